pub mod config;
mod constants;
mod dialer;
mod entrypoint;
mod error;
mod hostname;
mod router;
mod socket;
mod splice;
mod time_util;
mod trace;
mod udp_session;

pub use config::{Config, CoreConfig, EntryPoint, Matcher, RoutingKind};
pub use dialer::{ProxyDialer, ProxyStream};
pub use entrypoint::Entrypoint;
pub use error::{ConfigurationError, DialerError, HostnameError, NetworkError, ProtocolError, ProxyError};
pub use hostname::{sanitize_host_header, validate_hostname};
pub use router::TagRegistry;
pub use splice::{RelayResult, relay_streams};
