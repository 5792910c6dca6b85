mod client_hello;
mod error;
mod serialize;
mod sni;

#[allow(unused)]
pub(crate) mod trace {
  pub(crate) use tracing::{debug, error, info, trace, warn};
}

/// TLS record header length: content type (1) + version (2) + length (2)
pub(crate) const TLS_RECORD_HEADER_LEN: usize = 5;
/// TLS handshake message header length: msg_type (1) + length (3)
pub(crate) const TLS_HANDSHAKE_MESSAGE_HEADER_LEN: usize = 4;
/// Content type of a TLS handshake record
pub(crate) const TLS_HANDSHAKE_CONTENT_TYPE: u8 = 0x16;
/// Handshake message type of a ClientHello
pub(crate) const TLS_HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
/// Extension type of server_name
pub(crate) const TLS_EXTENSION_TYPE_SNI: u16 = 0x0000;

pub use client_hello::{ClientHello, MAX_SNI_NAMES};
pub use error::ClientHelloError;
pub use sni::extract_sni;
