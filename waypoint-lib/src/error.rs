/// Categorized error types for the routing core.
///
/// Configuration errors are fatal for the entry that raised them; network and
/// protocol errors are scoped to a single flow and never cross entry boundaries.
use std::net::SocketAddr;

/// Top-level error type that encompasses all proxy operation errors
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
  #[error(transparent)]
  Configuration(#[from] ConfigurationError),

  #[error(transparent)]
  Network(#[from] NetworkError),

  #[error(transparent)]
  Protocol(#[from] ProtocolError),

  #[error(transparent)]
  Dialer(#[from] DialerError),
}

impl ProxyError {
  /// A fatal error exits the entry worker permanently instead of being retried
  pub(crate) fn is_fatal(&self) -> bool {
    matches!(
      self,
      Self::Configuration(_) | Self::Network(NetworkError::BindFailed { .. })
    )
  }
}

/// Configuration-related errors, raised at entry startup
#[derive(thiserror::Error, Debug)]
pub enum ConfigurationError {
  #[error("No entrypoints configured")]
  NoEntrypoints,

  #[error("Routing mode {routing} requires a non-empty target")]
  MissingTarget { routing: String },

  #[error("Invalid listen address: {value}")]
  InvalidListen { value: String },

  #[error("Invalid duration: {value}")]
  InvalidDuration { value: String },

  #[error("Invalid proxy url: {value}")]
  InvalidProxyUrl { value: String },

  #[error("Invalid matcher pattern: {pattern}")]
  InvalidMatcher { pattern: String },

  #[error("Shorthand entry has more than the allowed separators (;): {value}")]
  InvalidShorthand { value: String },
}

/// Network-related errors with context
#[derive(thiserror::Error, Debug)]
pub enum NetworkError {
  #[error("Socket bind failed for {address}: {source}")]
  BindFailed {
    address: SocketAddr,
    #[source]
    source: std::io::Error,
  },

  #[error("Connection failed to {address}: {source}")]
  ConnectionFailed {
    address: String,
    #[source]
    source: std::io::Error,
  },

  #[error("DNS resolution failed for {host}")]
  DnsResolution { host: String },

  #[error("IO error: {source}")]
  IoError {
    #[from]
    source: std::io::Error,
  },
}

/// Flow-level protocol errors
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
  #[error("No data received from {source_addr}")]
  NoDataReceived { source_addr: SocketAddr },

  #[error("No SNI found in the ClientHello from {source_addr}")]
  SniMissing { source_addr: SocketAddr },

  #[error("Hostname {host} rejected by the entry matchers")]
  HostRejected { host: String },

  #[error(transparent)]
  HostMalformed(#[from] HostnameError),

  #[error("Timed out reading the request head from {source_addr}")]
  HeaderReadTimeout { source_addr: SocketAddr },

  #[error("Malformed HTTP request: {reason}")]
  MalformedRequest { reason: String },

  #[error("Invalid target address: {target}")]
  InvalidTarget { target: String },
}

/// Hostname validation failures
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum HostnameError {
  #[error("Hostname is empty")]
  Empty,

  #[error("Hostname exceeds the maximum length of 255 characters")]
  TooLong,

  #[error("{0} is a local hostname")]
  LocalName(String),

  #[error("{0} is not RFC1123 compliant")]
  NotRfc1123(String),

  #[error("Invalid URL in host header")]
  InvalidUrl,
}

/// Errors raised while building or exercising the proxy dialer chain
#[derive(thiserror::Error, Debug)]
pub enum DialerError {
  #[error("Unsupported proxy scheme: {scheme}")]
  UnsupportedScheme { scheme: String },

  #[error("Proxy url {url} is missing a host")]
  MissingHost { url: String },

  #[error("Connect to {address} failed: {source}")]
  Connect {
    address: String,
    #[source]
    source: std::io::Error,
  },

  #[error("SOCKS5 handshake failed: {reason}")]
  Socks5 { reason: String },

  #[error("SSH handshake timed out")]
  SshHandshakeTimeout,

  #[error("SSH session error: {source}")]
  Ssh {
    #[from]
    source: russh::Error,
  },

  #[error("SSH key error: {source}")]
  SshKey {
    #[from]
    source: russh::keys::Error,
  },

  #[error("SSH authentication rejected for user {user}")]
  SshAuthRejected { user: String },

  #[error("No auth method provided (password or key path required)")]
  NoSshAuthMethod,

  #[error("SSH key content is not valid base64: {source}")]
  KeyContentEncoding {
    #[from]
    source: base64::DecodeError,
  },

  #[error("IO error during proxy handshake: {source}")]
  Io {
    #[from]
    source: std::io::Error,
  },
}

impl DialerError {
  pub(crate) fn socks5(reason: impl Into<String>) -> Self {
    Self::Socks5 { reason: reason.into() }
  }
}
