/// Error emitted when a buffer cannot be parsed as a TLS ClientHello
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ClientHelloError {
  #[error("Input too short for a TLS handshake record")]
  ShortInput,

  #[error("Not a TLS handshake record")]
  NotHandshake,

  #[error("TLS record body is truncated")]
  TruncatedRecord,

  #[error("Handshake message is not a ClientHello")]
  NotClientHello,

  #[error("Malformed ClientHello body")]
  InvalidClientHello,

  #[error("Malformed server_name extension")]
  InvalidSniExtension,
}
