/// TCP backlog size
pub(crate) const TCP_BACKLOG: u32 = 1024;

/// Peek buffer size for the SNI router.
/// The ClientHello must fit in the first read; considering hybrid post-quantum
/// key exchange (key_share > 1KB in X25519MLKEM768) the buffer should be at
/// least 2KB. https://datatracker.ietf.org/doc/html/rfc8446#section-5.1
pub(crate) const SNI_PEEK_BUFFER_SIZE: usize = 4096;

/// Default target port for the SNI router when the entry carries none
pub(crate) const SNI_DEFAULT_PORT: &str = "443";

/// Timeout to read the full request head on the HTTP router, in seconds
pub(crate) const HTTP_HEADER_READ_TIMEOUT_SECS: u64 = 30;

/// UDP receive buffer size, overridable with the `UDP_BUFFER` environment variable.
/// Theoretical datagram limit is 65535 bytes in IPv4.
pub(crate) const UDP_BUFFER_SIZE: usize = 65536;

/// Upper bound on a single relayed datagram, to prevent memory abuse
pub(crate) const UDP_MAX_DATAGRAM_CAPACITY: usize = 8 * 1024 * 1024;

/// Default UDP session idle timeout in seconds, applied when the entry has no timeout.
/// A session is keyed by the client source address + port and pruned when idle.
pub(crate) const UDP_SESSION_IDLE_TIMEOUT_SECS: u64 = 300;

/// SSH client handshake timeout in seconds
pub(crate) const SSH_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Default SSH server port when the proxy URL carries none
pub(crate) const SSH_DEFAULT_PORT: u16 = 22;

/// Fallback per-flow timeout in seconds (24h), overridable with the `TIMEOUT` environment variable
pub(crate) const DEFAULT_FLOW_TIMEOUT_SECS: u64 = 86_400;

/// Initial delay for restarting a failed entry worker, in milliseconds
pub(crate) const WORKER_BACKOFF_INITIAL_MSEC: u64 = 500;

/// Cap for the exponential worker restart backoff, in milliseconds
pub(crate) const WORKER_BACKOFF_MAX_MSEC: u64 = 16_000;

/// A worker that survived this long is considered healthy and its backoff resets, in seconds
pub(crate) const WORKER_BACKOFF_RESET_AFTER_SECS: u64 = 30;
