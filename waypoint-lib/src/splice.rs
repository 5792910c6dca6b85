use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// How a relay ended.
///
/// `Closed` covers orderly shutdown of either stream; `Failed` is everything
/// else and worth a warning. `Cancelled` means the flow context ended first.
#[derive(Debug)]
pub enum RelayResult {
  /// One direction reached EOF or saw the peer close; `bytes` were copied on it
  Closed { bytes: u64 },
  /// A copy failed with an error that is not a normal close
  Failed(std::io::Error),
  /// The cancellation token fired before either copy finished
  Cancelled,
}

impl RelayResult {
  fn from_copy(res: std::io::Result<u64>) -> Self {
    match res {
      Ok(bytes) => Self::Closed { bytes },
      Err(e) if is_normal_close(&e) => Self::Closed { bytes: 0 },
      Err(e) => Self::Failed(e),
    }
  }
}

fn is_normal_close(e: &std::io::Error) -> bool {
  use std::io::ErrorKind::*;
  matches!(
    e.kind(),
    UnexpectedEof | ConnectionReset | ConnectionAborted | BrokenPipe | NotConnected
  )
}

/// Copy `client <-> server` concurrently until either direction finishes or the
/// token is cancelled, then close both streams.
///
/// Both streams are consumed and dropped on return, which closes them; a peer
/// blocked on the opposite direction observes the close immediately. This is
/// the core contract of the splicer: the first exit tears the whole flow down.
pub async fn relay_streams<A, B>(client: A, server: B, cancel: &CancellationToken) -> RelayResult
where
  A: AsyncRead + AsyncWrite + Send + Unpin,
  B: AsyncRead + AsyncWrite + Send + Unpin,
{
  let (mut client_rx, mut client_tx) = tokio::io::split(client);
  let (mut server_rx, mut server_tx) = tokio::io::split(server);

  let upstream = tokio::io::copy(&mut client_rx, &mut server_tx);
  let downstream = tokio::io::copy(&mut server_rx, &mut client_tx);

  tokio::select! {
    res = upstream => RelayResult::from_copy(res),
    res = downstream => RelayResult::from_copy(res),
    _ = cancel.cancelled() => RelayResult::Cancelled,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::time::{Duration, timeout};

  #[tokio::test]
  async fn bytes_flow_both_ways() {
    let (client_near, mut client_far) = tokio::io::duplex(1024);
    let (server_near, mut server_far) = tokio::io::duplex(1024);
    let cancel = CancellationToken::new();

    let relay = tokio::spawn(async move { relay_streams(client_near, server_near, &cancel).await });

    client_far.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    server_far.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    server_far.write_all(b"pong").await.unwrap();
    client_far.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    drop(client_far);
    let outcome = timeout(Duration::from_secs(1), relay).await.unwrap().unwrap();
    assert!(matches!(outcome, RelayResult::Closed { .. }));
  }

  #[tokio::test]
  async fn closing_either_endpoint_ends_the_relay() {
    let (client_near, client_far) = tokio::io::duplex(64);
    let (server_near, mut server_far) = tokio::io::duplex(64);
    let cancel = CancellationToken::new();

    let relay = tokio::spawn(async move { relay_streams(client_near, server_near, &cancel).await });

    // the server side closes while the client side stays open
    server_far.shutdown().await.unwrap();
    drop(server_far);

    let outcome = timeout(Duration::from_secs(1), relay).await.unwrap().unwrap();
    assert!(matches!(outcome, RelayResult::Closed { .. }));

    // the client endpoint must observe the teardown promptly
    let mut client_far = client_far;
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(1), client_far.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0);
  }

  #[tokio::test]
  async fn cancellation_ends_the_relay() {
    let (client_near, _client_far) = tokio::io::duplex(64);
    let (server_near, _server_far) = tokio::io::duplex(64);
    let cancel = CancellationToken::new();
    let child = cancel.child_token();

    let relay = tokio::spawn(async move { relay_streams(client_near, server_near, &child).await });
    cancel.cancel();

    let outcome = timeout(Duration::from_secs(1), relay).await.unwrap().unwrap();
    assert!(matches!(outcome, RelayResult::Cancelled));
  }
}
