//! Raw TCP router: every accepted flow is forwarded to the entry's fixed target
//! through the proxy chain.

use crate::{
  config::EntryPoint,
  constants::TCP_BACKLOG,
  dialer::ProxyDialer,
  error::{ConfigurationError, ProxyError},
  socket::bind_tcp_listener,
  splice::{RelayResult, relay_streams},
  trace::*,
};
use std::net::SocketAddr;
use tokio::{net::TcpListener, runtime::Handle};
use tokio_util::sync::CancellationToken;

/* ---------------------------------------------------------- */
/// Single raw TCP router bound to its listener
pub(crate) struct TcpRawRouter {
  entry: EntryPoint,
  listener: TcpListener,
  runtime_handle: Handle,
}

impl TcpRawRouter {
  /// Validate the entry and bind the listener.
  /// A missing target is a configuration error and fatal for this entry.
  pub(crate) fn bind(entry: EntryPoint, runtime_handle: Handle) -> Result<Self, ProxyError> {
    if entry.target.is_empty() {
      error!("tcp-raw entry on {} has no target", entry.listen);
      return Err(
        ConfigurationError::MissingTarget {
          routing: entry.routing.to_string(),
        }
        .into(),
      );
    }
    let listener = bind_tcp_listener(&entry.listen, TCP_BACKLOG)?;
    Ok(Self {
      entry,
      listener,
      runtime_handle,
    })
  }

  pub(crate) fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
    Ok(self.listener.local_addr().map_err(crate::error::NetworkError::from)?)
  }

  /// Accept loop. Accept errors are logged and the loop continues; only
  /// cancellation ends it.
  pub(crate) async fn start(&self, cancel_token: CancellationToken) -> Result<(), ProxyError> {
    info!("Starting raw TCP router on {} -> {}", self.entry.listen, self.entry.target);

    let listener_service = async {
      loop {
        let (incoming_stream, src_addr) = match self.listener.accept().await {
          Err(e) => {
            error!("Error in TCP listener on {}: {e}", self.entry.listen);
            continue;
          }
          Ok(res) => res,
        };
        debug!("Accepted TCP connection from {src_addr}");

        self.runtime_handle.spawn({
          let entry = self.entry.clone();
          let flow_cancel = cancel_token.child_token();
          async move {
            let flow = handle_flow(incoming_stream, &entry, &flow_cancel);
            if tokio::time::timeout(entry.flow_timeout(), flow).await.is_err() {
              debug!("Flow from {src_addr} hit the entry timeout");
            }
          }
        });
      }
    };

    tokio::select! {
      _ = listener_service => {}
      _ = cancel_token.cancelled() => {
        warn!("Raw TCP router on {} cancelled", self.entry.listen);
      }
    }
    Ok(())
  }
}

/// Dial the target through the chain and splice; the client is dropped
/// (closed) on any dial error.
async fn handle_flow(client: tokio::net::TcpStream, entry: &EntryPoint, cancel: &CancellationToken) {
  let dialer = match ProxyDialer::from_chain(&entry.proxy) {
    Ok(d) => d,
    Err(e) => {
      error!("Failed to build the dialer chain: {e}");
      return;
    }
  };
  let outbound = match dialer.dial_target(&entry.target).await {
    Ok(s) => s,
    Err(e) => {
      error!("Failed to connect to target {}: {e}", entry.target);
      return;
    }
  };

  match relay_streams(client, outbound, cancel).await {
    RelayResult::Closed { bytes } => debug!("TCP flow closed after {bytes} bytes"),
    RelayResult::Cancelled => debug!("TCP flow cancelled"),
    RelayResult::Failed(e) => warn!("TCP flow collapsed: {e}"),
  }
}

/* ---------------------------------------------------------- */
#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::RoutingKind;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::{TcpListener as TokioListener, TcpStream};
  use tokio::time::{Duration, timeout};

  fn entry_to(target: String) -> EntryPoint {
    EntryPoint {
      routing: RoutingKind::TcpRaw,
      listen: "127.0.0.1:0".parse().unwrap(),
      target,
      proxy: Vec::new(),
      block_list: Vec::new(),
      allow_list: Vec::new(),
      timeout: Some(Duration::from_secs(5)),
      tag: None,
      features: Vec::new(),
    }
  }

  #[tokio::test]
  async fn missing_target_is_fatal() {
    let res = TcpRawRouter::bind(entry_to(String::new()), Handle::current());
    assert!(matches!(res, Err(ProxyError::Configuration(_))));
  }

  #[tokio::test]
  async fn flows_are_forwarded_to_the_target() {
    let backend = TokioListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut stream, _) = backend.accept().await.unwrap();
      let mut buf = [0u8; 4];
      stream.read_exact(&mut buf).await.unwrap();
      stream.write_all(b"ack:").await.unwrap();
      stream.write_all(&buf).await.unwrap();
    });

    let router = TcpRawRouter::bind(entry_to(backend_addr.to_string()), Handle::current()).unwrap();
    let router_addr = router.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(async move { router.start(cancel).await });

    let mut client = TcpStream::connect(router_addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 8];
    timeout(Duration::from_secs(2), client.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"ack:ping");
  }

  #[tokio::test]
  async fn cancellation_stops_the_router() {
    let router = TcpRawRouter::bind(entry_to("127.0.0.1:1".to_string()), Handle::current()).unwrap();
    let cancel = CancellationToken::new();
    let child = cancel.clone();
    let task = tokio::spawn(async move { router.start(child).await });
    cancel.cancel();
    timeout(Duration::from_secs(1), task).await.unwrap().unwrap().unwrap();
  }
}
