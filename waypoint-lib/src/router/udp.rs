//! Raw UDP router: datagrams are forwarded per client through the session
//! table, which owns the NAT-like mapping and its reapers.

use crate::{
  config::EntryPoint,
  constants::UDP_BUFFER_SIZE,
  error::{ConfigurationError, ProxyError},
  socket::bind_udp_socket,
  trace::*,
  udp_session::UdpSessionTable,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::UdpSocket, runtime::Handle};
use tokio_util::sync::CancellationToken;

/* ---------------------------------------------------------- */
/// Single raw UDP router bound to its socket
pub(crate) struct UdpRawRouter {
  entry: EntryPoint,
  socket: Arc<UdpSocket>,
  sessions: UdpSessionTable,
}

impl UdpRawRouter {
  /// Validate the entry and bind the server socket.
  /// The proxy chain is not applied to UDP flows; a configured chain is
  /// ignored with a warning.
  pub(crate) fn bind(entry: EntryPoint, runtime_handle: Handle, cancel_token: CancellationToken) -> Result<Self, ProxyError> {
    if entry.target.is_empty() {
      error!("udp-raw entry on {} has no target", entry.listen);
      return Err(
        ConfigurationError::MissingTarget {
          routing: entry.routing.to_string(),
        }
        .into(),
      );
    }
    if !entry.proxy.is_empty() {
      warn!("udp-raw does not dial through the proxy chain yet; forwarding directly");
    }

    let socket = Arc::new(bind_udp_socket(&entry.listen)?);
    let sessions = UdpSessionTable::new(entry.target.clone(), entry.udp_idle_timeout(), cancel_token, runtime_handle);
    Ok(Self { entry, socket, sessions })
  }

  pub(crate) fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
    Ok(self.socket.local_addr().map_err(crate::error::NetworkError::from)?)
  }

  #[cfg(test)]
  pub(crate) fn session_count(&self) -> usize {
    self.sessions.session_count()
  }

  pub(crate) async fn start(&self, cancel_token: CancellationToken) -> Result<(), ProxyError> {
    info!("Starting raw UDP router on {} -> {}", self.entry.listen, self.entry.target);
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];

    let listener_service = async {
      loop {
        let (n, src_addr) = match self.socket.recv_from(&mut buf).await {
          Err(e) => {
            error!("Error in UDP listener on {}: {e}", self.entry.listen);
            continue;
          }
          Ok(res) => res,
        };
        trace!("received {n} bytes from {src_addr}");

        // session errors stay scoped to their client
        let _ = self.sessions.handle_datagram(src_addr, &buf[..n], &self.socket).await;
      }
    };

    tokio::select! {
      _ = listener_service => {}
      _ = cancel_token.cancelled() => {
        warn!("Raw UDP router on {} cancelled", self.entry.listen);
      }
    }
    self.sessions.shutdown();
    Ok(())
  }
}

/* ---------------------------------------------------------- */
#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::RoutingKind;
  use tokio::time::{Duration, sleep, timeout};

  fn udp_entry(target: String, timeout: Option<Duration>) -> EntryPoint {
    EntryPoint {
      routing: RoutingKind::UdpRaw,
      listen: "127.0.0.1:0".parse().unwrap(),
      target,
      proxy: Vec::new(),
      block_list: Vec::new(),
      allow_list: Vec::new(),
      timeout,
      tag: None,
      features: Vec::new(),
    }
  }

  async fn spawn_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
      let mut buf = [0u8; 2048];
      while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
        let _ = socket.send_to(&buf[..n], peer).await;
      }
    });
    addr
  }

  #[tokio::test]
  async fn missing_target_is_fatal() {
    let res = UdpRawRouter::bind(udp_entry(String::new(), None), Handle::current(), CancellationToken::new());
    assert!(matches!(res, Err(ProxyError::Configuration(_))));
  }

  #[tokio::test]
  async fn datagrams_round_trip_and_idle_sessions_reap() {
    let echo = spawn_udp_echo().await;
    let entry = udp_entry(echo.to_string(), Some(Duration::from_secs(2)));

    let cancel = CancellationToken::new();
    let router = Arc::new(UdpRawRouter::bind(entry, Handle::current(), cancel.child_token()).unwrap());
    let router_addr = router.local_addr().unwrap();
    tokio::spawn({
      let router = Arc::clone(&router);
      let cancel = cancel.clone();
      async move { router.start(cancel).await }
    });

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"ping", router_addr).await.unwrap();

    // the response must come back on the client-visible port of the router
    let mut buf = [0u8; 16];
    let (n, from) = timeout(Duration::from_secs(2), client.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"ping");
    assert_eq!(from, router_addr);
    assert_eq!(router.session_count(), 1);

    // after the idle timeout the mapping is gone
    sleep(Duration::from_secs(4)).await;
    assert_eq!(router.session_count(), 0);

    cancel.cancel();
  }

  #[tokio::test]
  async fn datagram_order_is_preserved_per_client() {
    let echo = spawn_udp_echo().await;
    let entry = udp_entry(echo.to_string(), Some(Duration::from_secs(10)));
    let cancel = CancellationToken::new();
    let router = Arc::new(UdpRawRouter::bind(entry, Handle::current(), cancel.child_token()).unwrap());
    let router_addr = router.local_addr().unwrap();
    tokio::spawn({
      let router = Arc::clone(&router);
      let cancel = cancel.clone();
      async move { router.start(cancel).await }
    });

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for i in 0u8..5 {
      client.send_to(&[i], router_addr).await.unwrap();
    }
    let mut seen = Vec::new();
    let mut buf = [0u8; 4];
    for _ in 0..5 {
      let (n, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf)).await.unwrap().unwrap();
      seen.extend_from_slice(&buf[..n]);
    }
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    cancel.cancel();
  }
}
