//! NAT-like UDP session table: one outbound socket per client source address,
//! with a response pump and an idle reaper per session.

use crate::{
  constants::{UDP_BUFFER_SIZE, UDP_MAX_DATAGRAM_CAPACITY},
  error::{NetworkError, ProxyError},
  socket::bind_udp_socket,
  time_util::get_since_the_epoch,
  trace::*,
};
use std::{
  net::SocketAddr,
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
  time::Duration,
};
use tokio::{net::UdpSocket, runtime::Handle};
use tokio_util::sync::CancellationToken;

/// DashMap type alias, uses ahash::RandomState as hashbuilder
type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;

/// Receive buffer size for the response pump, `UDP_BUFFER` env overrides
fn udp_buffer_size() -> usize {
  std::env::var("UDP_BUFFER")
    .ok()
    .and_then(|v| v.parse::<usize>().ok())
    .filter(|v| *v > 0 && *v <= UDP_MAX_DATAGRAM_CAPACITY)
    .unwrap_or(UDP_BUFFER_SIZE)
}

/* ---------------------------------------------------------- */
#[derive(Clone)]
/// Session table owned by one udp-raw entry
pub(crate) struct UdpSessionTable {
  inner: Arc<DashMap<SocketAddr, UdpSession>>,
  /// Resolved lazily per session; the entry's `host:port` target
  target: String,
  idle_timeout: Duration,
  parent_cancel: CancellationToken,
  runtime_handle: Handle,
}

#[derive(Clone)]
struct UdpSession {
  upstream: Arc<UdpSocket>,
  last_active: Arc<AtomicU64>,
  cancel: CancellationToken,
}

impl UdpSession {
  fn touch(&self) {
    self.last_active.store(get_since_the_epoch(), Ordering::Release);
  }

  fn idle_for(&self) -> u64 {
    get_since_the_epoch().saturating_sub(self.last_active.load(Ordering::Acquire))
  }
}

impl UdpSessionTable {
  pub(crate) fn new(target: String, idle_timeout: Duration, parent_cancel: CancellationToken, runtime_handle: Handle) -> Self {
    Self {
      inner: Arc::new(DashMap::default()),
      target,
      idle_timeout,
      parent_cancel,
      runtime_handle,
    }
  }

  /// Number of live sessions
  pub(crate) fn session_count(&self) -> usize {
    self.inner.len()
  }

  /// Route one inbound datagram: look up or create the session for its source,
  /// refresh the idle clock, and forward the payload upstream.
  pub(crate) async fn handle_datagram(
    &self,
    src_addr: SocketAddr,
    payload: &[u8],
    server_socket: &Arc<UdpSocket>,
  ) -> Result<(), ProxyError> {
    if payload.len() > UDP_MAX_DATAGRAM_CAPACITY {
      warn!("Dropping oversized datagram ({} bytes) from {src_addr}", payload.len());
      return Ok(());
    }

    let session = match self.inner.get(&src_addr).map(|s| s.value().clone()) {
      Some(session) => session,
      None => self.create_session(src_addr, server_socket).await?,
    };
    session.touch();

    if let Err(e) = session.upstream.send(payload).await {
      error!("Failed to forward datagram from {src_addr} upstream: {e}");
      self.destroy(&src_addr);
      return Err(NetworkError::IoError { source: e }.into());
    }
    Ok(())
  }

  /// Open the outbound socket for a new client and spawn its pump and reaper
  async fn create_session(&self, src_addr: SocketAddr, server_socket: &Arc<UdpSocket>) -> Result<UdpSession, ProxyError> {
    let dst_addr = tokio::net::lookup_host(&self.target)
      .await
      .map_err(|_| NetworkError::DnsResolution {
        host: self.target.clone(),
      })?
      .next()
      .ok_or_else(|| NetworkError::DnsResolution {
        host: self.target.clone(),
      })?;

    let bind_any: SocketAddr = if dst_addr.is_ipv6() {
      "[::]:0".parse().unwrap()
    } else {
      "0.0.0.0:0".parse().unwrap()
    };
    let upstream = Arc::new(bind_udp_socket(&bind_any)?);
    upstream.connect(dst_addr).await.map_err(|source| NetworkError::ConnectionFailed {
      address: dst_addr.to_string(),
      source,
    })?;
    debug!("New UDP session {src_addr} -> {dst_addr}");

    let session = UdpSession {
      upstream,
      last_active: Arc::new(AtomicU64::new(get_since_the_epoch())),
      cancel: self.parent_cancel.child_token(),
    };

    if let Some(old) = self.inner.insert(src_addr, session.clone()) {
      warn!("UDP session for {src_addr} already existed and was replaced");
      old.cancel.cancel();
    }

    self.spawn_response_pump(src_addr, session.clone(), Arc::clone(server_socket));
    self.spawn_reaper(src_addr, session.clone());
    Ok(session)
  }

  /// Pump datagrams coming back from the target to the client, until the
  /// session is cancelled or the socket fails
  fn spawn_response_pump(&self, src_addr: SocketAddr, session: UdpSession, server_socket: Arc<UdpSocket>) {
    let table = self.inner.clone();
    self.runtime_handle.spawn(async move {
      let mut buf = vec![0u8; udp_buffer_size()];
      let pump = async {
        loop {
          let n = match session.upstream.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
              debug!("UDP session {src_addr} upstream read failed: {e}");
              break;
            }
          };
          session.touch();
          #[cfg(feature = "gro-segmentation")]
          let segments = split_segments(&buf[..n], None);
          #[cfg(not(feature = "gro-segmentation"))]
          let segments = std::iter::once(&buf[..n]);
          for segment in segments {
            if let Err(e) = server_socket.send_to(segment, src_addr).await {
              debug!("UDP session {src_addr} downstream write failed: {e}");
              return;
            }
          }
        }
      };

      tokio::select! {
        _ = pump => {}
        _ = session.cancel.cancelled() => {
          debug!("UDP session {src_addr} response pump cancelled");
        }
      }
      session.cancel.cancel();
      table.remove(&src_addr);
    });
  }

  /// Wake every `idle_timeout / 2` and destroy the session once it has been
  /// silent longer than the timeout
  fn spawn_reaper(&self, src_addr: SocketAddr, session: UdpSession) {
    let table = self.inner.clone();
    let timeout_secs = self.idle_timeout.as_secs().max(1);
    let tick = Duration::from_secs((timeout_secs / 2).max(1));
    self.runtime_handle.spawn(async move {
      let mut interval = tokio::time::interval(tick);
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      interval.tick().await; // first tick completes immediately
      loop {
        tokio::select! {
          _ = interval.tick() => {}
          _ = session.cancel.cancelled() => return,
        }
        if session.idle_for() > timeout_secs {
          debug!("Reaping idle UDP session {src_addr}");
          session.cancel.cancel();
          table.remove(&src_addr);
          return;
        }
      }
    });
  }

  fn destroy(&self, src_addr: &SocketAddr) {
    if let Some((_, session)) = self.inner.remove(src_addr) {
      session.cancel.cancel();
    }
  }

  /// Cancel every session and clear the table
  pub(crate) fn shutdown(&self) {
    self.inner.retain(|_, session| {
      session.cancel.cancel();
      false
    });
  }
}

/* ---------------------------------------------------------- */
/// Split a kernel-coalesced jumbo datagram into wire-sized segments.
/// With no segment size reported by the OS the payload passes through whole.
#[cfg(feature = "gro-segmentation")]
pub(crate) fn split_segments(payload: &[u8], segment_size: Option<usize>) -> impl Iterator<Item = &[u8]> {
  let size = segment_size.filter(|s| *s > 0).unwrap_or(payload.len().max(1));
  payload.chunks(size)
}

/* ---------------------------------------------------------- */
#[cfg(test)]
mod tests {
  use super::*;
  use tokio::time::{sleep, timeout};

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
  async fn responses_reach_the_client_through_the_server_socket() {
    let echo = spawn_udp_echo().await;
    let cancel = CancellationToken::new();
    let table = UdpSessionTable::new(echo.to_string(), Duration::from_secs(30), cancel.clone(), Handle::current());

    let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(server.local_addr().unwrap()).await.unwrap();
    let client_addr = client.local_addr().unwrap();

    table.handle_datagram(client_addr, b"ping", &server).await.unwrap();
    assert_eq!(table.session_count(), 1);

    let mut buf = [0u8; 16];
    let (n, from) = timeout(Duration::from_secs(2), client.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"ping");
    assert_eq!(from, server.local_addr().unwrap());

    cancel.cancel();
  }

  #[tokio::test]
  async fn idle_sessions_are_reaped() {
    let echo = spawn_udp_echo().await;
    let cancel = CancellationToken::new();
    let table = UdpSessionTable::new(echo.to_string(), Duration::from_secs(2), cancel.clone(), Handle::current());

    let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let client_addr: SocketAddr = "127.0.0.1:40123".parse().unwrap();

    table.handle_datagram(client_addr, b"one", &server).await.unwrap();
    assert_eq!(table.session_count(), 1);

    sleep(Duration::from_secs(4)).await;
    assert_eq!(table.session_count(), 0, "idle session must be pruned after the timeout");

    cancel.cancel();
  }

  #[tokio::test]
  async fn shutdown_clears_all_sessions() {
    let echo = spawn_udp_echo().await;
    let cancel = CancellationToken::new();
    let table = UdpSessionTable::new(echo.to_string(), Duration::from_secs(30), cancel.clone(), Handle::current());
    let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

    for port in [41001u16, 41002, 41003] {
      let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
      table.handle_datagram(addr, b"x", &server).await.unwrap();
    }
    assert_eq!(table.session_count(), 3);

    table.shutdown();
    assert_eq!(table.session_count(), 0);
  }

  #[cfg(feature = "gro-segmentation")]
  #[test]
  fn segments_split_on_reported_size() {
    let payload = [0u8; 10];
    let segments: Vec<_> = split_segments(&payload, Some(4)).collect();
    assert_eq!(segments.iter().map(|s| s.len()).collect::<Vec<_>>(), vec![4, 4, 2]);
    let whole: Vec<_> = split_segments(&payload, None).collect();
    assert_eq!(whole.len(), 1);
  }
}
