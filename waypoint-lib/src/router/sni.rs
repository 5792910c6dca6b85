//! SNI router: peek the first client bytes, pull the server name out of the
//! TLS ClientHello, pick the entry whose matchers admit it, then dial
//! `<sni>:<port>` through that entry's chain and replay the consumed bytes.

use crate::{
  config::EntryPoint,
  constants::{SNI_DEFAULT_PORT, SNI_PEEK_BUFFER_SIZE, TCP_BACKLOG},
  dialer::ProxyDialer,
  error::ProxyError,
  hostname::validate_hostname,
  router::TagRegistry,
  socket::bind_tcp_listener,
  splice::{RelayResult, relay_streams},
  trace::*,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{
  io::{AsyncReadExt, AsyncWriteExt},
  net::{TcpListener, TcpStream},
  runtime::Handle,
};
use tokio_util::sync::CancellationToken;

/* ---------------------------------------------------------- */
/// Single SNI router bound to its listener
pub(crate) struct SniRouter {
  entry: EntryPoint,
  registry: Arc<TagRegistry>,
  listener: TcpListener,
  runtime_handle: Handle,
}

impl SniRouter {
  pub(crate) fn bind(entry: EntryPoint, registry: Arc<TagRegistry>, runtime_handle: Handle) -> Result<Self, ProxyError> {
    let listener = bind_tcp_listener(&entry.listen, TCP_BACKLOG)?;
    Ok(Self {
      entry,
      registry,
      listener,
      runtime_handle,
    })
  }

  pub(crate) fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
    Ok(self.listener.local_addr().map_err(crate::error::NetworkError::from)?)
  }

  pub(crate) async fn start(&self, cancel_token: CancellationToken) -> Result<(), ProxyError> {
    info!("Starting SNI router on {}", self.entry.listen);

    let listener_service = async {
      loop {
        let (incoming_stream, src_addr) = match self.listener.accept().await {
          Err(e) => {
            error!("Error in SNI listener on {}: {e}", self.entry.listen);
            continue;
          }
          Ok(res) => res,
        };
        debug!("Accepted connection from {src_addr} on the SNI router");

        self.runtime_handle.spawn({
          let entry = self.entry.clone();
          let registry = Arc::clone(&self.registry);
          let flow_cancel = cancel_token.child_token();
          async move {
            handle_client(incoming_stream, src_addr, entry, registry, flow_cancel).await;
          }
        });
      }
    };

    tokio::select! {
      _ = listener_service => {}
      _ = cancel_token.cancelled() => {
        warn!("SNI router on {} cancelled", self.entry.listen);
      }
    }
    Ok(())
  }
}

/// Read the ClientHello, derive and vet the server name, then hand the flow to
/// the selected entry. Every failure path just drops the client.
async fn handle_client(
  mut client: TcpStream,
  src_addr: SocketAddr,
  owner: EntryPoint,
  registry: Arc<TagRegistry>,
  cancel: CancellationToken,
) {
  let mut buf = vec![0u8; SNI_PEEK_BUFFER_SIZE];
  let n = match client.read(&mut buf).await {
    Ok(0) | Err(_) => {
      debug!("Client {src_addr} closed before the ClientHello");
      return;
    }
    Ok(n) => n,
  };

  let Some(sni_bytes) = peek_tls::extract_sni(&buf[..n]) else {
    warn!("SNI missing in the ClientHello from {src_addr}");
    return;
  };
  let sni = String::from_utf8_lossy(sni_bytes).to_ascii_lowercase();

  if let Err(e) = validate_hostname(&sni) {
    warn!("SNI {sni} from {src_addr} rejected: {e}");
    return;
  }

  let Some(effective) = registry.select(&owner, &sni) else {
    warn!("No entry admits SNI {sni} from {src_addr}");
    return;
  };

  let flow = proxy_to_target(client, &sni, &buf[..n], &effective, &cancel);
  if tokio::time::timeout(effective.flow_timeout(), flow).await.is_err() {
    debug!("SNI flow from {src_addr} hit the entry timeout");
  }
}

/// Dial `<sni>:<port>` through the entry's chain, replay the consumed
/// ClientHello bytes first, then splice.
async fn proxy_to_target(client: TcpStream, sni: &str, consumed: &[u8], entry: &EntryPoint, cancel: &CancellationToken) {
  let target = format!("{sni}:{}", entry.target_or(SNI_DEFAULT_PORT));

  let dialer = match ProxyDialer::from_chain(&entry.proxy) {
    Ok(d) => d,
    Err(e) => {
      error!("Failed to build the dialer chain: {e}");
      return;
    }
  };
  let mut outbound = match dialer.dial_target(&target).await {
    Ok(s) => s,
    Err(e) => {
      error!("Failed to connect to {target}: {e}");
      return;
    }
  };

  // The outbound must see the exact bytes the client already sent
  if let Err(e) = outbound.write_all(consumed).await {
    error!("Initial write to {target} failed: {e}");
    return;
  }

  match relay_streams(client, outbound, cancel).await {
    RelayResult::Closed { bytes } => debug!("SNI flow to {target} closed after {bytes} bytes"),
    RelayResult::Cancelled => debug!("SNI flow to {target} cancelled"),
    RelayResult::Failed(e) => warn!("SNI flow to {target} collapsed: {e}"),
  }
}

/* ---------------------------------------------------------- */
