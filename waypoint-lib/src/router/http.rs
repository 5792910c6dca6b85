//! HTTP router: derive the destination from the Host header, then either
//! tunnel a CONNECT or replay the request upstream as a reverse proxy.
//!
//! The router speaks HTTP/1.1 on both sides and handles one request per
//! connection; responses it generates itself carry `Connection: close`.

use crate::{
  config::{EntryPoint, FEATURE_FLEXIBLE_PORT},
  constants::{HTTP_HEADER_READ_TIMEOUT_SECS, TCP_BACKLOG},
  dialer::ProxyDialer,
  error::ProxyError,
  hostname::sanitize_host_header,
  router::TagRegistry,
  socket::bind_tcp_listener,
  splice::{RelayResult, relay_streams},
  trace::*,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
  io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
  net::{TcpListener, TcpStream},
  runtime::Handle,
};
use tokio_util::sync::CancellationToken;

/// Header that overrides the target port when the entry opted into `flexible-port`
const JUNCTION_PORT_HEADER: &str = "junction-port";

/// Hard cap on a buffered request body
const MAX_REQUEST_BODY: usize = 8 * 1024 * 1024;

/* ---------------------------------------------------------- */
/// Single HTTP router bound to its listener
pub(crate) struct HttpRouter {
  entry: EntryPoint,
  registry: Arc<TagRegistry>,
  listener: TcpListener,
  runtime_handle: Handle,
}

impl HttpRouter {
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
    info!("Starting HTTP router on {}", self.entry.listen);

    let listener_service = async {
      loop {
        let (incoming_stream, src_addr) = match self.listener.accept().await {
          Err(e) => {
            error!("Error in HTTP listener on {}: {e}", self.entry.listen);
            continue;
          }
          Ok(res) => res,
        };
        debug!("Accepted connection from {src_addr} on the HTTP router");

        self.runtime_handle.spawn({
          let entry = self.entry.clone();
          let registry = Arc::clone(&self.registry);
          let flow_cancel = cancel_token.child_token();
          async move {
            let flow = handle_connection(incoming_stream, src_addr, entry.clone(), registry, flow_cancel);
            if tokio::time::timeout(entry.flow_timeout(), flow).await.is_err() {
              debug!("HTTP flow from {src_addr} hit the entry timeout");
            }
          }
        });
      }
    };

    tokio::select! {
      _ = listener_service => {}
      _ = cancel_token.cancelled() => {
        warn!("HTTP router on {} cancelled", self.entry.listen);
      }
    }
    Ok(())
  }
}

/* ---------------------------------------------------------- */
/// Parsed request line plus headers; the body stays on the wire
#[derive(Debug)]
struct RequestHead {
  method: String,
  target: String,
  headers: Vec<(String, String)>,
}

impl RequestHead {
  fn is_connect(&self) -> bool {
    self.method.eq_ignore_ascii_case("CONNECT")
  }

  fn header(&self, name: &str) -> Option<&str> {
    self.headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
  }

  fn content_length(&self) -> Option<usize> {
    self.header("content-length").and_then(|v| v.parse().ok())
  }

  /// The raw host value: the authority for CONNECT, the Host header otherwise
  fn host_source(&self) -> &str {
    if self.is_connect() {
      &self.target
    } else {
      self.header("host").unwrap_or_default()
    }
  }

  /// Port carried by the request itself, e.g. the CONNECT authority
  fn request_port(&self) -> Option<&str> {
    let source = self.host_source();
    let (_, port) = source.rsplit_once(':')?;
    port.parse::<u16>().ok()?;
    Some(port)
  }

  /// Path and query for the upstream request line
  fn forward_path(&self) -> &str {
    if let Some(rest) = self.target.strip_prefix("http://") {
      return rest.find('/').map(|pos| &rest[pos..]).unwrap_or("/");
    }
    if self.target.starts_with('/') {
      return &self.target;
    }
    "/"
  }
}

/// Read the request line and headers, bounded in size
async fn read_request_head(reader: &mut BufReader<TcpStream>) -> Result<RequestHead, ProxyError> {
  use crate::error::ProtocolError;
  let malformed = |reason: &str| ProtocolError::MalformedRequest {
    reason: reason.to_string(),
  };

  let mut line = String::new();
  reader.read_line(&mut line).await.map_err(crate::error::NetworkError::from)?;
  let mut parts = line.split_whitespace();
  let method = parts.next().ok_or_else(|| malformed("empty request line"))?.to_string();
  let target = parts.next().ok_or_else(|| malformed("missing request target"))?.to_string();
  if parts.next().is_none() {
    return Err(malformed("missing HTTP version").into());
  }

  let mut headers = Vec::new();
  loop {
    if headers.len() > 128 {
      return Err(malformed("too many headers").into());
    }
    let mut line = String::new();
    let n = reader.read_line(&mut line).await.map_err(crate::error::NetworkError::from)?;
    if n == 0 {
      return Err(malformed("connection closed inside the header block").into());
    }
    let line = line.trim_end();
    if line.is_empty() {
      break;
    }
    let Some((key, value)) = line.split_once(':') else {
      return Err(malformed("header line without a colon").into());
    };
    headers.push((key.trim().to_ascii_lowercase(), value.trim().to_string()));
  }

  Ok(RequestHead { method, target, headers })
}

/// Resolve the port component for the upstream target:
/// `Junction-Port` (behind the feature) beats the entry target, which beats
/// the port the request itself carried.
fn derive_port(entry: &EntryPoint, head: &RequestHead) -> String {
  if entry.has_feature(FEATURE_FLEXIBLE_PORT) {
    if let Some(port) = head.header(JUNCTION_PORT_HEADER) {
      if !port.is_empty() {
        return port.to_string();
      }
    }
  }
  if !entry.target.is_empty() {
    return entry.target.clone();
  }
  head.request_port().unwrap_or_default().to_string()
}

/* ---------------------------------------------------------- */
async fn handle_connection(
  stream: TcpStream,
  src_addr: SocketAddr,
  owner: EntryPoint,
  registry: Arc<TagRegistry>,
  cancel: CancellationToken,
) {
  let mut reader = BufReader::new(stream);

  let head = match tokio::time::timeout(
    Duration::from_secs(HTTP_HEADER_READ_TIMEOUT_SECS),
    read_request_head(&mut reader),
  )
  .await
  {
    Ok(Ok(head)) => head,
    Ok(Err(e)) => {
      debug!("Malformed request from {src_addr}: {e}");
      let _ = respond_error(reader.get_mut(), 400, "Bad Request").await;
      return;
    }
    Err(_) => {
      debug!("Timed out reading the request head from {src_addr}");
      return;
    }
  };

  // Bare host first: matchers and group selection see no port
  let bare_host = match sanitize_host_header(head.host_source(), "") {
    Ok(host) => host,
    Err(e) => {
      warn!("Failed to prepare target host from {src_addr}: {e}");
      let _ = respond_error(reader.get_mut(), 400, "Bad Request").await;
      return;
    }
  };

  let Some(effective) = registry.select(&owner, &bare_host) else {
    warn!("Hostname {bare_host} rejected for {src_addr}");
    let _ = respond_error(reader.get_mut(), 403, "Forbidden").await;
    return;
  };

  let port = derive_port(&effective, &head);
  let target = if port.is_empty() {
    bare_host.clone()
  } else {
    format!("{bare_host}:{port}")
  };
  debug!("HTTP {} {} from {src_addr} routed to {target}", head.method, head.target);

  let dialer = match ProxyDialer::from_chain(&effective.proxy) {
    Ok(d) => d,
    Err(e) => {
      error!("Failed to build the dialer chain: {e}");
      let _ = respond_error(reader.get_mut(), 500, "Internal Server Error").await;
      return;
    }
  };

  if head.is_connect() {
    handle_connect(reader, &target, &dialer, &cancel).await;
  } else {
    handle_reverse_request(reader, head, &bare_host, &target, &dialer).await;
  }
}

/// CONNECT: dial, acknowledge with 200, then hand both raw streams to the splicer
async fn handle_connect(mut reader: BufReader<TcpStream>, target: &str, dialer: &ProxyDialer, cancel: &CancellationToken) {
  let mut outbound = match dialer.dial_target(target).await {
    Ok(s) => s,
    Err(e) => {
      error!("CONNECT to {target} failed: {e}");
      let _ = respond_error(reader.get_mut(), 502, "Bad Gateway").await;
      return;
    }
  };

  if reader
    .get_mut()
    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
    .await
    .is_err()
  {
    return;
  }

  // bytes the client pipelined behind the header block belong to the tunnel
  let buffered = reader.buffer().to_vec();
  if !buffered.is_empty() && outbound.write_all(&buffered).await.is_err() {
    return;
  }

  match relay_streams(reader.into_inner(), outbound, cancel).await {
    RelayResult::Closed { bytes } => debug!("CONNECT tunnel to {target} closed after {bytes} bytes"),
    RelayResult::Cancelled => debug!("CONNECT tunnel to {target} cancelled"),
    RelayResult::Failed(e) => warn!("CONNECT tunnel to {target} collapsed: {e}"),
  }
}

/// Reverse request: replay the request upstream through the chain and stream
/// the response back verbatim
async fn handle_reverse_request(
  mut reader: BufReader<TcpStream>,
  head: RequestHead,
  bare_host: &str,
  target: &str,
  dialer: &ProxyDialer,
) {
  // buffered body, bounded
  let body = match head.content_length() {
    Some(len) if len > MAX_REQUEST_BODY => {
      let _ = respond_error(reader.get_mut(), 400, "Bad Request").await;
      return;
    }
    Some(len) if len > 0 => {
      let mut body = vec![0u8; len];
      if reader.read_exact(&mut body).await.is_err() {
        return;
      }
      body
    }
    _ => Vec::new(),
  };

  let mut outbound = match dialer.dial_target(target).await {
    Ok(s) => s,
    Err(e) => {
      error!("Request to {target} failed: {e}");
      let _ = respond_error(reader.get_mut(), 502, "Bad Gateway").await;
      return;
    }
  };

  // rebuild the request line and headers for the upstream
  let mut request = format!("{} {} HTTP/1.1\r\n", head.method, head.forward_path());
  request.push_str(&format!("Host: {bare_host}\r\n"));
  for (key, value) in &head.headers {
    if key == "host" || key == "connection" || key == JUNCTION_PORT_HEADER || key.starts_with("proxy-") {
      continue;
    }
    request.push_str(&format!("{key}: {value}\r\n"));
  }
  request.push_str("Connection: close\r\n\r\n");

  if outbound.write_all(request.as_bytes()).await.is_err() {
    return;
  }
  if !body.is_empty() && outbound.write_all(&body).await.is_err() {
    return;
  }

  // status line, headers and body stream back untouched
  let client = reader.get_mut();
  match tokio::io::copy(&mut outbound, client).await {
    Ok(bytes) => debug!("Response from {target} streamed back ({bytes} bytes)"),
    Err(e) => warn!("Response copy from {target} failed: {e}"),
  }
  let _ = client.shutdown().await;
}

async fn respond_error(stream: &mut TcpStream, code: u16, reason: &str) -> std::io::Result<()> {
  let response = format!("HTTP/1.1 {code} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
  stream.write_all(response.as_bytes()).await?;
  stream.shutdown().await
}

/* ---------------------------------------------------------- */
