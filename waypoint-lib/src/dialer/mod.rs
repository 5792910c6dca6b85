//! Proxy-chain dialer: direct, SOCKS5 and SSH hops composed in order so that
//! each hop dials through the previous one. The hop set is closed; building a
//! chain with an unknown scheme fails up front.

mod socks5;
mod ssh;

use crate::{error::DialerError, trace::*};
use ssh::SshDialer;
use std::{future::Future, pin::Pin};
use tokio::{
  io::{AsyncRead, AsyncWrite},
  net::TcpStream,
};
use url::Url;

/// Byte stream produced by a dialer, whatever transport it rides on
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Boxed stream handed to the splicer
pub type ProxyStream = Box<dyn AsyncStream>;

/* ---------------------------------------------------------- */
#[derive(Debug, Clone)]
/// Dialing primitive built from an entry's proxy chain.
///
/// `Direct` talks to the OS; every other variant tunnels the requested target
/// through its hop, itself reached via the inner dialer.
pub enum ProxyDialer {
  Direct,
  Socks5(Socks5Dialer),
  Ssh(SshDialer),
}

#[derive(Debug, Clone)]
/// One SOCKS5 hop of the dialer chain
pub struct Socks5Dialer {
  host: String,
  port: u16,
  credentials: Option<(String, String)>,
  inner: Box<ProxyDialer>,
}

impl ProxyDialer {
  /// Right-fold the chain: start direct, then wrap one adapter per URL in order.
  /// The last URL in the chain is the hop closest to the final destination.
  pub fn from_chain(chain: &[Url]) -> Result<Self, DialerError> {
    let mut dialer = ProxyDialer::Direct;
    for url in chain {
      dialer = match url.scheme() {
        "socks5" | "socks5h" => ProxyDialer::Socks5(Socks5Dialer::from_url(url, dialer)?),
        "ssh" => ProxyDialer::Ssh(SshDialer::from_url(url, dialer)?),
        other => {
          return Err(DialerError::UnsupportedScheme {
            scheme: other.to_string(),
          });
        }
      };
    }
    Ok(dialer)
  }

  /// Open a stream to `host:port` through the whole chain.
  /// Boxed because each hop recurses into its inner dialer.
  pub fn dial<'a>(&'a self, host: &'a str, port: u16) -> Pin<Box<dyn Future<Output = Result<ProxyStream, DialerError>> + Send + 'a>> {
    Box::pin(async move {
      match self {
        Self::Direct => {
          let stream = TcpStream::connect((host, port)).await.map_err(|source| DialerError::Connect {
            address: format!("{host}:{port}"),
            source,
          })?;
          debug!("direct connection established to {host}:{port}");
          Ok(Box::new(stream) as ProxyStream)
        }
        Self::Socks5(hop) => hop.dial(host, port).await,
        Self::Ssh(hop) => hop.dial(host, port).await,
      }
    })
  }

  /// Dial a `host:port` target string through the chain
  pub async fn dial_target(&self, target: &str) -> Result<ProxyStream, DialerError> {
    let (host, port) = split_host_port(target)?;
    self.dial(&host, port).await
  }
}

impl Socks5Dialer {
  fn from_url(url: &Url, inner: ProxyDialer) -> Result<Self, DialerError> {
    let host = url
      .host_str()
      .ok_or_else(|| DialerError::MissingHost { url: url.to_string() })?
      .to_string();
    let port = url.port().unwrap_or(1080);
    let credentials = if url.username().is_empty() {
      None
    } else {
      Some((url.username().to_string(), url.password().unwrap_or_default().to_string()))
    };
    Ok(Self {
      host,
      port,
      credentials,
      inner: Box::new(inner),
    })
  }

  async fn dial(&self, host: &str, port: u16) -> Result<ProxyStream, DialerError> {
    let mut stream = self.inner.dial(&self.host, self.port).await?;
    let auth = self.credentials.as_ref().map(|(u, p)| (u.as_str(), p.as_str()));
    socks5::connect(&mut stream, host, port, auth).await?;
    debug!("SOCKS5 tunnel to {host}:{port} established via {}:{}", self.host, self.port);
    Ok(stream)
  }
}

/// Split a `host:port` target, with IPv6 brackets tolerated
pub(crate) fn split_host_port(target: &str) -> Result<(String, u16), DialerError> {
  let err = || DialerError::Socks5 {
    reason: format!("invalid target address: {target}"),
  };
  let (host, port) = target.rsplit_once(':').ok_or_else(err)?;
  let port = port.parse::<u16>().map_err(|_| err())?;
  let host = host.trim_start_matches('[').trim_end_matches(']');
  if host.is_empty() {
    return Err(err());
  }
  Ok((host.to_string(), port))
}

/* ---------------------------------------------------------- */
