//! SOCKS5 CONNECT client over an arbitrary byte stream, RFC 1928 / RFC 1929.

use crate::error::DialerError;
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;

/// Perform a SOCKS5 CONNECT handshake for `host:port` on an established stream.
/// On success the stream carries the tunneled connection.
pub(crate) async fn connect<S>(stream: &mut S, host: &str, port: u16, auth: Option<(&str, &str)>) -> Result<(), DialerError>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  // Greeting with the methods we can do
  let method = if auth.is_some() { AUTH_PASSWORD } else { AUTH_NONE };
  stream.write_all(&[SOCKS5_VERSION, 1, method]).await?;

  let mut selected = [0u8; 2];
  stream.read_exact(&mut selected).await?;
  if selected[0] != SOCKS5_VERSION {
    return Err(DialerError::socks5(format!("unexpected version {}", selected[0])));
  }
  if selected[1] == AUTH_NO_ACCEPTABLE {
    return Err(DialerError::socks5("server accepted none of our auth methods"));
  }

  // Username/password subnegotiation, RFC 1929
  if selected[1] == AUTH_PASSWORD {
    let (username, password) = auth.ok_or_else(|| DialerError::socks5("server requires authentication"))?;
    if username.len() > 255 || password.len() > 255 {
      return Err(DialerError::socks5("credentials exceed 255 bytes"));
    }
    let mut request = vec![0x01, username.len() as u8];
    request.extend_from_slice(username.as_bytes());
    request.push(password.len() as u8);
    request.extend_from_slice(password.as_bytes());
    stream.write_all(&request).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    if response[1] != 0x00 {
      return Err(DialerError::socks5("authentication failed"));
    }
  }

  // CONNECT request
  let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
  match host.parse::<IpAddr>() {
    Ok(IpAddr::V4(v4)) => {
      request.push(ATYP_IPV4);
      request.extend_from_slice(&v4.octets());
    }
    Ok(IpAddr::V6(v6)) => {
      request.push(ATYP_IPV6);
      request.extend_from_slice(&v6.octets());
    }
    Err(_) => {
      if host.len() > 255 {
        return Err(DialerError::socks5("domain name exceeds 255 bytes"));
      }
      request.push(ATYP_DOMAIN);
      request.push(host.len() as u8);
      request.extend_from_slice(host.as_bytes());
    }
  }
  request.extend_from_slice(&port.to_be_bytes());
  stream.write_all(&request).await?;

  // Reply: VER REP RSV ATYP BND.ADDR BND.PORT
  let mut reply = [0u8; 4];
  stream.read_exact(&mut reply).await?;
  if reply[0] != SOCKS5_VERSION {
    return Err(DialerError::socks5(format!("unexpected version {} in reply", reply[0])));
  }
  if reply[1] != REP_SUCCESS {
    return Err(DialerError::socks5(reply_error(reply[1])));
  }

  // Drain the bound address
  match reply[3] {
    ATYP_IPV4 => {
      let mut skip = [0u8; 6];
      stream.read_exact(&mut skip).await?;
    }
    ATYP_IPV6 => {
      let mut skip = [0u8; 18];
      stream.read_exact(&mut skip).await?;
    }
    ATYP_DOMAIN => {
      let mut len = [0u8; 1];
      stream.read_exact(&mut len).await?;
      let mut skip = vec![0u8; len[0] as usize + 2];
      stream.read_exact(&mut skip).await?;
    }
    other => return Err(DialerError::socks5(format!("unknown bound address type {other}"))),
  }

  Ok(())
}

fn reply_error(code: u8) -> &'static str {
  match code {
    0x01 => "general failure",
    0x02 => "connection not allowed",
    0x03 => "network unreachable",
    0x04 => "host unreachable",
    0x05 => "connection refused",
    0x06 => "TTL expired",
    0x07 => "command not supported",
    0x08 => "address type not supported",
    _ => "unknown error",
  }
}
