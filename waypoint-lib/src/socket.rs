use crate::error::NetworkError;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpSocket, UdpSocket};

/// Bind a TCP listener with `SO_REUSEADDR` and `SO_REUSEPORT` set.
/// Re-binding must succeed when a new supervisor generation replaces the old
/// one during configuration reload.
pub(crate) fn bind_tcp_listener(listen_on: &SocketAddr, backlog: u32) -> Result<TcpListener, NetworkError> {
  let bind = |addr: &SocketAddr| -> Result<TcpListener, std::io::Error> {
    let socket = if addr.is_ipv6() { TcpSocket::new_v6() } else { TcpSocket::new_v4() }?;
    socket.set_reuseaddr(true)?;

    #[cfg(not(target_os = "windows"))]
    socket.set_reuseport(true)?;

    socket.bind(*addr)?;
    socket.listen(backlog)
  };

  bind(listen_on).map_err(|source| NetworkError::BindFailed {
    address: *listen_on,
    source,
  })
}

/// Bind a UDP socket with the same re-bind options as the TCP path
pub(crate) fn bind_udp_socket(listen_on: &SocketAddr) -> Result<UdpSocket, NetworkError> {
  let bind = |addr: &SocketAddr| -> Result<UdpSocket, std::io::Error> {
    let socket = if addr.is_ipv6() {
      Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))
    } else {
      Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
    }?;
    socket.set_reuse_address(true)?;

    #[cfg(not(target_os = "windows"))]
    socket.set_reuse_port(true)?;

    // required for recv_from through the tokio wrapper
    socket.set_nonblocking(true)?;

    socket.bind(&(*addr).into())?;
    UdpSocket::from_std(socket.into())
  };

  bind(listen_on).map_err(|source| NetworkError::BindFailed {
    address: *listen_on,
    source,
  })
}
