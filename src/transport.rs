use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use thiserror::Error;
use tokio::net::UdpSocket;

/// Largest UDP message we accept.
pub const MAX_MSG_SIZE: usize = 65536;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Opens the probe's listening socket on `port`, optionally pinned to
/// `source_ip`. Must be called from inside a tokio runtime.
pub fn listen(source_ip: Option<IpAddr>, port: u16) -> Result<UdpSocket, TransportError> {
    let addr = SocketAddr::new(source_ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), port);
    bind(addr).map_err(|source| TransportError::Listen { addr, source })
}

fn bind(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = socket2::Socket::new(
        if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        },
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;

    // Quick restarts on the same port
    socket.set_reuse_address(true)?;

    // [::] listens for v4-mapped senders as well
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }

    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// Write errors that mean the socket is gone rather than a single send failed.
pub fn is_socket_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listen_ephemeral() {
        let sock = listen(Some("127.0.0.1".parse().unwrap()), 0).unwrap();
        let addr = sock.local_addr().unwrap();
        assert_eq!(addr.ip(), "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_listen_port_taken() {
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = listen(Some("127.0.0.1".parse().unwrap()), port).unwrap_err();
        assert!(matches!(err, TransportError::Listen { .. }));
        assert!(err.to_string().contains(&port.to_string()));
    }

    #[test]
    fn test_closed_socket_errors() {
        assert!(is_socket_closed(&io::Error::from(io::ErrorKind::NotConnected)));
        assert!(!is_socket_closed(&io::Error::from(
            io::ErrorKind::ConnectionRefused
        )));
    }
}
