//! Transport abstraction for network I/O.
//!
//! The endpoint state machines never touch sockets. Drivers move their
//! bytes over one of two transports:
//!
//! - [`DatagramTransport`]: unreliable, unordered datagrams (NetTask and
//!   Netflow over UDP)
//! - [`StreamTransport`]: reliable, ordered byte streams (AlertFlow over TCP)
//!
//! # Implementations
//!
//! - **Tokio** (here): [`UdpTransport`] and [`TcpTransport`]
//! - **Turmoil** (nms-harness): the same traits over simulated sockets, so
//!   the drivers run unchanged under deterministic network faults
//!
//! The protocol does not rely on the transport for anything but delivery.
//! Loss and duplication on the datagram side are handled by sequence numbers
//! and timeouts; integrity on the stream side is the stream's job.

use std::{io, net::SocketAddr};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{
        TcpListener, TcpStream, UdpSocket,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};

/// Abstract transport for connectionless datagrams.
#[async_trait]
pub trait DatagramTransport: Send + Sync + 'static {
    /// Sends one datagram to `target`.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the socket is closed or the datagram is
    /// too large for the path.
    async fn send_to(&self, bytes: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Receives one datagram, returning its length and source.
    ///
    /// Blocks until a datagram arrives.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the socket is closed.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Address the transport is bound to.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the socket has no local address.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Abstract transport for reliable, ordered byte streams.
///
/// Connections come back split into a write half and a read half so a
/// driver can read and write from different tasks.
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    /// Type of stream for sending data.
    type SendStream: AsyncWrite + Unpin + Send + 'static;

    /// Type of stream for receiving data.
    type RecvStream: AsyncRead + Unpin + Send + 'static;

    /// Accepts an incoming connection, returning `(send, recv)` halves and
    /// the peer address.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the transport is not listening or the
    /// listener fails.
    async fn accept(&self) -> io::Result<(Self::SendStream, Self::RecvStream, SocketAddr)>;

    /// Connects to `remote`, returning `(send, recv)` halves.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the remote is unreachable or refuses.
    async fn connect(
        &self,
        remote: SocketAddr,
    ) -> io::Result<(Self::SendStream, Self::RecvStream)>;
}

/// [`DatagramTransport`] over a tokio UDP socket.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind a UDP socket at `addr`.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the address is unavailable.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self { socket: UdpSocket::bind(addr).await? })
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn send_to(&self, bytes: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(bytes, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// [`StreamTransport`] over tokio TCP.
///
/// A transport created with [`TcpTransport::client`] can only connect.
#[derive(Debug)]
pub struct TcpTransport {
    listener: Option<TcpListener>,
}

impl TcpTransport {
    /// Listen for connections at `addr`.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the address is unavailable.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self { listener: Some(TcpListener::bind(addr).await?) })
    }

    /// Connect-only transport
    #[must_use]
    pub fn client() -> Self {
        Self { listener: None }
    }

    fn listening(&self) -> io::Result<&TcpListener> {
        self.listener.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "transport is not listening")
        })
    }

    /// Listening address, if bound.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` for a connect-only transport.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listening()?.local_addr()
    }
}

#[async_trait]
impl StreamTransport for TcpTransport {
    type SendStream = OwnedWriteHalf;
    type RecvStream = OwnedReadHalf;

    async fn accept(&self) -> io::Result<(Self::SendStream, Self::RecvStream, SocketAddr)> {
        let (stream, peer) = self.listening()?.accept().await?;
        let (recv, send) = stream.into_split();
        Ok((send, recv, peer))
    }

    async fn connect(
        &self,
        remote: SocketAddr,
    ) -> io::Result<(Self::SendStream, Self::RecvStream)> {
        let stream = TcpStream::connect(remote).await?;
        let (recv, send) = stream.into_split();
        Ok((send, recv))
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn loopback() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
    }

    #[tokio::test]
    async fn udp_datagrams_carry_their_source() {
        let a = UdpTransport::bind(loopback()).await.unwrap();
        let b = UdpTransport::bind(loopback()).await.unwrap();

        a.send_to(b"NTSK", b.local_addr().unwrap()).await.unwrap();

        let mut buf = [0u8; 16];
        let (len, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"NTSK");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn tcp_halves_are_independent() {
        let server = TcpTransport::bind(loopback()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let client = TcpTransport::client();

        let (accepted, connected) = tokio::join!(server.accept(), client.connect(addr));
        let (_, mut server_recv, _) = accepted.unwrap();
        let (mut client_send, _) = connected.unwrap();

        client_send.write_all(b"ALRT").await.unwrap();
        let mut buf = [0u8; 4];
        server_recv.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ALRT");
    }

    #[tokio::test]
    async fn client_transport_cannot_accept() {
        let client = TcpTransport::client();
        let err = client.accept().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
