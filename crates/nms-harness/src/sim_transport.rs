//! Turmoil-backed transports.
//!
//! [`SimDatagramTransport`] carries NetTask and Netflow over simulated UDP,
//! where turmoil can drop, delay and partition traffic. [`SimStreamTransport`]
//! carries AlertFlow over simulated TCP. Both implement the nms-core
//! transport traits, so the drivers run unchanged against real sockets.

use std::{io, net::SocketAddr};

use async_trait::async_trait;
use nms_core::transport::{DatagramTransport, StreamTransport};
use tokio::io::{ReadHalf, WriteHalf};
use turmoil::net::{TcpListener, TcpStream, UdpSocket};

/// [`DatagramTransport`] over a turmoil UDP socket.
pub struct SimDatagramTransport {
    socket: UdpSocket,
}

impl SimDatagramTransport {
    /// Bind a simulated UDP socket, e.g. `"0.0.0.0:9000"`.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the port is taken on this host.
    pub async fn bind(address: &str) -> io::Result<Self> {
        Ok(Self { socket: UdpSocket::bind(address).await? })
    }
}

#[async_trait]
impl DatagramTransport for SimDatagramTransport {
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

/// [`StreamTransport`] over turmoil TCP.
///
/// A transport created with [`SimStreamTransport::client`] can only connect.
pub struct SimStreamTransport {
    listener: Option<TcpListener>,
}

impl SimStreamTransport {
    /// Listen for connections, e.g. `"0.0.0.0:9100"`.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the port is taken on this host.
    pub async fn bind(address: &str) -> io::Result<Self> {
        Ok(Self { listener: Some(TcpListener::bind(address).await?) })
    }

    /// Connect-only transport
    pub fn client() -> Self {
        Self { listener: None }
    }
}

#[async_trait]
impl StreamTransport for SimStreamTransport {
    type SendStream = WriteHalf<TcpStream>;
    type RecvStream = ReadHalf<TcpStream>;

    async fn accept(&self) -> io::Result<(Self::SendStream, Self::RecvStream, SocketAddr)> {
        let listener = self.listener.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "transport is not listening")
        })?;
        let (stream, peer) = listener.accept().await?;
        let (recv, send) = tokio::io::split(stream);
        Ok((send, recv, peer))
    }

    async fn connect(
        &self,
        remote: SocketAddr,
    ) -> io::Result<(Self::SendStream, Self::RecvStream)> {
        let stream = TcpStream::connect(remote).await?;
        let (recv, send) = tokio::io::split(stream);
        Ok((send, recv))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn udp_reply_reaches_sender() {
        let mut sim = turmoil::Builder::new().build();

        sim.host("collector", || async {
            let transport = SimDatagramTransport::bind("0.0.0.0:9000").await?;
            let mut buf = [0u8; 64];
            let (len, from) = transport.recv_from(&mut buf).await?;
            transport.send_to(&buf[..len], from).await?;
            Ok(())
        });

        sim.client("agent", async {
            let transport = SimDatagramTransport::bind("0.0.0.0:40000").await?;
            let collector = SocketAddr::new(turmoil::lookup("collector"), 9000);

            transport.send_to(b"NTSK", collector).await?;

            let mut buf = [0u8; 64];
            let (len, from) = transport.recv_from(&mut buf).await?;
            assert_eq!(&buf[..len], b"NTSK");
            assert_eq!(from, collector);
            Ok(())
        });

        sim.run().expect("simulation failed");
    }

    #[test]
    fn stream_halves_carry_bytes_both_ways() {
        let mut sim = turmoil::Builder::new().build();

        sim.host("collector", || async {
            let transport = SimStreamTransport::bind("0.0.0.0:9100").await?;
            let (mut send, mut recv, _) = transport.accept().await?;

            let mut buf = [0u8; 4];
            recv.read_exact(&mut buf).await?;
            assert_eq!(&buf, b"ALRT");
            send.write_all(b"ack!").await?;
            Ok(())
        });

        sim.client("agent", async {
            let collector = SocketAddr::new(turmoil::lookup("collector"), 9100);
            let (mut send, mut recv) = SimStreamTransport::client().connect(collector).await?;

            send.write_all(b"ALRT").await?;
            let mut buf = [0u8; 4];
            recv.read_exact(&mut buf).await?;
            assert_eq!(&buf, b"ack!");
            Ok(())
        });

        sim.run().expect("simulation failed");
    }

    #[test]
    fn client_transport_cannot_accept() {
        let mut sim = turmoil::Builder::new().build();

        sim.client("agent", async {
            let Err(err) = SimStreamTransport::client().accept().await else {
                panic!("connect-only transport accepted a connection");
            };
            assert_eq!(err.kind(), io::ErrorKind::NotConnected);
            Ok(())
        });

        sim.run().expect("simulation failed");
    }
}
