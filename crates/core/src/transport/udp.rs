use std::io;
use std::net::{SocketAddr, UdpSocket};

use super::PacketSink;
use crate::error::Result;

/// UDP transport for outbound RTP packet delivery.
///
/// Binds one socket (ephemeral by default) and sends RTP packets to the
/// destinations resolved by the session layer.
///
/// This layer is address-only and does not know about
/// sessions. The caller resolves session state to socket addresses before
/// calling [`send_to`](PacketSink::send_to).
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind an ephemeral UDP socket on all interfaces.
    pub fn bind() -> Result<Self> {
        Self::bind_to("0.0.0.0:0")
    }

    /// Bind the outbound socket to a specific local address.
    pub fn bind_to(addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        tracing::debug!(local_addr = ?socket.local_addr().ok(), "UDP transport bound");
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl PacketSink for UdpTransport {
    fn send_to(&self, datagram: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(datagram, addr)
    }
}
