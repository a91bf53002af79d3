//! Outbound datagram transport for RTP media delivery.
//!
//! RTP is carried over an unreliable connectionless transport. Sessions do
//! not talk to sockets directly; they hand serialized packets to a
//! [`PacketSink`], which keeps the session layer testable against stalled
//! or failing networks.
//!
//! - **UDP** ([`udp`]): a single socket shared for all outbound RTP delivery.

pub mod udp;

use std::io;
use std::net::SocketAddr;

pub use udp::UdpTransport;

/// Something that can put one datagram on the wire.
pub trait PacketSink: Send + Sync {
    /// Send `datagram` to `addr`, returning the number of bytes accepted.
    fn send_to(&self, datagram: &[u8], addr: SocketAddr) -> io::Result<usize>;
}
