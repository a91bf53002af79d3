//! RTP receiving side.
//!
//! [`RtpReceiver`] listens on a UDP port, parses datagrams, hands them to a
//! [`FrameAssembler`] and depacketizes completed frames with the configured
//! [`PayloadFormat`]. Rebuilt units are queued for the caller the same way
//! the sender pipeline queues between stages: bounded, oldest dropped.

pub mod assembler;

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::Result;
use crate::media::rtp::RtpPacket;
use crate::media::{PayloadFormat, VIDEO_CLOCK_RATE};
use crate::queue::BoundedQueue;
pub use assembler::{AssembledFrame, AssemblerStats, FrameAssembler};

/// Socket read timeout; bounds how long `stop` waits for the thread.
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Largest datagram accepted.
const MAX_DATAGRAM: usize = 65_536;

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Local address to listen on.
    pub bind_addr: String,
    pub payload_format: PayloadFormat,
    pub clock_rate: u32,
    /// Incomplete frames kept at once before the oldest is given up.
    pub max_pending_frames: usize,
    /// How long an incomplete frame may wait for missing packets.
    pub max_frame_age: Duration,
    /// Rebuilt frames buffered for the caller.
    pub frame_queue_capacity: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5004".to_string(),
            payload_format: PayloadFormat::default(),
            clock_rate: VIDEO_CLOCK_RATE,
            max_pending_frames: 16,
            max_frame_age: Duration::from_millis(500),
            frame_queue_capacity: 16,
        }
    }
}

/// One unit rebuilt from the network.
#[derive(Debug, Clone)]
pub struct ReceivedFrame {
    pub data: Bytes,
    pub ssrc: u32,
    pub timestamp: u32,
    pub first_sequence: u16,
    pub packets: usize,
    pub received_at: Instant,
}

/// Receiver counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReceiverStats {
    pub assembler: AssemblerStats,
    /// Datagrams that were not valid RTP.
    pub parse_errors: u64,
    /// Datagrams with a payload type other than the expected one.
    pub foreign_packets: u64,
    /// Assembled frames whose payloads did not follow the payload format.
    pub depacketize_errors: u64,
    /// Frames dropped because the caller did not keep up.
    pub frames_dropped: u64,
}

/// Background UDP receiver producing [`ReceivedFrame`]s.
pub struct RtpReceiver {
    local_addr: SocketAddr,
    frames: Arc<BoundedQueue<ReceivedFrame>>,
    stats: Arc<Mutex<ReceiverStats>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RtpReceiver {
    /// Bind the socket and start the receive thread.
    pub fn bind(config: ReceiverConfig) -> Result<Self> {
        Self::bind_filtered(config, None)
    }

    /// Like [`bind`](Self::bind), but ignore payload types other than `pt`.
    pub fn bind_filtered(config: ReceiverConfig, payload_type: Option<u8>) -> Result<Self> {
        let socket = UdpSocket::bind(&config.bind_addr)?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        let local_addr = socket.local_addr()?;

        let frames = Arc::new(BoundedQueue::new(config.frame_queue_capacity));
        let stats = Arc::new(Mutex::new(ReceiverStats::default()));
        let running = Arc::new(AtomicBool::new(true));

        let worker = ReceiveLoop {
            socket,
            format: config.payload_format,
            payload_type,
            assembler: FrameAssembler::new(
                config.clock_rate,
                config.max_pending_frames,
                config.max_frame_age,
            ),
            frames: frames.clone(),
            stats: stats.clone(),
            running: running.clone(),
        };
        let handle = thread::Builder::new()
            .name("rtp-receive".to_string())
            .spawn(move || worker.run())?;

        tracing::info!(
            %local_addr,
            format = %config.payload_format,
            "RTP receiver listening"
        );

        Ok(Self {
            local_addr,
            frames,
            stats,
            running,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next rebuilt frame. Blocks; `None` once stopped and drained.
    pub fn recv_frame(&self) -> Option<ReceivedFrame> {
        self.frames.pop()
    }

    pub fn recv_frame_timeout(&self, timeout: Duration) -> Option<ReceivedFrame> {
        self.frames.pop_timeout(timeout)
    }

    pub fn stats(&self) -> ReceiverStats {
        let mut stats = self.stats.lock().clone();
        stats.frames_dropped = self.frames.dropped();
        stats
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the receive thread. Frames already queued stay readable.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("receive thread panicked");
            }
            tracing::info!(local_addr = %self.local_addr, "RTP receiver stopped");
        }
    }
}

impl Drop for RtpReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ReceiveLoop {
    socket: UdpSocket,
    format: PayloadFormat,
    payload_type: Option<u8>,
    assembler: FrameAssembler,
    frames: Arc<BoundedQueue<ReceivedFrame>>,
    stats: Arc<Mutex<ReceiverStats>>,
    running: Arc<AtomicBool>,
}

impl ReceiveLoop {
    fn run(mut self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        while self.running.load(Ordering::SeqCst) {
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => self.handle_datagram(&buf[..n], from),
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    if self.assembler.expire(Instant::now()) > 0 {
                        self.publish_stats();
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "receive failed");
                    thread::sleep(READ_TIMEOUT);
                }
            }
        }

        self.frames.close();
        tracing::debug!("receive thread exited");
    }

    fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        let packet = match RtpPacket::parse(datagram) {
            Ok(p) => p,
            Err(e) => {
                self.stats.lock().parse_errors += 1;
                tracing::debug!(%from, len = datagram.len(), error = %e, "dropping non-RTP datagram");
                return;
            }
        };
        if self.payload_type.is_some_and(|pt| pt != packet.payload_type) {
            self.stats.lock().foreign_packets += 1;
            return;
        }

        let received_at = Instant::now();
        if let Some(frame) = self.assembler.push(packet, received_at) {
            let packets = frame.payloads.len();
            match self.format.depacketize(&frame.payloads) {
                Ok(data) => {
                    let rebuilt = ReceivedFrame {
                        data,
                        ssrc: frame.ssrc,
                        timestamp: frame.timestamp,
                        first_sequence: frame.first_sequence,
                        packets,
                        received_at,
                    };
                    if let Ok(Some(old)) = self.frames.push(rebuilt) {
                        tracing::debug!(ts = old.timestamp, "frame queue full, oldest frame dropped");
                    }
                }
                Err(e) => {
                    self.stats.lock().depacketize_errors += 1;
                    tracing::warn!(ts = frame.timestamp, error = %e, "frame could not be depacketized");
                }
            }
        }
        self.publish_stats();
    }

    fn publish_stats(&self) {
        self.stats.lock().assembler = self.assembler.stats().clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::rtp::RtpSequencer;
    use crate::media::Fragment;

    fn loopback() -> ReceiverConfig {
        ReceiverConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn receives_and_rebuilds_frame() {
        let mut receiver = RtpReceiver::bind(loopback()).unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();

        let mut seq = RtpSequencer::new(96, 0x42, VIDEO_CLOCK_RATE, 100, 0);
        let fragments = vec![
            Fragment {
                payload: Bytes::from_static(b"hello "),
                marker: false,
            },
            Fragment {
                payload: Bytes::from_static(b"world"),
                marker: true,
            },
        ];
        for packet in seq.stamp(&fragments, Duration::from_millis(40)) {
            sender.send_to(&packet.to_bytes(), receiver.local_addr()).unwrap();
        }

        let frame = receiver.recv_frame_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(&frame.data[..], b"hello world");
        assert_eq!(frame.ssrc, 0x42);
        assert_eq!(frame.timestamp, 3600);
        assert_eq!(frame.first_sequence, 100);
        assert_eq!(frame.packets, 2);

        receiver.stop();
        assert!(!receiver.is_running());
    }

    #[test]
    fn garbage_counted_as_parse_error() {
        let receiver = RtpReceiver::bind(loopback()).unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&[0x00, 0x01, 0x02], receiver.local_addr()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while receiver.stats().parse_errors == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(receiver.stats().parse_errors, 1);
    }

    #[test]
    fn stop_ends_recv_frame() {
        let mut receiver = RtpReceiver::bind(loopback()).unwrap();
        receiver.stop();
        assert!(receiver.recv_frame().is_none());
    }
}
