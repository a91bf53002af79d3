//! RTP sender sessions.
//!
//! A session is one receiver endpoint. It owns the RTP numbering for that
//! receiver (SSRC, sequence counter, timestamp offset), a bounded outbound
//! queue and a sender thread that drains the queue onto the transport.
//!
//! ## Session lifecycle
//!
//! ```text
//! register                                   -> Created
//! first successful send                      -> Active
//! teardown / N consecutive send failures     -> Closed
//! ```
//!
//! Closing is one-way and idempotent. A closed session stays in the
//! [`SessionManager`] (so its statistics remain readable) until
//! [`SessionManager::prune_closed`] removes it.

pub mod stats;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::error::{Result, StreamError, TransportError};
use crate::media::Fragment;
use crate::media::rtp::{RtpPacket, RtpSequencer};
use crate::queue::BoundedQueue;
use crate::transport::PacketSink;
pub use stats::{SessionStats, SessionStatsSnapshot};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Per-session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Packets buffered for the sender thread before the oldest is dropped.
    pub outbound_queue_capacity: usize,
    /// Consecutive send failures after which the receiver is presumed gone.
    pub max_consecutive_failures: u32,
    /// Fixed SSRC instead of a random one.
    pub ssrc: Option<u32>,
    /// Fixed first sequence number instead of a random one.
    pub initial_sequence: Option<u16>,
    /// Fixed RTP timestamp offset instead of a random one.
    pub timestamp_offset: Option<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 256,
            max_consecutive_failures: 10,
            ssrc: None,
            initial_sequence: None,
            timestamp_offset: None,
        }
    }
}

/// Session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered, nothing delivered yet.
    Created,
    /// At least one packet reached the transport.
    Active,
    /// Torn down or presumed unreachable. Terminal.
    Closed,
}

/// One receiver endpoint.
///
/// Interior mutability lets the packetize thread, the session's sender
/// thread and control callers share it behind an `Arc`. The sequencer is
/// only ever touched by the packetize stage, the counters only by the
/// sender thread.
///
/// Packets are numbered when they are queued, not when they are sent. A
/// packet evicted from a full outbound queue has already used its sequence
/// number, so the drop shows up on the wire as a gap the receiver can count
/// as loss. Numbering at send time would hide overflow drops from it.
pub struct Session {
    /// Unique session identifier (16-char hex string).
    pub id: String,
    /// Receiver address for RTP.
    pub destination: SocketAddr,
    state: RwLock<SessionState>,
    sequencer: Mutex<RtpSequencer>,
    outbound: BoundedQueue<RtpPacket>,
    stats: SessionStats,
    max_consecutive_failures: u32,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn new(
        destination: SocketAddr,
        payload_type: u8,
        clock_rate: u32,
        config: &SessionConfig,
    ) -> Self {
        let id = SESSION_COUNTER.fetch_add(1, Ordering::SeqCst);
        let sequencer = RtpSequencer::new(
            payload_type,
            config.ssrc.unwrap_or_else(rand::random::<u32>),
            clock_rate,
            config.initial_sequence.unwrap_or_else(rand::random::<u16>),
            config.timestamp_offset.unwrap_or_else(rand::random::<u32>),
        );

        Session {
            id: format!("{:016X}", id),
            destination,
            state: RwLock::new(SessionState::Created),
            sequencer: Mutex::new(sequencer),
            outbound: BoundedQueue::new(config.outbound_queue_capacity),
            stats: SessionStats::default(),
            max_consecutive_failures: config.max_consecutive_failures.max(1),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the sender thread delivering this session's queue to `sink`.
    pub fn start(self: &Arc<Self>, sink: Arc<dyn PacketSink>) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(StreamError::AlreadyRunning);
        }
        let session = self.clone();
        let handle = thread::Builder::new()
            .name(format!("rtp-session-{}", self.id))
            .spawn(move || session.run_sender(sink))?;
        *worker = Some(handle);
        Ok(())
    }

    pub fn ssrc(&self) -> u32 {
        self.sequencer.lock().ssrc
    }

    /// Sequence number the next packet will carry.
    pub fn next_sequence(&self) -> u16 {
        self.sequencer.lock().sequence()
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub fn stats(&self) -> SessionStatsSnapshot {
        self.stats.snapshot(self.outbound.dropped())
    }

    /// Packets waiting for the sender thread.
    pub fn queued(&self) -> usize {
        self.outbound.len()
    }

    /// Number one unit's fragments with this session's sequencer and queue
    /// the packets. Returns how many packets were queued.
    pub fn submit(&self, fragments: &[Fragment], pts: Duration) -> std::result::Result<usize, TransportError> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed(self.id.clone()));
        }
        let packets = self.sequencer.lock().stamp(fragments, pts);
        let count = packets.len();
        for packet in packets {
            self.send(packet)?;
        }
        Ok(count)
    }

    /// Queue one packet for transmission without blocking.
    ///
    /// When the queue is full the oldest queued packet is dropped and
    /// counted as lost. Order of the remaining packets is preserved.
    pub fn send(&self, packet: RtpPacket) -> std::result::Result<(), TransportError> {
        match self.outbound.push(packet) {
            Ok(None) => Ok(()),
            Ok(Some(evicted)) => {
                tracing::trace!(
                    session_id = %self.id,
                    seq = evicted.sequence,
                    dropped = self.outbound.dropped(),
                    "outbound queue full, oldest packet dropped"
                );
                Ok(())
            }
            Err(_) => Err(TransportError::SessionClosed(self.id.clone())),
        }
    }

    /// Close the session, discarding anything still queued.
    ///
    /// Returns `false` if it was already closed; nothing else happens then.
    pub fn close(&self) -> bool {
        {
            let mut state = self.state.write();
            if *state == SessionState::Closed {
                return false;
            }
            tracing::debug!(session_id = %self.id, old_state = ?*state, "state transition to Closed");
            *state = SessionState::Closed;
        }

        let discarded = self.outbound.clear();
        self.outbound.close();
        tracing::info!(session_id = %self.id, discarded, "session closed");
        true
    }

    /// Let the sender thread deliver everything queued, then close.
    pub fn finish(&self) {
        self.outbound.close();
        self.join();
        self.close();
    }

    /// Wait for the sender thread to exit. No-op from the sender thread itself.
    pub fn join(&self) {
        let handle = {
            let mut worker = self.worker.lock();
            if worker
                .as_ref()
                .is_some_and(|h| h.thread().id() == thread::current().id())
            {
                return;
            }
            worker.take()
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!(session_id = %self.id, "session sender thread panicked");
            }
        }
    }

    fn mark_active(&self) {
        let mut state = self.state.write();
        if *state == SessionState::Created {
            *state = SessionState::Active;
            tracing::info!(
                session_id = %self.id,
                destination = %self.destination,
                "session active"
            );
        }
    }

    /// Sender thread body: strict FIFO, one packet at a time.
    fn run_sender(self: Arc<Self>, sink: Arc<dyn PacketSink>) {
        let mut buf = Vec::with_capacity(1500);

        while let Some(packet) = self.outbound.pop() {
            buf.clear();
            packet.write_to(&mut buf);

            let outcome = match sink.send_to(&buf, self.destination) {
                Ok(n) if n == buf.len() => Ok(n),
                Ok(n) => Err(TransportError::ShortSend {
                    sent: n,
                    len: buf.len(),
                }),
                Err(e) => Err(TransportError::Io(e)),
            };

            match outcome {
                Ok(n) => {
                    self.stats.record_sent(n);
                    self.mark_active();
                    tracing::trace!(session_id = %self.id, seq = packet.sequence, ts = packet.timestamp, bytes = n, "packet sent");
                }
                Err(e) => {
                    let consecutive = self.stats.record_failure();
                    tracing::warn!(
                        session_id = %self.id,
                        seq = packet.sequence,
                        consecutive,
                        error = %e,
                        "RTP send failed"
                    );
                    if consecutive >= self.max_consecutive_failures {
                        tracing::warn!(
                            session_id = %self.id,
                            destination = %self.destination,
                            consecutive,
                            "receiver presumed unreachable"
                        );
                        self.close();
                        break;
                    }
                }
            }
        }

        tracing::debug!(session_id = %self.id, "sender thread exited");
    }
}

/// Thread-safe registry of sessions.
///
/// Backed by `parking_lot::RwLock` for fast concurrent reads. The live
/// session list is read once per encoded unit by the packetize stage.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        SessionManager {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Create a session for `destination`, start its sender thread and
    /// register it.
    pub fn register(
        &self,
        destination: SocketAddr,
        payload_type: u8,
        clock_rate: u32,
        sink: Arc<dyn PacketSink>,
    ) -> Result<Arc<Session>> {
        let session = Arc::new(Session::new(
            destination,
            payload_type,
            clock_rate,
            &self.config,
        ));
        session.start(sink)?;

        let id = session.id.clone();
        let total = {
            let mut sessions = self.sessions.write();
            sessions.insert(id.clone(), session.clone());
            sessions.len()
        };
        tracing::info!(
            session_id = %id,
            %destination,
            ssrc = format_args!("{:#010X}", session.ssrc()),
            total_sessions = total,
            "session created"
        );

        Ok(session)
    }

    /// Look up a session by ID.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Close a session and wait for its sender thread.
    ///
    /// Tearing down an already closed session succeeds without effect.
    pub fn teardown(&self, id: &str) -> Result<()> {
        let session = self
            .get(id)
            .ok_or_else(|| StreamError::SessionNotFound(id.to_string()))?;
        session.close();
        session.join();
        Ok(())
    }

    /// Sessions that are not closed.
    pub fn live_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .filter(|s| !s.is_closed())
            .cloned()
            .collect()
    }

    /// Every registered session, closed ones included.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop closed sessions from the registry.
    pub fn prune_closed(&self) -> usize {
        let closed: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write();
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.is_closed())
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in &closed {
            session.join();
        }
        if !closed.is_empty() {
            tracing::debug!(removed = closed.len(), remaining = self.len(), "closed sessions pruned");
        }
        closed.len()
    }

    /// Close every session, discarding queued packets.
    pub fn close_all(&self) {
        for session in self.sessions() {
            session.close();
            session.join();
        }
    }

    /// Drain every session's queue, then close it.
    pub fn finish_all(&self) {
        for session in self.sessions() {
            session.finish();
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}
