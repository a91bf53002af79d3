use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

/// Transmission counters for one session.
///
/// Written only by the session's sender thread; anyone may read a
/// [`snapshot`](Self::snapshot).
#[derive(Debug, Default)]
pub struct SessionStats {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    send_failures: AtomicU64,
    consecutive_failures: AtomicU32,
    last_send: Mutex<Option<Instant>>,
}

/// Point-in-time copy of [`SessionStats`] plus the outbound queue loss count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatsSnapshot {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    /// Packets evicted from the outbound queue before they could be sent.
    pub packets_dropped: u64,
    pub send_failures: u64,
    pub consecutive_failures: u32,
    pub last_send: Option<Instant>,
}

impl SessionStats {
    pub(crate) fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        *self.last_send.lock() = Some(Instant::now());
    }

    /// Returns the consecutive failure count including this one.
    pub(crate) fn record_failure(&self) -> u32 {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn snapshot(&self, packets_dropped: u64) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_dropped,
            send_failures: self.send_failures.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            last_send: *self.last_send.lock(),
        }
    }
}
