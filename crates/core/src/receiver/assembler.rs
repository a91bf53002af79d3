use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::media::rtp::RtpPacket;

/// Marker sequence numbers remembered for frame-start checks.
const MARKER_HISTORY: usize = 64;

/// All payloads of one unit, in sequence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledFrame {
    pub ssrc: u32,
    pub timestamp: u32,
    pub first_sequence: u16,
    pub payloads: Vec<Bytes>,
}

/// Assembler counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssemblerStats {
    pub packets_received: u64,
    pub duplicate_packets: u64,
    /// Packets for a frame already emitted or given up on.
    pub late_packets: u64,
    pub frames_completed: u64,
    /// Incomplete frames evicted for age, pending limit, or being overtaken.
    pub frames_lost: u64,
    /// RFC 3550 §6.4.1 interarrival jitter, in RTP clock units.
    pub jitter: f64,
}

#[derive(Debug)]
struct PendingFrame {
    timestamp: u32,
    first_seen: Instant,
    /// First sequence number seen for this frame; keys are offsets from it.
    anchor: u16,
    packets: BTreeMap<i32, RtpPacket>,
    marker: Option<i32>,
}

impl PendingFrame {
    fn new(timestamp: u32, anchor: u16, now: Instant) -> Self {
        Self {
            timestamp,
            first_seen: now,
            anchor,
            packets: BTreeMap::new(),
            marker: None,
        }
    }

    fn offset(&self, seq: u16) -> i32 {
        seq.wrapping_sub(self.anchor) as i16 as i32
    }

    fn first_sequence(&self) -> Option<u16> {
        self.packets
            .keys()
            .next()
            .map(|&k| self.anchor.wrapping_add(k as u16))
    }

    /// Marker present and every sequence number from the lowest up to it received.
    fn is_contiguous(&self) -> bool {
        let Some(marker) = self.marker else {
            return false;
        };
        let (Some(&first), Some(&last)) = (self.packets.keys().next(), self.packets.keys().next_back())
        else {
            return false;
        };
        last == marker && (last - first + 1) as usize == self.packets.len()
    }
}

/// Rebuilds units from RTP packets.
///
/// Packets are grouped by RTP timestamp. A frame is emitted once its marker
/// packet has arrived and the sequence numbers from its start up to the
/// marker are all present, in whatever order they came. The start is known
/// from the previous frame's marker; before any marker has been seen the
/// lowest received sequence number is trusted.
///
/// Emitted timestamps strictly increase. When a frame completes, older
/// incomplete frames are given up as lost, and packets arriving for them
/// later are counted as late.
pub struct FrameAssembler {
    clock_rate: u32,
    max_pending: usize,
    max_age: Duration,
    epoch: Instant,
    ssrc: Option<u32>,
    pending: HashMap<u32, PendingFrame>,
    markers: VecDeque<u16>,
    last_emitted: Option<u32>,
    last_transit: Option<u32>,
    stats: AssemblerStats,
}

impl FrameAssembler {
    pub fn new(clock_rate: u32, max_pending: usize, max_age: Duration) -> Self {
        Self {
            clock_rate: clock_rate.max(1),
            max_pending: max_pending.max(1),
            max_age,
            epoch: Instant::now(),
            ssrc: None,
            pending: HashMap::new(),
            markers: VecDeque::with_capacity(MARKER_HISTORY),
            last_emitted: None,
            last_transit: None,
            stats: AssemblerStats::default(),
        }
    }

    pub fn stats(&self) -> &AssemblerStats {
        &self.stats
    }

    /// Interarrival jitter converted to wall-clock time.
    pub fn jitter(&self) -> Duration {
        Duration::from_secs_f64(self.stats.jitter / self.clock_rate as f64)
    }

    /// Frames waiting for more packets.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Feed one packet that arrived at `now`. Returns a frame if this
    /// packet completed one.
    pub fn push(&mut self, packet: RtpPacket, now: Instant) -> Option<AssembledFrame> {
        if self.ssrc != Some(packet.ssrc) {
            if let Some(old) = self.ssrc {
                tracing::debug!(
                    old_ssrc = format_args!("{:#010X}", old),
                    new_ssrc = format_args!("{:#010X}", packet.ssrc),
                    "SSRC changed, assembler reset"
                );
            }
            self.reset(packet.ssrc);
        }

        self.stats.packets_received += 1;
        self.update_jitter(packet.timestamp, now);

        if let Some(last) = self.last_emitted {
            if !is_newer(packet.timestamp, last) {
                self.stats.late_packets += 1;
                tracing::trace!(seq = packet.sequence, ts = packet.timestamp, "late packet discarded");
                return None;
            }
        }

        let timestamp = packet.timestamp;
        let seq = packet.sequence;
        let frame = self
            .pending
            .entry(timestamp)
            .or_insert_with(|| PendingFrame::new(timestamp, seq, now));

        let offset = frame.offset(seq);
        if frame.packets.contains_key(&offset) {
            self.stats.duplicate_packets += 1;
            return None;
        }
        if packet.marker {
            frame.marker = Some(offset);
            if self.markers.len() == MARKER_HISTORY {
                self.markers.pop_front();
            }
            self.markers.push_back(seq);
        }
        frame.packets.insert(offset, packet);

        let completed = self.try_complete(timestamp);
        self.enforce_limits(now);
        completed
    }

    /// Give up on frames older than the maximum age. Returns how many were
    /// evicted.
    pub fn expire(&mut self, now: Instant) -> usize {
        let stale: Vec<u32> = self
            .pending
            .values()
            .filter(|f| now.saturating_duration_since(f.first_seen) > self.max_age)
            .map(|f| f.timestamp)
            .collect();
        for ts in &stale {
            self.evict(*ts, "frame timed out");
        }
        stale.len()
    }

    fn reset(&mut self, ssrc: u32) {
        self.ssrc = Some(ssrc);
        self.pending.clear();
        self.markers.clear();
        self.last_emitted = None;
        self.last_transit = None;
    }

    /// J(i) = J(i-1) + (|D(i-1,i)| - J(i-1)) / 16
    fn update_jitter(&mut self, timestamp: u32, now: Instant) {
        let arrival = (now.saturating_duration_since(self.epoch).as_secs_f64()
            * self.clock_rate as f64) as u64 as u32;
        let transit = arrival.wrapping_sub(timestamp);
        if let Some(prev) = self.last_transit {
            let d = (transit.wrapping_sub(prev) as i32).unsigned_abs() as f64;
            self.stats.jitter += (d - self.stats.jitter) / 16.0;
        }
        self.last_transit = Some(transit);
    }

    fn start_is_known(&self, frame: &PendingFrame) -> bool {
        let Some(first) = frame.first_sequence() else {
            return false;
        };
        if self.markers.contains(&first.wrapping_sub(1)) {
            return true;
        }
        // no earlier frame's marker seen yet
        let own = frame.marker.map(|m| frame.anchor.wrapping_add(m as u16));
        self.markers.iter().all(|&m| Some(m) == own)
    }

    fn try_complete(&mut self, timestamp: u32) -> Option<AssembledFrame> {
        let ready = self
            .pending
            .get(&timestamp)
            .is_some_and(|f| f.is_contiguous() && self.start_is_known(f));
        if !ready {
            return None;
        }
        let frame = self.pending.remove(&timestamp)?;

        self.evict(timestamp, "frame overtaken by a newer complete frame");

        self.last_emitted = Some(timestamp);
        self.stats.frames_completed += 1;

        let first_sequence = frame.first_sequence().unwrap_or(frame.anchor);
        let payloads: Vec<Bytes> = frame.packets.into_values().map(|p| p.payload).collect();
        tracing::trace!(
            ts = timestamp,
            first_seq = first_sequence,
            packets = payloads.len(),
            "frame assembled"
        );

        Some(AssembledFrame {
            ssrc: self.ssrc.unwrap_or_default(),
            timestamp,
            first_sequence,
            payloads,
        })
    }

    fn enforce_limits(&mut self, now: Instant) {
        self.expire(now);
        while self.pending.len() > self.max_pending {
            let oldest = self
                .pending
                .values()
                .min_by_key(|f| f.first_seen)
                .map(|f| f.timestamp);
            match oldest {
                Some(ts) => self.evict(ts, "too many incomplete frames"),
                None => break,
            }
        }
    }

    /// Drop the frame at `timestamp` and any older incomplete frame with it.
    fn evict(&mut self, timestamp: u32, reason: &'static str) {
        let doomed: Vec<u32> = self
            .pending
            .keys()
            .copied()
            .filter(|&ts| !is_newer(ts, timestamp))
            .collect();
        for ts in doomed {
            if let Some(frame) = self.pending.remove(&ts) {
                self.stats.frames_lost += 1;
                tracing::debug!(
                    ts,
                    packets = frame.packets.len(),
                    lost = self.stats.frames_lost,
                    reason,
                    "incomplete frame dropped"
                );
            }
        }
        if self.last_emitted.is_none_or(|last| is_newer(timestamp, last)) {
            self.last_emitted = Some(timestamp);
        }
    }
}

/// `a` is later than `b` in 32-bit RTP timestamp space.
fn is_newer(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}
