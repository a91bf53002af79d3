//! Emission cadence.
//!
//! The pacer maps each unit's presentation time onto the wall clock, anchored
//! at the first unit it sees, and holds the unit back until that moment.
//! A late unit goes out immediately and the anchor moves to it, so the units
//! queued behind it keep their spacing instead of bursting out to catch up.
//! A unit later than the drift tolerance is dropped and re-anchors the same
//! way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Longest single sleep, so shutdown is noticed promptly.
const MAX_SLEEP_SLICE: Duration = Duration::from_millis(50);

/// What to do with a unit right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaceDecision {
    /// Too early; wait this long.
    Wait(Duration),
    /// Due (or slightly late); send without waiting.
    SendNow,
    /// Beyond the drift tolerance; skip this unit.
    Drop { behind: Duration },
}

#[derive(Debug)]
pub struct Pacer {
    tolerance: Duration,
    anchor: Option<(Instant, Duration)>,
    dropped: u64,
}

impl Pacer {
    pub fn new(tolerance: Duration) -> Self {
        Self {
            tolerance,
            anchor: None,
            dropped: 0,
        }
    }

    /// Units dropped for lateness so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Decide what to do with a unit presented at `pts`, as of `now`.
    pub fn schedule(&mut self, pts: Duration, now: Instant) -> PaceDecision {
        let (origin, base_pts) = *self.anchor.get_or_insert((now, pts));

        if pts < base_pts {
            // presentation clock restarted
            tracing::debug!(
                pts_ms = pts.as_millis() as u64,
                base_ms = base_pts.as_millis() as u64,
                "pacer re-anchored on backwards pts"
            );
            self.anchor = Some((now, pts));
            return PaceDecision::SendNow;
        }

        let due = origin + (pts - base_pts);
        if due > now {
            return PaceDecision::Wait(due - now);
        }

        let behind = now - due;
        if behind > self.tolerance {
            self.dropped += 1;
            self.anchor = Some((now, pts));
            tracing::debug!(
                behind_ms = behind.as_millis() as u64,
                dropped = self.dropped,
                "unit dropped, pipeline behind schedule"
            );
            return PaceDecision::Drop { behind };
        }

        if behind > Duration::ZERO {
            self.anchor = Some((now, pts));
        }
        PaceDecision::SendNow
    }

    /// Block until the unit at `pts` is due.
    ///
    /// Returns `true` when the unit should be sent, `false` when it was
    /// dropped for lateness or `running` was cleared while waiting.
    pub fn wait(&mut self, pts: Duration, running: &AtomicBool) -> bool {
        loop {
            if !running.load(Ordering::SeqCst) {
                return false;
            }
            match self.schedule(pts, Instant::now()) {
                PaceDecision::SendNow => return true,
                PaceDecision::Drop { .. } => return false,
                PaceDecision::Wait(d) => thread::sleep(d.min(MAX_SLEEP_SLICE)),
            }
        }
    }
}
