//! Raw frame acquisition.
//!
//! A [`FrameSource`] yields [`Frame`]s at its nominal rate and blocks the
//! calling thread between frames, the way a capture device would. Sources
//! are owned by the capture thread for their whole lifetime and released
//! when that thread exits.
//!
//! | Source | Module | Notes |
//! |--------|--------|-------|
//! | Synthetic pattern | [`pattern`] | moving bars, optional frame limit |
//! | Raw file | [`file`] | fixed-size frames, optional loop |

pub mod file;
pub mod pattern;

use std::fmt;
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::CaptureError;

pub use file::RawFileSource;
pub use pattern::TestPatternSource;

/// Layout of the bytes in [`Frame::data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// One luma byte per pixel.
    Gray8,
    /// Planar YUV 4:2:0 (Y plane, then quarter-size U and V planes).
    I420,
    /// Packed 8-bit RGB.
    Rgb24,
}

impl PixelFormat {
    /// Size in bytes of one frame with the given geometry.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            Self::Gray8 => w * h,
            Self::I420 => w * h + 2 * (w.div_ceil(2) * h.div_ceil(2)),
            Self::Rgb24 => w * h * 3,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Gray8 => "gray8",
            Self::I420 => "i420",
            Self::Rgb24 => "rgb24",
        };
        f.write_str(name)
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gray8" | "gray" => Ok(Self::Gray8),
            "i420" | "yuv420p" => Ok(Self::I420),
            "rgb24" | "rgb" => Ok(Self::Rgb24),
            other => Err(format!("unknown pixel format: {other}")),
        }
    }
}

/// One raw video frame.
///
/// Moves by value from stage to stage; never shared.
#[derive(Debug)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Presentation time relative to the start of the stream (monotonic).
    pub pts: Duration,
    /// Wall-clock instant the frame became available.
    pub captured_at: Instant,
    /// Zero-based position in the stream.
    pub index: u64,
}

/// A producer of raw frames.
pub trait FrameSource: Send {
    /// Block until the next frame is available.
    ///
    /// `Ok(None)` signals end of stream; every later call returns `Ok(None)`
    /// too. A source can only be restarted by opening a new one.
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError>;

    /// Nominal frame rate in frames per second.
    fn frame_rate(&self) -> u32;
}

/// Ticks at a fixed frame rate and hands out presentation times.
///
/// Frame `n` is released no earlier than `start + n / fps`. When the caller
/// falls behind, ticks are released immediately without sleeping, so
/// presentation times stay on the nominal grid.
#[derive(Debug)]
pub struct FrameClock {
    interval: Duration,
    start: Option<Instant>,
    next_index: u64,
}

impl FrameClock {
    pub fn new(fps: u32) -> Result<Self, CaptureError> {
        if fps == 0 {
            return Err(CaptureError::InvalidFrameRate(fps));
        }
        Ok(Self {
            interval: Duration::from_secs(1) / fps,
            start: None,
            next_index: 0,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Presentation time of frame `index`.
    pub fn pts_of(&self, index: u64) -> Duration {
        self.interval.saturating_mul(index.min(u32::MAX as u64) as u32)
    }

    /// Sleep until the next frame is due; returns `(index, pts)`.
    pub fn tick(&mut self) -> (u64, Duration) {
        let start = *self.start.get_or_insert_with(Instant::now);
        let index = self.next_index;
        let pts = self.pts_of(index);

        let due = start + pts;
        let now = Instant::now();
        if due > now {
            thread::sleep(due - now);
        }

        self.next_index += 1;
        (index, pts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_sizes() {
        assert_eq!(PixelFormat::Gray8.frame_size(4, 2), 8);
        assert_eq!(PixelFormat::Rgb24.frame_size(4, 2), 24);
        assert_eq!(PixelFormat::I420.frame_size(4, 2), 8 + 2 * 2);
        // odd sizes round chroma up
        assert_eq!(PixelFormat::I420.frame_size(3, 3), 9 + 2 * 4);
    }

    #[test]
    fn pixel_format_parse() {
        assert_eq!("I420".parse::<PixelFormat>(), Ok(PixelFormat::I420));
        assert_eq!("rgb".parse::<PixelFormat>(), Ok(PixelFormat::Rgb24));
        assert!("nv12".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn clock_rejects_zero_fps() {
        assert!(FrameClock::new(0).is_err());
    }

    #[test]
    fn clock_pts_on_grid() {
        let mut clock = FrameClock::new(100).unwrap();
        let (i0, p0) = clock.tick();
        let (i1, p1) = clock.tick();
        assert_eq!((i0, p0), (0, Duration::ZERO));
        assert_eq!((i1, p1), (1, Duration::from_millis(10)));
    }

    #[test]
    fn clock_paces_ticks() {
        let mut clock = FrameClock::new(50).unwrap();
        let started = Instant::now();
        for _ in 0..3 {
            clock.tick();
        }
        // third tick is due 40ms after the first
        assert!(started.elapsed() >= Duration::from_millis(35));
    }
}
