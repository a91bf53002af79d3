use std::time::Instant;

use super::{Frame, FrameClock, FrameSource, PixelFormat};
use crate::error::CaptureError;

/// Synthetic live source: diagonal bars that scroll one pixel per frame.
///
/// Behaves like a camera: frames are released at the nominal rate, so a slow
/// consumer sees drops in the capture queue rather than a burst.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    format: PixelFormat,
    fps: u32,
    clock: FrameClock,
    frame_limit: Option<u64>,
    exhausted: bool,
}

impl TestPatternSource {
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        fps: u32,
    ) -> Result<Self, CaptureError> {
        if width == 0 || height == 0 {
            return Err(CaptureError::InvalidGeometry { width, height });
        }
        Ok(Self {
            width,
            height,
            format,
            fps,
            clock: FrameClock::new(fps)?,
            frame_limit: None,
            exhausted: false,
        })
    }

    /// Stop after `limit` frames instead of running forever.
    pub fn with_frame_limit(mut self, limit: u64) -> Self {
        self.frame_limit = Some(limit);
        self
    }

    /// Render frame `index` of the pattern.
    pub fn render(index: u64, width: u32, height: u32, format: PixelFormat) -> Vec<u8> {
        let (w, h) = (width as usize, height as usize);
        let shift = index as usize;
        let luma = |x: usize, y: usize| -> u8 { (((x + y + shift) / 4) % 8 * 32) as u8 };

        let mut data = Vec::with_capacity(format.frame_size(width, height));
        match format {
            PixelFormat::Gray8 => {
                for y in 0..h {
                    data.extend((0..w).map(|x| luma(x, y)));
                }
            }
            PixelFormat::I420 => {
                for y in 0..h {
                    data.extend((0..w).map(|x| luma(x, y)));
                }
                let chroma = w.div_ceil(2) * h.div_ceil(2);
                let u = (index % 256) as u8;
                data.extend(std::iter::repeat_n(u, chroma));
                data.extend(std::iter::repeat_n(255 - u, chroma));
            }
            PixelFormat::Rgb24 => {
                for y in 0..h {
                    for x in 0..w {
                        let v = luma(x, y);
                        data.extend_from_slice(&[v, 255 - v, (index % 256) as u8]);
                    }
                }
            }
        }
        data
    }
}

impl FrameSource for TestPatternSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        if self.exhausted {
            return Ok(None);
        }

        let (index, pts) = self.clock.tick();
        if self.frame_limit.is_some_and(|limit| index >= limit) {
            tracing::debug!(frames = index, "test pattern exhausted");
            self.exhausted = true;
            return Ok(None);
        }

        let data = Self::render(index, self.width, self.height, self.format);
        tracing::trace!(index, pts_ms = pts.as_millis() as u64, "pattern frame");

        Ok(Some(Frame {
            data,
            width: self.width,
            height: self.height,
            format: self.format,
            pts,
            captured_at: Instant::now(),
            index,
        }))
    }

    fn frame_rate(&self) -> u32 {
        self.fps
    }
}
