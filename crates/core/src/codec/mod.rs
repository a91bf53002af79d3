//! Frame compression.
//!
//! An [`Encoder`] turns raw [`Frame`]s into [`EncodedUnit`]s. Output is not
//! required to be 1:1 with input: an encoder may hold frames back for
//! inter-frame prediction and release them later, which is why
//! [`Encoder::flush`] exists. The encode thread owns its encoder outright,
//! including any reference-frame state.

#[cfg(feature = "openh264")]
pub mod h264;
pub mod raw;

use std::time::Duration;

use bytes::Bytes;

use crate::error::EncodeError;
use crate::source::Frame;

#[cfg(feature = "openh264")]
pub use h264::H264Encoder;
pub use raw::RawEncoder;

/// One compressed, presentable quantum of media (typically one frame).
#[derive(Debug, Clone)]
pub struct EncodedUnit {
    pub data: Bytes,
    /// Presentation time carried over from the source frame.
    pub pts: Duration,
    /// The unit is a complete presentable frame rather than a partial slice.
    pub complete: bool,
    /// The unit can be decoded without earlier units.
    pub keyframe: bool,
}

impl EncodedUnit {
    pub fn new(data: impl Into<Bytes>, pts: Duration) -> Self {
        Self {
            data: data.into(),
            pts,
            complete: true,
            keyframe: false,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Codec integration point.
pub trait Encoder: Send {
    /// Encode one frame, returning whatever units became ready.
    ///
    /// An `Err` means this frame is skipped; the encoder must stay usable.
    fn encode(&mut self, frame: Frame) -> Result<Vec<EncodedUnit>, EncodeError>;

    /// Emit every unit still buffered inside the encoder.
    fn flush(&mut self) -> Result<Vec<EncodedUnit>, EncodeError>;

    /// Short codec name for logs.
    fn name(&self) -> &'static str;
}
