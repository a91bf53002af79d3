use super::{EncodedUnit, Encoder};
use crate::error::EncodeError;
use crate::source::Frame;

/// Identity "codec": every frame becomes one unit carrying its raw bytes.
///
/// Useful with the generic payload format for lossless test streams and as
/// the reference encoder in pipeline tests.
#[derive(Debug, Default)]
pub struct RawEncoder {
    encoded: u64,
}

impl RawEncoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Encoder for RawEncoder {
    fn encode(&mut self, frame: Frame) -> Result<Vec<EncodedUnit>, EncodeError> {
        let expected = frame.format.frame_size(frame.width, frame.height);
        if frame.data.len() != expected {
            return Err(EncodeError::FrameSizeMismatch {
                expected,
                actual: frame.data.len(),
            });
        }

        self.encoded += 1;
        let mut unit = EncodedUnit::new(frame.data, frame.pts);
        unit.keyframe = true;
        Ok(vec![unit])
    }

    fn flush(&mut self) -> Result<Vec<EncodedUnit>, EncodeError> {
        tracing::debug!(encoded = self.encoded, "raw encoder flushed");
        Ok(Vec::new())
    }

    fn name(&self) -> &'static str {
        "raw"
    }
}
