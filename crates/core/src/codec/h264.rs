use openh264::OpenH264API;
use openh264::encoder::{
    BitRate, Encoder as OpenH264Encoder, EncoderConfig, FrameRate, FrameType, RateControlMode,
    SpsPpsStrategy, UsageType,
};
use openh264::formats::{RgbSliceU8, YUVBuffer};

use super::{EncodedUnit, Encoder};
use crate::error::EncodeError;
use crate::source::{Frame, PixelFormat};

/// H.264 encoder backed by Cisco's openh264, producing Annex B access units.
///
/// Configured for low-latency camera streaming: bitrate rate control,
/// SPS/PPS repeated in every IDR access unit so receivers can join
/// mid-stream, and a periodic IDR every `keyint` frames.
pub struct H264Encoder {
    inner: OpenH264Encoder,
    skipped: u64,
}

impl H264Encoder {
    pub fn new(fps: u32, bitrate_bps: u32, keyint: u32) -> Result<Self, EncodeError> {
        let config = EncoderConfig::new()
            .usage_type(UsageType::CameraVideoRealTime)
            .max_frame_rate(FrameRate::from_hz(fps as f32))
            .bitrate(BitRate::from_bps(bitrate_bps))
            .rate_control_mode(RateControlMode::Bitrate)
            .sps_pps_strategy(SpsPpsStrategy::InAccessUnit)
            .intra_frame_period(keyint.into());

        let inner = OpenH264Encoder::with_api_config(OpenH264API::default(), config)
            .map_err(|e| EncodeError::Codec(e.to_string()))?;

        tracing::info!(fps, bitrate_bps, keyint, "openh264 encoder ready");
        Ok(Self { inner, skipped: 0 })
    }
}

impl Encoder for H264Encoder {
    fn encode(&mut self, frame: Frame) -> Result<Vec<EncodedUnit>, EncodeError> {
        if frame.format != PixelFormat::Rgb24 {
            return Err(EncodeError::UnsupportedFormat(frame.format));
        }
        let expected = frame.format.frame_size(frame.width, frame.height);
        if frame.data.len() != expected {
            return Err(EncodeError::FrameSizeMismatch {
                expected,
                actual: frame.data.len(),
            });
        }

        let rgb = RgbSliceU8::new(
            frame.data.as_slice(),
            (frame.width as usize, frame.height as usize),
        );
        let yuv = YUVBuffer::from_rgb_source(rgb);
        let bitstream = self
            .inner
            .encode(&yuv)
            .map_err(|e| EncodeError::Codec(e.to_string()))?;

        // only an IDR is a clean join point for a receiver
        let keyframe = match bitstream.frame_type() {
            FrameType::IDR => true,
            FrameType::Skip => {
                // rate control dropped this frame
                self.skipped += 1;
                tracing::trace!(
                    index = frame.index,
                    skipped = self.skipped,
                    "frame skipped by encoder"
                );
                return Ok(Vec::new());
            }
            _ => false,
        };
        let data = bitstream.to_vec();
        if data.is_empty() {
            return Ok(Vec::new());
        }

        let mut unit = EncodedUnit::new(data, frame.pts);
        unit.keyframe = keyframe;
        Ok(vec![unit])
    }

    fn flush(&mut self) -> Result<Vec<EncodedUnit>, EncodeError> {
        // openh264 emits each access unit synchronously; nothing is held back.
        Ok(Vec::new())
    }

    fn name(&self) -> &'static str {
        "h264"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::h264::H264Packetizer;
    use crate::source::TestPatternSource;
    use std::time::{Duration, Instant};

    fn rgb_frame(index: u64) -> Frame {
        Frame {
            data: TestPatternSource::render(index, 64, 64, PixelFormat::Rgb24),
            width: 64,
            height: 64,
            format: PixelFormat::Rgb24,
            pts: Duration::from_millis(index * 40),
            captured_at: Instant::now(),
            index,
        }
    }

    fn has_idr(data: &[u8]) -> bool {
        H264Packetizer::nal_unit_ranges(data)
            .into_iter()
            .any(|r| data[r.start] & 0x1f == 5)
    }

    #[test]
    fn keyframe_flag_follows_reported_frame_type() {
        let mut encoder = H264Encoder::new(25, 500_000, 5).unwrap();
        let mut units = Vec::new();
        for index in 0..12 {
            units.extend(encoder.encode(rgb_frame(index)).unwrap());
        }

        assert!(units[0].keyframe, "stream must open with a keyframe");
        for unit in &units {
            assert_eq!(unit.keyframe, has_idr(&unit.data));
        }
    }

    #[test]
    fn rejects_non_rgb_frames() {
        let mut encoder = H264Encoder::new(25, 500_000, 5).unwrap();
        let mut frame = rgb_frame(0);
        frame.format = PixelFormat::Gray8;
        assert!(matches!(
            encoder.encode(frame),
            Err(EncodeError::UnsupportedFormat(PixelFormat::Gray8))
        ));
    }
}
