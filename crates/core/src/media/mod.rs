//! RTP payload formats and packetization.
//!
//! This module provides the [`Packetizer`] trait and payload-format
//! implementations that split encoded units into RTP-sized fragments.
//!
//! ## RTP overview (RFC 3550)
//!
//! Each encoded unit is split into one or more RTP packets.
//! Every RTP packet carries a 12-byte fixed header ([`rtp::RtpPacket`])
//! containing:
//!
//! - **Sequence number** (16-bit, wrapping): for reordering and loss detection.
//! - **Timestamp** (32-bit): media clock, typically 90 kHz for video.
//! - **SSRC** (32-bit): randomly chosen to identify the sender.
//! - **Marker bit**: set on the last packet of an encoded unit.
//!
//! Fragmentation happens once per unit; numbering happens per session in
//! [`rtp::RtpSequencer`], so sessions fanned out from one packetizer never
//! share sequence state.
//!
//! ## Supported payload formats
//!
//! | Format | Module | RFC |
//! |--------|--------|-----|
//! | Generic split | [`generic`] | none |
//! | H.264 | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) |

pub mod generic;
pub mod h264;
pub mod rtp;

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use crate::codec::EncodedUnit;
use crate::error::PacketizationError;
use generic::GenericPacketizer;
use h264::H264Packetizer;
use rtp::{RtpPacket, RtpSequencer};

/// Default RTP clock rate for video (RFC 3551 §5).
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Default upper bound on packets produced from one unit.
pub const DEFAULT_MAX_PACKETS_PER_UNIT: usize = 1024;

/// One packet's worth of payload, before RTP numbering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub payload: Bytes,
    /// Last fragment of its unit.
    pub marker: bool,
}

/// Payload-format specific splitter.
///
/// Each supported format implements this trait, providing:
/// - **Fragmentation**: splitting one encoded unit into packet payloads
/// - **SDP attributes**: format parameters for the session description
/// - **RTP metadata**: payload type and clock rate
///
/// Implementations must keep every fragment at or below
/// [`max_payload_size`](Self::max_payload_size) and mark only the last one.
pub trait Packetizer: Send {
    /// Split one unit into ordered fragments.
    ///
    /// An empty unit yields no fragments. A unit that would need more than
    /// the configured packet bound is rejected whole.
    fn fragment(&mut self, unit: &EncodedUnit) -> Result<Vec<Fragment>, PacketizationError>;

    /// Fragment a unit and number it with one session's sequencer.
    fn packetize(
        &mut self,
        unit: &EncodedUnit,
        sequencer: &mut RtpSequencer,
    ) -> Result<Vec<RtpPacket>, PacketizationError> {
        let fragments = self.fragment(unit)?;
        Ok(sequencer.stamp(&fragments, unit.pts))
    }

    /// Encoding name for the SDP `a=rtpmap` attribute (e.g. `"H264"`).
    fn codec_name(&self) -> &'static str;

    /// RTP clock rate in Hz.
    fn clock_rate(&self) -> u32 {
        VIDEO_CLOCK_RATE
    }

    /// RTP payload type number (RFC 3551). Dynamic types use 96–127.
    fn payload_type(&self) -> u8;

    /// Largest payload (bytes after the RTP header) this packetizer emits.
    fn max_payload_size(&self) -> usize;

    /// SDP media-level attribute lines, including the `a=` prefix.
    fn sdp_attributes(&self) -> Vec<String>;
}

/// Which payload format a stream uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadFormat {
    /// Unit bytes split at the maximum payload size, no per-packet header.
    #[default]
    Generic,
    /// RFC 6184 over an Annex B bitstream.
    H264,
}

impl PayloadFormat {
    /// Build a packetizer for this format.
    pub fn packetizer(
        self,
        payload_type: u8,
        max_payload_size: usize,
        max_packets_per_unit: usize,
    ) -> Result<Box<dyn Packetizer>, PacketizationError> {
        Ok(match self {
            Self::Generic => Box::new(GenericPacketizer::new(
                payload_type,
                max_payload_size,
                max_packets_per_unit,
            )?),
            Self::H264 => Box::new(H264Packetizer::new(
                payload_type,
                max_payload_size,
                max_packets_per_unit,
            )?),
        })
    }

    /// Rebuild a unit from the payloads of its packets, in sequence order.
    pub fn depacketize(self, payloads: &[Bytes]) -> Result<Bytes, PacketizationError> {
        match self {
            Self::Generic => Ok(GenericPacketizer::reassemble(payloads)),
            Self::H264 => H264Packetizer::reassemble(payloads),
        }
    }
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generic => f.write_str("generic"),
            Self::H264 => f.write_str("h264"),
        }
    }
}

impl FromStr for PayloadFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "generic" | "raw" => Ok(Self::Generic),
            "h264" | "avc" => Ok(Self::H264),
            other => Err(format!("unknown payload format: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parse_payload_format() {
        assert_eq!("H264".parse::<PayloadFormat>(), Ok(PayloadFormat::H264));
        assert_eq!("generic".parse::<PayloadFormat>(), Ok(PayloadFormat::Generic));
        assert!("vp8".parse::<PayloadFormat>().is_err());
    }

    #[test]
    fn packetize_numbers_contiguously_across_units() {
        let mut p = PayloadFormat::Generic.packetizer(96, 100, 64).unwrap();
        let mut seq = RtpSequencer::new(96, 1, VIDEO_CLOCK_RATE, u16::MAX - 2, 0);

        let mut all = Vec::new();
        for i in 0..4u64 {
            let unit = EncodedUnit::new(vec![i as u8; 250], Duration::from_millis(i * 40));
            all.extend(p.packetize(&unit, &mut seq).unwrap());
        }

        // 4 units x 3 packets, wrapping through 0
        assert_eq!(all.len(), 12);
        for pair in all.windows(2) {
            assert_eq!(pair[1].sequence, pair[0].sequence.wrapping_add(1));
        }
        assert_eq!(all[0].sequence, u16::MAX - 2);
        assert_eq!(all.iter().filter(|p| p.marker).count(), 4);
    }
}
