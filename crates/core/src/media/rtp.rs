use std::time::Duration;

use bytes::{BufMut, Bytes};

use super::Fragment;
use crate::error::{ParseErrorKind, Result, StreamError};

/// Size of the fixed RTP header without CSRCs or extensions.
pub const RTP_HEADER_LEN: usize = 12;

const RTP_VERSION: u8 = 2;

/// One RTP packet (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Outbound packets never use padding, extensions or CSRCs. Inbound parsing
/// accepts all three and strips them so `payload` is only media bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrcs: Vec<u32>,
    pub payload: Bytes,
}

impl RtpPacket {
    /// Serialized length in bytes, header included.
    pub fn wire_len(&self) -> usize {
        RTP_HEADER_LEN + self.csrcs.len() * 4 + self.payload.len()
    }

    /// Serialize the 12-byte fixed header.
    pub fn header_bytes(&self) -> [u8; RTP_HEADER_LEN] {
        let first_byte: u8 = (RTP_VERSION << 6) | (self.csrcs.len().min(15) as u8);
        let second_byte: u8 = ((self.marker as u8) << 7) | (self.payload_type & 0x7f);

        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = first_byte;
        header[1] = second_byte;
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        header
    }

    /// Append the wire form to `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.wire_len());
        buf.extend_from_slice(&self.header_bytes());
        for csrc in self.csrcs.iter().take(15) {
            buf.put_u32(*csrc);
        }
        buf.extend_from_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_len());
        self.write_to(&mut buf);
        buf
    }

    /// Parse a datagram.
    ///
    /// Handles the CSRC list, skips a header extension (RFC 3550 §5.3.1) and
    /// removes trailing padding.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let parse_err = |kind| StreamError::Parse { kind };

        if data.len() < RTP_HEADER_LEN {
            return Err(parse_err(ParseErrorKind::Truncated));
        }

        let version = data[0] >> 6;
        if version != RTP_VERSION {
            return Err(parse_err(ParseErrorKind::BadVersion(version)));
        }
        let padding = data[0] & 0x20 != 0;
        let extension = data[0] & 0x10 != 0;
        let csrc_count = (data[0] & 0x0f) as usize;

        let marker = data[1] & 0x80 != 0;
        let payload_type = data[1] & 0x7f;
        let sequence = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = RTP_HEADER_LEN;
        if data.len() < offset + csrc_count * 4 {
            return Err(parse_err(ParseErrorKind::Truncated));
        }
        let csrcs = data[offset..offset + csrc_count * 4]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        offset += csrc_count * 4;

        if extension {
            if data.len() < offset + 4 {
                return Err(parse_err(ParseErrorKind::Truncated));
            }
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + words * 4;
            if data.len() < offset {
                return Err(parse_err(ParseErrorKind::Truncated));
            }
        }

        let mut end = data.len();
        if padding {
            let pad = data[end - 1] as usize;
            if pad == 0 || offset + pad > end {
                return Err(parse_err(ParseErrorKind::BadPadding));
            }
            end -= pad;
        }

        Ok(Self {
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            csrcs,
            payload: Bytes::copy_from_slice(&data[offset..end]),
        })
    }
}

/// Per-stream RTP numbering state.
///
/// Each session owns exactly one sequencer, so numbering is never shared:
/// - **Sequence number**: 16-bit, wrapping, incremented on every packet.
/// - **Timestamp**: `offset + pts × clock_rate`. Media ticks are kept as
///   u64 internally and clamped so they never decrease; the lower 32 bits
///   (plus the random offset) go on the wire.
/// - **SSRC**: randomly generated per RFC 3550 §8.1 to avoid collisions.
#[derive(Debug)]
pub struct RtpSequencer {
    /// RTP payload type (7-bit, RFC 3551).
    pub pt: u8,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    clock_rate: u32,
    sequence: u16,
    timestamp_offset: u32,
    ticks: u64,
}

impl RtpSequencer {
    /// Create with explicit SSRC, starting sequence number and timestamp offset.
    pub fn new(pt: u8, ssrc: u32, clock_rate: u32, initial_sequence: u16, timestamp_offset: u32) -> Self {
        tracing::debug!(
            pt,
            ssrc = format_args!("{:#010X}", ssrc),
            clock_rate,
            initial_sequence,
            "RTP sequencer created"
        );
        Self {
            pt,
            ssrc,
            clock_rate,
            sequence: initial_sequence,
            timestamp_offset,
            ticks: 0,
        }
    }

    /// Random SSRC, starting sequence number and timestamp offset
    /// (RFC 3550 §5.1 recommends all three be unpredictable).
    pub fn with_random_ssrc(pt: u8, clock_rate: u32) -> Self {
        Self::new(
            pt,
            rand::random::<u32>(),
            clock_rate,
            rand::random::<u16>(),
            rand::random::<u32>(),
        )
    }

    /// Sequence number the next packet will carry.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Most recent wire timestamp.
    pub fn timestamp(&self) -> u32 {
        self.timestamp_offset.wrapping_add(self.ticks as u32)
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Media clock ticks elapsed at `pts`.
    pub fn ticks_for(&self, pts: Duration) -> u64 {
        (pts.as_nanos() * self.clock_rate as u128 / 1_000_000_000) as u64
    }

    /// Move the media clock to `pts` and return the wire timestamp for it.
    ///
    /// A `pts` earlier than one already seen keeps the previous timestamp.
    pub fn set_media_time(&mut self, pts: Duration) -> u32 {
        self.ticks = self.ticks.max(self.ticks_for(pts));
        self.timestamp()
    }

    /// Build the next packet and advance the sequence number.
    pub fn next_packet(&mut self, marker: bool, timestamp: u32, payload: Bytes) -> RtpPacket {
        let packet = RtpPacket {
            marker,
            payload_type: self.pt,
            sequence: self.sequence,
            timestamp,
            ssrc: self.ssrc,
            csrcs: Vec::new(),
            payload,
        };
        self.sequence = self.sequence.wrapping_add(1);
        packet
    }

    /// Number the fragments of one unit presented at `pts`.
    ///
    /// All packets share one timestamp. An empty fragment list produces no
    /// packets but still moves the media clock forward.
    pub fn stamp(&mut self, fragments: &[Fragment], pts: Duration) -> Vec<RtpPacket> {
        let timestamp = self.set_media_time(pts);
        fragments
            .iter()
            .map(|f| self.next_packet(f.marker, timestamp, f.payload.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_sequencer() -> RtpSequencer {
        RtpSequencer::new(96, 0xAABBCCDD, 90_000, 0, 0)
    }

    fn fragment(payload: &'static [u8], marker: bool) -> Fragment {
        Fragment {
            payload: Bytes::from_static(payload),
            marker,
        }
    }

    #[test]
    fn version_is_2() {
        let mut s = make_sequencer();
        let buf = s.next_packet(false, 0, Bytes::new()).to_bytes();
        assert_eq!(buf[0] >> 6, 2);
    }

    #[test]
    fn wire_len_counts_header() {
        let mut s = make_sequencer();
        let empty = s.next_packet(false, 0, Bytes::new());
        assert_eq!(empty.wire_len(), RTP_HEADER_LEN);
        assert_eq!(empty.to_bytes().len(), empty.wire_len());

        let full = s.next_packet(true, 0, Bytes::from_static(b"abcd"));
        assert_eq!(full.wire_len(), RTP_HEADER_LEN + 4);
        assert_eq!(full.to_bytes().len(), full.wire_len());
    }

    #[test]
    fn marker_bit() {
        let mut s = make_sequencer();
        let no_marker = s.next_packet(false, 0, Bytes::new()).header_bytes();
        assert_eq!(no_marker[1] & 0x80, 0);

        let with_marker = s.next_packet(true, 0, Bytes::new()).header_bytes();
        assert_eq!(with_marker[1] & 0x80, 0x80);
    }

    #[test]
    fn payload_type() {
        let mut s = make_sequencer();
        let buf = s.next_packet(false, 0, Bytes::new()).header_bytes();
        assert_eq!(buf[1] & 0x7f, 96);
    }

    #[test]
    fn sequence_wraps() {
        let mut s = RtpSequencer::new(96, 1, 90_000, u16::MAX, 0);
        let p = s.next_packet(false, 0, Bytes::new());
        assert_eq!(p.sequence, u16::MAX);
        assert_eq!(s.sequence(), 0);
    }

    #[test]
    fn ssrc_written() {
        let mut s = make_sequencer();
        let buf = s.next_packet(false, 0, Bytes::new()).header_bytes();
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        assert_eq!(ssrc, 0xAABBCCDD);
    }

    #[test]
    fn timestamp_from_presentation_time() {
        let mut s = RtpSequencer::new(96, 1, 90_000, 0, 1000);
        assert_eq!(s.set_media_time(Duration::from_millis(100)), 1000 + 9000);
        assert_eq!(s.set_media_time(Duration::from_secs(1)), 1000 + 90_000);
    }

    #[test]
    fn timestamp_never_decreases() {
        let mut s = make_sequencer();
        let later = s.set_media_time(Duration::from_millis(200));
        let earlier = s.set_media_time(Duration::from_millis(100));
        assert_eq!(earlier, later);
    }

    #[test]
    fn timestamp_offset_wraps() {
        let mut s = RtpSequencer::new(96, 1, 90_000, 0, u32::MAX);
        assert_eq!(s.set_media_time(Duration::from_secs(1)), 90_000 - 1);
    }

    #[test]
    fn stamp_shares_timestamp_and_numbers_in_order() {
        let mut s = RtpSequencer::new(96, 7, 90_000, 100, 0);
        let frags = [fragment(b"ab", false), fragment(b"cd", false), fragment(b"e", true)];
        let packets = s.stamp(&frags, Duration::from_millis(40));

        let seqs: Vec<u16> = packets.iter().map(|p| p.sequence).collect();
        assert_eq!(seqs, vec![100, 101, 102]);
        assert!(packets.iter().all(|p| p.timestamp == 3600));
        let markers: Vec<bool> = packets.iter().map(|p| p.marker).collect();
        assert_eq!(markers, vec![false, false, true]);
    }

    #[test]
    fn empty_unit_advances_clock_only() {
        let mut s = RtpSequencer::new(96, 7, 90_000, 5, 0);
        assert!(s.stamp(&[], Duration::from_millis(10)).is_empty());
        assert_eq!(s.sequence(), 5);
        assert_eq!(s.timestamp(), 900);
    }

    #[test]
    fn random_ssrc_differs() {
        let s1 = RtpSequencer::with_random_ssrc(96, 90_000);
        let s2 = RtpSequencer::with_random_ssrc(96, 90_000);
        assert_ne!(s1.ssrc, s2.ssrc);
    }

    #[test]
    fn parse_serialized_packet() {
        let mut s = make_sequencer();
        let packet = s.next_packet(true, 1234, Bytes::from_static(b"payload"));
        let parsed = RtpPacket::parse(&packet.to_bytes()).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn parse_strips_csrc_extension_and_padding() {
        let mut data = vec![
            0x80 | 0x20 | 0x10 | 0x01, // V=2, P, X, CC=1
            0x80 | 96,
            0x00,
            0x05,
            0,
            0,
            0,
            9,
            0,
            0,
            0,
            1,
        ];
        data.extend_from_slice(&0xDEADBEEFu32.to_be_bytes()); // CSRC
        data.extend_from_slice(&[0xBE, 0xDE, 0x00, 0x01, 1, 2, 3, 4]); // 1-word extension
        data.extend_from_slice(b"xyz");
        data.extend_from_slice(&[0, 0, 3]); // 3 bytes padding

        let p = RtpPacket::parse(&data).unwrap();
        assert!(p.marker);
        assert_eq!(p.payload_type, 96);
        assert_eq!(p.sequence, 5);
        assert_eq!(p.timestamp, 9);
        assert_eq!(p.ssrc, 1);
        assert_eq!(p.csrcs, vec![0xDEADBEEF]);
        assert_eq!(&p.payload[..], b"xyz");
    }

    #[test]
    fn parse_rejects_short_and_bad_version() {
        assert!(matches!(
            RtpPacket::parse(&[0x80; 11]),
            Err(StreamError::Parse {
                kind: ParseErrorKind::Truncated
            })
        ));
        let mut v1 = [0u8; 12];
        v1[0] = 0x40;
        assert!(matches!(
            RtpPacket::parse(&v1),
            Err(StreamError::Parse {
                kind: ParseErrorKind::BadVersion(1)
            })
        ));
    }

    #[test]
    fn parse_rejects_oversized_padding() {
        let mut data = vec![0xA0, 96, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        data.push(200);
        assert!(matches!(
            RtpPacket::parse(&data),
            Err(StreamError::Parse {
                kind: ParseErrorKind::BadPadding
            })
        ));
    }
}
