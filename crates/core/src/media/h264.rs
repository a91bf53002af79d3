use std::ops::Range;

use base64::prelude::{BASE64_STANDARD, Engine as _};
use bytes::{BufMut, Bytes, BytesMut};

use super::{Fragment, Packetizer};
use crate::codec::EncodedUnit;
use crate::error::PacketizationError;

const FU_A: u8 = 28;
const FU_HEADER_LEN: usize = 2;
const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// RFC 6184 payloader for Annex B access units.
///
/// Each NAL unit in the access unit becomes either one single-NAL packet
/// (§5.6) when it fits the payload limit, or a run of FU-A fragments (§5.8):
///
/// ```text
/// byte 0  FU indicator  [F|NRI|28]   F and NRI copied from the NAL header
/// byte 1  FU header     [S|E|R|type] S on the first, E on the last fragment
/// byte 2+ NAL body, without the original header byte
/// ```
///
/// Start codes may be 3 or 4 bytes long; see
/// [`nal_unit_ranges`](Self::nal_unit_ranges). Only the last packet of the
/// access unit is marked.
///
/// The first SPS and PPS seen are kept so the SDP `fmtp` line can carry
/// `profile-level-id` and `sprop-parameter-sets` (§8.1).
#[derive(Debug)]
pub struct H264Packetizer {
    pt: u8,
    max_payload: usize,
    max_fragments: usize,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
}

impl H264Packetizer {
    pub fn new(
        pt: u8,
        max_payload: usize,
        max_fragments: usize,
    ) -> Result<Self, PacketizationError> {
        if max_payload <= FU_HEADER_LEN {
            return Err(PacketizationError::PayloadTooSmall(max_payload));
        }
        Ok(Self {
            pt,
            max_payload,
            max_fragments: max_fragments.max(1),
            sps: None,
            pps: None,
        })
    }

    /// Derive profile-level-id from SPS NAL (RFC 6184 §8.1): bytes 1–3 are profile_idc, constraint_set, level_idc.
    fn profile_level_id(&self) -> Option<String> {
        let sps = self.sps.as_deref()?;
        if sps.len() < 4 {
            return None;
        }
        Some(format!("{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]))
    }

    fn sprop_parameter_sets(&self) -> Option<String> {
        let sps = self.sps.as_deref()?;
        let pps = self.pps.as_deref()?;
        Some(format!(
            "{},{}",
            BASE64_STANDARD.encode(sps),
            BASE64_STANDARD.encode(pps)
        ))
    }

    fn capture_parameter_sets(&mut self, data: &[u8], nals: &[Range<usize>]) {
        if self.sps.is_some() && self.pps.is_some() {
            return;
        }
        for range in nals {
            let nal = &data[range.clone()];
            match nal[0] & 0x1f {
                7 if self.sps.is_none() => {
                    self.sps = Some(nal.to_vec());
                    tracing::debug!("H.264 SPS captured from bitstream ({} bytes)", nal.len());
                }
                8 if self.pps.is_none() => {
                    self.pps = Some(nal.to_vec());
                    tracing::debug!("H.264 PPS captured from bitstream ({} bytes)", nal.len());
                }
                _ => {}
            }
        }
    }

    /// Packets needed for one NAL of `len` bytes.
    fn fragments_for(&self, len: usize) -> usize {
        if len <= self.max_payload {
            1
        } else {
            (len - 1).div_ceil(self.max_payload - FU_HEADER_LEN)
        }
    }

    /// Split one NAL unit into payloads.
    ///
    /// If the NAL fits, it is sent as a Single NAL Unit packet (RFC 6184
    /// §5.6) sharing the unit buffer. Otherwise FU-A fragmentation is used
    /// (RFC 6184 §5.8).
    fn fragment_nal(&self, nal: Bytes, is_last_nal: bool, out: &mut Vec<Fragment>) {
        if nal.len() <= self.max_payload {
            out.push(Fragment {
                payload: nal,
                marker: is_last_nal,
            });
            return;
        }

        let nal_header = nal[0];
        let nal_type = nal_header & 0x1f;
        // FU indicator: F and NRI from original NAL, type = 28 (FU-A)
        let fu_indicator = (nal_header & 0xe0) | FU_A;
        let payload = &nal[1..];

        let max_chunk = self.max_payload - FU_HEADER_LEN;
        let before = out.len();
        let mut offset = 0usize;

        while offset < payload.len() {
            let chunk_size = max_chunk.min(payload.len() - offset);
            let first = offset == 0;
            let last = offset + chunk_size == payload.len();

            // FU header: S=start, E=end, R=0, Type=original NAL type
            let start_bit = if first { 0x80 } else { 0x00 };
            let end_bit = if last { 0x40 } else { 0x00 };

            let mut buf = BytesMut::with_capacity(FU_HEADER_LEN + chunk_size);
            buf.put_u8(fu_indicator);
            buf.put_u8(start_bit | end_bit | nal_type);
            buf.extend_from_slice(&payload[offset..offset + chunk_size]);
            out.push(Fragment {
                payload: buf.freeze(),
                marker: is_last_nal && last,
            });

            offset += chunk_size;
        }

        tracing::trace!(
            nal_type,
            nal_size = nal.len(),
            fragments = out.len() - before,
            "FU-A fragmented NAL unit"
        );
    }

    /// Locate NAL units in an H.264 Annex B bitstream.
    ///
    /// Scans for start codes (both 4-byte `00 00 00 01` and 3-byte
    /// `00 00 01`) and returns the byte ranges between them, excluding the
    /// start codes themselves.
    ///
    /// The start code length is tracked per-NAL so boundaries between
    /// adjacent NALs stay correct when 3-byte and 4-byte codes are mixed.
    pub fn nal_unit_ranges(data: &[u8]) -> Vec<Range<usize>> {
        let mut i = 0usize;

        // (nal_data_start_index, start_code_length)
        let mut start_entries: Vec<(usize, usize)> = Vec::new();

        while i < data.len() {
            if i + 3 < data.len() && data[i..i + 4] == START_CODE {
                start_entries.push((i + 4, 4));
                i += 4;
            } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
                start_entries.push((i + 3, 3));
                i += 3;
            } else {
                i += 1;
            }
        }

        start_entries
            .iter()
            .enumerate()
            .filter_map(|(idx, &(start, _))| {
                let end = match start_entries.get(idx + 1) {
                    Some(&(next_start, next_sc_len)) => next_start - next_sc_len,
                    None => data.len(),
                };
                (start < end).then_some(start..end)
            })
            .collect()
    }

    /// Rebuild an Annex B access unit (4-byte start codes) from the RTP
    /// payloads of one unit, in sequence order.
    pub fn reassemble(payloads: &[Bytes]) -> Result<Bytes, PacketizationError> {
        let total: usize = payloads.iter().map(|p| p.len() + START_CODE.len()).sum();
        let mut out = BytesMut::with_capacity(total);
        let mut in_fragment = false;

        for payload in payloads {
            let Some(&first) = payload.first() else {
                return Err(PacketizationError::Malformed("empty H.264 payload"));
            };

            match first & 0x1f {
                1..=23 => {
                    if in_fragment {
                        return Err(PacketizationError::Malformed("FU-A interrupted"));
                    }
                    out.extend_from_slice(&START_CODE);
                    out.extend_from_slice(payload);
                }
                FU_A => {
                    if payload.len() < FU_HEADER_LEN {
                        return Err(PacketizationError::Malformed("truncated FU-A header"));
                    }
                    let fu_header = payload[1];
                    let start = fu_header & 0x80 != 0;
                    let end = fu_header & 0x40 != 0;

                    if start {
                        if in_fragment {
                            return Err(PacketizationError::Malformed("FU-A restarted"));
                        }
                        out.extend_from_slice(&START_CODE);
                        out.put_u8((first & 0xe0) | (fu_header & 0x1f));
                        in_fragment = true;
                    } else if !in_fragment {
                        return Err(PacketizationError::Malformed(
                            "FU-A continuation without start",
                        ));
                    }

                    out.extend_from_slice(&payload[FU_HEADER_LEN..]);
                    if end {
                        in_fragment = false;
                    }
                }
                _ => return Err(PacketizationError::Malformed("unsupported NAL unit type")),
            }
        }

        if in_fragment {
            return Err(PacketizationError::Malformed("FU-A missing end fragment"));
        }
        Ok(out.freeze())
    }
}

impl Packetizer for H264Packetizer {
    fn fragment(&mut self, unit: &EncodedUnit) -> Result<Vec<Fragment>, PacketizationError> {
        if unit.data.is_empty() {
            return Ok(Vec::new());
        }

        let nals = Self::nal_unit_ranges(&unit.data);
        if nals.is_empty() {
            return Err(PacketizationError::Malformed("no Annex B start code"));
        }

        let needed: usize = nals.iter().map(|r| self.fragments_for(r.len())).sum();
        if needed > self.max_fragments {
            return Err(PacketizationError::TooManyFragments {
                needed,
                limit: self.max_fragments,
            });
        }

        // Auto-capture SPS/PPS from first unit that contains them (e.g. first keyframe).
        self.capture_parameter_sets(&unit.data, &nals);

        let mut fragments = Vec::with_capacity(needed);
        let last = nals.len() - 1;
        for (i, range) in nals.into_iter().enumerate() {
            self.fragment_nal(unit.data.slice(range), i == last, &mut fragments);
        }

        tracing::trace!(
            rtp_packets = fragments.len(),
            unit_bytes = unit.data.len(),
            "access unit packetized"
        );

        Ok(fragments)
    }

    fn codec_name(&self) -> &'static str {
        "H264"
    }

    fn payload_type(&self) -> u8 {
        self.pt
    }

    fn max_payload_size(&self) -> usize {
        self.max_payload
    }

    /// SDP attributes per RFC 6184 §8.2.1.
    ///
    /// Order matters: `a=rtpmap` defines the payload type and MUST precede
    /// `a=fmtp` which references it. ffplay and other clients parse attributes
    /// sequentially and expect this ordering.
    fn sdp_attributes(&self) -> Vec<String> {
        let mut fmtp = format!("a=fmtp:{} packetization-mode=1", self.pt);
        if let Some(pl) = self.profile_level_id() {
            fmtp.push_str(&format!(";profile-level-id={}", pl));
        }
        if let Some(sprop) = self.sprop_parameter_sets() {
            fmtp.push_str(&format!(";sprop-parameter-sets={}", sprop));
        }

        vec![
            format!(
                "a=rtpmap:{} {}/{}",
                self.payload_type(),
                self.codec_name(),
                self.clock_rate()
            ),
            fmtp,
            "a=control:track1".to_string(),
        ]
    }
}
