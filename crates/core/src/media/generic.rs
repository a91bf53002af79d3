use bytes::{Bytes, BytesMut};

use super::{Fragment, Packetizer};
use crate::codec::EncodedUnit;
use crate::error::PacketizationError;

/// Format-agnostic packetizer: cuts the unit into consecutive slices of at
/// most `max_payload_size` bytes. No payload header is added, so the
/// receiver rebuilds the unit by concatenating payloads in sequence order.
///
/// Slices share the unit's buffer; nothing is copied.
#[derive(Debug)]
pub struct GenericPacketizer {
    pt: u8,
    max_payload: usize,
    max_fragments: usize,
}

impl GenericPacketizer {
    pub fn new(
        pt: u8,
        max_payload: usize,
        max_fragments: usize,
    ) -> Result<Self, PacketizationError> {
        if max_payload == 0 {
            return Err(PacketizationError::PayloadTooSmall(max_payload));
        }
        Ok(Self {
            pt,
            max_payload,
            max_fragments: max_fragments.max(1),
        })
    }

    /// Concatenate payloads that arrived in sequence order.
    pub fn reassemble(payloads: &[Bytes]) -> Bytes {
        if let [single] = payloads {
            return single.clone();
        }
        let total = payloads.iter().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(total);
        for p in payloads {
            out.extend_from_slice(p);
        }
        out.freeze()
    }
}

impl Packetizer for GenericPacketizer {
    fn fragment(&mut self, unit: &EncodedUnit) -> Result<Vec<Fragment>, PacketizationError> {
        let len = unit.data.len();
        let needed = len.div_ceil(self.max_payload);
        if needed > self.max_fragments {
            return Err(PacketizationError::TooManyFragments {
                needed,
                limit: self.max_fragments,
            });
        }

        let fragments: Vec<Fragment> = (0..needed)
            .map(|i| {
                let start = i * self.max_payload;
                let end = (start + self.max_payload).min(len);
                Fragment {
                    payload: unit.data.slice(start..end),
                    marker: end == len,
                }
            })
            .collect();

        tracing::trace!(unit_bytes = len, fragments = fragments.len(), "unit fragmented");
        Ok(fragments)
    }

    fn codec_name(&self) -> &'static str {
        "X-GENERIC"
    }

    fn payload_type(&self) -> u8 {
        self.pt
    }

    fn max_payload_size(&self) -> usize {
        self.max_payload
    }

    fn sdp_attributes(&self) -> Vec<String> {
        vec![
            format!(
                "a=rtpmap:{} {}/{}",
                self.pt,
                self.codec_name(),
                self.clock_rate()
            ),
            "a=control:track1".to_string(),
        ]
    }
}
