//! SDP (Session Description Protocol) generation (RFC 8866).
//!
//! A receiver such as `ffplay` cannot open a bare RTP stream; it needs a
//! description naming the port, payload type and codec. The format:
//!
//! ```text
//! v=0                                          ← protocol version
//! o=<user> <sess-id> <sess-ver> IN IP4 <addr>  ← origin
//! s=<session-name>                             ← session name
//! c=IN IP4 <receiver-addr>                     ← where RTP is sent
//! t=0 0                                        ← timing (live stream)
//! a=tool:rtp-streamer                          ← sender software
//! a=recvonly                                   ← direction, receiver's view
//! m=video <port> RTP/AVP 96                    ← media description
//! a=rtpmap:96 H264/90000                       ← codec/clock rate
//! a=fmtp:96 packetization-mode=1               ← codec parameters
//! ```

use std::net::{IpAddr, SocketAddr};

use crate::media::Packetizer;

/// Session-level SDP fields.
#[derive(Debug, Clone)]
pub struct SdpConfig {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub session_name: String,
    /// Address placed in the `o=` line; the receiver address when unset.
    pub origin_address: Option<IpAddr>,
}

impl Default for SdpConfig {
    fn default() -> Self {
        Self {
            username: "-".to_string(),
            session_id: "0".to_string(),
            session_version: "0".to_string(),
            session_name: "RTP video stream".to_string(),
            origin_address: None,
        }
    }
}

fn addr_type(ip: &IpAddr) -> &'static str {
    match ip {
        IpAddr::V4(_) => "IP4",
        IpAddr::V6(_) => "IP6",
    }
}

/// Describe the stream `packetizer` produces as seen by the receiver at
/// `destination`.
pub fn generate_sdp(
    packetizer: &dyn Packetizer,
    destination: SocketAddr,
    config: &SdpConfig,
) -> String {
    let dest_ip = destination.ip();
    let origin_ip = config.origin_address.unwrap_or(dest_ip);

    let mut sdp: Vec<String> = Vec::new();
    sdp.push("v=0".to_string());
    sdp.push(format!(
        "o={} {} {} IN {} {}",
        config.username,
        config.session_id,
        config.session_version,
        addr_type(&origin_ip),
        origin_ip
    ));
    sdp.push(format!("s={}", config.session_name));
    sdp.push(format!("c=IN {} {}", addr_type(&dest_ip), dest_ip));
    sdp.push("t=0 0".to_string());
    sdp.push("a=tool:rtp-streamer".to_string());
    sdp.push("a=recvonly".to_string());
    sdp.push(format!(
        "m=video {} RTP/AVP {}",
        destination.port(),
        packetizer.payload_type()
    ));
    sdp.extend(packetizer.sdp_attributes());

    tracing::debug!("SDP: {}", sdp.join("\r\n"));

    format!("{}\r\n", sdp.join("\r\n"))
}
