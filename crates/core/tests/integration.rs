//! Integration tests: full pipeline over loopback UDP.
//!
//! Each test starts a [`Server`] with a gated source so receivers can be
//! registered before the first frame leaves, then checks what arrives on the
//! wire and what the [`RtpReceiver`] rebuilds from it.

use std::net::{SocketAddr, UdpSocket};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use rtpstream::codec::{EncodedUnit, Encoder};
use rtpstream::error::{CaptureError, EncodeError};
use rtpstream::media::rtp::RtpPacket;
use rtpstream::source::TestPatternSource;
use rtpstream::{
    Frame, FrameSource, PayloadFormat, PixelFormat, RawEncoder, ReceiverConfig, RtpReceiver,
    Server, SessionState, StreamConfig,
};

const WIDTH: u32 = 16;
const HEIGHT: u32 = 16;
const FRAMES: u64 = 5;

/// Holds the first frame back until the test says go.
struct GatedSource {
    inner: TestPatternSource,
    gate: Option<mpsc::Receiver<()>>,
}

impl GatedSource {
    fn new(inner: TestPatternSource) -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                inner,
                gate: Some(rx),
            },
            tx,
        )
    }
}

impl FrameSource for GatedSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        if let Some(gate) = self.gate.take() {
            let _ = gate.recv();
        }
        self.inner.next_frame()
    }

    fn frame_rate(&self) -> u32 {
        self.inner.frame_rate()
    }
}

fn pattern(frames: u64) -> TestPatternSource {
    TestPatternSource::new(WIDTH, HEIGHT, PixelFormat::Gray8, 25)
        .unwrap()
        .with_frame_limit(frames)
}

fn config(format: PayloadFormat) -> StreamConfig {
    StreamConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        payload_format: format,
        max_payload_size: 100,
        ..Default::default()
    }
}

fn raw_listener() -> (UdpSocket, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

/// Collect packets until `markers` units have ended or the socket goes quiet.
fn collect_packets(socket: &UdpSocket, markers: usize) -> Vec<RtpPacket> {
    let mut buf = [0u8; 2048];
    let mut packets = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while packets.iter().filter(|p: &&RtpPacket| p.marker).count() < markers
        && Instant::now() < deadline
    {
        if let Ok((n, _)) = socket.recv_from(&mut buf) {
            packets.push(RtpPacket::parse(&buf[..n]).unwrap());
        }
    }
    packets
}

#[test]
fn streams_pattern_end_to_end() {
    let receiver = RtpReceiver::bind(ReceiverConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        ..Default::default()
    })
    .unwrap();
    let (raw, raw_addr) = raw_listener();

    let mut server = Server::new(config(PayloadFormat::Generic)).unwrap();
    let (source, go) = GatedSource::new(pattern(FRAMES));
    server
        .start(Box::new(source), Box::new(RawEncoder::new()))
        .unwrap();
    let session = server.add_receiver(raw_addr).unwrap();
    server.add_receiver(receiver.local_addr()).unwrap();
    go.send(()).unwrap();

    let packets = collect_packets(&raw, FRAMES as usize);
    let stats = server.wait().unwrap();

    // 256-byte frames at 100 bytes per packet
    assert_eq!(packets.len(), 3 * FRAMES as usize);
    let sizes: Vec<usize> = packets[..3].iter().map(|p| p.payload.len()).collect();
    assert_eq!(sizes, vec![100, 100, 56]);

    for pair in packets.windows(2) {
        assert_eq!(pair[1].sequence, pair[0].sequence.wrapping_add(1));
        assert_eq!(pair[0].ssrc, pair[1].ssrc);
    }
    for (i, unit) in packets.chunks(3).enumerate() {
        assert!(unit.iter().all(|p| p.timestamp == unit[0].timestamp));
        let markers: Vec<bool> = unit.iter().map(|p| p.marker).collect();
        assert_eq!(markers, vec![false, false, true], "unit {i}");
    }
    // 25 fps on a 90 kHz clock
    let first_ts: Vec<u32> = packets.chunks(3).map(|u| u[0].timestamp).collect();
    for pair in first_ts.windows(2) {
        assert_eq!(pair[1].wrapping_sub(pair[0]), 3600);
    }

    for index in 0..FRAMES {
        let frame = receiver
            .recv_frame_timeout(Duration::from_secs(2))
            .expect("frame rebuilt by receiver");
        assert_eq!(
            frame.data.as_ref(),
            TestPatternSource::render(index, WIDTH, HEIGHT, PixelFormat::Gray8).as_slice(),
            "frame {index}"
        );
    }

    assert_eq!(stats.frames_captured, FRAMES);
    assert_eq!(stats.units_sent, FRAMES);
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.stats().packets_sent, 3 * FRAMES);
    assert_eq!(session.stats().packets_dropped, 0);
}

#[test]
fn sessions_number_independently() {
    let (a, a_addr) = raw_listener();
    let (b, b_addr) = raw_listener();

    let mut server = Server::new(StreamConfig {
        pace: false,
        ..config(PayloadFormat::Generic)
    })
    .unwrap();
    let (source, go) = GatedSource::new(pattern(3));
    server
        .start(Box::new(source), Box::new(RawEncoder::new()))
        .unwrap();
    let sa = server.add_receiver(a_addr).unwrap();
    let sb = server.add_receiver(b_addr).unwrap();
    go.send(()).unwrap();

    let pa = collect_packets(&a, 3);
    let pb = collect_packets(&b, 3);
    server.wait().unwrap();

    assert_eq!(pa.len(), 9);
    assert_eq!(pb.len(), 9);
    assert_eq!(pa[0].ssrc, sa.ssrc());
    assert_eq!(pb[0].ssrc, sb.ssrc());
    for packets in [&pa, &pb] {
        for pair in packets.windows(2) {
            assert_eq!(pair[1].sequence, pair[0].sequence.wrapping_add(1));
        }
    }
    // same media, each session on its own timestamp offset
    for (x, y) in pa.iter().zip(&pb) {
        assert_eq!(x.payload, y.payload);
        assert_eq!(x.marker, y.marker);
    }
}

#[test]
fn removed_receiver_stops_getting_packets() {
    let (a, a_addr) = raw_listener();
    let (b, b_addr) = raw_listener();

    let mut server = Server::new(config(PayloadFormat::Generic)).unwrap();
    let (source, go) = GatedSource::new(pattern(10));
    server
        .start(Box::new(source), Box::new(RawEncoder::new()))
        .unwrap();
    let sa = server.add_receiver(a_addr).unwrap();
    server.add_receiver(b_addr).unwrap();
    go.send(()).unwrap();

    // let the first unit through, then drop receiver A
    assert!(!collect_packets(&a, 1).is_empty());
    server.remove_receiver(&sa.id).unwrap();
    assert_eq!(sa.state(), SessionState::Closed);
    // second teardown is a no-op
    server.remove_receiver(&sa.id).unwrap();

    let pb = collect_packets(&b, 10);
    server.wait().unwrap();
    assert_eq!(pb.iter().filter(|p| p.marker).count(), 10);
    assert!(sa.stats().packets_sent < 30);
}

#[test]
fn stop_discards_and_closes_sessions() {
    let (_sock, addr) = raw_listener();

    let mut server = Server::new(config(PayloadFormat::Generic)).unwrap();
    let source = TestPatternSource::new(WIDTH, HEIGHT, PixelFormat::Gray8, 25).unwrap();
    server
        .start(Box::new(source), Box::new(RawEncoder::new()))
        .unwrap();
    let session = server.add_receiver(addr).unwrap();

    std::thread::sleep(Duration::from_millis(150));
    let handle = server.shutdown_handle();
    handle.shutdown();
    // shutting down twice is harmless
    handle.shutdown();

    server.wait().unwrap();
    assert!(!server.is_running());
    assert_eq!(session.state(), SessionState::Closed);
}

#[test]
fn sdp_describes_stream() {
    let mut server = Server::new(config(PayloadFormat::H264)).unwrap();
    let (source, go) = GatedSource::new(pattern(1));
    server
        .start(Box::new(source), Box::new(RawEncoder::new()))
        .unwrap();

    let sdp = server.sdp("127.0.0.1:5004".parse().unwrap());
    assert!(sdp.starts_with("v=0\r\n"));
    assert!(sdp.contains("m=video 5004 RTP/AVP 96\r\n"));
    assert!(sdp.contains("a=rtpmap:96 H264/90000\r\n"));
    server.stop();
    // releasing the gate lets the capture thread see the stop
    drop(go);
    server.wait().unwrap();
}

/// Emits a fixed Annex B access unit per frame: SPS, PPS and one large IDR slice.
struct AnnexBEncoder;

impl AnnexBEncoder {
    fn access_unit(index: u64) -> Vec<u8> {
        let mut au = vec![0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1e];
        au.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xce, 0x38, 0x80]);
        au.extend_from_slice(&[0, 0, 0, 1, 0x65]);
        au.extend((0..1500u32).map(|i| ((i as u64 + index) % 200 + 1) as u8));
        au
    }
}

impl Encoder for AnnexBEncoder {
    fn encode(&mut self, frame: Frame) -> Result<Vec<EncodedUnit>, EncodeError> {
        let mut unit = EncodedUnit::new(Self::access_unit(frame.index), frame.pts);
        unit.keyframe = true;
        Ok(vec![unit])
    }

    fn flush(&mut self) -> Result<Vec<EncodedUnit>, EncodeError> {
        Ok(Vec::new())
    }

    fn name(&self) -> &'static str {
        "annexb-fixture"
    }
}

#[test]
fn h264_units_survive_fu_a_round_trip() {
    let receiver = RtpReceiver::bind(ReceiverConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        payload_format: PayloadFormat::H264,
        ..Default::default()
    })
    .unwrap();

    let mut server = Server::new(StreamConfig {
        pace: false,
        ..config(PayloadFormat::H264)
    })
    .unwrap();
    let (source, go) = GatedSource::new(pattern(3));
    server
        .start(Box::new(source), Box::new(AnnexBEncoder))
        .unwrap();
    server.add_receiver(receiver.local_addr()).unwrap();
    go.send(()).unwrap();

    for index in 0..3 {
        let frame = receiver
            .recv_frame_timeout(Duration::from_secs(2))
            .expect("access unit rebuilt");
        assert_eq!(frame.data.as_ref(), AnnexBEncoder::access_unit(index).as_slice());
        // SPS + PPS + 16 FU-A fragments of the slice
        assert!(frame.packets > 3);
    }
    server.wait().unwrap();

    let sdp = server.sdp(receiver.local_addr());
    assert!(sdp.contains("sprop-parameter-sets="));
}

/// Passes frames through unchanged except one, which it blows up past the
/// packet bound.
struct OversizedAt(u64);

impl Encoder for OversizedAt {
    fn encode(&mut self, frame: Frame) -> Result<Vec<EncodedUnit>, EncodeError> {
        let data = if frame.index == self.0 {
            vec![0xaa; 2000]
        } else {
            frame.data
        };
        Ok(vec![EncodedUnit::new(data, frame.pts)])
    }

    fn flush(&mut self) -> Result<Vec<EncodedUnit>, EncodeError> {
        Ok(Vec::new())
    }

    fn name(&self) -> &'static str {
        "oversized-fixture"
    }
}

#[test]
fn oversized_unit_is_skipped_and_stream_continues() {
    let (raw, raw_addr) = raw_listener();

    // 2000 bytes at 100 per packet needs 20 packets, over the bound of 8
    let mut server = Server::new(StreamConfig {
        pace: false,
        max_packets_per_unit: 8,
        ..config(PayloadFormat::Generic)
    })
    .unwrap();
    let (source, go) = GatedSource::new(pattern(3));
    server
        .start(Box::new(source), Box::new(OversizedAt(1)))
        .unwrap();
    let session = server.add_receiver(raw_addr).unwrap();
    go.send(()).unwrap();

    let packets = collect_packets(&raw, 2);
    let stats = server.wait().unwrap();

    assert_eq!(stats.packetization_errors, 1);
    assert_eq!(stats.units_sent, 2);

    // frames 0 and 2 only, numbered as if frame 1 never existed
    assert_eq!(packets.len(), 6);
    for pair in packets.windows(2) {
        assert_eq!(pair[1].sequence, pair[0].sequence.wrapping_add(1));
    }
    let payload: Vec<u8> = packets[3..]
        .iter()
        .flat_map(|p| p.payload.iter().copied())
        .collect();
    assert_eq!(
        payload,
        TestPatternSource::render(2, WIDTH, HEIGHT, PixelFormat::Gray8)
    );

    // the failure did not tear the session down
    let s = session.stats();
    assert_eq!(s.packets_sent, 6);
    assert_eq!(s.send_failures, 0);
    assert_eq!(session.state(), SessionState::Closed);
}
