use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rtpstream::session::SessionConfig;
use rtpstream::source::{RawFileSource, TestPatternSource};
use rtpstream::{
    Encoder, FrameSource, PayloadFormat, PixelFormat, RawEncoder, ReceiverConfig, RtpReceiver,
    Server, StreamConfig,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rtp-streamer", about = "Real-time RTP video sender and receiver")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Capture, encode and stream video to one or more receivers
    Send(SendArgs),
    /// Receive an RTP stream and rebuild its frames
    Receive(ReceiveArgs),
}

#[derive(Clone, Copy, ValueEnum)]
enum SourceKind {
    /// Synthetic moving bars
    Pattern,
    /// Raw frames read from --file
    File,
}

#[derive(Clone, Copy, ValueEnum)]
enum EncoderKind {
    /// Frames sent as-is
    Raw,
    /// H.264 via OpenH264 (requires the `openh264` feature)
    H264,
}

#[derive(Args)]
struct SendArgs {
    /// Receiver address (host:port); repeat for several receivers
    #[arg(long = "dest", short, required = true)]
    destinations: Vec<SocketAddr>,

    /// Local address for the RTP socket
    #[arg(long, default_value = "0.0.0.0:0")]
    bind: String,

    #[arg(long, value_enum, default_value = "pattern")]
    source: SourceKind,

    /// Raw frame file for --source file
    #[arg(long)]
    file: Option<PathBuf>,

    /// Rewind the file at end instead of stopping
    #[arg(long = "loop")]
    looping: bool,

    #[arg(long, default_value_t = 320)]
    width: u32,

    #[arg(long, default_value_t = 240)]
    height: u32,

    /// gray8, i420 or rgb24
    #[arg(long, default_value = "i420")]
    pixel_format: PixelFormat,

    #[arg(long, default_value_t = 25)]
    fps: u32,

    /// Stop after this many frames (pattern source)
    #[arg(long)]
    frames: Option<u64>,

    #[arg(long, value_enum, default_value = "raw")]
    encoder: EncoderKind,

    /// Target bitrate for the H.264 encoder, bits per second
    #[cfg(feature = "openh264")]
    #[arg(long, default_value_t = 1_000_000)]
    bitrate: u32,

    /// Keyframe interval for the H.264 encoder, in frames
    #[cfg(feature = "openh264")]
    #[arg(long, default_value_t = 50)]
    keyint: u32,

    /// RTP payload format: generic or h264
    #[arg(long, default_value = "generic")]
    format: PayloadFormat,

    #[arg(long, default_value_t = 96)]
    payload_type: u8,

    /// Largest RTP payload in bytes
    #[arg(long, default_value_t = 1200)]
    max_payload: usize,

    #[arg(long, default_value_t = 1024)]
    max_packets_per_unit: usize,

    #[arg(long, default_value_t = 8)]
    frame_queue: usize,

    #[arg(long, default_value_t = 8)]
    unit_queue: usize,

    /// Per-receiver outbound packet queue
    #[arg(long, default_value_t = 256)]
    session_queue: usize,

    /// Consecutive send failures before a receiver is dropped
    #[arg(long, default_value_t = 10)]
    max_send_failures: u32,

    /// Send units as fast as they are produced
    #[arg(long)]
    no_pace: bool,

    /// Drift tolerance before late units are dropped, in milliseconds
    #[arg(long, default_value_t = 200)]
    pacer_tolerance_ms: u64,

    /// Consecutive capture failures before giving up
    #[arg(long, default_value_t = 3)]
    max_capture_failures: u32,

    /// Write an SDP description for the first receiver to this path
    #[arg(long)]
    sdp: Option<PathBuf>,
}

#[derive(Args)]
struct ReceiveArgs {
    /// Local address to listen on
    #[arg(long, short, default_value = "0.0.0.0:5004")]
    bind: String,

    /// RTP payload format: generic or h264
    #[arg(long, default_value = "generic")]
    format: PayloadFormat,

    /// Ignore packets with any other payload type
    #[arg(long)]
    payload_type: Option<u8>,

    /// Append every rebuilt frame to this file
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Exit after this many frames
    #[arg(long)]
    frames: Option<u64>,

    /// How long an incomplete frame waits for missing packets, in milliseconds
    #[arg(long, default_value_t = 500)]
    max_frame_age_ms: u64,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let result = match cli.command {
        Command::Send(args) => send(args),
        Command::Receive(args) => receive(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Sets the flag when Enter is pressed on stdin.
fn stop_on_enter(on_enter: impl FnOnce() + Send + 'static) {
    thread::spawn(move || {
        let mut input = String::new();
        if io::stdin().read_line(&mut input).is_ok() {
            on_enter();
        }
    });
}

fn build_source(args: &SendArgs) -> anyhow::Result<Box<dyn FrameSource>> {
    Ok(match args.source {
        SourceKind::Pattern => {
            let source =
                TestPatternSource::new(args.width, args.height, args.pixel_format, args.fps)?;
            match args.frames {
                Some(n) => Box::new(source.with_frame_limit(n)),
                None => Box::new(source),
            }
        }
        SourceKind::File => {
            let Some(path) = args.file.as_ref() else {
                bail!("--source file needs --file <path>");
            };
            let source =
                RawFileSource::open(path, args.width, args.height, args.pixel_format, args.fps)
                    .with_context(|| format!("opening {}", path.display()))?;
            Box::new(source.looping(args.looping))
        }
    })
}

fn build_encoder(args: &SendArgs) -> anyhow::Result<Box<dyn Encoder>> {
    match args.encoder {
        EncoderKind::Raw => Ok(Box::new(RawEncoder::new())),
        #[cfg(feature = "openh264")]
        EncoderKind::H264 => Ok(Box::new(rtpstream::codec::H264Encoder::new(
            args.fps,
            args.bitrate,
            args.keyint,
        )?)),
        #[cfg(not(feature = "openh264"))]
        EncoderKind::H264 => {
            bail!("built without H.264 support; rebuild with --features openh264")
        }
    }
}

fn send(args: SendArgs) -> anyhow::Result<()> {
    let config = StreamConfig {
        bind_addr: args.bind.clone(),
        payload_format: args.format,
        payload_type: args.payload_type,
        max_payload_size: args.max_payload,
        max_packets_per_unit: args.max_packets_per_unit,
        frame_queue_capacity: args.frame_queue,
        unit_queue_capacity: args.unit_queue,
        pace: !args.no_pace,
        pacer_tolerance: Duration::from_millis(args.pacer_tolerance_ms),
        max_capture_failures: args.max_capture_failures,
        session: SessionConfig {
            outbound_queue_capacity: args.session_queue,
            max_consecutive_failures: args.max_send_failures,
            ..Default::default()
        },
        ..Default::default()
    };

    let source = build_source(&args)?;
    let encoder = build_encoder(&args)?;

    let mut server = Server::new(config).context("invalid stream configuration")?;
    server
        .start(source, encoder)
        .context("failed to start server")?;

    for dest in &args.destinations {
        let session = server.add_receiver(*dest)?;
        tracing::info!(session_id = %session.id, %dest, "streaming to receiver");
    }

    if let (Some(path), Some(first)) = (args.sdp.as_ref(), args.destinations.first()) {
        std::fs::write(path, server.sdp(*first))
            .with_context(|| format!("writing SDP to {}", path.display()))?;
        tracing::info!(path = %path.display(), "SDP written");
    }

    let handle = server.shutdown_handle();
    stop_on_enter(move || handle.shutdown());
    tracing::info!("streaming, press Enter to stop");

    let stats = server.wait()?;
    tracing::info!(
        frames = stats.frames_captured,
        units = stats.units_sent,
        encode_errors = stats.encode_errors,
        dropped = stats.frames_dropped + stats.units_dropped + stats.units_late,
        "done"
    );
    for session in server.sessions() {
        let s = session.stats();
        tracing::info!(
            session_id = %session.id,
            destination = %session.destination,
            packets = s.packets_sent,
            bytes = s.bytes_sent,
            dropped = s.packets_dropped,
            failures = s.send_failures,
            "receiver summary"
        );
    }
    Ok(())
}

fn receive(args: ReceiveArgs) -> anyhow::Result<()> {
    let config = ReceiverConfig {
        bind_addr: args.bind.clone(),
        payload_format: args.format,
        max_frame_age: Duration::from_millis(args.max_frame_age_ms),
        ..Default::default()
    };
    let mut receiver = RtpReceiver::bind_filtered(config, args.payload_type)
        .with_context(|| format!("binding {}", args.bind))?;

    let mut output = match args.output.as_ref() {
        Some(path) => Some(BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => None,
    };

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        stop_on_enter(move || stop.store(true, Ordering::SeqCst));
    }
    tracing::info!(local_addr = %receiver.local_addr(), "receiving, press Enter to stop");

    let mut received = 0u64;
    while !stop.load(Ordering::SeqCst) && args.frames.is_none_or(|n| received < n) {
        let Some(frame) = receiver.recv_frame_timeout(Duration::from_millis(100)) else {
            continue;
        };
        received += 1;
        tracing::debug!(
            ts = frame.timestamp,
            seq = frame.first_sequence,
            packets = frame.packets,
            bytes = frame.data.len(),
            "frame received"
        );
        if let Some(out) = output.as_mut() {
            out.write_all(&frame.data)?;
        }
    }

    if let Some(mut out) = output {
        out.flush()?;
    }
    receiver.stop();

    let stats = receiver.stats();
    tracing::info!(
        frames = received,
        packets = stats.assembler.packets_received,
        lost_frames = stats.assembler.frames_lost,
        late = stats.assembler.late_packets,
        jitter_ticks = stats.assembler.jitter,
        parse_errors = stats.parse_errors,
        "receiver summary"
    );
    Ok(())
}
