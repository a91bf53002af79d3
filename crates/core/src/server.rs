use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::codec::{EncodedUnit, Encoder};
use crate::error::{CaptureError, Result, StreamError};
use crate::media::rtp::RTP_HEADER_LEN;
use crate::media::{DEFAULT_MAX_PACKETS_PER_UNIT, Packetizer, PayloadFormat};
use crate::pacer::Pacer;
use crate::queue::BoundedQueue;
use crate::sdp::{SdpConfig, generate_sdp};
use crate::session::{Session, SessionConfig, SessionManager};
use crate::source::{Frame, FrameSource};
use crate::transport::UdpTransport;

/// Largest UDP payload over IPv4.
const MAX_UDP_PAYLOAD: usize = 65_507;

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Local address the RTP socket binds to.
    pub bind_addr: String,
    pub payload_format: PayloadFormat,
    /// RTP payload type (dynamic range 96-127 for non-static formats).
    pub payload_type: u8,
    /// Largest RTP payload in bytes, header excluded.
    pub max_payload_size: usize,
    /// Units needing more packets than this are dropped.
    pub max_packets_per_unit: usize,
    /// Capture → encode queue.
    pub frame_queue_capacity: usize,
    /// Encode → packetize queue.
    pub unit_queue_capacity: usize,
    /// Hold each unit back until its presentation time.
    pub pace: bool,
    /// How far behind schedule a unit may fall before it is dropped.
    pub pacer_tolerance: Duration,
    /// Consecutive capture failures after which the source is given up.
    pub max_capture_failures: u32,
    pub capture_retry_delay: Duration,
    pub session: SessionConfig,
    pub sdp: SdpConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".to_string(),
            payload_format: PayloadFormat::default(),
            payload_type: 96,
            max_payload_size: 1200,
            max_packets_per_unit: DEFAULT_MAX_PACKETS_PER_UNIT,
            frame_queue_capacity: 8,
            unit_queue_capacity: 8,
            pace: true,
            pacer_tolerance: Duration::from_millis(200),
            max_capture_failures: 3,
            capture_retry_delay: Duration::from_millis(100),
            session: SessionConfig::default(),
            sdp: SdpConfig::default(),
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(StreamError::InvalidConfig(msg));

        if self.payload_type > 127 {
            return invalid(format!("payload type {} exceeds 127", self.payload_type));
        }
        if self.max_payload_size == 0 || self.max_payload_size + RTP_HEADER_LEN > MAX_UDP_PAYLOAD {
            return invalid(format!(
                "max payload size {} out of range 1..={}",
                self.max_payload_size,
                MAX_UDP_PAYLOAD - RTP_HEADER_LEN
            ));
        }
        if self.max_packets_per_unit == 0 {
            return invalid("max packets per unit must be non-zero".to_string());
        }
        if self.frame_queue_capacity == 0 || self.unit_queue_capacity == 0 {
            return invalid("stage queue capacities must be non-zero".to_string());
        }
        if self.session.outbound_queue_capacity == 0 {
            return invalid("session outbound queue capacity must be non-zero".to_string());
        }
        if self.session.max_consecutive_failures == 0 {
            return invalid("session failure threshold must be non-zero".to_string());
        }
        if self.max_capture_failures == 0 {
            return invalid("capture failure threshold must be non-zero".to_string());
        }
        Ok(())
    }
}

/// Pipeline-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_captured: u64,
    pub capture_failures: u64,
    /// Frames evicted from the capture → encode queue.
    pub frames_dropped: u64,
    pub frames_encoded: u64,
    /// Frames skipped because the encoder rejected them.
    pub encode_errors: u64,
    pub units_encoded: u64,
    /// Units evicted from the encode → packetize queue.
    pub units_dropped: u64,
    /// Units dropped by the pacer for running too far behind.
    pub units_late: u64,
    pub packetization_errors: u64,
    /// Units fragmented and handed to the live sessions.
    pub units_sent: u64,
    /// Frames and units thrown away by shutdown, flushed units included.
    pub units_discarded: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_captured: AtomicU64,
    capture_failures: AtomicU64,
    frames_encoded: AtomicU64,
    encode_errors: AtomicU64,
    units_encoded: AtomicU64,
    units_late: AtomicU64,
    packetization_errors: AtomicU64,
    units_sent: AtomicU64,
    units_discarded: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Stops a running [`Server`] from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
    frames: Arc<BoundedQueue<Frame>>,
    units: Arc<BoundedQueue<EncodedUnit>>,
    counters: Arc<Counters>,
}

impl ShutdownHandle {
    /// Signal every stage to stop. Queued frames and units are discarded.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let discarded = self.frames.clear() + self.units.clear();
        self.frames.close();
        self.units.close();
        self.counters
            .units_discarded
            .fetch_add(discarded as u64, Ordering::Relaxed);
        tracing::info!(discarded, "server stopping");
    }
}

/// RTP streaming server.
///
/// Owns the pipeline threads (capture, encode, packetize), the session
/// manager and the UDP transport. Frames move stage to stage through
/// bounded drop-oldest queues; each encoded unit is fragmented once and
/// fanned out to every live session, which numbers and sends it on its own
/// thread.
///
/// The pipeline ends when the source is exhausted (everything queued is
/// delivered) or on [`stop`](Self::stop) (everything queued is discarded).
pub struct Server {
    config: StreamConfig,
    session_manager: SessionManager,
    running: Arc<AtomicBool>,
    started: bool,
    udp: Option<Arc<UdpTransport>>,
    packetizer: Arc<Mutex<Box<dyn Packetizer>>>,
    frames: Arc<BoundedQueue<Frame>>,
    units: Arc<BoundedQueue<EncodedUnit>>,
    counters: Arc<Counters>,
    fatal: Arc<Mutex<Option<CaptureError>>>,
    workers: Vec<JoinHandle<()>>,
}

impl Server {
    /// Validate `config` and build the packetizer it describes.
    pub fn new(config: StreamConfig) -> Result<Self> {
        config.validate()?;
        let packetizer = config.payload_format.packetizer(
            config.payload_type,
            config.max_payload_size,
            config.max_packets_per_unit,
        )?;
        Ok(Self::with_packetizer(config, packetizer))
    }

    /// Use a caller-supplied packetizer instead of the configured format.
    pub fn with_packetizer(config: StreamConfig, packetizer: Box<dyn Packetizer>) -> Self {
        Self {
            session_manager: SessionManager::new(config.session.clone()),
            running: Arc::new(AtomicBool::new(false)),
            started: false,
            udp: None,
            packetizer: Arc::new(Mutex::new(packetizer)),
            frames: Arc::new(BoundedQueue::new(config.frame_queue_capacity)),
            units: Arc::new(BoundedQueue::new(config.unit_queue_capacity)),
            counters: Arc::new(Counters::default()),
            fatal: Arc::new(Mutex::new(None)),
            workers: Vec::new(),
            config,
        }
    }

    /// Bind the transport and start the pipeline threads.
    ///
    /// The source and encoder are moved into their threads and dropped when
    /// those threads exit.
    pub fn start(
        &mut self,
        source: Box<dyn FrameSource>,
        encoder: Box<dyn Encoder>,
    ) -> Result<()> {
        if self.started {
            return Err(StreamError::AlreadyRunning);
        }
        self.config.validate()?;

        let udp = Arc::new(UdpTransport::bind_to(&self.config.bind_addr)?);
        let local_addr = udp.local_addr()?;
        self.udp = Some(udp);
        self.started = true;
        self.running.store(true, Ordering::SeqCst);

        let fps = source.frame_rate();
        let codec = encoder.name();

        let spawned = self.spawn_capture(source).and_then(|h| {
            self.workers.push(h);
            self.spawn_encode(encoder)
        });
        let spawned = spawned.and_then(|h| {
            self.workers.push(h);
            self.spawn_packetize()
        });
        match spawned {
            Ok(h) => self.workers.push(h),
            Err(e) => {
                self.stop();
                return Err(e);
            }
        }

        tracing::info!(
            %local_addr,
            fps,
            codec,
            format = %self.config.payload_format,
            pt = self.config.payload_type,
            "RTP server started"
        );
        Ok(())
    }

    fn spawn_capture(&self, mut source: Box<dyn FrameSource>) -> Result<JoinHandle<()>> {
        let running = self.running.clone();
        let frames = self.frames.clone();
        let counters = self.counters.clone();
        let fatal = self.fatal.clone();
        let max_failures = self.config.max_capture_failures;
        let retry_delay = self.config.capture_retry_delay;

        let handle = thread::Builder::new()
            .name("rtp-capture".to_string())
            .spawn(move || {
                let mut failures = 0u32;
                while running.load(Ordering::SeqCst) {
                    match source.next_frame() {
                        Ok(Some(frame)) => {
                            failures = 0;
                            bump(&counters.frames_captured);
                            match frames.push(frame) {
                                Ok(Some(old)) => {
                                    tracing::trace!(index = old.index, "encoder behind, oldest frame dropped")
                                }
                                Ok(None) => {}
                                Err(_) => break,
                            }
                        }
                        Ok(None) => {
                            tracing::info!("frame source exhausted");
                            break;
                        }
                        Err(e) => {
                            failures += 1;
                            bump(&counters.capture_failures);
                            if failures >= max_failures {
                                tracing::error!(error = %e, failures, "capture failed, giving up on source");
                                *fatal.lock() = Some(e);
                                break;
                            }
                            tracing::warn!(error = %e, failures, "capture failed, retrying");
                            thread::sleep(retry_delay);
                        }
                    }
                }
                frames.close();
                tracing::debug!("capture thread exited");
            })?;
        Ok(handle)
    }

    fn spawn_encode(&self, mut encoder: Box<dyn Encoder>) -> Result<JoinHandle<()>> {
        let running = self.running.clone();
        let frames = self.frames.clone();
        let units = self.units.clone();
        let counters = self.counters.clone();

        let handle = thread::Builder::new()
            .name("rtp-encode".to_string())
            .spawn(move || {
                let forward = |produced: Vec<EncodedUnit>| {
                    for unit in produced {
                        bump(&counters.units_encoded);
                        match units.push(unit) {
                            Ok(Some(old)) => tracing::trace!(
                                pts_ms = old.pts.as_millis() as u64,
                                "packetizer behind, oldest unit dropped"
                            ),
                            Ok(None) => {}
                            Err(_) => bump(&counters.units_discarded),
                        }
                    }
                };

                while let Some(frame) = frames.pop() {
                    let index = frame.index;
                    match encoder.encode(frame) {
                        Ok(produced) => {
                            bump(&counters.frames_encoded);
                            forward(produced);
                        }
                        Err(e) => {
                            bump(&counters.encode_errors);
                            tracing::warn!(index, error = %e, "frame skipped, encode failed");
                        }
                    }
                }

                // exactly one flush, whichever way the stream ended
                match encoder.flush() {
                    Ok(flushed) if running.load(Ordering::SeqCst) => forward(flushed),
                    Ok(flushed) => {
                        if !flushed.is_empty() {
                            tracing::debug!(units = flushed.len(), "flushed units discarded by shutdown");
                        }
                        counters
                            .units_discarded
                            .fetch_add(flushed.len() as u64, Ordering::Relaxed);
                    }
                    Err(e) => tracing::warn!(error = %e, "encoder flush failed"),
                }
                units.close();
                tracing::debug!("encode thread exited");
            })?;
        Ok(handle)
    }

    fn spawn_packetize(&self) -> Result<JoinHandle<()>> {
        let running = self.running.clone();
        let units = self.units.clone();
        let counters = self.counters.clone();
        let packetizer = self.packetizer.clone();
        let sessions = self.session_manager.clone();
        let mut pacer = self.config.pace.then(|| Pacer::new(self.config.pacer_tolerance));

        let handle = thread::Builder::new()
            .name("rtp-packetize".to_string())
            .spawn(move || {
                while let Some(unit) = units.pop() {
                    if !running.load(Ordering::SeqCst) {
                        bump(&counters.units_discarded);
                        break;
                    }
                    if let Some(pacer) = pacer.as_mut() {
                        if !pacer.wait(unit.pts, &running) {
                            if !running.load(Ordering::SeqCst) {
                                bump(&counters.units_discarded);
                                break;
                            }
                            bump(&counters.units_late);
                            continue;
                        }
                    }

                    let fragments = match packetizer.lock().fragment(&unit) {
                        Ok(f) => f,
                        Err(e) => {
                            bump(&counters.packetization_errors);
                            tracing::warn!(
                                bytes = unit.len(),
                                error = %e,
                                "unit dropped, packetization failed"
                            );
                            continue;
                        }
                    };

                    let live = sessions.live_sessions();
                    for session in &live {
                        if let Err(e) = session.submit(&fragments, unit.pts) {
                            tracing::debug!(session_id = %session.id, error = %e, "unit not queued");
                        }
                    }
                    bump(&counters.units_sent);
                    tracing::trace!(
                        pts_ms = unit.pts.as_millis() as u64,
                        packets = fragments.len(),
                        sessions = live.len(),
                        "unit fanned out"
                    );
                }

                if running.swap(false, Ordering::SeqCst) {
                    tracing::info!("stream ended, draining sessions");
                    sessions.finish_all();
                } else {
                    sessions.close_all();
                }
                tracing::debug!("packetize thread exited");
            })?;
        Ok(handle)
    }

    /// Start sending the stream to `destination`.
    pub fn add_receiver(&self, destination: SocketAddr) -> Result<Arc<Session>> {
        let udp = self.udp.as_ref().ok_or(StreamError::NotStarted)?;
        let clock_rate = self.packetizer.lock().clock_rate();
        self.session_manager.register(
            destination,
            self.config.payload_type,
            clock_rate,
            udp.clone(),
        )
    }

    /// Tear down a receiver's session. Already closed sessions are a no-op.
    pub fn remove_receiver(&self, session_id: &str) -> Result<()> {
        self.session_manager.teardown(session_id)
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.session_manager.sessions()
    }

    pub fn session_manager(&self) -> &SessionManager {
        &self.session_manager
    }

    /// Session description for a receiver at `destination`.
    pub fn sdp(&self, destination: SocketAddr) -> String {
        let packetizer = self.packetizer.lock();
        generate_sdp(packetizer.as_ref(), destination, &self.config.sdp)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.udp.as_ref().ok_or(StreamError::NotStarted)?.local_addr()
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            frames_captured: c.frames_captured.load(Ordering::Relaxed),
            capture_failures: c.capture_failures.load(Ordering::Relaxed),
            frames_dropped: self.frames.dropped(),
            frames_encoded: c.frames_encoded.load(Ordering::Relaxed),
            encode_errors: c.encode_errors.load(Ordering::Relaxed),
            units_encoded: c.units_encoded.load(Ordering::Relaxed),
            units_dropped: self.units.dropped(),
            units_late: c.units_late.load(Ordering::Relaxed),
            packetization_errors: c.packetization_errors.load(Ordering::Relaxed),
            units_sent: c.units_sent.load(Ordering::Relaxed),
            units_discarded: c.units_discarded.load(Ordering::Relaxed),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            running: self.running.clone(),
            frames: self.frames.clone(),
            units: self.units.clone(),
            counters: self.counters.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop all stages, discarding whatever is still queued.
    pub fn stop(&mut self) {
        self.shutdown_handle().shutdown();
    }

    /// Block until the pipeline threads exit.
    ///
    /// Returns the final counters, or the capture error that ended the
    /// stream if the source failed persistently.
    pub fn wait(&mut self) -> Result<PipelineStats> {
        if !self.started {
            return Err(StreamError::NotStarted);
        }
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("rtp-worker").to_string();
            if handle.join().is_err() {
                tracing::error!(thread = %name, "pipeline thread panicked");
            }
        }
        // sessions registered after the pipeline finished
        self.session_manager.close_all();

        let stats = self.stats();
        tracing::info!(
            frames = stats.frames_captured,
            units = stats.units_sent,
            dropped = stats.frames_dropped + stats.units_dropped + stats.units_late,
            "RTP server finished"
        );

        match self.fatal.lock().take() {
            Some(e) => Err(StreamError::Capture(e)),
            None => Ok(stats),
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.stop();
            for handle in self.workers.drain(..) {
                let _ = handle.join();
            }
            self.session_manager.close_all();
        }
    }
}
