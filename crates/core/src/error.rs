//! Error types for the streaming pipeline.

use std::fmt;

use crate::source::PixelFormat;

/// Errors surfaced by the streaming library.
///
/// Stage-local failures are grouped into their own enums so callers can
/// decide how far they propagate:
///
/// - **Capture**: [`CaptureError`]: the frame source failed. Fatal to the
///   source once retries are exhausted.
/// - **Encode**: [`EncodeError`]: one frame could not be encoded; it is skipped.
/// - **Packetization**: [`PacketizationError`]: one encoded unit was dropped.
/// - **Transport**: [`TransportError`]: a send failed; counted per session.
/// - **Server**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning),
///   [`InvalidConfig`](Self::InvalidConfig).
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Packetization(#[from] PacketizationError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// No session with the given ID exists in the [`SessionManager`](crate::session::SessionManager).
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to parse an inbound RTP datagram (RFC 3550 §5.1).
    #[error("RTP parse error: {kind}")]
    Parse { kind: ParseErrorKind },
}

/// Frame source failure.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The source was configured with a geometry it cannot produce.
    #[error("invalid source geometry {width}x{height}")]
    InvalidGeometry { width: u32, height: u32 },

    /// Frame rate of zero.
    #[error("invalid frame rate: {0}")]
    InvalidFrameRate(u32),

    /// Device-level failure reported by a capture backend.
    #[error("capture device error: {0}")]
    Device(String),
}

/// A single frame could not be encoded.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// Buffer length does not match `format.frame_size(width, height)`.
    #[error("frame buffer is {actual} bytes, expected {expected}")]
    FrameSizeMismatch { expected: usize, actual: usize },

    #[error("unsupported pixel format: {0}")]
    UnsupportedFormat(PixelFormat),

    /// Error reported by the codec backend.
    #[error("codec error: {0}")]
    Codec(String),
}

/// An encoded unit could not be turned into packets.
#[derive(Debug, thiserror::Error)]
pub enum PacketizationError {
    /// The unit would need more packets than the configured bound.
    #[error("unit needs {needed} packets, limit is {limit}")]
    TooManyFragments { needed: usize, limit: usize },

    /// Maximum payload size is too small for the payload format headers.
    #[error("max payload size {0} is too small for this payload format")]
    PayloadTooSmall(usize),

    /// Encoder output or received payload does not follow the payload format.
    #[error("malformed payload: {0}")]
    Malformed(&'static str),
}

/// Datagram delivery failure.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("send failed: {0}")]
    Io(#[from] std::io::Error),

    /// The session is closed; nothing more is accepted for it.
    #[error("session closed: {0}")]
    SessionClosed(String),

    /// The packet was serialized but the socket accepted fewer bytes.
    #[error("short send: {sent} of {len} bytes")]
    ShortSend { sent: usize, len: usize },
}

/// Specific kind of RTP parse failure.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Fewer than 12 bytes, or shorter than the CSRC list / extension announce.
    Truncated,
    /// Version field is not 2.
    BadVersion(u8),
    /// Padding count exceeds the payload length.
    BadPadding,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated packet"),
            Self::BadVersion(v) => write!(f, "unsupported version {v}"),
            Self::BadPadding => write!(f, "invalid padding"),
        }
    }
}

/// Convenience alias for `Result<T, StreamError>`.
pub type Result<T> = std::result::Result<T, StreamError>;
