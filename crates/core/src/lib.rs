pub mod codec;
pub mod error;
pub mod media;
pub mod pacer;
pub mod queue;
pub mod receiver;
pub mod sdp;
pub mod server;
pub mod session;
pub mod source;
pub mod transport;

pub use codec::{EncodedUnit, Encoder, RawEncoder};
pub use error::{Result, StreamError};
pub use media::{Packetizer, PayloadFormat};
pub use receiver::{ReceiverConfig, RtpReceiver};
pub use server::{PipelineStats, Server, ShutdownHandle, StreamConfig};
pub use session::{Session, SessionConfig, SessionState};
pub use source::{Frame, FrameSource, PixelFormat};
