//! Screen capture session, negotiation and frame exchange

pub mod buffer;
pub mod caps;
pub mod exchange;
pub mod format;
pub mod negotiate;
pub mod params;
pub mod session;

pub use buffer::{Chunk, DataPlane, FrameBuffer};
pub use exchange::{ExchangeStats, FrameBufferExchange, FrameSink};
pub use format::{Fraction, PixelFormat, Resolution, VideoFormat};
pub use negotiate::FormatNegotiator;
pub use params::{MediaSubtype, MediaType, ParamId, ParamObject, PropKey, Value};
pub use session::{run_capture, CaptureSession, SessionConfig, SessionState, SessionStats};
