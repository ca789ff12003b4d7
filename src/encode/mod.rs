//! Pixel normalization, H.264 encoding and the frame-to-consumer bridge

pub mod bridge;
pub mod convert;
pub mod h264;

pub use bridge::{BridgeConfig, BridgeStats, EncodeBridge};
pub use convert::{I420Buffer, PixelConverter};
pub use h264::{unit_kind, EncodedUnit, EncoderContext, OpenH264Encoder, UnitKind, VideoEncoder};
