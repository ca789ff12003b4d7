//! Bridge from raw captured frames to an encoded-unit consumer
//!
//! The bridge is the frame sink of the capture loop. Each delivered frame
//! is normalized to I420, pushed through the encoder and every resulting
//! access unit is relayed synchronously to the consumer callback together
//! with the context of the encoder that produced it. The bridge keeps no
//! reference to the frame once the call returns.

use serde::Serialize;
use tracing::info;

use crate::capture::buffer::FrameBuffer;
use crate::capture::exchange::FrameSink;
use crate::capture::format::VideoFormat;
use crate::encode::convert::PixelConverter;
use crate::encode::h264::{EncodedUnit, EncoderContext, OpenH264Encoder, VideoEncoder};
use crate::error::{RelayError, Result};
use crate::utils::LogThrottler;

const DEFAULT_BITRATE_BPS: u32 = 4_000_000;
const FALLBACK_FPS: u32 = 30;

/// Encode bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Target bitrate handed to the encoder
    pub bitrate_bps: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bitrate_bps: DEFAULT_BITRATE_BPS,
        }
    }
}

impl BridgeConfig {
    pub fn with_bitrate(mut self, bitrate_bps: u32) -> Self {
        self.bitrate_bps = bitrate_bps;
        self
    }
}

/// Counters accumulated by the bridge
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BridgeStats {
    pub frames_encoded: u64,
    pub units_relayed: u64,
    pub bytes_relayed: u64,
    pub encode_errors: u64,
}

/// Nearest whole frames per second for the encoder configuration
fn whole_fps(format: &VideoFormat) -> u32 {
    if format.framerate.denom == 0 {
        return FALLBACK_FPS;
    }
    let rounded = (format.framerate.num + format.framerate.denom / 2) / format.framerate.denom;
    rounded.max(1)
}

/// Relays raw frames into the encoder and encoded units to the consumer
///
/// The encoder is built lazily from the first delivered frame; a
/// renegotiated frame size rebuilds it on the next frame. Per-frame
/// conversion or encode failures are logged (throttled) and absorbed, so
/// the capture loop keeps running through them.
pub struct EncodeBridge<F> {
    config: BridgeConfig,
    converter: Option<PixelConverter>,
    encoder: Option<Box<dyn VideoEncoder>>,
    consumer: F,
    throttler: LogThrottler,
    stats: BridgeStats,
}

impl<F> EncodeBridge<F>
where
    F: FnMut(&EncoderContext, EncodedUnit),
{
    pub fn new(config: BridgeConfig, consumer: F) -> Self {
        Self {
            config,
            converter: None,
            encoder: None,
            consumer,
            throttler: LogThrottler::default(),
            stats: BridgeStats::default(),
        }
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    /// Context of the current encoder, once one has been built
    pub fn encoder_context(&self) -> Option<&EncoderContext> {
        self.encoder.as_ref().map(|e| e.context())
    }

    /// Build or rebuild the converter and encoder for `format`
    fn ensure_pipeline(&mut self, node_id: u32, format: &VideoFormat) -> Result<()> {
        if self.converter.as_ref().map(|c| c.format()) == Some(format) {
            return Ok(());
        }

        let rebuild_encoder = match self.encoder.as_ref() {
            Some(enc) => enc.context().size != format.size,
            None => true,
        };
        if rebuild_encoder {
            let encoder =
                OpenH264Encoder::new(format.size, self.config.bitrate_bps, whole_fps(format))?;
            info!(
                "encoding node {} as h264: {} @ {} bps",
                node_id, format, self.config.bitrate_bps
            );
            self.encoder = Some(Box::new(encoder));
        }
        self.converter = Some(PixelConverter::new(*format)?);
        Ok(())
    }

    fn encode_frame(&mut self, node_id: u32, format: &VideoFormat, buffer: &FrameBuffer) -> Result<()> {
        let Some(plane) = buffer.primary() else {
            return Err(RelayError::Encoder("frame has no data plane".into()));
        };
        let Some(data) = plane.readable_data() else {
            return Err(RelayError::Encoder("frame plane is not readable".into()));
        };
        let offset = plane.chunk.offset as usize;
        if offset > data.len() {
            return Err(RelayError::Encoder(format!(
                "chunk offset {} beyond {} byte plane",
                offset,
                data.len()
            )));
        }

        self.ensure_pipeline(node_id, format)?;
        let Self {
            converter,
            encoder,
            consumer,
            stats,
            ..
        } = self;
        let (Some(converter), Some(encoder)) = (converter.as_mut(), encoder.as_mut()) else {
            return Err(RelayError::Encoder("encode pipeline not ready".into()));
        };

        let i420 = converter.convert(&data[offset..], plane.chunk.stride as usize)?;
        let context = encoder.context().clone();
        encoder.encode(i420, &mut |unit| {
            stats.units_relayed += 1;
            stats.bytes_relayed += unit.payload.len() as u64;
            consumer(&context, unit);
        })?;
        stats.frames_encoded += 1;
        Ok(())
    }
}

impl<F> FrameSink for EncodeBridge<F>
where
    F: FnMut(&EncoderContext, EncodedUnit),
{
    fn deliver_frame(
        &mut self,
        node_id: u32,
        format: &VideoFormat,
        buffer: &FrameBuffer,
    ) -> Result<()> {
        match self.encode_frame(node_id, format, buffer) {
            Ok(()) => {
                self.throttler.clear("encode");
            }
            Err(e) => {
                self.stats.encode_errors += 1;
                crate::error_throttled!(self.throttler, "encode", "cannot encode frame: {}", e);
            }
        }
        Ok(())
    }
}
