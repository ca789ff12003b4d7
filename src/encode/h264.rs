//! H.264 encoding through OpenH264
//!
//! The encoder consumes I420 planes and hands back an Annex B bitstream,
//! which is split into NAL units and relayed one by one through a sink
//! callback. OpenH264 is compiled from source, so no system codec
//! libraries are needed.

use bytes::Bytes;
use openh264::encoder::{BitRate, Encoder, EncoderConfig, FrameRate, RateControlMode};
use openh264::formats::YUVSlices;
use openh264::{nal_units, OpenH264API};
use serde::Serialize;
use tracing::debug;

use crate::capture::format::Resolution;
use crate::encode::convert::I420Buffer;
use crate::error::{RelayError, Result};

/// NAL unit classification from the Annex B header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// Sequence parameter set
    Sps,
    /// Picture parameter set
    Pps,
    /// IDR slice
    Key,
    /// Non-IDR slice
    Delta,
    /// Anything else (SEI, delimiters, malformed)
    Other,
}

/// Classify one Annex B NAL unit, start code included
pub fn unit_kind(unit: &[u8]) -> UnitKind {
    // Skip the 00 00 01 / 00 00 00 01 start code
    let mut i = 0;
    while i < unit.len() && unit[i] == 0 {
        i += 1;
    }
    if i < 2 || i >= unit.len() || unit[i] != 1 {
        return UnitKind::Other;
    }
    let Some(&header) = unit.get(i + 1) else {
        return UnitKind::Other;
    };
    match header & 0x1F {
        1 => UnitKind::Delta,
        5 => UnitKind::Key,
        7 => UnitKind::Sps,
        8 => UnitKind::Pps,
        _ => UnitKind::Other,
    }
}

/// One encoded access unit relayed to the consumer
#[derive(Debug, Clone)]
pub struct EncodedUnit {
    /// Annex B payload including the start code
    pub payload: Bytes,
    pub kind: UnitKind,
    /// Input frame this unit was produced from
    pub sequence: u64,
}

/// Description of the encoder instance that produced a unit
///
/// Passed to the consumer callback alongside every unit so a consumer
/// serving multiple encoders can tell them apart.
#[derive(Debug, Clone, Serialize)]
pub struct EncoderContext {
    /// Codec name, always "h264" for this encoder
    pub codec: &'static str,
    pub size: Resolution,
    pub bitrate_bps: u32,
    pub max_framerate: u32,
}

/// Encoder seam between the bridge and a codec implementation
///
/// Note: Send but not Sync; codec state is single-owner.
pub trait VideoEncoder: Send {
    /// Describe this encoder instance
    fn context(&self) -> &EncoderContext;

    /// Encode one I420 frame, relaying each produced unit to `sink`
    ///
    /// A frame may produce zero units when the codec withholds output.
    fn encode(&mut self, frame: &I420Buffer, sink: &mut dyn FnMut(EncodedUnit)) -> Result<()>;
}

/// Software H.264 encoder backed by OpenH264
pub struct OpenH264Encoder {
    encoder: Encoder,
    context: EncoderContext,
    sequence: u64,
}

// The wrapped codec handle is a raw pointer; the encoder is only ever
// moved between threads whole, never shared.
unsafe impl Send for OpenH264Encoder {}

impl OpenH264Encoder {
    /// Create an encoder for the given output size
    pub fn new(size: Resolution, bitrate_bps: u32, max_framerate: u32) -> Result<Self> {
        let config = EncoderConfig::new()
            .bitrate(BitRate::from_bps(bitrate_bps))
            .max_frame_rate(FrameRate::from_hz(max_framerate as f32))
            .rate_control_mode(RateControlMode::Bitrate);

        let api = OpenH264API::from_source();
        let encoder = Encoder::with_api_config(api, config)
            .map_err(|e| RelayError::Encoder(format!("cannot create encoder: {}", e)))?;

        debug!(
            "created h264 encoder: {} @ {} bps, max {} fps",
            size, bitrate_bps, max_framerate
        );

        Ok(Self {
            encoder,
            context: EncoderContext {
                codec: "h264",
                size,
                bitrate_bps,
                max_framerate,
            },
            sequence: 0,
        })
    }
}

impl VideoEncoder for OpenH264Encoder {
    fn context(&self) -> &EncoderContext {
        &self.context
    }

    fn encode(&mut self, frame: &I420Buffer, sink: &mut dyn FnMut(EncodedUnit)) -> Result<()> {
        if frame.resolution() != self.context.size {
            return Err(RelayError::Encoder(format!(
                "frame size {} does not match encoder {}",
                frame.resolution(),
                self.context.size
            )));
        }

        let w = self.context.size.width as usize;
        let h = self.context.size.height as usize;
        let slices = YUVSlices::new(
            (frame.y_plane(), frame.u_plane(), frame.v_plane()),
            (w, h),
            (w, w / 2, w / 2),
        );

        let bitstream = self
            .encoder
            .encode(&slices)
            .map_err(|e| RelayError::Encoder(format!("encode failed: {}", e)))?;

        let sequence = self.sequence;
        self.sequence += 1;

        // One contiguous Annex B buffer; every unit is a zero-copy view
        let annexb = Bytes::from(bitstream.to_vec());
        for nal in nal_units(&annexb) {
            sink(EncodedUnit {
                payload: annexb.slice_ref(nal),
                kind: unit_kind(nal),
                sequence,
            });
        }
        Ok(())
    }
}
