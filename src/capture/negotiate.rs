//! Format negotiation from parameter events
//!
//! The negotiator watches parameter events for a fixated raw video format.
//! Anything else leaves the current format untouched without diagnostics:
//! absent objects, foreign parameter classes, non-video media and
//! unparseable objects are all expected traffic, not errors.

use tracing::info;

use crate::capture::format::VideoFormat;
use crate::capture::params::{MediaSubtype, MediaType, ParamId, ParamObject};

/// Tracks the format the capture service has fixated for the stream
#[derive(Debug, Default)]
pub struct FormatNegotiator {
    current: Option<VideoFormat>,
    accepted: u64,
}

impl FormatNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle one parameter event
    ///
    /// Updates the current format only for a parseable, fixated raw video
    /// format object under the format parameter id.
    pub fn param_changed(&mut self, id: ParamId, param: Option<&ParamObject>) {
        let Some(param) = param else {
            return;
        };
        if id != ParamId::Format {
            return;
        }
        let Some((media_type, media_subtype)) = param.media_identity() else {
            return;
        };
        if media_type != MediaType::Video || media_subtype != MediaSubtype::Raw {
            return;
        }
        let Some(format) = param.video_raw_format() else {
            return;
        };

        info!(
            "got video format: {} {} @ {}",
            format.pixel_format, format.size, format.framerate
        );
        self.current = Some(format);
        self.accepted += 1;
    }

    /// The format currently negotiated for the stream
    pub fn current(&self) -> Option<&VideoFormat> {
        self.current.as_ref()
    }

    /// How many format objects have been accepted so far
    pub fn accepted(&self) -> u64 {
        self.accepted
    }
}
