//! Capability enumeration offered at stream connect
//!
//! The session advertises every raw format it can relay and lets the
//! service fixate one. Sizes are offered as a wide open range so the
//! service can pick its native output; the framerate range is anchored at
//! the session's target rate, which caps the negotiated numerator.

use crate::capture::format::{Fraction, PixelFormat, Resolution};
use crate::capture::params::{ParamId, ParamObject, PropKey, Value};
use crate::capture::params::{MediaSubtype, MediaType};

/// Build the raw video enumeration offered to the capture service
///
/// `target_framerate` is the most frames per second the session wants to
/// receive; the service may fixate anything from a variable rate up to it.
pub fn video_enum_format(target_framerate: u32) -> ParamObject {
    let candidates: Vec<u32> = PixelFormat::preference_order()
        .iter()
        .map(|f| f.to_raw())
        .collect();

    ParamObject::new(ParamId::EnumFormat)
        .with(PropKey::MediaType, Value::Id(MediaType::Video.to_raw()))
        .with(PropKey::MediaSubtype, Value::Id(MediaSubtype::Raw.to_raw()))
        .with(
            PropKey::VideoFormat,
            Value::IdChoice {
                default: PixelFormat::Rgb.to_raw(),
                alternatives: candidates,
            },
        )
        .with(
            PropKey::VideoSize,
            Value::RectangleRange {
                default: Resolution::QVGA,
                min: Resolution::MIN,
                max: Resolution::MAX,
            },
        )
        .with(
            PropKey::VideoFramerate,
            Value::FractionRange {
                default: Fraction::new(target_framerate, 1),
                min: Fraction::new(0, 1),
                max: Fraction::new(target_framerate, 1),
            },
        )
}
