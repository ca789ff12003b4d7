//! Structured stream parameters
//!
//! Parameter objects travel between the session and the capture service in
//! both directions: the session offers a format enumeration at stream
//! connect, the service answers with a fixated format. Objects are flat
//! key/value lists; readers treat missing or wrongly typed entries as an
//! unparseable object rather than an error.

use crate::capture::format::{Fraction, PixelFormat, Resolution, VideoFormat};

/// Parameter classes the service and session exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamId {
    /// Stream properties
    Props,
    /// Format enumeration offered by the session
    EnumFormat,
    /// Fixated format chosen by the service
    Format,
    /// Buffer requirements
    Buffers,
    /// Metadata requirements
    Meta,
}

/// Keys a parameter object can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropKey {
    MediaType,
    MediaSubtype,
    VideoFormat,
    VideoSize,
    VideoFramerate,
}

/// Media classes carried in a format object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Audio,
    Video,
    Image,
}

impl MediaType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(MediaType::Audio),
            2 => Some(MediaType::Video),
            3 => Some(MediaType::Image),
            _ => None,
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            MediaType::Audio => 1,
            MediaType::Video => 2,
            MediaType::Image => 3,
        }
    }
}

/// Media subtypes carried in a format object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaSubtype {
    Raw,
    H264,
}

impl MediaSubtype {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(MediaSubtype::Raw),
            0x0001_0001 => Some(MediaSubtype::H264),
            _ => None,
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            MediaSubtype::Raw => 1,
            MediaSubtype::H264 => 0x0001_0001,
        }
    }
}

/// A single parameter value, fixated or a constrained choice
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Fixated identifier
    Id(u32),
    /// Fixated rectangle
    Rectangle(Resolution),
    /// Fixated fraction
    Fraction(Fraction),
    /// Identifier choice with a preferred default
    IdChoice { default: u32, alternatives: Vec<u32> },
    /// Rectangle range with a preferred default
    RectangleRange {
        default: Resolution,
        min: Resolution,
        max: Resolution,
    },
    /// Fraction range with a preferred default
    FractionRange {
        default: Fraction,
        min: Fraction,
        max: Fraction,
    },
}

/// A parameter object: an id plus an ordered key/value list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamObject {
    id: ParamId,
    props: Vec<(PropKey, Value)>,
}

impl ParamObject {
    pub fn new(id: ParamId) -> Self {
        Self {
            id,
            props: Vec::new(),
        }
    }

    /// Append a key/value pair, builder style
    pub fn with(mut self, key: PropKey, value: Value) -> Self {
        self.props.push((key, value));
        self
    }

    pub fn id(&self) -> ParamId {
        self.id
    }

    /// First value stored under `key`
    pub fn get(&self, key: PropKey) -> Option<&Value> {
        self.props.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    /// Fixated identifier stored under `key`
    pub fn id_value(&self, key: PropKey) -> Option<u32> {
        match self.get(key)? {
            Value::Id(raw) => Some(*raw),
            _ => None,
        }
    }

    /// Fixated rectangle stored under `key`
    pub fn rectangle(&self, key: PropKey) -> Option<Resolution> {
        match self.get(key)? {
            Value::Rectangle(r) => Some(*r),
            _ => None,
        }
    }

    /// Fixated fraction stored under `key`
    pub fn fraction(&self, key: PropKey) -> Option<Fraction> {
        match self.get(key)? {
            Value::Fraction(f) => Some(*f),
            _ => None,
        }
    }

    /// All identifier candidates under `key`, preferred first
    ///
    /// A fixated id yields itself; a choice yields the default followed by
    /// the alternatives.
    pub fn id_candidates(&self, key: PropKey) -> Vec<u32> {
        match self.get(key) {
            Some(Value::Id(raw)) => vec![*raw],
            Some(Value::IdChoice {
                default,
                alternatives,
            }) => {
                let mut out = Vec::with_capacity(alternatives.len() + 1);
                out.push(*default);
                out.extend_from_slice(alternatives);
                out
            }
            _ => Vec::new(),
        }
    }

    /// Rectangle bounds under `key` as (default, min, max)
    pub fn rectangle_bounds(&self, key: PropKey) -> Option<(Resolution, Resolution, Resolution)> {
        match self.get(key)? {
            Value::Rectangle(r) => Some((*r, *r, *r)),
            Value::RectangleRange { default, min, max } => Some((*default, *min, *max)),
            _ => None,
        }
    }

    /// Fraction bounds under `key` as (default, min, max)
    pub fn fraction_bounds(&self, key: PropKey) -> Option<(Fraction, Fraction, Fraction)> {
        match self.get(key)? {
            Value::Fraction(f) => Some((*f, *f, *f)),
            Value::FractionRange { default, min, max } => Some((*default, *min, *max)),
            _ => None,
        }
    }

    /// Media type and subtype of a format object
    ///
    /// Returns `None` when either key is missing, not fixated, or not a
    /// known identifier.
    pub fn media_identity(&self) -> Option<(MediaType, MediaSubtype)> {
        let media_type = MediaType::from_raw(self.id_value(PropKey::MediaType)?)?;
        let media_subtype = MediaSubtype::from_raw(self.id_value(PropKey::MediaSubtype)?)?;
        Some((media_type, media_subtype))
    }

    /// Parse a fully fixated raw video format out of this object
    ///
    /// Returns `None` when any of format, size or framerate is missing, not
    /// fixated, unknown, or outside the negotiable bounds.
    pub fn video_raw_format(&self) -> Option<VideoFormat> {
        let pixel_format = PixelFormat::from_raw(self.id_value(PropKey::VideoFormat)?)?;
        let size = self.rectangle(PropKey::VideoSize)?;
        let framerate = self.fraction(PropKey::VideoFramerate)?;
        let format = VideoFormat::new(pixel_format, size, framerate);
        format.is_valid().then_some(format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixated_video_object() -> ParamObject {
        ParamObject::new(ParamId::Format)
            .with(PropKey::MediaType, Value::Id(MediaType::Video.to_raw()))
            .with(PropKey::MediaSubtype, Value::Id(MediaSubtype::Raw.to_raw()))
            .with(PropKey::VideoFormat, Value::Id(PixelFormat::Bgrx.to_raw()))
            .with(PropKey::VideoSize, Value::Rectangle(Resolution::VGA))
            .with(PropKey::VideoFramerate, Value::Fraction(Fraction::new(30, 1)))
    }

    #[test]
    fn test_getters() {
        let obj = fixated_video_object();
        assert_eq!(obj.id(), ParamId::Format);
        assert_eq!(
            obj.id_value(PropKey::MediaType),
            Some(MediaType::Video.to_raw())
        );
        assert_eq!(obj.rectangle(PropKey::VideoSize), Some(Resolution::VGA));
        assert_eq!(
            obj.fraction(PropKey::VideoFramerate),
            Some(Fraction::new(30, 1))
        );
        assert_eq!(obj.id_value(PropKey::VideoSize), None);
        assert!(obj.get(PropKey::VideoFormat).is_some());
    }

    #[test]
    fn test_media_identity() {
        let obj = fixated_video_object();
        assert_eq!(
            obj.media_identity(),
            Some((MediaType::Video, MediaSubtype::Raw))
        );

        let no_subtype = ParamObject::new(ParamId::Format)
            .with(PropKey::MediaType, Value::Id(MediaType::Video.to_raw()));
        assert_eq!(no_subtype.media_identity(), None);

        let wrong_type = ParamObject::new(ParamId::Format)
            .with(PropKey::MediaType, Value::Rectangle(Resolution::VGA))
            .with(PropKey::MediaSubtype, Value::Id(MediaSubtype::Raw.to_raw()));
        assert_eq!(wrong_type.media_identity(), None);

        let unknown_id = ParamObject::new(ParamId::Format)
            .with(PropKey::MediaType, Value::Id(77))
            .with(PropKey::MediaSubtype, Value::Id(MediaSubtype::Raw.to_raw()));
        assert_eq!(unknown_id.media_identity(), None);
    }

    #[test]
    fn test_video_raw_format_parses_fixated_object() {
        let format = fixated_video_object().video_raw_format().unwrap();
        assert_eq!(format.pixel_format, PixelFormat::Bgrx);
        assert_eq!(format.size, Resolution::VGA);
        assert_eq!(format.framerate, Fraction::new(30, 1));
    }

    #[test]
    fn test_video_raw_format_rejects_unfixated_values() {
        let obj = ParamObject::new(ParamId::Format)
            .with(
                PropKey::VideoFormat,
                Value::IdChoice {
                    default: PixelFormat::Rgb.to_raw(),
                    alternatives: vec![PixelFormat::Bgrx.to_raw()],
                },
            )
            .with(PropKey::VideoSize, Value::Rectangle(Resolution::VGA))
            .with(PropKey::VideoFramerate, Value::Fraction(Fraction::new(30, 1)));
        assert_eq!(obj.video_raw_format(), None);
    }

    #[test]
    fn test_video_raw_format_rejects_unknown_or_invalid() {
        let unknown_pixel = ParamObject::new(ParamId::Format)
            .with(PropKey::VideoFormat, Value::Id(999))
            .with(PropKey::VideoSize, Value::Rectangle(Resolution::VGA))
            .with(PropKey::VideoFramerate, Value::Fraction(Fraction::new(30, 1)));
        assert_eq!(unknown_pixel.video_raw_format(), None);

        let zero_denom = ParamObject::new(ParamId::Format)
            .with(PropKey::VideoFormat, Value::Id(PixelFormat::Rgb.to_raw()))
            .with(PropKey::VideoSize, Value::Rectangle(Resolution::VGA))
            .with(PropKey::VideoFramerate, Value::Fraction(Fraction::new(30, 0)));
        assert_eq!(zero_denom.video_raw_format(), None);

        let oversized = ParamObject::new(ParamId::Format)
            .with(PropKey::VideoFormat, Value::Id(PixelFormat::Rgb.to_raw()))
            .with(
                PropKey::VideoSize,
                Value::Rectangle(Resolution::new(8192, 8192)),
            )
            .with(PropKey::VideoFramerate, Value::Fraction(Fraction::new(30, 1)));
        assert_eq!(oversized.video_raw_format(), None);
    }

    #[test]
    fn test_id_candidates() {
        let obj = ParamObject::new(ParamId::EnumFormat).with(
            PropKey::VideoFormat,
            Value::IdChoice {
                default: 15,
                alternatives: vec![15, 11, 8],
            },
        );
        assert_eq!(obj.id_candidates(PropKey::VideoFormat), vec![15, 15, 11, 8]);

        let fixated = ParamObject::new(ParamId::Format).with(PropKey::VideoFormat, Value::Id(8));
        assert_eq!(fixated.id_candidates(PropKey::VideoFormat), vec![8]);

        let empty = ParamObject::new(ParamId::Format);
        assert!(empty.id_candidates(PropKey::VideoFormat).is_empty());
    }

    #[test]
    fn test_bounds_accessors() {
        let obj = ParamObject::new(ParamId::EnumFormat)
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
                    default: Fraction::new(30, 1),
                    min: Fraction::new(0, 1),
                    max: Fraction::new(30, 1),
                },
            );

        let (d, min, max) = obj.rectangle_bounds(PropKey::VideoSize).unwrap();
        assert_eq!(d, Resolution::QVGA);
        assert_eq!(min, Resolution::MIN);
        assert_eq!(max, Resolution::MAX);

        let (d, min, max) = obj.fraction_bounds(PropKey::VideoFramerate).unwrap();
        assert_eq!(d, Fraction::new(30, 1));
        assert_eq!(min, Fraction::new(0, 1));
        assert_eq!(max, Fraction::new(30, 1));

        // fixated values collapse to a degenerate range
        let fixed = ParamObject::new(ParamId::Format)
            .with(PropKey::VideoSize, Value::Rectangle(Resolution::VGA));
        let (d, min, max) = fixed.rectangle_bounds(PropKey::VideoSize).unwrap();
        assert_eq!((d, min, max), (Resolution::VGA, Resolution::VGA, Resolution::VGA));
    }
}
