//! Video format model
//!
//! Pixel formats, frame sizes and rates as negotiated with the capture
//! service. The raw numeric identifiers follow the service's registry so
//! parameter objects can carry them without translation tables elsewhere.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Raw pixel formats the capture service can deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// 24-bit packed RGB
    Rgb,
    /// 32-bit RGB with alpha
    Rgba,
    /// 32-bit RGB with a padding byte
    Rgbx,
    /// 32-bit BGR with a padding byte, common compositor output
    Bgrx,
    /// Packed 4:2:2 YUV
    Yuy2,
    /// Planar 4:2:0 YUV
    I420,
}

impl PixelFormat {
    /// Map a raw format identifier from the capture service
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            2 => Some(PixelFormat::I420),
            4 => Some(PixelFormat::Yuy2),
            7 => Some(PixelFormat::Rgbx),
            8 => Some(PixelFormat::Bgrx),
            11 => Some(PixelFormat::Rgba),
            15 => Some(PixelFormat::Rgb),
            _ => None,
        }
    }

    /// Raw format identifier used in parameter objects
    pub fn to_raw(self) -> u32 {
        match self {
            PixelFormat::I420 => 2,
            PixelFormat::Yuy2 => 4,
            PixelFormat::Rgbx => 7,
            PixelFormat::Bgrx => 8,
            PixelFormat::Rgba => 11,
            PixelFormat::Rgb => 15,
        }
    }

    /// Candidate order offered during negotiation, most preferred first
    pub fn preference_order() -> &'static [PixelFormat] {
        &[
            PixelFormat::Rgb,
            PixelFormat::Rgba,
            PixelFormat::Rgbx,
            PixelFormat::Bgrx,
            PixelFormat::Yuy2,
            PixelFormat::I420,
        ]
    }

    /// Bytes per pixel for packed formats, `None` for planar ones
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            PixelFormat::Rgb => Some(3),
            PixelFormat::Rgba | PixelFormat::Rgbx | PixelFormat::Bgrx => Some(4),
            PixelFormat::Yuy2 => Some(2),
            PixelFormat::I420 => None,
        }
    }

    /// Bytes in one tightly packed row
    ///
    /// For planar formats this is the luma row; chroma rows are half of it.
    pub fn row_stride(&self, width: u32) -> usize {
        match self.bytes_per_pixel() {
            Some(bpp) => width as usize * bpp,
            None => width as usize,
        }
    }

    /// Expected byte size of one frame at the given resolution
    pub fn frame_size(&self, size: Resolution) -> usize {
        let pixels = size.pixels();
        match self {
            PixelFormat::I420 => pixels * 3 / 2,
            // packed formats always report bytes per pixel
            _ => pixels * self.bytes_per_pixel().unwrap_or(0),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PixelFormat::Rgb => "RGB",
            PixelFormat::Rgba => "RGBA",
            PixelFormat::Rgbx => "RGBx",
            PixelFormat::Bgrx => "BGRx",
            PixelFormat::Yuy2 => "YUY2",
            PixelFormat::I420 => "I420",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "RGB" => Ok(PixelFormat::Rgb),
            "RGBA" => Ok(PixelFormat::Rgba),
            "RGBX" => Ok(PixelFormat::Rgbx),
            "BGRX" => Ok(PixelFormat::Bgrx),
            "YUY2" => Ok(PixelFormat::Yuy2),
            "I420" => Ok(PixelFormat::I420),
            _ => Err(format!("Unknown pixel format: {}", s)),
        }
    }
}

/// Frame size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Smallest size accepted during negotiation
    pub const MIN: Resolution = Resolution::new(1, 1);
    /// Largest size accepted during negotiation
    pub const MAX: Resolution = Resolution::new(4096, 4096);
    /// 320x240
    pub const QVGA: Resolution = Resolution::new(320, 240);
    /// 640x480
    pub const VGA: Resolution = Resolution::new(640, 480);

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Whether both dimensions are within the negotiable range
    pub fn is_valid(&self) -> bool {
        self.width >= Self::MIN.width
            && self.height >= Self::MIN.height
            && self.width <= Self::MAX.width
            && self.height <= Self::MAX.height
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("Invalid resolution: {}", s))?;
        let width = w
            .trim()
            .parse::<u32>()
            .map_err(|_| format!("Invalid width in resolution: {}", s))?;
        let height = h
            .trim()
            .parse::<u32>()
            .map_err(|_| format!("Invalid height in resolution: {}", s))?;
        Ok(Resolution::new(width, height))
    }
}

/// Frame rate as a rational number of frames per second
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fraction {
    pub num: u32,
    pub denom: u32,
}

impl Fraction {
    pub const fn new(num: u32, denom: u32) -> Self {
        Self { num, denom }
    }

    /// Whether the fraction denotes a usable rate
    ///
    /// A zero numerator is allowed and means a variable rate.
    pub fn is_valid(&self) -> bool {
        self.denom > 0
    }

    /// Compare two fractions as rates
    pub fn rate_cmp(&self, other: &Fraction) -> std::cmp::Ordering {
        let lhs = self.num as u64 * other.denom as u64;
        let rhs = other.num as u64 * self.denom as u64;
        lhs.cmp(&rhs)
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.denom)
    }
}

/// A fully negotiated raw video format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoFormat {
    pub pixel_format: PixelFormat,
    pub size: Resolution,
    pub framerate: Fraction,
}

impl VideoFormat {
    pub const fn new(pixel_format: PixelFormat, size: Resolution, framerate: Fraction) -> Self {
        Self {
            pixel_format,
            size,
            framerate,
        }
    }

    /// Whether size and framerate satisfy the negotiation bounds
    pub fn is_valid(&self) -> bool {
        self.size.is_valid() && self.framerate.is_valid()
    }

    /// Expected byte size of one frame in this format
    pub fn frame_size(&self) -> usize {
        self.pixel_format.frame_size(self.size)
    }
}

impl fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} @ {}", self.pixel_format, self.size, self.framerate)
    }
}
