//! Pixel format normalization in front of the encoder
//!
//! Every negotiated capture format is converted to I420 (YUV 4:2:0 planar),
//! the one layout the encoder consumes. Conversions reuse a single output
//! buffer, so a steady stream of frames does not allocate.

use crate::capture::format::{PixelFormat, Resolution, VideoFormat};
use crate::error::{RelayError, Result};

/// I420 buffer with separate Y, U, V planes
#[derive(Debug)]
pub struct I420Buffer {
    /// Raw buffer containing all three planes
    data: Vec<u8>,
    width: u32,
    height: u32,
    /// U plane offset; the Y plane starts at 0
    u_offset: usize,
    /// V plane offset
    v_offset: usize,
}

impl I420Buffer {
    /// Create a zeroed buffer for the given resolution
    pub fn new(resolution: Resolution) -> Self {
        let y_size = resolution.pixels();
        let uv_size = y_size / 4;

        Self {
            data: vec![0u8; y_size + uv_size * 2],
            width: resolution.width,
            height: resolution.height,
            u_offset: y_size,
            v_offset: y_size + uv_size,
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Plane strides in bytes: luma row, then the two chroma rows
    pub fn strides(&self) -> (usize, usize, usize) {
        let w = self.width as usize;
        (w, w / 2, w / 2)
    }

    pub fn y_plane(&self) -> &[u8] {
        &self.data[..self.u_offset]
    }

    pub fn u_plane(&self) -> &[u8] {
        &self.data[self.u_offset..self.v_offset]
    }

    pub fn v_plane(&self) -> &[u8] {
        &self.data[self.v_offset..]
    }

    /// All three planes as one contiguous slice
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Byte layout of one packed RGB-family pixel: (bytes per pixel, r, g, b)
fn packed_rgb_layout(format: PixelFormat) -> Option<(usize, usize, usize, usize)> {
    match format {
        PixelFormat::Rgb => Some((3, 0, 1, 2)),
        PixelFormat::Rgba | PixelFormat::Rgbx => Some((4, 0, 1, 2)),
        PixelFormat::Bgrx => Some((4, 2, 1, 0)),
        PixelFormat::Yuy2 | PixelFormat::I420 => None,
    }
}

/// BT.601 full-range luma for one pixel
fn luma(r: f32, g: f32, b: f32) -> u8 {
    (0.299 * r + 0.587 * g + 0.114 * b).round().clamp(0.0, 255.0) as u8
}

/// BT.601 full-range chroma for one averaged 2x2 block
fn chroma(r: f32, g: f32, b: f32) -> (u8, u8) {
    let u = (-0.169 * r - 0.331 * g + 0.500 * b + 128.0)
        .round()
        .clamp(0.0, 255.0) as u8;
    let v = (0.500 * r - 0.419 * g - 0.081 * b + 128.0)
        .round()
        .clamp(0.0, 255.0) as u8;
    (u, v)
}

/// Converter from one negotiated capture format to I420
///
/// The output buffer is sized once from the format and reused across
/// frames.
pub struct PixelConverter {
    format: VideoFormat,
    output: I420Buffer,
}

impl PixelConverter {
    /// Create a converter for the given negotiated format
    ///
    /// 4:2:0 chroma needs even frame dimensions; odd or empty sizes are
    /// rejected.
    pub fn new(format: VideoFormat) -> Result<Self> {
        if !format.is_valid() {
            return Err(RelayError::Encoder(format!(
                "cannot convert frames of invalid format {}",
                format
            )));
        }
        if format.size.width % 2 != 0 || format.size.height % 2 != 0 {
            return Err(RelayError::Encoder(format!(
                "frame size {} must be even for 4:2:0 output",
                format.size
            )));
        }
        Ok(Self {
            format,
            output: I420Buffer::new(format.size),
        })
    }

    pub fn format(&self) -> &VideoFormat {
        &self.format
    }

    /// Convert one frame and return the filled output buffer
    ///
    /// `stride` is the source row pitch in bytes; zero means tightly
    /// packed. Trailing padding after the last row may be absent.
    pub fn convert(&mut self, input: &[u8], stride: usize) -> Result<&I420Buffer> {
        let tight = self.format.pixel_format.row_stride(self.format.size.width);
        let stride = if stride == 0 { tight } else { stride };
        if stride < tight {
            return Err(RelayError::Encoder(format!(
                "stride {} narrower than a {} byte row",
                stride, tight
            )));
        }

        match self.format.pixel_format {
            PixelFormat::Yuy2 => self.convert_yuy2(input, stride)?,
            PixelFormat::I420 => self.copy_i420(input, stride)?,
            _ => self.convert_packed_rgb(input, stride)?,
        }

        Ok(&self.output)
    }

    fn check_input(&self, input: &[u8], required: usize) -> Result<()> {
        if input.len() < required {
            return Err(RelayError::Encoder(format!(
                "input buffer too small: {} < {}",
                input.len(),
                required
            )));
        }
        Ok(())
    }

    fn convert_packed_rgb(&mut self, input: &[u8], stride: usize) -> Result<()> {
        let w = self.format.size.width as usize;
        let h = self.format.size.height as usize;
        let tight = self.format.pixel_format.row_stride(self.format.size.width);
        self.check_input(input, stride * (h - 1) + tight)?;

        let (bpp, ro, go, bo) = match packed_rgb_layout(self.format.pixel_format) {
            Some(layout) => layout,
            None => {
                return Err(RelayError::Encoder(format!(
                    "{} is not a packed RGB layout",
                    self.format.pixel_format
                )))
            }
        };

        let y_size = w * h;
        let uv_size = y_size / 4;
        let (y_plane, uv_planes) = self.output.data.split_at_mut(y_size);
        let (u_plane, v_plane) = uv_planes.split_at_mut(uv_size);

        for row in 0..h {
            for col in 0..w {
                let idx = row * stride + col * bpp;
                y_plane[row * w + col] = luma(
                    input[idx + ro] as f32,
                    input[idx + go] as f32,
                    input[idx + bo] as f32,
                );
            }
        }

        // Subsample chroma over 2x2 blocks
        for row in (0..h).step_by(2) {
            for col in (0..w).step_by(2) {
                let mut r_sum = 0.0f32;
                let mut g_sum = 0.0f32;
                let mut b_sum = 0.0f32;
                for dr in 0..2 {
                    for dc in 0..2 {
                        let idx = (row + dr) * stride + (col + dc) * bpp;
                        r_sum += input[idx + ro] as f32;
                        g_sum += input[idx + go] as f32;
                        b_sum += input[idx + bo] as f32;
                    }
                }
                let (u, v) = chroma(r_sum / 4.0, g_sum / 4.0, b_sum / 4.0);
                let uv_idx = (row / 2) * (w / 2) + (col / 2);
                u_plane[uv_idx] = u;
                v_plane[uv_idx] = v;
            }
        }
        Ok(())
    }

    /// YUY2 is 4:2:2 packed as Y0 U0 Y1 V0; chroma from two adjacent rows
    /// is averaged down to 4:2:0.
    fn convert_yuy2(&mut self, input: &[u8], stride: usize) -> Result<()> {
        let w = self.format.size.width as usize;
        let h = self.format.size.height as usize;
        self.check_input(input, stride * (h - 1) + w * 2)?;

        let y_size = w * h;
        let uv_size = y_size / 4;
        let half_width = w / 2;
        let (y_plane, uv_planes) = self.output.data.split_at_mut(y_size);
        let (u_plane, v_plane) = uv_planes.split_at_mut(uv_size);

        for row in (0..h).step_by(2) {
            let src_row0 = row * stride;
            let src_row1 = (row + 1) * stride;
            let y_row0 = row * w;
            let y_row1 = (row + 1) * w;
            let uv_row = (row / 2) * half_width;

            for col in (0..w).step_by(2) {
                let off0 = src_row0 + col * 2;
                let off1 = src_row1 + col * 2;

                y_plane[y_row0 + col] = input[off0];
                y_plane[y_row0 + col + 1] = input[off0 + 2];
                y_plane[y_row1 + col] = input[off1];
                y_plane[y_row1 + col + 1] = input[off1 + 2];

                let u0 = input[off0 + 1] as u16;
                let v0 = input[off0 + 3] as u16;
                let u1 = input[off1 + 1] as u16;
                let v1 = input[off1 + 3] as u16;

                let uv_idx = uv_row + col / 2;
                u_plane[uv_idx] = ((u0 + u1) / 2) as u8;
                v_plane[uv_idx] = ((v0 + v1) / 2) as u8;
            }
        }
        Ok(())
    }

    /// I420 input is copied plane by plane; padded sources carry the luma
    /// pitch in `stride` and half of it per chroma row.
    fn copy_i420(&mut self, input: &[u8], stride: usize) -> Result<()> {
        let w = self.format.size.width as usize;
        let h = self.format.size.height as usize;
        let uv_stride = stride / 2;
        let uv_rows = h / 2;
        self.check_input(input, stride * h + uv_stride * uv_rows * 2)?;

        if stride == w {
            let len = self.output.data.len();
            self.output.data.copy_from_slice(&input[..len]);
            return Ok(());
        }

        let y_size = w * h;
        let uv_size = y_size / 4;
        let (y_plane, uv_planes) = self.output.data.split_at_mut(y_size);
        let (u_plane, v_plane) = uv_planes.split_at_mut(uv_size);

        for row in 0..h {
            let src = row * stride;
            y_plane[row * w..(row + 1) * w].copy_from_slice(&input[src..src + w]);
        }
        let u_base = stride * h;
        let v_base = u_base + uv_stride * uv_rows;
        for row in 0..uv_rows {
            let half = w / 2;
            let u_src = u_base + row * uv_stride;
            let v_src = v_base + row * uv_stride;
            u_plane[row * half..(row + 1) * half].copy_from_slice(&input[u_src..u_src + half]);
            v_plane[row * half..(row + 1) * half].copy_from_slice(&input[v_src..v_src + half]);
        }
        Ok(())
    }
}
