//! Frame buffers borrowed from the service-owned pool
//!
//! Buffers stay owned by the capture service; the session only ever holds
//! a lease on one. Plane payloads are reference counted so a dequeued view
//! never copies pixel data.

use bytes::Bytes;

/// Valid region of a data plane
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Chunk {
    /// Bytes of valid data in the plane
    pub size: u32,
    /// Offset of the first valid byte
    pub offset: u32,
    /// Bytes per row, 0 when the producer did not set it
    pub stride: u32,
}

/// One data plane of a frame buffer
#[derive(Debug, Clone)]
pub struct DataPlane {
    /// Pixel bytes, `None` when the service mapped no memory for the plane
    pub data: Option<Bytes>,
    /// Whether the mapping is readable by the session
    pub readable: bool,
    pub chunk: Chunk,
}

impl DataPlane {
    /// A readable plane holding `data` with the given row stride
    pub fn filled(data: Bytes, stride: u32) -> Self {
        let size = data.len() as u32;
        Self {
            data: Some(data),
            readable: true,
            chunk: Chunk {
                size,
                offset: 0,
                stride,
            },
        }
    }

    /// A plane without backing memory
    pub fn empty() -> Self {
        Self {
            data: None,
            readable: false,
            chunk: Chunk::default(),
        }
    }

    /// Plane bytes when present and readable
    pub fn readable_data(&self) -> Option<&Bytes> {
        if self.readable {
            self.data.as_ref()
        } else {
            None
        }
    }
}

/// A frame buffer as handed out by the service pool
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    id: u32,
    planes: Vec<DataPlane>,
}

impl FrameBuffer {
    pub fn new(id: u32, planes: Vec<DataPlane>) -> Self {
        Self { id, planes }
    }

    /// Pool slot this buffer occupies
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn planes(&self) -> &[DataPlane] {
        &self.planes
    }

    /// The first plane, which carries packed formats entirely
    pub fn primary(&self) -> Option<&DataPlane> {
        self.planes.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filled_plane() {
        let plane = DataPlane::filled(Bytes::from_static(&[1, 2, 3, 4]), 4);
        assert!(plane.readable);
        assert_eq!(plane.chunk.size, 4);
        assert_eq!(plane.chunk.stride, 4);
        assert_eq!(plane.readable_data().unwrap().as_ref(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_empty_plane() {
        let plane = DataPlane::empty();
        assert!(plane.data.is_none());
        assert_eq!(plane.readable_data(), None);
        assert_eq!(plane.chunk.size, 0);
    }

    #[test]
    fn test_unreadable_plane_hides_data() {
        let mut plane = DataPlane::filled(Bytes::from_static(&[9]), 1);
        plane.readable = false;
        assert!(plane.data.is_some());
        assert_eq!(plane.readable_data(), None);
    }

    #[test]
    fn test_frame_buffer_primary() {
        let buffer = FrameBuffer::new(2, vec![]);
        assert_eq!(buffer.id(), 2);
        assert!(buffer.primary().is_none());

        let buffer = FrameBuffer::new(
            0,
            vec![
                DataPlane::filled(Bytes::from_static(&[1]), 1),
                DataPlane::empty(),
            ],
        );
        assert_eq!(buffer.planes().len(), 2);
        assert!(buffer.primary().unwrap().readable);
    }
}
