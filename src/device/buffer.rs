use std::time::Duration;

use super::StreamError;
use crate::capture::frame::PixelFormat;

/// Classification of a buffer's contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    Image,
    ChunkData,
    RawData,
    MultiPart,
    Unsupported,
}

/// Geometry and encoding of an image payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

impl ImageInfo {
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            pixel_format,
        }
    }

    /// Bytes needed for the pixel data, if the encoding has a known size.
    pub fn image_size(&self) -> Option<usize> {
        self.pixel_format
            .bytes_per_pixel()
            .and_then(|bpp| {
                (self.width as usize)
                    .checked_mul(self.height as usize)?
                    .checked_mul(bpp)
            })
    }
}

/// What the device wrote into a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// Nothing received yet
    Empty,
    Image(ImageInfo),
    ChunkData { chunk_count: u32 },
    RawData { length: usize },
    MultiPart { part_count: u32 },
    Unsupported(u32),
}

/// Fixed-capacity payload block circulating between the pool and the stream.
///
/// The backing allocation is sized once from the device payload size and never
/// grows; a payload that does not fit is refused.
pub struct Buffer {
    id: u64,
    data: Box<[u8]>,
    filled: usize,
    payload: Payload,
    block_id: u64,
    timestamp: Option<Duration>,
}

impl Buffer {
    pub fn new(id: u64, capacity: usize) -> Self {
        Self {
            id,
            data: vec![0u8; capacity].into_boxed_slice(),
            filled: 0,
            payload: Payload::Empty,
            block_id: 0,
            timestamp: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn payload(&self) -> Payload {
        self.payload
    }

    pub fn payload_type(&self) -> PayloadType {
        match self.payload {
            Payload::Image(_) => PayloadType::Image,
            Payload::ChunkData { .. } => PayloadType::ChunkData,
            Payload::RawData { .. } => PayloadType::RawData,
            Payload::MultiPart { .. } => PayloadType::MultiPart,
            Payload::Empty | Payload::Unsupported(_) => PayloadType::Unsupported,
        }
    }

    /// Image geometry, for image payloads only.
    pub fn image(&self) -> Option<ImageInfo> {
        match self.payload {
            Payload::Image(info) => Some(info),
            _ => None,
        }
    }

    pub fn pixel_format(&self) -> Option<PixelFormat> {
        self.image().map(|info| info.pixel_format)
    }

    /// Bytes written by the last payload.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    pub fn block_id(&self) -> u64 {
        self.block_id
    }

    pub fn timestamp(&self) -> Option<Duration> {
        self.timestamp
    }

    /// Fill the buffer with a new payload, replacing the previous one.
    pub fn write_payload(
        &mut self,
        bytes: &[u8],
        payload: Payload,
        block_id: u64,
        timestamp: Option<Duration>,
    ) -> Result<(), StreamError> {
        if bytes.len() > self.data.len() {
            return Err(StreamError::BufferTooSmall {
                needed: bytes.len(),
                capacity: self.data.len(),
            });
        }
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.filled = bytes.len();
        self.payload = payload;
        self.block_id = block_id;
        self.timestamp = timestamp;
        Ok(())
    }

    /// Forget the last payload; the allocation is kept.
    pub fn reset(&mut self) {
        self.filled = 0;
        self.payload = Payload::Empty;
        self.block_id = 0;
        self.timestamp = None;
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("capacity", &self.data.len())
            .field("filled", &self.filled)
            .field("payload", &self.payload)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_payload_is_refused_without_growing() {
        let mut buffer = Buffer::new(3, 4);
        let err = buffer
            .write_payload(&[0u8; 5], Payload::RawData { length: 5 }, 1, None)
            .unwrap_err();
        assert!(matches!(
            err,
            StreamError::BufferTooSmall {
                needed: 5,
                capacity: 4
            }
        ));
        assert_eq!(buffer.capacity(), 4);
        assert_eq!(buffer.payload_type(), PayloadType::Unsupported);
    }

    #[test]
    fn image_payload_exposes_geometry() {
        let mut buffer = Buffer::new(0, 16);
        let info = ImageInfo::new(4, 2, PixelFormat::Mono8);
        buffer
            .write_payload(&[7u8; 8], Payload::Image(info), 42, None)
            .unwrap();
        assert_eq!(buffer.payload_type(), PayloadType::Image);
        assert_eq!(buffer.image(), Some(info));
        assert_eq!(buffer.bytes(), &[7u8; 8]);
        assert_eq!(buffer.block_id(), 42);

        buffer.reset();
        assert!(buffer.bytes().is_empty());
        assert_eq!(buffer.capacity(), 16);
    }
}
