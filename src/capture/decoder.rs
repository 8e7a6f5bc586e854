//! Payload classification and pixel normalization

use tracing::{debug, warn};

use crate::capture::frame::{BayerPattern, Channel, PixelFormat};
use crate::device::{Buffer, ImageInfo, Payload};

/// Pixel data copied out of a buffer, ready to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
}

impl DecodedImage {
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }
}

/// Classify a retrieved buffer and decode it if it carries an image.
///
/// Non-image payloads are only reported. The returned pixels never alias the
/// buffer, which goes back to the stream right after this call.
pub fn decode_payload(buffer: &Buffer, normalize: bool) -> Option<DecodedImage> {
    match buffer.payload() {
        Payload::Image(info) => {
            let Some(data) = image_bytes(buffer.bytes(), info) else {
                warn!(
                    buffer = buffer.id(),
                    received = buffer.bytes().len(),
                    format = %info.pixel_format,
                    "Image payload shorter than its geometry"
                );
                return None;
            };
            if normalize {
                decode_frame(data, info)
            } else {
                Some(DecodedImage {
                    pixels: data.to_vec(),
                    width: info.width,
                    height: info.height,
                    stride: stride(info.width, info.pixel_format)?,
                    format: info.pixel_format,
                })
            }
        }
        Payload::ChunkData { chunk_count } => {
            debug!(chunk_count, "Chunk data payload");
            None
        }
        Payload::RawData { length } => {
            debug!(length, "Raw data payload");
            None
        }
        Payload::MultiPart { part_count } => {
            debug!(part_count, "Multi-part payload");
            None
        }
        Payload::Unsupported(code) => {
            debug!(code, "Payload type not supported");
            None
        }
        Payload::Empty => None,
    }
}

/// The bytes covered by `info`, or the whole payload when the encoding has no known size.
fn image_bytes(data: &[u8], info: ImageInfo) -> Option<&[u8]> {
    match info.image_size() {
        Some(size) => data.get(..size),
        None => Some(data),
    }
}

/// Bytes per row, or `None` when the row length does not fit in a `u32`.
fn stride(width: u32, format: PixelFormat) -> Option<u32> {
    let bpp = u32::try_from(format.bytes_per_pixel().unwrap_or(1)).ok()?;
    width.checked_mul(bpp)
}

/// Convert an image to the display encoding.
///
/// Bayer mosaics become RGB, RGB becomes BGR, mono passes through. Any other
/// encoding yields `None`.
pub fn decode_frame(data: &[u8], info: ImageInfo) -> Option<DecodedImage> {
    let (width, height) = (info.width as usize, info.height as usize);
    if data.len() < info.image_size()? {
        return None;
    }
    let (pixels, format) = match info.pixel_format {
        PixelFormat::Mono8 => (data.to_vec(), PixelFormat::Mono8),
        PixelFormat::Rgb8 => (swap_red_blue(data), PixelFormat::Bgr8),
        format => {
            let pattern = format.bayer_pattern()?;
            (demosaic(data, width, height, pattern), PixelFormat::Rgb8)
        }
    };
    Some(DecodedImage {
        pixels,
        width: info.width,
        height: info.height,
        stride: stride(info.width, format)?,
        format,
    })
}

/// Swap the first and third channel of packed 3-byte pixels.
pub fn swap_red_blue(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for px in data.chunks_exact(3) {
        out.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    out
}

/// Bilinear demosaic of an 8-bit Bayer mosaic into packed RGB.
///
/// Each site keeps its own sample; the two missing channels are the mean of
/// the same-colored sites in its 3x3 neighborhood, clipped at the borders.
pub fn demosaic(data: &[u8], width: usize, height: usize, pattern: BayerPattern) -> Vec<u8> {
    let mut out = vec![0u8; width * height * 3];
    for y in 0..height {
        for x in 0..width {
            let own = pattern.channel_at(x, y);
            let mut sums = [0u32; 3];
            let mut counts = [0u32; 3];

            for ny in y.saturating_sub(1)..=(y + 1).min(height - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
                    let channel = pattern.channel_at(nx, ny) as usize;
                    sums[channel] += u32::from(data[ny * width + nx]);
                    counts[channel] += 1;
                }
            }

            let px = &mut out[(y * width + x) * 3..][..3];
            for channel in [Channel::Red, Channel::Green, Channel::Blue] {
                let c = channel as usize;
                px[c] = if channel == own {
                    data[y * width + x]
                } else if counts[c] > 0 {
                    ((sums[c] + counts[c] / 2) / counts[c]) as u8
                } else {
                    0
                };
            }
        }
    }
    out
}
