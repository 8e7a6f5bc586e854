use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Decoded frame handed to consumers
#[derive(Clone)]
pub struct Frame {
    /// Independent copy of the pixel data - the source buffer is already back in the channel
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Host timestamp taken when the payload was retrieved
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(data: Bytes, meta: FrameMetadata) -> Self {
        Self {
            data,
            meta: Arc::new(meta),
            timestamp: Instant::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.data.len())
            .field("meta", &self.meta)
            .finish()
    }
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub block_id: u64,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Color filter layout of a Bayer sensor, named after its top-left 2x2 cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BayerPattern {
    BG,
    GB,
    GR,
    RG,
}

/// Channel index into an RGB triple
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Red = 0,
    Green = 1,
    Blue = 2,
}

impl BayerPattern {
    /// Color sampled by the sensor site at `(x, y)`.
    pub fn channel_at(self, x: usize, y: usize) -> Channel {
        use Channel::{Blue, Green, Red};
        let cell = match self {
            BayerPattern::BG => [[Blue, Green], [Green, Red]],
            BayerPattern::GB => [[Green, Blue], [Red, Green]],
            BayerPattern::GR => [[Green, Red], [Blue, Green]],
            BayerPattern::RG => [[Red, Green], [Green, Blue]],
        };
        cell[y & 1][x & 1]
    }
}

/// Pixel encodings reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Mono8,
    Mono10,
    Mono12,
    Mono16,
    BayerBG8,
    BayerGB8,
    BayerGR8,
    BayerRG8,
    BayerBG12,
    BayerGB12,
    BayerGR12,
    BayerRG12,
    Rgb8,
    Bgr8,
    YCbCr422_8,
    /// Encoding this crate has no name for
    Other(u32),
}

const NAMES: [(PixelFormat, &str); 15] = [
    (PixelFormat::Mono8, "Mono8"),
    (PixelFormat::Mono10, "Mono10"),
    (PixelFormat::Mono12, "Mono12"),
    (PixelFormat::Mono16, "Mono16"),
    (PixelFormat::BayerBG8, "BayerBG8"),
    (PixelFormat::BayerGB8, "BayerGB8"),
    (PixelFormat::BayerGR8, "BayerGR8"),
    (PixelFormat::BayerRG8, "BayerRG8"),
    (PixelFormat::BayerBG12, "BayerBG12"),
    (PixelFormat::BayerGB12, "BayerGB12"),
    (PixelFormat::BayerGR12, "BayerGR12"),
    (PixelFormat::BayerRG12, "BayerRG12"),
    (PixelFormat::Rgb8, "RGB8"),
    (PixelFormat::Bgr8, "BGR8"),
    (PixelFormat::YCbCr422_8, "YCbCr422_8"),
];

impl PixelFormat {
    /// Look up a format by its device symbol, e.g. `"BayerRG8"`.
    pub fn from_name(name: &str) -> Option<Self> {
        NAMES
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
            .map(|(format, _)| *format)
    }

    pub fn name(&self) -> Option<&'static str> {
        NAMES
            .iter()
            .find(|(format, _)| format == self)
            .map(|(_, n)| *n)
    }

    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            PixelFormat::Mono8
            | PixelFormat::BayerBG8
            | PixelFormat::BayerGB8
            | PixelFormat::BayerGR8
            | PixelFormat::BayerRG8 => Some(1),
            PixelFormat::Mono10
            | PixelFormat::Mono12
            | PixelFormat::Mono16
            | PixelFormat::BayerBG12
            | PixelFormat::BayerGB12
            | PixelFormat::BayerGR12
            | PixelFormat::BayerRG12
            | PixelFormat::YCbCr422_8 => Some(2),
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => Some(3),
            PixelFormat::Other(_) => None,
        }
    }

    /// Mosaic layout for 8-bit Bayer encodings.
    pub fn bayer_pattern(&self) -> Option<BayerPattern> {
        match self {
            PixelFormat::BayerBG8 => Some(BayerPattern::BG),
            PixelFormat::BayerGB8 => Some(BayerPattern::GB),
            PixelFormat::BayerGR8 => Some(BayerPattern::GR),
            PixelFormat::BayerRG8 => Some(BayerPattern::RG),
            _ => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self, self.name()) {
            (_, Some(name)) => f.write_str(name),
            (PixelFormat::Other(code), None) => write!(f, "0x{code:08x}"),
            (other, None) => write!(f, "{other:?}"),
        }
    }
}
