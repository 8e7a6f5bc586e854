pub mod capture;
pub mod device;
pub mod error;
pub mod parameter;
pub mod pipeline;
pub mod utils;

use std::path::Path;

use arc_swap::ArcSwap;
use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use capture::{AcquisitionState, Camera, Frame, FrameMetadata};
pub use error::{CameraError, Result};
pub use parameter::{get_parameter, set_parameter, step_parameter, NumericRange, ParameterReading};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub stream: StreamConfig,
    pub pipeline: PipelineConfig,
    pub preview: PreviewConfig,
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Convert frames to 8-bit RGB/BGR/mono before publishing
    pub normalize_format: bool,
    /// Upper bound on buffers queued in the stream
    pub buffer_count: usize,
    pub pin_core: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub resend_group_size: i64,
    pub resend_retries_per_packet: i64,
    pub retrieve_timeout_ms: u64,
    pub drain_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_consecutive_errors: u32,
    /// How long the preview waits for a frame before checking for shutdown
    pub frame_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    pub max_frames: Option<u64>,
    pub log_every: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub connection_id: String,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub frame_interval_ms: u64,
    pub queue_max: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            normalize_format: true,
            buffer_count: pipeline::DEFAULT_BUFFER_COUNT,
            pin_core: None,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            resend_group_size: 5000,
            resend_retries_per_packet: 5,
            retrieve_timeout_ms: 1000,
            drain_timeout_ms: 100,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_consecutive_errors: capture::acquisition::DEFAULT_ERROR_THRESHOLD,
            frame_wait_ms: 250,
        }
    }
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            max_frames: None,
            log_every: 30,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            connection_id: "sim://0".into(),
            width: 640,
            height: 480,
            pixel_format: PixelFormat::BayerRG12,
            frame_interval_ms: 33, // ~30fps
            queue_max: 64,
        }
    }
}

impl Config {
    /// Defaults, then the TOML file at `path` if given, then `ARGUS__*`
    /// environment variables (e.g. `ARGUS__STREAM__RETRIEVE_TIMEOUT_MS`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("ARGUS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}
