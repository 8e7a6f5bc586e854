//! Error types for argus

use thiserror::Error;

use crate::device::StreamError;

/// Result type alias using CameraError
pub type Result<T> = std::result::Result<T, CameraError>;

/// Errors raised by the acquisition core
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("Parameter {name} is not available")]
    ParameterNotAvailable { name: String },

    #[error("Parameter {name} is not readable")]
    ParameterNotReadable { name: String },

    #[error("Failed to set parameter {name}: {description}")]
    ParameterSetFailure { name: String, description: String },

    #[error("Failed to read parameter {name}: {description}")]
    ParameterReadFailure { name: String, description: String },

    #[error("Parameter {name} must stay within [{min}, {max}], requested {requested}")]
    ParameterOutOfRange {
        name: String,
        requested: f64,
        min: f64,
        max: f64,
    },

    #[error("Parameter {name} is not numeric")]
    ParameterNotNumeric { name: String },

    #[error("Unable to stream from device {connection_id}: {source}")]
    StreamOpen {
        connection_id: String,
        #[source]
        source: StreamError,
    },

    #[error("Acquisition aborted after {consecutive} consecutive errors")]
    AcquisitionAborted {
        consecutive: u32,
        diagnostics: Vec<String>,
    },

    #[error("Acquisition has stopped")]
    AcquisitionStopped,

    #[error("Camera is not open")]
    NotOpen,

    #[error("Camera is already open")]
    AlreadyOpen,

    #[error("Acquisition thread panicked")]
    TaskPanicked,

    #[error("Failed to spawn acquisition thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl CameraError {
    /// True for errors that end the acquisition session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CameraError::AcquisitionAborted { .. }
                | CameraError::AcquisitionStopped
                | CameraError::TaskPanicked
        )
    }
}
