//! Interfaces to the camera's protocol stack.
//!
//! The acquisition core only talks to these traits. An adapter over the vendor
//! SDK implements them for real hardware; [`sim`] implements them in memory.

pub mod buffer;
pub mod sim;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub use buffer::{Buffer, ImageInfo, Payload, PayloadType};

/// Physical transport of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    GigEVision,
    Usb3Vision,
}

/// Transport-level failure of a stream or device call
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("Timed out waiting for a buffer")]
    Timeout,

    #[error("Stream is closed")]
    Closed,

    #[error("Stream queue is full ({maximum} buffers)")]
    QueueFull { maximum: usize },

    #[error("Buffer too small: payload needs {needed} bytes, capacity is {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    #[error("Transport error {code}: {description}")]
    Transport { code: i32, description: String },
}

/// Why a retrieved buffer does not hold a usable payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationalCode {
    MissingPackets,
    TooManyResends,
    ResendsFailure,
    BufferTooSmall,
    Aborted,
    Other(i32),
}

/// Operational result flagged by the stream on a retrieved buffer
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code:?}: {description}")]
pub struct OperationalError {
    pub code: OperationalCode,
    pub description: String,
}

impl OperationalError {
    pub fn new(code: OperationalCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

/// A buffer handed back by [`Stream::retrieve_buffer`].
///
/// `status` carries the operational result; the buffer is returned either way
/// and must be re-queued by the caller.
#[derive(Debug)]
pub struct Retrieval {
    pub buffer: Buffer,
    pub status: Result<(), OperationalError>,
}

/// Failure reported by the remote parameter dictionary
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{description}")]
pub struct RemoteError {
    pub description: String,
}

impl RemoteError {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
        }
    }
}

/// Type of a remote parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    Integer,
    Float,
    Enumeration,
    Boolean,
    String,
    Command,
    Register,
}

/// Value read from or written to a remote parameter
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Integer(i64),
    Float(f64),
    Enumeration(String),
    Boolean(bool),
    String(String),
}

impl ParameterValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Integer(v) => Some(*v as f64),
            ParameterValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::Enumeration(s) | ParameterValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Integer(v) => write!(f, "{v}"),
            ParameterValue::Float(v) => write!(f, "{v}"),
            ParameterValue::Enumeration(s) | ParameterValue::String(s) => f.write_str(s),
            ParameterValue::Boolean(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        ParameterValue::Integer(v)
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        ParameterValue::Float(v)
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self {
        ParameterValue::Boolean(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        ParameterValue::String(v.to_owned())
    }
}

impl From<String> for ParameterValue {
    fn from(v: String) -> Self {
        ParameterValue::String(v)
    }
}

/// Handle to one remote parameter. Every call round-trips to the device.
pub trait ParameterHandle: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> ParameterKind;
    fn is_available(&self) -> bool;
    fn is_readable(&self) -> bool;
    fn value(&self) -> Result<ParameterValue, RemoteError>;
    fn min(&self) -> Result<ParameterValue, RemoteError>;
    fn max(&self) -> Result<ParameterValue, RemoteError>;
    fn set_value(&self, value: ParameterValue) -> Result<(), RemoteError>;
    fn execute(&self) -> Result<(), RemoteError>;
}

/// Remote parameter dictionary of a device or stream
pub trait ParameterMap: Send + Sync {
    fn get(&self, name: &str) -> Option<Arc<dyn ParameterHandle>>;
}

/// Open data channel bound to a device
pub trait Stream: Send + Sync + 'static {
    /// Local endpoint the device should send packets to.
    fn local_address(&self) -> SocketAddr;

    /// Stream-level parameters (resend tuning and the like).
    fn parameters(&self) -> &dyn ParameterMap;

    /// Admission limit of the stream's buffer queue.
    fn queued_buffer_maximum(&self) -> usize;

    /// Hand a buffer to the stream. On refusal the buffer comes back with the error.
    fn queue_buffer(&self, buffer: Buffer) -> Result<(), (Buffer, StreamError)>;

    /// Wait up to `timeout` for the oldest filled buffer.
    fn retrieve_buffer(&self, timeout: Duration) -> Result<Retrieval, StreamError>;

    /// Flag every queued buffer as aborted so it can be retrieved immediately.
    fn abort_queued_buffers(&self);

    fn queued_buffer_count(&self) -> usize;

    fn close(&self);
}

/// Connected camera
pub trait Device: Send + Sync + 'static {
    type Stream: Stream;

    fn connection_id(&self) -> &str;

    fn transport(&self) -> Transport;

    fn open_stream(&self) -> Result<Self::Stream, StreamError>;

    fn negotiate_packet_size(&self) -> Result<(), StreamError>;

    fn set_stream_destination(&self, destination: SocketAddr) -> Result<(), StreamError>;

    /// Size in bytes of one payload at the current configuration.
    fn payload_size(&self) -> Result<usize, StreamError>;

    fn parameters(&self) -> &dyn ParameterMap;

    fn stream_enable(&self) -> Result<(), StreamError>;

    fn stream_disable(&self) -> Result<(), StreamError>;
}
