//! In-memory camera implementing the device traits.
//!
//! Drives the preview binary when no hardware adapter is linked in and backs
//! the test suite. Failures and payloads can be scripted with [`SimEvent`];
//! otherwise an enabled stream produces a moving test pattern.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::debug;

use super::{
    Buffer, Device, ImageInfo, OperationalCode, OperationalError, ParameterHandle, ParameterKind,
    ParameterMap, ParameterValue, Payload, RemoteError, Retrieval, Stream, StreamError, Transport,
};
use crate::capture::frame::PixelFormat;
use crate::SimulationConfig;

/// One simulated remote parameter
pub struct SimParameter {
    name: String,
    kind: ParameterKind,
    entries: Vec<String>,
    min: Option<ParameterValue>,
    max: Option<ParameterValue>,
    value: Mutex<Option<ParameterValue>>,
    available: AtomicBool,
    readable: AtomicBool,
    read_failure: Mutex<Option<String>>,
    write_failure: Mutex<Option<String>>,
    writes: AtomicUsize,
    executions: AtomicUsize,
}

impl SimParameter {
    fn with_kind(name: &str, kind: ParameterKind, value: Option<ParameterValue>) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            entries: Vec::new(),
            min: None,
            max: None,
            value: Mutex::new(value),
            available: AtomicBool::new(true),
            readable: AtomicBool::new(true),
            read_failure: Mutex::new(None),
            write_failure: Mutex::new(None),
            writes: AtomicUsize::new(0),
            executions: AtomicUsize::new(0),
        }
    }

    pub fn integer(name: &str, min: i64, current: i64, max: i64) -> Self {
        let mut p = Self::with_kind(
            name,
            ParameterKind::Integer,
            Some(ParameterValue::Integer(current)),
        );
        p.min = Some(ParameterValue::Integer(min));
        p.max = Some(ParameterValue::Integer(max));
        p
    }

    pub fn float(name: &str, min: f64, current: f64, max: f64) -> Self {
        let mut p = Self::with_kind(
            name,
            ParameterKind::Float,
            Some(ParameterValue::Float(current)),
        );
        p.min = Some(ParameterValue::Float(min));
        p.max = Some(ParameterValue::Float(max));
        p
    }

    pub fn enumeration(name: &str, entries: &[&str], current: &str) -> Self {
        let mut p = Self::with_kind(
            name,
            ParameterKind::Enumeration,
            Some(ParameterValue::Enumeration(current.to_owned())),
        );
        p.entries = entries.iter().map(|e| (*e).to_owned()).collect();
        p
    }

    pub fn boolean(name: &str, value: bool) -> Self {
        Self::with_kind(name, ParameterKind::Boolean, Some(ParameterValue::Boolean(value)))
    }

    pub fn string(name: &str, value: &str) -> Self {
        Self::with_kind(
            name,
            ParameterKind::String,
            Some(ParameterValue::String(value.to_owned())),
        )
    }

    pub fn command(name: &str) -> Self {
        Self::with_kind(name, ParameterKind::Command, None)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    pub fn set_readable(&self, readable: bool) {
        self.readable.store(readable, Ordering::Relaxed);
    }

    /// Make every read fail with `description` until cleared with `None`.
    pub fn fail_reads(&self, description: Option<&str>) {
        *self.read_failure.lock() = description.map(str::to_owned);
    }

    /// Make every write fail with `description` until cleared with `None`.
    pub fn fail_writes(&self, description: Option<&str>) {
        *self.write_failure.lock() = description.map(str::to_owned);
    }

    /// Write attempts that reached the device.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::Relaxed)
    }

    /// Value as the device sees it, unaffected by injected read failures.
    fn current(&self) -> Option<ParameterValue> {
        self.value.lock().clone()
    }

    fn check_range(&self, value: f64) -> Result<(), RemoteError> {
        let min = self.min.as_ref().and_then(ParameterValue::as_f64);
        let max = self.max.as_ref().and_then(ParameterValue::as_f64);
        match (min, max) {
            (Some(min), Some(max)) if value < min || value > max => Err(RemoteError::new(
                format!("{} value {value} out of range [{min}, {max}]", self.name),
            )),
            _ => Ok(()),
        }
    }

    fn coerce(&self, value: ParameterValue) -> Result<ParameterValue, RemoteError> {
        match (self.kind, value) {
            (ParameterKind::Integer, ParameterValue::Integer(v)) => {
                self.check_range(v as f64)?;
                Ok(ParameterValue::Integer(v))
            }
            (ParameterKind::Float, v @ (ParameterValue::Float(_) | ParameterValue::Integer(_))) => {
                let v = v.as_f64().unwrap_or_default();
                self.check_range(v)?;
                Ok(ParameterValue::Float(v))
            }
            (
                ParameterKind::Enumeration,
                ParameterValue::Enumeration(s) | ParameterValue::String(s),
            ) => {
                if self.entries.iter().any(|e| *e == s) {
                    Ok(ParameterValue::Enumeration(s))
                } else {
                    Err(RemoteError::new(format!("{s} is not an entry of {}", self.name)))
                }
            }
            (ParameterKind::Boolean, v @ ParameterValue::Boolean(_)) => Ok(v),
            (ParameterKind::String, v @ ParameterValue::String(_)) => Ok(v),
            (kind, v) => Err(RemoteError::new(format!(
                "cannot write {v:?} to {kind:?} parameter {}",
                self.name
            ))),
        }
    }
}

impl ParameterHandle for SimParameter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ParameterKind {
        self.kind
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    fn is_readable(&self) -> bool {
        self.readable.load(Ordering::Relaxed)
    }

    fn value(&self) -> Result<ParameterValue, RemoteError> {
        if let Some(description) = self.read_failure.lock().clone() {
            return Err(RemoteError::new(description));
        }
        self.value
            .lock()
            .clone()
            .ok_or_else(|| RemoteError::new(format!("{} has no value", self.name)))
    }

    fn min(&self) -> Result<ParameterValue, RemoteError> {
        if let Some(description) = self.read_failure.lock().clone() {
            return Err(RemoteError::new(description));
        }
        self.min
            .clone()
            .ok_or_else(|| RemoteError::new(format!("{} has no limits", self.name)))
    }

    fn max(&self) -> Result<ParameterValue, RemoteError> {
        if let Some(description) = self.read_failure.lock().clone() {
            return Err(RemoteError::new(description));
        }
        self.max
            .clone()
            .ok_or_else(|| RemoteError::new(format!("{} has no limits", self.name)))
    }

    fn set_value(&self, value: ParameterValue) -> Result<(), RemoteError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        if let Some(description) = self.write_failure.lock().clone() {
            return Err(RemoteError::new(description));
        }
        let value = self.coerce(value)?;
        *self.value.lock() = Some(value);
        Ok(())
    }

    fn execute(&self) -> Result<(), RemoteError> {
        if self.kind != ParameterKind::Command {
            return Err(RemoteError::new(format!("{} is not a command", self.name)));
        }
        self.executions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Shared, cheaply cloneable parameter dictionary
#[derive(Clone, Default)]
pub struct SimParameters {
    params: Arc<RwLock<HashMap<String, Arc<SimParameter>>>>,
}

impl SimParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, parameter: SimParameter) -> Arc<SimParameter> {
        let parameter = Arc::new(parameter);
        self.params
            .write()
            .insert(parameter.name.clone(), Arc::clone(&parameter));
        parameter
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<SimParameter>> {
        self.params.read().get(name).cloned()
    }

    fn integer(&self, name: &str) -> Option<i64> {
        match self.lookup(name)?.current()? {
            ParameterValue::Integer(v) => Some(v),
            _ => None,
        }
    }

    fn pixel_format(&self) -> Option<PixelFormat> {
        let value = self.lookup("PixelFormat")?.current()?;
        PixelFormat::from_name(value.as_str()?)
    }

    /// Geometry of the image the device would currently send.
    fn image_info(&self) -> Option<ImageInfo> {
        let width = u32::try_from(self.integer("Width")?).ok()?;
        let height = u32::try_from(self.integer("Height")?).ok()?;
        Some(ImageInfo::new(width, height, self.pixel_format()?))
    }
}

impl ParameterMap for SimParameters {
    fn get(&self, name: &str) -> Option<Arc<dyn ParameterHandle>> {
        self.lookup(name)
            .map(|p| p as Arc<dyn ParameterHandle>)
    }
}

/// Scripted stream outcome, consumed in order by `retrieve_buffer`
#[derive(Debug, Clone)]
pub enum SimEvent {
    /// Fill the next queued buffer
    Deliver { payload: Payload, bytes: Vec<u8> },
    /// Fail the retrieval call itself
    TransportFailure { code: i32, description: String },
    /// Return the next queued buffer flagged with an operational failure
    OperationalFailure(OperationalCode),
}

impl SimEvent {
    pub fn image(pixel_format: PixelFormat, width: u32, height: u32, pixels: Vec<u8>) -> Self {
        SimEvent::Deliver {
            payload: Payload::Image(ImageInfo::new(width, height, pixel_format)),
            bytes: pixels,
        }
    }

    pub fn transport_failure(description: &str) -> Self {
        SimEvent::TransportFailure {
            code: -1,
            description: description.to_owned(),
        }
    }
}

/// Deterministic pixel pattern shifted by `frame`.
pub fn test_pattern(info: ImageInfo, frame: u64) -> Vec<u8> {
    let (width, height) = (info.width as u64, info.height as u64);
    let mut out = Vec::with_capacity(info.image_size().unwrap_or(0));
    for y in 0..height {
        for x in 0..width {
            let v = x + y + frame;
            match info.pixel_format.bytes_per_pixel() {
                Some(1) => out.push((v % 256) as u8),
                Some(2) => out.extend_from_slice(&((v % 4096) as u16).to_le_bytes()),
                Some(3) => out.extend_from_slice(&[(x % 256) as u8, (y % 256) as u8, (frame % 256) as u8]),
                _ => return Vec::new(),
            }
        }
    }
    out
}

struct LinkState {
    open: bool,
    streaming: bool,
    aborted: bool,
    queue: VecDeque<Buffer>,
    script: VecDeque<SimEvent>,
    frame_interval: Option<Duration>,
    next_frame_at: Option<Instant>,
    frames_generated: u64,
    block_id: u64,
    queue_refusal: Option<StreamError>,
    discarded_on_close: usize,
}

/// State shared between a device and the stream it opened
struct SimLink {
    state: Mutex<LinkState>,
    changed: Condvar,
    epoch: Instant,
}

/// Builder for [`SimDevice`]
pub struct SimDeviceBuilder {
    connection_id: String,
    model_name: String,
    transport: Transport,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    queue_max: usize,
    frame_interval: Option<Duration>,
}

impl SimDeviceBuilder {
    pub fn connection_id(mut self, id: &str) -> Self {
        self.connection_id = id.to_owned();
        self
    }

    pub fn model_name(mut self, name: &str) -> Self {
        self.model_name = name.to_owned();
        self
    }

    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn pixel_format(mut self, format: PixelFormat) -> Self {
        self.pixel_format = format;
        self
    }

    /// Admission limit reported by streams of this device.
    pub fn queue_max(mut self, max: usize) -> Self {
        self.queue_max = max;
        self
    }

    /// Generate a test-pattern frame at this interval while streaming is
    /// enabled. `None` leaves only scripted events.
    pub fn frame_interval(mut self, interval: Option<Duration>) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn build(self) -> SimDevice {
        let params = SimParameters::new();
        let format_names: Vec<&str> = [
            PixelFormat::Mono8,
            PixelFormat::Mono10,
            PixelFormat::Mono12,
            PixelFormat::Mono16,
            PixelFormat::BayerBG8,
            PixelFormat::BayerGB8,
            PixelFormat::BayerGR8,
            PixelFormat::BayerRG8,
            PixelFormat::BayerBG12,
            PixelFormat::BayerGB12,
            PixelFormat::BayerGR12,
            PixelFormat::BayerRG12,
            PixelFormat::Rgb8,
            PixelFormat::Bgr8,
            PixelFormat::YCbCr422_8,
        ]
        .iter()
        .filter_map(PixelFormat::name)
        .collect();
        let current = self.pixel_format.name().unwrap_or("Mono8");

        params.insert(SimParameter::string("DeviceModelName", &self.model_name));
        params.insert(SimParameter::enumeration("PixelFormat", &format_names, current));
        params.insert(SimParameter::integer("Width", 1, i64::from(self.width), 8192));
        params.insert(SimParameter::integer("Height", 1, i64::from(self.height), 8192));
        params.insert(SimParameter::float("ExposureTime", 10.0, 5000.0, 1_000_000.0));
        params.insert(SimParameter::float("Gain", 0.0, 1.0, 24.0));
        params.insert(SimParameter::command("AcquisitionStart"));
        params.insert(SimParameter::command("AcquisitionStop"));

        let stream_params = SimParameters::new();
        stream_params.insert(SimParameter::integer("MaximumResendGroupSize", 0, 1000, 100_000));
        stream_params.insert(SimParameter::integer(
            "MaximumResendRequestRetryByPacket",
            0,
            3,
            1000,
        ));

        SimDevice {
            connection_id: self.connection_id,
            transport: self.transport,
            params,
            stream_params,
            queue_max: self.queue_max,
            open_failure: Mutex::new(None),
            enable_failure: Mutex::new(None),
            packet_size_negotiated: AtomicBool::new(false),
            destination: Mutex::new(None),
            link: Arc::new(SimLink {
                state: Mutex::new(LinkState {
                    open: false,
                    streaming: false,
                    aborted: false,
                    queue: VecDeque::new(),
                    script: VecDeque::new(),
                    frame_interval: self.frame_interval,
                    next_frame_at: None,
                    frames_generated: 0,
                    block_id: 0,
                    queue_refusal: None,
                    discarded_on_close: 0,
                }),
                changed: Condvar::new(),
                epoch: Instant::now(),
            }),
        }
    }
}

/// Simulated camera
pub struct SimDevice {
    connection_id: String,
    transport: Transport,
    params: SimParameters,
    stream_params: SimParameters,
    queue_max: usize,
    open_failure: Mutex<Option<StreamError>>,
    enable_failure: Mutex<Option<StreamError>>,
    packet_size_negotiated: AtomicBool,
    destination: Mutex<Option<SocketAddr>>,
    link: Arc<SimLink>,
}

impl SimDevice {
    pub fn builder() -> SimDeviceBuilder {
        SimDeviceBuilder {
            connection_id: "sim://0".to_owned(),
            model_name: "Argus Simulated Camera".to_owned(),
            transport: Transport::GigEVision,
            width: 640,
            height: 480,
            pixel_format: PixelFormat::Mono8,
            queue_max: 64,
            frame_interval: None,
        }
    }

    pub fn from_config(config: &SimulationConfig) -> Self {
        Self::builder()
            .connection_id(&config.connection_id)
            .resolution(config.width, config.height)
            .pixel_format(config.pixel_format)
            .queue_max(config.queue_max)
            .frame_interval(Some(Duration::from_millis(config.frame_interval_ms)))
            .build()
    }

    pub fn params(&self) -> &SimParameters {
        &self.params
    }

    pub fn stream_params(&self) -> &SimParameters {
        &self.stream_params
    }

    /// Make the next `open_stream` calls fail with `error` until cleared.
    pub fn fail_open(&self, error: Option<StreamError>) {
        *self.open_failure.lock() = error;
    }

    /// Make `stream_enable` fail with `error` until cleared.
    pub fn fail_enable(&self, error: Option<StreamError>) {
        *self.enable_failure.lock() = error;
    }

    /// Make the stream refuse every queued buffer with `error` until cleared.
    pub fn refuse_queue(&self, error: Option<StreamError>) {
        self.link.state.lock().queue_refusal = error;
    }

    /// Buffers still queued when a stream was closed, summed over all closes
    pub fn discarded_on_close(&self) -> usize {
        self.link.state.lock().discarded_on_close
    }

    /// Append scripted outcomes for upcoming retrievals.
    pub fn inject(&self, events: impl IntoIterator<Item = SimEvent>) {
        let mut state = self.link.state.lock();
        state.script.extend(events);
        self.link.changed.notify_all();
    }

    pub fn pending_events(&self) -> usize {
        self.link.state.lock().script.len()
    }

    pub fn queued_buffer_count(&self) -> usize {
        self.link.state.lock().queue.len()
    }

    pub fn is_stream_open(&self) -> bool {
        self.link.state.lock().open
    }

    pub fn is_streaming(&self) -> bool {
        self.link.state.lock().streaming
    }

    pub fn packet_size_negotiated(&self) -> bool {
        self.packet_size_negotiated.load(Ordering::Relaxed)
    }

    pub fn destination(&self) -> Option<SocketAddr> {
        *self.destination.lock()
    }
}

impl Device for SimDevice {
    type Stream = SimStream;

    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn transport(&self) -> Transport {
        self.transport
    }

    fn open_stream(&self) -> Result<SimStream, StreamError> {
        if let Some(error) = self.open_failure.lock().clone() {
            return Err(error);
        }
        let mut state = self.link.state.lock();
        state.open = true;
        state.aborted = false;
        state.queue.clear();
        drop(state);

        debug!(connection_id = %self.connection_id, "Simulated stream opened");
        Ok(SimStream {
            link: Arc::clone(&self.link),
            params: self.stream_params.clone(),
            device_params: self.params.clone(),
            queue_max: self.queue_max,
        })
    }

    fn negotiate_packet_size(&self) -> Result<(), StreamError> {
        self.packet_size_negotiated.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn set_stream_destination(&self, destination: SocketAddr) -> Result<(), StreamError> {
        *self.destination.lock() = Some(destination);
        Ok(())
    }

    fn payload_size(&self) -> Result<usize, StreamError> {
        self.params
            .image_info()
            .and_then(|info| info.image_size())
            .ok_or(StreamError::Transport {
                code: -2,
                description: "payload size unavailable".to_owned(),
            })
    }

    fn parameters(&self) -> &dyn ParameterMap {
        &self.params
    }

    fn stream_enable(&self) -> Result<(), StreamError> {
        if let Some(error) = self.enable_failure.lock().clone() {
            return Err(error);
        }
        let mut state = self.link.state.lock();
        state.streaming = true;
        state.next_frame_at = Some(Instant::now());
        self.link.changed.notify_all();
        Ok(())
    }

    fn stream_disable(&self) -> Result<(), StreamError> {
        let mut state = self.link.state.lock();
        state.streaming = false;
        state.next_frame_at = None;
        self.link.changed.notify_all();
        Ok(())
    }
}

/// Stream opened on a [`SimDevice`]
pub struct SimStream {
    link: Arc<SimLink>,
    params: SimParameters,
    device_params: SimParameters,
    queue_max: usize,
}

impl SimStream {
    fn deliver(&self, state: &mut LinkState, mut buffer: Buffer, payload: Payload, bytes: &[u8]) -> Retrieval {
        state.block_id += 1;
        let timestamp = Some(self.link.epoch.elapsed());
        match buffer.write_payload(bytes, payload, state.block_id, timestamp) {
            Ok(()) => Retrieval {
                buffer,
                status: Ok(()),
            },
            Err(e) => {
                buffer.reset();
                Retrieval {
                    buffer,
                    status: Err(OperationalError::new(
                        OperationalCode::BufferTooSmall,
                        e.to_string(),
                    )),
                }
            }
        }
    }
}

impl Stream for SimStream {
    fn local_address(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 50_000))
    }

    fn parameters(&self) -> &dyn ParameterMap {
        &self.params
    }

    fn queued_buffer_maximum(&self) -> usize {
        self.queue_max
    }

    fn queue_buffer(&self, buffer: Buffer) -> Result<(), (Buffer, StreamError)> {
        let mut state = self.link.state.lock();
        if !state.open {
            return Err((buffer, StreamError::Closed));
        }
        if let Some(error) = state.queue_refusal.clone() {
            return Err((buffer, error));
        }
        if state.queue.len() >= self.queue_max {
            return Err((
                buffer,
                StreamError::QueueFull {
                    maximum: self.queue_max,
                },
            ));
        }
        state.queue.push_back(buffer);
        self.link.changed.notify_all();
        Ok(())
    }

    fn retrieve_buffer(&self, timeout: Duration) -> Result<Retrieval, StreamError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.link.state.lock();
        loop {
            if !state.open {
                return Err(StreamError::Closed);
            }

            if state.aborted {
                if let Some(mut buffer) = state.queue.pop_front() {
                    buffer.reset();
                    return Ok(Retrieval {
                        buffer,
                        status: Err(OperationalError::new(
                            OperationalCode::Aborted,
                            "buffer aborted",
                        )),
                    });
                }
                state.aborted = false;
            }

            let scripted = match state.script.front() {
                Some(SimEvent::TransportFailure { .. }) => true,
                Some(_) => !state.queue.is_empty(),
                None => false,
            };
            if scripted {
                match state.script.pop_front() {
                    Some(SimEvent::TransportFailure { code, description }) => {
                        return Err(StreamError::Transport { code, description });
                    }
                    Some(SimEvent::OperationalFailure(code)) => {
                        if let Some(mut buffer) = state.queue.pop_front() {
                            buffer.reset();
                            return Ok(Retrieval {
                                buffer,
                                status: Err(OperationalError::new(code, "simulated failure")),
                            });
                        }
                    }
                    Some(SimEvent::Deliver { payload, bytes }) => {
                        if let Some(buffer) = state.queue.pop_front() {
                            return Ok(self.deliver(&mut state, buffer, payload, &bytes));
                        }
                    }
                    None => {}
                }
            }

            let now = Instant::now();
            let due = match (state.streaming, state.frame_interval, state.next_frame_at) {
                (true, Some(_), Some(at)) => Some(at),
                _ => None,
            };
            if let Some(at) = due {
                let info = self.device_params.image_info();
                if let (true, Some(info)) = (at <= now, info) {
                    if let Some(buffer) = state.queue.pop_front() {
                        let bytes = test_pattern(info, state.frames_generated);
                        state.frames_generated += 1;
                        state.next_frame_at = state.frame_interval.map(|interval| now + interval);
                        return Ok(self.deliver(&mut state, buffer, Payload::Image(info), &bytes));
                    }
                }
            }

            if now >= deadline {
                return Err(StreamError::Timeout);
            }
            let wake = match due {
                Some(at) if at > now && at < deadline => at,
                _ => deadline,
            };
            self.link.changed.wait_until(&mut state, wake);
        }
    }

    fn abort_queued_buffers(&self) {
        let mut state = self.link.state.lock();
        if !state.queue.is_empty() {
            state.aborted = true;
        }
        self.link.changed.notify_all();
    }

    fn queued_buffer_count(&self) -> usize {
        self.link.state.lock().queue.len()
    }

    fn close(&self) {
        let mut state = self.link.state.lock();
        state.open = false;
        state.streaming = false;
        let queued = state.queue.len();
        state.discarded_on_close += queued;
        state.queue.clear();
        self.link.changed.notify_all();
    }
}
