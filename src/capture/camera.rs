//! Camera session: stream setup, acquisition control and parameter access

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::capture::acquisition::{AcquisitionHandle, AcquisitionState, LoopSettings, StateCell};
use crate::capture::frame::{Frame, PixelFormat};
use crate::device::{Device, ParameterValue, Stream, Transport};
use crate::error::{CameraError, Result};
use crate::parameter::{self, ParameterReading};
use crate::pipeline::{BufferPool, FrameSlot, Released, SlotStats};
use crate::{utils, Config};

/// Everything that lives between `open` and `close`
struct Session<S> {
    stream: Arc<S>,
    pool: Arc<BufferPool>,
    acquisition: AcquisitionHandle,
}

/// One camera and at most one open stream on it
pub struct Camera<D: Device> {
    device: D,
    config: Config,
    session: Option<Session<D::Stream>>,
    slot: Option<Arc<FrameSlot>>,
    state: Arc<StateCell>,
    device_name: Option<String>,
    output_format: Option<PixelFormat>,
    last_release: Option<Released>,
}

impl<D: Device> Camera<D> {
    pub fn new(device: D, config: Config) -> Self {
        Self {
            device,
            config,
            session: None,
            slot: None,
            state: Arc::new(StateCell::new(AcquisitionState::Idle)),
            device_name: None,
            output_format: None,
            last_release: None,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// `DeviceModelName` as read when the stream was opened
    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }

    /// Encoding published frames are expected in, when known
    pub fn output_format(&self) -> Option<PixelFormat> {
        self.output_format
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn acquisition_state(&self) -> AcquisitionState {
        self.state.get()
    }

    /// Buffer accounting of the last `close`
    pub fn last_release(&self) -> Option<Released> {
        self.last_release
    }

    /// Buffers of the open session that have left the stream for good
    pub fn returned_buffers(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.pool.returned())
    }

    /// Counters of the frame slot, zero before the first `open`.
    pub fn frame_stats(&self) -> SlotStats {
        self.slot.as_ref().map(|s| s.stats()).unwrap_or_default()
    }

    /// Open the stream, size and queue the buffer pool, and start the
    /// acquisition thread in the idle state.
    #[instrument(skip(self), fields(connection_id = %self.device.connection_id()))]
    pub fn open(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Err(CameraError::AlreadyOpen);
        }

        let stream = self
            .device
            .open_stream()
            .map_err(|source| CameraError::StreamOpen {
                connection_id: self.device.connection_id().to_owned(),
                source,
            })?;
        let stream = Arc::new(stream);

        match self.start_session(Arc::clone(&stream)) {
            Ok(session) => {
                info!(
                    device = self.device_name.as_deref().unwrap_or("unknown"),
                    buffers = session.pool.len(),
                    "Camera opened"
                );
                self.session = Some(session);
                Ok(())
            }
            Err(e) => {
                stream.close();
                Err(e)
            }
        }
    }

    fn start_session(&mut self, stream: Arc<D::Stream>) -> Result<Session<D::Stream>> {
        self.device_name = self.read_model_name();

        if self.device.transport() == Transport::GigEVision {
            self.configure_gige(stream.as_ref())?;
        }

        self.output_format = if self.config.capture.normalize_format {
            self.negotiate_pixel_format()?
        } else {
            None
        };

        let payload_size = self.device.payload_size()?;
        let pool = Arc::new(BufferPool::allocate(
            stream.as_ref(),
            self.config.capture.buffer_count,
            payload_size,
        )?);

        let slot = Arc::new(FrameSlot::new());
        let acquisition = AcquisitionHandle::spawn(
            Arc::clone(&stream),
            Arc::clone(&pool),
            Arc::clone(&slot),
            Arc::clone(&self.state),
            self.loop_settings(),
        )?;
        self.slot = Some(slot);

        Ok(Session {
            stream,
            pool,
            acquisition,
        })
    }

    fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            retrieve_timeout: Duration::from_millis(self.config.stream.retrieve_timeout_ms),
            drain_timeout: Duration::from_millis(self.config.stream.drain_timeout_ms),
            error_threshold: self.config.pipeline.max_consecutive_errors,
            normalize: self.config.capture.normalize_format,
            pin_core: self.config.capture.pin_core,
        }
    }

    fn read_model_name(&self) -> Option<String> {
        match parameter::get_parameter("DeviceModelName", self.device.parameters()) {
            Ok(Some(ParameterReading::Text(name))) => Some(name),
            Ok(_) => None,
            Err(e) => {
                warn!("Unable to read device model name: {}", e);
                None
            }
        }
    }

    /// Packet size, destination and resend tuning. GigE Vision only.
    fn configure_gige(&self, stream: &D::Stream) -> Result<()> {
        self.device.negotiate_packet_size()?;
        self.device.set_stream_destination(stream.local_address())?;

        let settings = &self.config.stream;
        for (name, value) in [
            ("MaximumResendGroupSize", settings.resend_group_size),
            (
                "MaximumResendRequestRetryByPacket",
                settings.resend_retries_per_packet,
            ),
        ] {
            if let Err(e) = parameter::set_parameter(name, value, stream.parameters()) {
                warn!("Resend tuning skipped: {}", e);
            }
        }
        debug!(destination = %stream.local_address(), "GigE stream configured");
        Ok(())
    }

    /// Switch the sensor to the 8-bit variant of its current encoding and
    /// return the encoding frames will be published in.
    fn negotiate_pixel_format(&self) -> Result<Option<PixelFormat>> {
        let params = self.device.parameters();
        let current = match parameter::get_parameter("PixelFormat", params) {
            Ok(Some(ParameterReading::Enumeration(name))) => name,
            Ok(_) => {
                warn!("PixelFormat not present; keeping the device encoding");
                return Ok(None);
            }
            Err(e) => {
                warn!("Unable to read pixel format, keeping the device encoding: {}", e);
                return Ok(None);
            }
        };

        let Some((target, switch)) = utils::eight_bit_variant(&current) else {
            warn!(format = %current, "Unrecognized pixel format; keeping the device encoding");
            return Ok(None);
        };

        if switch {
            info!(from = %current, to = %target, "Switching to 8-bit pixel format");
            parameter::set_parameter(
                "PixelFormat",
                ParameterValue::Enumeration(target.clone()),
                params,
            )?;
        }

        Ok(PixelFormat::from_name(&target).map(normalized_output))
    }

    /// Stop the acquisition thread, drain and release every buffer, and
    /// close the stream.
    ///
    /// Returns how the acquisition thread ended: `Ok` for a requested stop,
    /// [`CameraError::AcquisitionAborted`] if it gave up on its own.
    #[instrument(skip(self), fields(connection_id = %self.device.connection_id()))]
    pub fn close(&mut self) -> Result<()> {
        let Session {
            stream,
            pool,
            acquisition,
        } = self.session.take().ok_or(CameraError::NotOpen)?;

        let outcome = acquisition.shutdown();
        let released = pool.release_all();
        stream.close();
        self.last_release = Some(released);

        info!(
            allocated = released.allocated,
            returned = released.returned,
            "Camera closed"
        );
        outcome
    }

    /// Begin decoding and publishing frames.
    #[instrument(skip(self))]
    pub fn start_acquisition(&self) -> Result<()> {
        let session = self.session.as_ref().ok_or(CameraError::NotOpen)?;
        self.execute("AcquisitionStart");
        if let Err(e) = self.device.stream_enable() {
            self.execute("AcquisitionStop");
            return Err(e.into());
        }
        session.acquisition.start();
        info!("Acquisition started");
        Ok(())
    }

    /// Stop publishing frames. The acquisition thread stays alive.
    #[instrument(skip(self))]
    pub fn stop_acquisition(&self) -> Result<()> {
        let session = self.session.as_ref().ok_or(CameraError::NotOpen)?;
        session.acquisition.stop();
        self.execute("AcquisitionStop");
        self.device.stream_disable()?;
        info!("Acquisition stopped");
        Ok(())
    }

    fn execute(&self, command: &str) {
        match self.device.parameters().get(command) {
            Some(handle) => {
                if let Err(e) = handle.execute() {
                    warn!(command, "Remote command failed: {}", e);
                }
            }
            None => debug!(command, "Remote command not present"),
        }
    }

    fn slot(&self) -> Result<&FrameSlot> {
        self.slot.as_deref().ok_or(CameraError::NotOpen)
    }

    /// Block until the next frame arrives.
    ///
    /// Fails with [`CameraError::AcquisitionStopped`] once the acquisition
    /// thread has ended.
    pub fn get_image(&self) -> Result<Frame> {
        self.slot()?.consume()
    }

    /// Like [`get_image`](Self::get_image), giving up after `timeout`.
    pub fn get_image_timeout(&self, timeout: Duration) -> Result<Option<Frame>> {
        self.slot()?.consume_timeout(timeout)
    }

    /// The pending frame, without waiting.
    pub fn try_get_image(&self) -> Result<Option<Frame>> {
        self.slot()?.try_consume()
    }

    /// Whether the acquisition thread is still running.
    pub fn is_acquiring(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.acquisition.is_alive())
    }

    pub fn get_parameter(&self, name: &str) -> Result<Option<ParameterReading>> {
        parameter::get_parameter(name, self.device.parameters())
    }

    pub fn set_parameter(&self, name: &str, value: impl Into<ParameterValue>) -> Result<()> {
        parameter::set_parameter(name, value, self.device.parameters())
    }

    pub fn step_parameter(&self, name: &str, delta: f64) -> Result<ParameterValue> {
        parameter::step_parameter(name, delta, self.device.parameters())
    }
}

impl<D: Device> Drop for Camera<D> {
    fn drop(&mut self) {
        if self.session.is_some() {
            if let Err(e) = self.close() {
                warn!("Camera dropped while open: {}", e);
            }
        }
    }
}

/// Encoding the decoder produces for an 8-bit sensor encoding.
fn normalized_output(format: PixelFormat) -> PixelFormat {
    match format {
        PixelFormat::Rgb8 => PixelFormat::Bgr8,
        f if f.bayer_pattern().is_some() => PixelFormat::Rgb8,
        f => f,
    }
}
