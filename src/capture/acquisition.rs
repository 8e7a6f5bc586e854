//! Background retrieval loop
//!
//! One thread per open stream pulls filled buffers, decodes them, publishes
//! the result to the frame slot and hands the buffers back. Commands arrive on
//! a channel; while idle the thread blocks on that channel instead of
//! spinning.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use flume::{Receiver, Sender, TryRecvError};
use tracing::{debug, error, info, warn};

use crate::capture::decoder::{self, DecodedImage};
use crate::capture::frame::{Frame, FrameMetadata};
use crate::device::{Buffer, Retrieval, Stream};
use crate::error::{CameraError, Result};
use crate::pipeline::handoff::{FrameSlot, ProducerGuard};
use crate::pipeline::BufferPool;
use crate::utils;

/// Consecutive failed retrievals that end the session
pub const DEFAULT_ERROR_THRESHOLD: u32 = 10;

/// Lifecycle of the acquisition thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AcquisitionState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Terminated = 3,
}

impl AcquisitionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => AcquisitionState::Idle,
            1 => AcquisitionState::Running,
            2 => AcquisitionState::Stopping,
            _ => AcquisitionState::Terminated,
        }
    }
}

/// State shared between the loop and its owner
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: AcquisitionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> AcquisitionState {
        AcquisitionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: AcquisitionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Start,
    Stop,
    Shutdown,
}

/// Tuning of one acquisition loop
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub retrieve_timeout: Duration,
    pub drain_timeout: Duration,
    pub error_threshold: u32,
    pub normalize: bool,
    pub pin_core: Option<usize>,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            retrieve_timeout: Duration::from_millis(1000),
            drain_timeout: Duration::from_millis(100),
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            normalize: true,
            pin_core: None,
        }
    }
}

/// Consecutive failure counter with the diagnostics collected since the last success
#[derive(Debug)]
pub struct ErrorTracker {
    threshold: u32,
    log: Vec<String>,
}

impl ErrorTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            log: Vec::new(),
        }
    }

    /// Record a failure; true once the threshold is reached.
    pub fn record(&mut self, diagnostic: String) -> bool {
        self.log.push(diagnostic);
        self.count() >= self.threshold
    }

    pub fn reset(&mut self) {
        self.log.clear();
    }

    pub fn count(&self) -> u32 {
        self.log.len() as u32
    }

    pub fn diagnostics(&self) -> &[String] {
        &self.log
    }

    fn into_error(self) -> CameraError {
        CameraError::AcquisitionAborted {
            consecutive: self.count(),
            diagnostics: self.log,
        }
    }
}

/// Owner side of a running acquisition thread
pub(crate) struct AcquisitionHandle {
    commands: Sender<Command>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl AcquisitionHandle {
    /// Start the loop on its own thread, initially idle.
    pub(crate) fn spawn<S: Stream>(
        stream: Arc<S>,
        pool: Arc<BufferPool>,
        slot: Arc<FrameSlot>,
        state: Arc<StateCell>,
        settings: LoopSettings,
    ) -> Result<Self> {
        let (commands, inbox) = flume::unbounded();
        state.set(AcquisitionState::Idle);

        let worker = AcquisitionLoop {
            stream,
            pool,
            slot,
            state,
            inbox,
            settings,
            sequence: AtomicU64::new(0),
            running: false,
        };
        let thread = thread::Builder::new()
            .name("argus-acquisition".into())
            .spawn(move || worker.run())
            .map_err(CameraError::Spawn)?;

        Ok(Self {
            commands,
            thread: Some(thread),
        })
    }

    pub(crate) fn start(&self) {
        self.send(Command::Start);
    }

    pub(crate) fn stop(&self) {
        self.send(Command::Stop);
    }

    fn send(&self, command: Command) {
        // A closed inbox means the loop already exited; its state says so.
        if self.commands.send(command).is_err() {
            debug!(?command, "Acquisition loop already exited");
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Ask the loop to exit and wait for it. Returns the loop's own result.
    pub(crate) fn shutdown(mut self) -> Result<()> {
        self.send(Command::Shutdown);
        self.join()
    }

    fn join(&mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| CameraError::TaskPanicked)?,
            None => Ok(()),
        }
    }
}

impl Drop for AcquisitionHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.send(Command::Shutdown);
            if let Err(e) = self.join() {
                warn!("Acquisition ended with error: {}", e);
            }
        }
    }
}

struct AcquisitionLoop<S> {
    stream: Arc<S>,
    pool: Arc<BufferPool>,
    slot: Arc<FrameSlot>,
    state: Arc<StateCell>,
    inbox: Receiver<Command>,
    settings: LoopSettings,
    sequence: AtomicU64,
    running: bool,
}

impl<S: Stream> AcquisitionLoop<S> {
    fn run(mut self) -> Result<()> {
        let _producer = ProducerGuard::new(Arc::clone(&self.slot));
        if let Some(core) = self.settings.pin_core {
            utils::pin_current_thread(core);
        }

        info!("Acquisition thread started");
        let outcome = self.retrieve_loop();

        self.state.set(AcquisitionState::Stopping);
        self.drain();
        self.state.set(AcquisitionState::Terminated);
        info!(ok = outcome.is_ok(), "Acquisition thread finished");
        outcome
    }

    fn retrieve_loop(&mut self) -> Result<()> {
        let mut errors = ErrorTracker::new(self.settings.error_threshold);

        loop {
            if let Some(command) = self.next_command() {
                match command {
                    Command::Start => {
                        self.running = true;
                        self.state.set(AcquisitionState::Running);
                    }
                    Command::Stop => {
                        self.running = false;
                        self.state.set(AcquisitionState::Idle);
                    }
                    Command::Shutdown => return Ok(()),
                }
                continue;
            }

            match self.stream.retrieve_buffer(self.settings.retrieve_timeout) {
                Ok(Retrieval {
                    buffer,
                    status: Ok(()),
                }) => {
                    errors.reset();
                    self.process(&buffer);
                    self.requeue(buffer);
                }
                Ok(Retrieval {
                    buffer,
                    status: Err(op),
                }) => {
                    metrics::counter!("retrieve_errors").increment(1);
                    let abort = errors.record(format!("Operational result: {op}"));
                    self.requeue(buffer);
                    if abort {
                        return Err(self.abort(errors));
                    }
                }
                Err(e) => {
                    metrics::counter!("retrieve_errors").increment(1);
                    if errors.record(format!("Result: {e}")) {
                        return Err(self.abort(errors));
                    }
                }
            }
        }
    }

    /// Next pending command. Blocks while idle; never blocks while running.
    fn next_command(&self) -> Option<Command> {
        if self.running {
            match self.inbox.try_recv() {
                Ok(command) => Some(command),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => Some(Command::Shutdown),
            }
        } else {
            Some(self.inbox.recv().unwrap_or(Command::Shutdown))
        }
    }

    fn abort(&self, errors: ErrorTracker) -> CameraError {
        error!(
            consecutive = errors.count(),
            "Too many consecutive errors, aborting acquisition"
        );
        for diagnostic in errors.diagnostics() {
            error!("{}", diagnostic);
        }
        errors.into_error()
    }

    fn process(&self, buffer: &Buffer) {
        let started = Instant::now();
        let decoded = decoder::decode_payload(buffer, self.settings.normalize);
        metrics::histogram!("decode_time_us").record(started.elapsed().as_micros() as f64);

        match decoded {
            Some(image) if !image.is_empty() => {
                let frame = self.frame(buffer, image);
                self.slot.publish(frame);
                metrics::counter!("frames_published").increment(1);
            }
            _ => {}
        }
    }

    fn frame(&self, buffer: &Buffer, image: DecodedImage) -> Frame {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        Frame::new(
            Bytes::from(image.pixels),
            FrameMetadata {
                sequence,
                width: image.width,
                height: image.height,
                stride: image.stride,
                format: image.format,
                block_id: buffer.block_id(),
                device_timestamp: buffer.timestamp(),
            },
        )
    }

    /// Hand a buffer back to the stream, or to the pool if the stream refuses it.
    fn requeue(&self, buffer: Buffer) {
        if let Err((buffer, e)) = self.stream.queue_buffer(buffer) {
            warn!(buffer = buffer.id(), "Failed to re-queue buffer: {}", e);
            self.pool.reclaim(buffer);
        }
    }

    /// Abort whatever is still queued and return it all to the pool.
    fn drain(&self) {
        self.stream.abort_queued_buffers();
        let mut drained = 0usize;
        while self.stream.queued_buffer_count() > 0 {
            match self.stream.retrieve_buffer(self.settings.drain_timeout) {
                Ok(Retrieval { buffer, .. }) => {
                    self.pool.reclaim(buffer);
                    drained += 1;
                }
                Err(e) => {
                    warn!(
                        remaining = self.stream.queued_buffer_count(),
                        "Stopped draining stream: {}", e
                    );
                    break;
                }
            }
        }
        debug!(drained, "Stream drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_trips_at_threshold() {
        let mut errors = ErrorTracker::new(3);
        assert!(!errors.record("a".into()));
        assert!(!errors.record("b".into()));
        assert!(errors.record("c".into()));
        assert_eq!(errors.diagnostics(), ["a", "b", "c"]);
    }

    #[test]
    fn success_resets_the_count() {
        let mut errors = ErrorTracker::new(10);
        for i in 0..9 {
            assert!(!errors.record(format!("error {i}")));
        }
        errors.reset();
        assert_eq!(errors.count(), 0);
        for i in 0..9 {
            assert!(!errors.record(format!("error {i}")));
        }
        assert!(errors.record("tenth".into()));

        match errors.into_error() {
            CameraError::AcquisitionAborted {
                consecutive,
                diagnostics,
            } => {
                assert_eq!(consecutive, 10);
                assert_eq!(diagnostics.last().map(String::as_str), Some("tenth"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn state_cell_round_trips() {
        let cell = StateCell::new(AcquisitionState::Idle);
        for state in [
            AcquisitionState::Running,
            AcquisitionState::Stopping,
            AcquisitionState::Terminated,
            AcquisitionState::Idle,
        ] {
            cell.set(state);
            assert_eq!(cell.get(), state);
        }
    }
}
