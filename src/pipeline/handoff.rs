//! Single-slot latest-frame store between the acquisition thread and consumers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::capture::Frame;
use crate::error::{CameraError, Result};

/// Latest-frame slot.
///
/// The producer overwrites, never blocks, and never queues: a consumer slower
/// than the camera only ever sees the newest frame. Each published frame is
/// delivered at most once.
pub struct FrameSlot {
    state: Mutex<SlotState>,
    ready: Condvar,

    /// Statistics
    stats: CachePadded<Stats>,
}

struct SlotState {
    frame: Option<Frame>,
    producer_alive: bool,
}

#[derive(Default)]
struct Stats {
    published: AtomicU64,
    consumed: AtomicU64,
    overwritten: AtomicU64,
}

/// Counters of a [`FrameSlot`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStats {
    pub published: u64,
    pub consumed: u64,
    /// Frames replaced before anyone consumed them
    pub overwritten: u64,
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                frame: None,
                producer_alive: true,
            }),
            ready: Condvar::new(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: replace the slot contents and wake a waiting consumer.
    pub fn publish(&self, frame: Frame) {
        let mut state = self.state.lock();
        if state.frame.replace(frame).is_some() {
            self.stats.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        drop(state);
        self.ready.notify_one();
    }

    /// Consumer: block until a frame is available and take it.
    ///
    /// Fails with [`CameraError::AcquisitionStopped`] once the producer is
    /// gone, since no frame will ever arrive.
    pub fn consume(&self) -> Result<Frame> {
        let mut state = self.state.lock();
        loop {
            if !state.producer_alive {
                return Err(CameraError::AcquisitionStopped);
            }
            if let Some(frame) = state.frame.take() {
                self.stats.consumed.fetch_add(1, Ordering::Relaxed);
                return Ok(frame);
            }
            self.ready.wait(&mut state);
        }
    }

    /// Like [`consume`](Self::consume) but gives up after `timeout`, returning `Ok(None)`.
    pub fn consume_timeout(&self, timeout: Duration) -> Result<Option<Frame>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if !state.producer_alive {
                return Err(CameraError::AcquisitionStopped);
            }
            if let Some(frame) = state.frame.take() {
                self.stats.consumed.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(frame));
            }
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                return Ok(None);
            }
        }
    }

    /// Take the pending frame, if any, without waiting.
    pub fn try_consume(&self) -> Result<Option<Frame>> {
        self.consume_timeout(Duration::ZERO)
    }

    pub fn is_producer_alive(&self) -> bool {
        self.state.lock().producer_alive
    }

    /// Mark the producer as gone and release every waiting consumer.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.producer_alive = false;
        drop(state);
        self.ready.notify_all();
    }

    pub fn stats(&self) -> SlotStats {
        SlotStats {
            published: self.stats.published.load(Ordering::Relaxed),
            consumed: self.stats.consumed.load(Ordering::Relaxed),
            overwritten: self.stats.overwritten.load(Ordering::Relaxed),
        }
    }
}

/// Closes the slot when the producing thread ends, including by unwinding.
pub(crate) struct ProducerGuard {
    slot: Arc<FrameSlot>,
}

impl ProducerGuard {
    pub(crate) fn new(slot: Arc<FrameSlot>) -> Self {
        Self { slot }
    }
}

impl Drop for ProducerGuard {
    fn drop(&mut self) {
        self.slot.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::{FrameMetadata, PixelFormat};
    use bytes::Bytes;
    use std::thread;

    fn frame(sequence: u64, fill: u8) -> Frame {
        Frame::new(
            Bytes::from(vec![fill; 4]),
            FrameMetadata {
                sequence,
                width: 2,
                height: 2,
                stride: 2,
                format: PixelFormat::Mono8,
                block_id: sequence,
                device_timestamp: None,
            },
        )
    }

    #[test]
    fn publish_then_consume_delivers_exactly_once() {
        let slot = FrameSlot::new();
        slot.publish(frame(1, 7));

        let got = slot.consume().unwrap();
        assert_eq!(got.meta.sequence, 1);
        assert_eq!(&got.data[..], &[7, 7, 7, 7]);

        // Nothing left: a second pull must wait
        assert!(slot
            .consume_timeout(Duration::from_millis(30))
            .unwrap()
            .is_none());
        assert!(slot.try_consume().unwrap().is_none());
    }

    #[test]
    fn slow_consumer_sees_only_latest() {
        let slot = FrameSlot::new();
        for seq in 1..=5 {
            slot.publish(frame(seq, seq as u8));
        }
        assert_eq!(slot.consume().unwrap().meta.sequence, 5);
        assert_eq!(
            slot.stats(),
            SlotStats {
                published: 5,
                consumed: 1,
                overwritten: 4
            }
        );
    }

    #[test]
    fn blocked_consumer_wakes_on_publish() {
        let slot = Arc::new(FrameSlot::new());
        let consumer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.consume())
        };
        thread::sleep(Duration::from_millis(20));
        slot.publish(frame(9, 1));
        assert_eq!(consumer.join().unwrap().unwrap().meta.sequence, 9);
    }

    #[test]
    fn closed_slot_fails_waiting_and_future_consumers() {
        let slot = Arc::new(FrameSlot::new());
        let consumer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.consume())
        };
        thread::sleep(Duration::from_millis(20));
        drop(ProducerGuard::new(Arc::clone(&slot)));

        assert!(matches!(
            consumer.join().unwrap(),
            Err(CameraError::AcquisitionStopped)
        ));
        slot.publish(frame(1, 1));
        assert!(matches!(
            slot.consume(),
            Err(CameraError::AcquisitionStopped)
        ));
        assert!(!slot.is_producer_alive());
    }
}
