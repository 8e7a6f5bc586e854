//! Fixed pool of payload buffers circulating through the stream

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::device::{Buffer, Stream};
use crate::error::Result;

/// Default cap on the number of buffers per stream
pub const DEFAULT_BUFFER_COUNT: usize = 16;

/// Number of buffers to allocate: the configured cap, limited by what the
/// stream will admit.
pub fn pool_size(configured_cap: usize, stream_maximum: usize) -> usize {
    configured_cap.min(stream_maximum)
}

/// Outcome of [`BufferPool::release_all`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Released {
    pub allocated: usize,
    /// Buffers handed back to the pool and freed
    pub returned: usize,
}

impl Released {
    /// Buffers that never came back
    pub fn missing(&self) -> usize {
        self.allocated.saturating_sub(self.returned)
    }
}

/// Owner of the buffers created for one stream.
///
/// Buffers are allocated once, at the device payload size, and queued
/// straight into the stream. While the session runs each one alternates
/// between the stream queue and the acquisition loop. A buffer leaving that
/// cycle (refused on requeue, drained at shutdown) is handed back with
/// [`reclaim`](Self::reclaim) and stays here until [`release_all`](Self::release_all).
#[derive(Debug)]
pub struct BufferPool {
    allocated: usize,
    buffer_size: usize,
    returned: Mutex<Vec<Buffer>>,
}

impl BufferPool {
    /// Create `min(cap, stream maximum)` buffers of `buffer_size` bytes and
    /// queue all of them.
    pub fn allocate<S: Stream + ?Sized>(
        stream: &S,
        configured_cap: usize,
        buffer_size: usize,
    ) -> Result<Self> {
        let count = pool_size(configured_cap, stream.queued_buffer_maximum());
        if count == 0 {
            warn!("Stream admits no buffers; acquisition will not receive frames");
        }

        for id in 0..count as u64 {
            if let Err((_, e)) = stream.queue_buffer(Buffer::new(id, buffer_size)) {
                return Err(e.into());
            }
        }

        info!(
            count,
            buffer_size,
            total_mb = (count * buffer_size) as f64 / (1024.0 * 1024.0),
            "Buffer pool queued"
        );

        Ok(Self {
            allocated: count,
            buffer_size,
            returned: Mutex::new(Vec::with_capacity(count)),
        })
    }

    pub fn len(&self) -> usize {
        self.allocated
    }

    pub fn is_empty(&self) -> bool {
        self.allocated == 0
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Take back a buffer that left the stream for good.
    pub fn reclaim(&self, mut buffer: Buffer) {
        buffer.reset();
        self.returned.lock().push(buffer);
    }

    /// Buffers handed back so far
    pub fn returned(&self) -> usize {
        self.returned.lock().len()
    }

    /// Free every returned buffer. Call once the stream has been drained.
    pub fn release_all(&self) -> Released {
        let returned = std::mem::take(&mut *self.returned.lock()).len();
        let released = Released {
            allocated: self.allocated,
            returned,
        };
        if released.missing() > 0 {
            warn!(
                missing = released.missing(),
                allocated = released.allocated,
                "Buffers not returned to the pool"
            );
        }
        released
    }
}
