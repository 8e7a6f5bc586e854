pub mod handoff;
pub mod pool;

pub use handoff::{FrameSlot, SlotStats};
pub use pool::{pool_size, BufferPool, Released, DEFAULT_BUFFER_COUNT};
