pub mod acquisition;
pub mod camera;
pub mod decoder;
pub mod frame;

pub use acquisition::AcquisitionState;
pub use camera::Camera;
pub use frame::{Frame, FrameMetadata, PixelFormat};
