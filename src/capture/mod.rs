pub mod acquirer;
pub mod frame;
pub mod pool;

pub use acquirer::{Acquirer, AcquirerState};
pub use frame::{Frame, FrameMetadata, PixelFormat};
pub use pool::{BufferPool, FrameGeometry, PoolStats};
