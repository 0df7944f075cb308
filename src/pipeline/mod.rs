pub mod correction;
pub mod delivery;
pub mod transform;

pub use correction::CorrectionFrame;
pub use delivery::{DeliveredFrame, DeliveryControl, DeliveryWorker, FrameSink};
pub use transform::Transform;
