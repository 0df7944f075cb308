//! Camera acquisition and delivery servers for laboratory imaging hardware.
//!
//! Each configured device runs in its own process. A producer thread fills
//! a bounded pool of reusable frame buffers from the hardware, a delivery
//! thread pushes finished frames to the one registered consumer, and a TCP
//! control surface lets clients enable, configure and trigger the device.

pub mod capture;
pub mod config;
pub mod device;
pub mod error;
pub mod hardware;
pub mod pipeline;
pub mod remote;
pub mod server;
pub mod utils;

pub use config::{DeviceDefinition, PipelineOptions, ServerOptions, Settings};
pub use device::{Device, DeviceControl, DeviceStatus};
pub use error::{DeviceError, DeviceResult, ServerError};
