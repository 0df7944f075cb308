//! Capability interface to a vendor SDK.
//!
//! Every camera backend implements [`Hardware`]. The methods take `&self`
//! so the acquisition thread can sit in [`Hardware::wait_for_frame`] while
//! control calls such as [`Hardware::soft_trigger`] arrive from the
//! remote-call listener; backends do their own internal locking.

pub mod simulated;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::pipeline::Transform;

pub use simulated::SimulatedCamera;

pub type HwResult<T> = std::result::Result<T, HardwareError>;

/// Parameter names pushed to the hardware when arming.
pub mod param {
    pub const EXPOSURE_TIME: &str = "ExposureTime";
    pub const AOI_LEFT: &str = "AOILeft";
    pub const AOI_TOP: &str = "AOITop";
    pub const AOI_WIDTH: &str = "AOIWidth";
    pub const AOI_HEIGHT: &str = "AOIHeight";
    pub const AOI_HBIN: &str = "AOIHBin";
    pub const AOI_VBIN: &str = "AOIVBin";
    pub const TRIGGER_MODE: &str = "TriggerMode";
    pub const SERIAL_NUMBER: &str = "SerialNumber";
    pub const SENSOR_TEMPERATURE: &str = "SensorTemperature";
    pub const FAN_SPEED: &str = "FanSpeed";

    /// Owned by the device settings; changing them alone would break the
    /// frame geometry the pool is sized for.
    pub const MANAGED: &[&str] = &[
        EXPOSURE_TIME,
        AOI_LEFT,
        AOI_TOP,
        AOI_WIDTH,
        AOI_HEIGHT,
        AOI_HBIN,
        AOI_VBIN,
        TRIGGER_MODE,
    ];
}

/// A parameter value as the SDK sees it, also used for constructor arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            ParamValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Text(v) => f.write_str(v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamKind {
    Bool,
    Int,
    Float,
    Text,
    /// Text restricted to the descriptor's `values`.
    Enum,
}

/// What a client needs to know to show or edit one parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDescriptor {
    pub name: String,
    pub kind: ParamKind,
    pub values: Vec<String>,
    pub readonly: bool,
}

impl ParamDescriptor {
    pub fn new(name: &str, kind: ParamKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            values: Vec::new(),
            readonly: false,
        }
    }

    pub fn with_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.values = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn read_only(mut self) -> Self {
        self.readonly = true;
        self
    }
}

/// Result of one wait for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The buffer holds a frame. `timestamp` is derived from the device clock.
    Frame {
        bytes_written: usize,
        timestamp: Duration,
    },
    /// Nothing arrived within the timeout.
    Timeout,
}

/// Vendor status codes.
pub mod status {
    pub const SUCCESS: i32 = 0;
    pub const NOT_INITIALISED: i32 = 1;
    pub const NOT_IMPLEMENTED: i32 = 2;
    pub const READ_ONLY: i32 = 3;
    pub const NOT_READABLE: i32 = 4;
    pub const NOT_WRITABLE: i32 = 5;
    pub const OUT_OF_RANGE: i32 = 6;
    pub const CONNECTION: i32 = 10;
    pub const NO_DATA: i32 = 11;
    pub const INVALID_HANDLE: i32 = 12;
    pub const TIMED_OUT: i32 = 13;
    pub const BUFFER_FULL: i32 = 14;
    pub const INVALID_SIZE: i32 = 15;
    pub const COMM: i32 = 17;
    pub const HARDWARE_OVERFLOW: i32 = 100;
    pub const DEVICE_IN_USE: i32 = 38;
}

static STATUS_NAMES: Lazy<HashMap<i32, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (status::SUCCESS, "SUCCESS"),
        (status::NOT_INITIALISED, "NOTINITIALISED"),
        (status::NOT_IMPLEMENTED, "NOTIMPLEMENTED"),
        (status::READ_ONLY, "READONLY"),
        (status::NOT_READABLE, "NOTREADABLE"),
        (status::NOT_WRITABLE, "NOTWRITABLE"),
        (status::OUT_OF_RANGE, "OUTOFRANGE"),
        (status::CONNECTION, "CONNECTION"),
        (status::NO_DATA, "NODATA"),
        (status::INVALID_HANDLE, "INVALIDHANDLE"),
        (status::TIMED_OUT, "TIMEDOUT"),
        (status::BUFFER_FULL, "BUFFERFULL"),
        (status::INVALID_SIZE, "INVALIDSIZE"),
        (status::COMM, "COMM"),
        (status::DEVICE_IN_USE, "DEVICEINUSE"),
        (status::HARDWARE_OVERFLOW, "HARDWARE_OVERFLOW"),
    ])
});

/// Human-readable name of a vendor status code.
pub fn status_name(code: i32) -> &'static str {
    STATUS_NAMES.get(&code).copied().unwrap_or("UNKNOWN")
}

/// A non-success vendor status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareError {
    pub code: i32,
}

impl HardwareError {
    pub fn new(code: i32) -> Self {
        Self { code }
    }

    pub fn name(&self) -> &'static str {
        status_name(self.code)
    }
}

impl fmt::Display for HardwareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code)
    }
}

impl std::error::Error for HardwareError {}

/// Devices whose identity is only known once the hardware is open.
pub trait FloatingIdentity {
    fn uid(&self) -> HwResult<String>;
}

/// Vendor SDK surface used by the acquisition pipeline.
pub trait Hardware: Send + Sync {
    fn open(&self) -> HwResult<()>;

    fn close(&self) -> HwResult<()>;

    fn get_param(&self, name: &str) -> HwResult<ParamValue>;

    fn set_param(&self, name: &str, value: ParamValue) -> HwResult<()>;

    /// Parameters a client may list, read and possibly write.
    fn describe_params(&self) -> Vec<ParamDescriptor> {
        Vec::new()
    }

    fn start_acquisition(&self) -> HwResult<()>;

    fn stop_acquisition(&self) -> HwResult<()>;

    /// Hand a buffer of `capacity` bytes to the SDK before waiting on it.
    fn queue_buffer(&self, _capacity: usize) -> HwResult<()> {
        Ok(())
    }

    /// Copy the next frame into `buffer`, waiting at most `timeout`.
    fn wait_for_frame(&self, buffer: &mut [u8], timeout: Duration) -> HwResult<WaitOutcome>;

    /// Full sensor size in pixels, `(width, height)`.
    fn sensor_shape(&self) -> (u32, u32);

    fn bytes_per_pixel(&self) -> usize;

    fn supports_soft_trigger(&self) -> bool {
        false
    }

    fn soft_trigger(&self) -> HwResult<()> {
        Err(HardwareError::new(status::NOT_IMPLEMENTED))
    }

    /// Orientation of the sensor readout, corrected before delivery.
    fn readout_transform(&self) -> Transform {
        Transform::IDENTITY
    }

    /// `Some` for floating devices.
    fn floating_identity(&self) -> Option<&dyn FloatingIdentity> {
        None
    }
}
