//! Error types for the acquisition pipeline and the device servers.
//!
//! `DeviceError` is what the control surface reports to its caller, local or
//! remote. `ServerError` is what ends a device server or the supervisor, and
//! it decides the process exit code.

use thiserror::Error;

use crate::hardware::HardwareError;
use crate::remote::wire::{RemoteError, RemoteErrorKind, WireError};

/// Convenience alias for control-surface results.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// A vendor call failed. Transient inside the acquirer, surfaced elsewhere.
    #[error("hardware call {call} failed: {name} (code {code})")]
    HardwareCallFailed {
        call: &'static str,
        code: i32,
        name: &'static str,
    },

    #[error("timed out waiting for a frame")]
    AcquisitionTimeout,

    #[error("acquisition stopped after {errors} consecutive hardware errors")]
    AcquisitionFailed { errors: u32 },

    #[error("buffer pool of {requested} bytes exceeds budget of {budget} bytes")]
    OutOfMemory { requested: usize, budget: usize },

    #[error("no host/port mapping for device {0}")]
    EndpointNotFound(String),

    #[error("device does not support software triggering")]
    NoSoftTrigger,

    #[error("frame delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("device has been shut down")]
    ShutDown,

    #[error("remote call failed: {0}")]
    Remote(String),
}

impl DeviceError {
    pub fn hardware(call: &'static str, err: HardwareError) -> Self {
        DeviceError::HardwareCallFailed {
            call,
            code: err.code,
            name: err.name(),
        }
    }

    pub fn kind(&self) -> RemoteErrorKind {
        match self {
            DeviceError::HardwareCallFailed { .. } => RemoteErrorKind::HardwareCallFailed,
            DeviceError::AcquisitionTimeout => RemoteErrorKind::AcquisitionTimeout,
            DeviceError::AcquisitionFailed { .. } => RemoteErrorKind::AcquisitionFailed,
            DeviceError::OutOfMemory { .. } => RemoteErrorKind::OutOfMemory,
            DeviceError::EndpointNotFound(_) => RemoteErrorKind::EndpointNotFound,
            DeviceError::NoSoftTrigger => RemoteErrorKind::NoSoftTrigger,
            DeviceError::DeliveryFailed(_) => RemoteErrorKind::DeliveryFailed,
            DeviceError::InvalidSettings(_) => RemoteErrorKind::InvalidSettings,
            DeviceError::InvalidState(_) => RemoteErrorKind::InvalidState,
            DeviceError::ShutDown => RemoteErrorKind::ShutDown,
            DeviceError::Remote(_) => RemoteErrorKind::Other,
        }
    }
}

impl From<&DeviceError> for RemoteError {
    fn from(err: &DeviceError) -> Self {
        RemoteError {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<RemoteError> for DeviceError {
    fn from(err: RemoteError) -> Self {
        match err.kind {
            RemoteErrorKind::NoSoftTrigger => DeviceError::NoSoftTrigger,
            RemoteErrorKind::AcquisitionTimeout => DeviceError::AcquisitionTimeout,
            RemoteErrorKind::ShutDown => DeviceError::ShutDown,
            RemoteErrorKind::InvalidSettings => DeviceError::InvalidSettings(err.message),
            RemoteErrorKind::EndpointNotFound => DeviceError::EndpointNotFound(err.message),
            RemoteErrorKind::DeliveryFailed => DeviceError::DeliveryFailed(err.message),
            _ => DeviceError::Remote(err.message),
        }
    }
}

impl From<WireError> for DeviceError {
    fn from(err: WireError) -> Self {
        DeviceError::Remote(err.to_string())
    }
}

/// Errors that end a device server process or stop the supervisor.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("unknown device class: {0}")]
    UnknownClass(String),

    #[error("invalid device definition: {0}")]
    InvalidDefinition(String),

    #[error("host or port not found for device {0}")]
    EndpointNotFound(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("failed to launch device server: {0}")]
    Launch(#[source] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl ServerError {
    /// Process exit code reported to whatever manages the device process.
    pub fn exit_code(&self) -> i32 {
        match self {
            ServerError::EndpointNotFound(_) => exit_code::ENDPOINT_NOT_FOUND,
            ServerError::Bind { .. } => exit_code::BIND_FAILED,
            _ => exit_code::INIT_FAILED,
        }
    }
}

/// Exit codes of a device server process.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const INIT_FAILED: i32 = 2;
    pub const ENDPOINT_NOT_FOUND: i32 = 3;
    pub const BIND_FAILED: i32 = 4;

    /// Exits that a restart would only repeat.
    pub fn is_permanent(code: i32) -> bool {
        matches!(code, INIT_FAILED | ENDPOINT_NOT_FOUND)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DeviceError::OutOfMemory {
            requested: 300,
            budget: 200,
        };
        assert_eq!(
            err.to_string(),
            "buffer pool of 300 bytes exceeds budget of 200 bytes"
        );
    }

    #[test]
    fn test_no_soft_trigger_survives_remote_round_trip() {
        let remote = RemoteError::from(&DeviceError::NoSoftTrigger);
        assert_eq!(DeviceError::from(remote), DeviceError::NoSoftTrigger);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            ServerError::EndpointNotFound("foo".into()).exit_code(),
            exit_code::ENDPOINT_NOT_FOUND
        );
        assert_eq!(
            ServerError::UnknownClass("x".into()).exit_code(),
            exit_code::INIT_FAILED
        );
        assert!(exit_code::is_permanent(exit_code::ENDPOINT_NOT_FOUND));
        assert!(!exit_code::is_permanent(1));
    }
}
