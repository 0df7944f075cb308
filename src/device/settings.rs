//! Acquisition settings a client can change at runtime.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DeviceError, DeviceResult};

/// Longest exposure accepted, one hour.
pub const MAX_EXPOSURE_MS: f64 = 3_600_000.0;

/// Region of interest in unbinned sensor pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    pub fn full(sensor: (u32, u32)) -> Self {
        Self {
            left: 0,
            top: 0,
            width: sensor.0,
            height: sensor.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binning {
    pub h: u32,
    pub v: u32,
}

impl Default for Binning {
    fn default() -> Self {
        Self { h: 1, v: 1 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerMode {
    /// Free running at the exposure rate.
    Continuous,
    /// One frame per software trigger.
    Software,
    /// One frame per edge on the trigger input.
    External,
}

impl TriggerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerMode::Continuous => "Continuous",
            TriggerMode::Software => "Software",
            TriggerMode::External => "External",
        }
    }
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerMode {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Continuous" => Ok(TriggerMode::Continuous),
            "Software" => Ok(TriggerMode::Software),
            "External" => Ok(TriggerMode::External),
            other => Err(DeviceError::InvalidSettings(format!(
                "unknown trigger mode {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub exposure_ms: f64,
    pub roi: Roi,
    pub binning: Binning,
    pub trigger_mode: TriggerMode,
}

impl DeviceSettings {
    /// Whole sensor, no binning, software triggered.
    pub fn full_sensor(sensor: (u32, u32)) -> Self {
        Self {
            exposure_ms: 10.0,
            roi: Roi::full(sensor),
            binning: Binning::default(),
            trigger_mode: TriggerMode::Software,
        }
    }

    /// Frame size after cropping and binning, `(width, height)`.
    pub fn frame_shape(&self) -> (u32, u32) {
        (
            self.roi.width / self.binning.h.max(1),
            self.roi.height / self.binning.v.max(1),
        )
    }

    pub fn validate(&self, sensor: (u32, u32)) -> DeviceResult<()> {
        if !(self.exposure_ms > 0.0 && self.exposure_ms <= MAX_EXPOSURE_MS) {
            return Err(DeviceError::InvalidSettings(format!(
                "exposure must be in (0, {MAX_EXPOSURE_MS}] ms, got {} ms",
                self.exposure_ms
            )));
        }
        if self.binning.h == 0 || self.binning.v == 0 {
            return Err(DeviceError::InvalidSettings("binning must be at least 1".into()));
        }
        let roi = &self.roi;
        if roi.width == 0 || roi.height == 0 {
            return Err(DeviceError::InvalidSettings("empty region of interest".into()));
        }
        if roi.left.saturating_add(roi.width) > sensor.0
            || roi.top.saturating_add(roi.height) > sensor.1
        {
            return Err(DeviceError::InvalidSettings(format!(
                "region {}x{}+{}+{} outside {}x{} sensor",
                roi.width, roi.height, roi.left, roi.top, sensor.0, sensor.1
            )));
        }
        if roi.width < self.binning.h || roi.height < self.binning.v {
            return Err(DeviceError::InvalidSettings(
                "binning larger than region of interest".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_shape_applies_binning() {
        let mut settings = DeviceSettings::full_sensor((512, 256));
        settings.binning = Binning { h: 2, v: 4 };
        assert_eq!(settings.frame_shape(), (256, 64));
    }

    #[test]
    fn test_validate_rejects_roi_outside_sensor() {
        let mut settings = DeviceSettings::full_sensor((512, 512));
        settings.roi.left = 10;
        assert!(matches!(
            settings.validate((512, 512)),
            Err(DeviceError::InvalidSettings(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_exposure() {
        let mut settings = DeviceSettings::full_sensor((64, 64));
        settings.exposure_ms = 0.0;
        assert!(settings.validate((64, 64)).is_err());
        settings.exposure_ms = 1.0;
        assert!(settings.validate((64, 64)).is_ok());
    }

    #[test]
    fn test_validate_rejects_unbounded_exposure() {
        let mut settings = DeviceSettings::full_sensor((64, 64));
        for ms in [1e300, f64::INFINITY, f64::NAN, MAX_EXPOSURE_MS * 2.0] {
            settings.exposure_ms = ms;
            assert!(settings.validate((64, 64)).is_err(), "{ms} accepted");
        }
        settings.exposure_ms = MAX_EXPOSURE_MS;
        assert!(settings.validate((64, 64)).is_ok());
    }

    #[test]
    fn test_trigger_mode_parse() {
        assert_eq!("Software".parse::<TriggerMode>().unwrap(), TriggerMode::Software);
        assert!("Bulb".parse::<TriggerMode>().is_err());
    }
}
