//! Maps configured class names to hardware constructors.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use crate::error::{DeviceError, DeviceResult};
use crate::hardware::simulated::{SimulatedCamera, SimulatedConfig};
use crate::hardware::{Hardware, ParamValue};
use crate::pipeline::Transform;

pub const SIMULATED_CAMERA: &str = "simulated-camera";
pub const SIMULATED_FLOATING_CAMERA: &str = "simulated-floating-camera";

/// Construction arguments of one device.
#[derive(Debug, Clone, Default)]
pub struct DeviceArgs {
    pub conf: HashMap<String, ParamValue>,
    /// Position among the definitions of the same class.
    pub index: usize,
}

impl DeviceArgs {
    pub fn int(&self, key: &str) -> DeviceResult<Option<i64>> {
        self.conf
            .get(key)
            .map(|v| v.as_int().ok_or_else(|| bad_arg(key, v, "an integer")))
            .transpose()
    }

    pub fn bool(&self, key: &str) -> DeviceResult<Option<bool>> {
        self.conf
            .get(key)
            .map(|v| v.as_bool().ok_or_else(|| bad_arg(key, v, "a boolean")))
            .transpose()
    }

    pub fn text(&self, key: &str) -> DeviceResult<Option<String>> {
        self.conf
            .get(key)
            .map(|v| {
                v.as_text()
                    .map(str::to_owned)
                    .ok_or_else(|| bad_arg(key, v, "a string"))
            })
            .transpose()
    }

    fn positive(&self, key: &str) -> DeviceResult<Option<u32>> {
        match self.int(key)? {
            Some(v) if v > 0 && v <= u32::MAX as i64 => Ok(Some(v as u32)),
            Some(v) => Err(DeviceError::InvalidSettings(format!(
                "`{key}` must be positive, got {v}"
            ))),
            None => Ok(None),
        }
    }
}

fn bad_arg(key: &str, value: &ParamValue, expected: &str) -> DeviceError {
    DeviceError::InvalidSettings(format!("`{key}` must be {expected}, got {value}"))
}

pub type BuildFn = dyn Fn(&DeviceArgs) -> DeviceResult<Arc<dyn Hardware>> + Send + Sync;

#[derive(Clone)]
pub struct DeviceClass {
    /// Instances are told apart by a hardware identity rather than by position.
    pub floating: bool,
    pub build: Arc<BuildFn>,
}

impl DeviceClass {
    pub fn new<F>(floating: bool, build: F) -> Self
    where
        F: Fn(&DeviceArgs) -> DeviceResult<Arc<dyn Hardware>> + Send + Sync + 'static,
    {
        Self {
            floating,
            build: Arc::new(build),
        }
    }
}

impl fmt::Debug for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceClass")
            .field("floating", &self.floating)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    classes: HashMap<String, DeviceClass>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the simulated camera classes.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(SIMULATED_CAMERA, DeviceClass::new(false, |args| simulated(args, false)));
        registry.register(
            SIMULATED_FLOATING_CAMERA,
            DeviceClass::new(true, |args| simulated(args, true)),
        );
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, class: DeviceClass) {
        self.classes.insert(name.into(), class);
    }

    pub fn get(&self, name: &str) -> Option<&DeviceClass> {
        self.classes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }
}

fn simulated(args: &DeviceArgs, floating: bool) -> DeviceResult<Arc<dyn Hardware>> {
    let defaults = SimulatedConfig::default();
    let bytes_per_pixel = match args.int("bytes_per_pixel")? {
        None => defaults.bytes_per_pixel,
        Some(v @ (1 | 2)) => v as usize,
        Some(v) => {
            return Err(DeviceError::InvalidSettings(format!(
                "`bytes_per_pixel` must be 1 or 2, got {v}"
            )))
        }
    };
    let serial = match args.text("serial")? {
        Some(serial) => serial,
        None => format!("SIM{:04}", args.index),
    };
    let config = SimulatedConfig {
        width: args.positive("width")?.unwrap_or(defaults.width),
        height: args.positive("height")?.unwrap_or(defaults.height),
        bytes_per_pixel,
        serial,
        soft_trigger: args.bool("soft_trigger")?.unwrap_or(defaults.soft_trigger),
        floating,
        readout: Transform::new(
            args.bool("readout_flip_lr")?.unwrap_or(false),
            args.bool("readout_flip_ud")?.unwrap_or(false),
            args.bool("readout_rot90")?.unwrap_or(false),
        ),
    };
    let mut camera = SimulatedCamera::new(config);
    if let Some(n) = args.int("fail_opens")?.filter(|n| *n > 0) {
        let remaining = u32::try_from(n).unwrap_or(u32::MAX);
        camera = camera.with_open_failures(Arc::new(AtomicU32::new(remaining)));
    }
    Ok(Arc::new(camera))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, ParamValue)]) -> DeviceArgs {
        DeviceArgs {
            conf: pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            index: 0,
        }
    }

    #[test]
    fn test_builtin_classes() {
        let registry = DeviceRegistry::with_builtin();
        assert!(!registry.get(SIMULATED_CAMERA).unwrap().floating);
        assert!(registry.get(SIMULATED_FLOATING_CAMERA).unwrap().floating);
        assert!(registry.get("andor-zyla").is_none());
    }

    #[test]
    fn test_simulated_conf() {
        let registry = DeviceRegistry::with_builtin();
        let class = registry.get(SIMULATED_CAMERA).unwrap();
        let hw = (class.build)(&args(&[
            ("width", ParamValue::Int(64)),
            ("height", ParamValue::Int(32)),
            ("bytes_per_pixel", ParamValue::Int(1)),
            ("readout_rot90", ParamValue::Bool(true)),
        ]))
        .unwrap();
        assert_eq!(hw.sensor_shape(), (64, 32));
        assert_eq!(hw.bytes_per_pixel(), 1);
        assert!(hw.floating_identity().is_none());
        assert_eq!(hw.readout_transform(), Transform::new(false, false, true));
    }

    #[test]
    fn test_bad_conf_rejected() {
        let registry = DeviceRegistry::with_builtin();
        let class = registry.get(SIMULATED_CAMERA).unwrap();
        for conf in [
            args(&[("width", ParamValue::Text("wide".into()))]),
            args(&[("height", ParamValue::Int(-1))]),
            args(&[("bytes_per_pixel", ParamValue::Int(3))]),
        ] {
            assert!(matches!((class.build)(&conf), Err(DeviceError::InvalidSettings(_))));
        }
    }
}
