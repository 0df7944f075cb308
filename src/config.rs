//! Server settings: which devices to serve and how.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::DeviceRegistry;
use crate::error::ServerError;
use crate::hardware::ParamValue;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerOptions,
    pub pipeline: PipelineOptions,
    pub devices: Vec<DeviceDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    pub log_level: String,
    pub init_retry_secs: u64,
    pub join_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub restart: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            init_retry_secs: 5,
            join_timeout_secs: 10,
            poll_interval_ms: 500,
            restart: true,
        }
    }
}

impl ServerOptions {
    pub fn init_retry(&self) -> Duration {
        Duration::from_secs(self.init_retry_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Per-device pipeline knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    pub pool_budget_bytes: usize,
    pub max_buffers: usize,
    pub wait_timeout_ms: u64,
    pub max_hardware_errors: u32,
    pub inbox_capacity: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            pool_budget_bytes: 256 * 1024 * 1024,
            max_buffers: 32,
            wait_timeout_ms: 500,
            max_hardware_errors: 5,
            inbox_capacity: 32,
        }
    }
}

impl PipelineOptions {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

/// One `[[devices]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDefinition {
    pub class: String,
    pub host: String,
    pub port: u16,
    /// Hardware identity of a floating device.
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub conf: HashMap<String, ParamValue>,
}

impl DeviceDefinition {
    pub fn new(class: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            class: class.into(),
            host: host.into(),
            port,
            uid: None,
            conf: HashMap::new(),
        }
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn with_conf(mut self, key: impl Into<String>, value: ParamValue) -> Self {
        self.conf.insert(key.into(), value);
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Settings {
    /// Read a TOML file, then apply `LABCAM_`-prefixed environment
    /// overrides such as `LABCAM_SERVER__LOG_LEVEL=debug`.
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let raw = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix("LABCAM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(raw.try_deserialize()?)
    }

    /// Check every definition against the known classes.
    pub fn validate(&self, registry: &DeviceRegistry) -> Result<(), ServerError> {
        let mut addrs = HashSet::new();
        for def in &self.devices {
            let class = registry
                .get(&def.class)
                .ok_or_else(|| ServerError::UnknownClass(def.class.clone()))?;
            match (class.floating, &def.uid) {
                (true, None) => {
                    return Err(ServerError::InvalidDefinition(format!(
                        "{} at {} is floating and needs a uid",
                        def.class,
                        def.addr()
                    )))
                }
                (false, Some(uid)) => {
                    return Err(ServerError::InvalidDefinition(format!(
                        "{} at {} is not floating but was given uid {uid}",
                        def.class,
                        def.addr()
                    )))
                }
                _ => {}
            }
            if !addrs.insert((def.host.as_str(), def.port)) {
                return Err(ServerError::InvalidDefinition(format!(
                    "more than one device at {}",
                    def.addr()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::registry::{SIMULATED_CAMERA, SIMULATED_FLOATING_CAMERA};

    fn settings(devices: Vec<DeviceDefinition>) -> Settings {
        Settings {
            devices,
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.server.init_retry(), Duration::from_secs(5));
        assert_eq!(s.pipeline.max_buffers, 32);
        assert!(s.devices.is_empty());
    }

    #[test]
    fn test_validate_floating_rules() {
        let registry = DeviceRegistry::with_builtin();

        let ok = settings(vec![
            DeviceDefinition::new(SIMULATED_CAMERA, "127.0.0.1", 8000),
            DeviceDefinition::new(SIMULATED_FLOATING_CAMERA, "127.0.0.1", 8001).with_uid("foo"),
        ]);
        ok.validate(&registry).unwrap();

        let missing_uid = settings(vec![DeviceDefinition::new(
            SIMULATED_FLOATING_CAMERA,
            "127.0.0.1",
            8001,
        )]);
        assert!(matches!(
            missing_uid.validate(&registry),
            Err(ServerError::InvalidDefinition(_))
        ));

        let stray_uid = settings(vec![
            DeviceDefinition::new(SIMULATED_CAMERA, "127.0.0.1", 8000).with_uid("foo")
        ]);
        assert!(matches!(
            stray_uid.validate(&registry),
            Err(ServerError::InvalidDefinition(_))
        ));

        let unknown = settings(vec![DeviceDefinition::new("laser", "127.0.0.1", 8000)]);
        assert!(matches!(
            unknown.validate(&registry),
            Err(ServerError::UnknownClass(_))
        ));
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let registry = DeviceRegistry::with_builtin();
        let dup = settings(vec![
            DeviceDefinition::new(SIMULATED_CAMERA, "127.0.0.1", 8000),
            DeviceDefinition::new(SIMULATED_CAMERA, "127.0.0.1", 8000),
        ]);
        assert!(dup.validate(&registry).is_err());
    }
}
