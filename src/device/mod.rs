//! A camera behind a uniform control surface.
//!
//! `Device` owns one buffer pool, one acquirer and one delivery worker and
//! starts and stops them as a unit. [`DeviceControl`] is the set of calls a
//! client can make; `Device` implements it locally and
//! [`crate::remote::DeviceClient`] implements it over the network.

pub mod registry;
pub mod settings;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::capture::acquirer::{Acquirer, AcquirerOptions, AcquirerState};
use crate::capture::frame::PixelFormat;
use crate::capture::pool::{BufferPool, FrameGeometry, PoolStats};
use crate::error::{DeviceError, DeviceResult};
use crate::hardware::{param, Hardware, ParamDescriptor, ParamValue};
use crate::pipeline::{CorrectionFrame, DeliveryControl, DeliveryWorker, FrameSink, Transform};
use crate::remote::consumer::{EndpointRef, RemoteSink};
use crate::config::PipelineOptions;

pub use registry::{DeviceArgs, DeviceClass, DeviceRegistry};
pub use settings::{Binning, DeviceSettings, Roi, TriggerMode};

/// Calls a client can make on a device, wherever it lives.
pub trait DeviceControl: Send + Sync {
    fn enable(&self) -> DeviceResult<()>;

    fn disable(&self) -> DeviceResult<()>;

    /// Apply new settings, pausing acquisition around the change.
    fn configure(&self, settings: DeviceSettings) -> DeviceResult<()>;

    fn settings(&self) -> DeviceResult<DeviceSettings>;

    fn status(&self) -> DeviceResult<DeviceStatus>;

    /// Register the consumer frames are pushed to; `None` clears it.
    fn set_client(&self, endpoint: Option<EndpointRef>) -> DeviceResult<()>;

    fn trigger(&self) -> DeviceResult<()>;

    fn go_silent(&self) -> DeviceResult<()>;

    fn go_loud(&self) -> DeviceResult<()>;

    fn set_correction(&self, correction: Option<CorrectionFrame>) -> DeviceResult<()>;

    fn get_id(&self) -> DeviceResult<String>;

    /// Orientation applied to delivered frames, relative to the sensor's
    /// natural readout.
    fn set_transform(&self, transform: Transform) -> DeviceResult<()>;

    fn transform(&self) -> DeviceResult<Transform>;

    fn describe_settings(&self) -> DeviceResult<Vec<ParamDescriptor>>;

    fn get_setting(&self, name: &str) -> DeviceResult<ParamValue>;

    /// Write one hardware parameter. Parameters covered by
    /// [`DeviceSettings`] go through `configure` instead.
    fn set_setting(&self, name: &str, value: ParamValue) -> DeviceResult<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub name: String,
    pub enabled: bool,
    pub acquirer: AcquirerState,
    pub width: u32,
    pub height: u32,
    pub delivery_enabled: bool,
    pub has_client: bool,
    pub pool: PoolStats,
    pub failure: Option<String>,
}

struct Inner {
    acquirer: Acquirer,
    delivery: DeliveryWorker,
    settings: DeviceSettings,
    enabled: bool,
    initialized: bool,
    shut_down: bool,
}

pub struct Device {
    name: String,
    hardware: Arc<dyn Hardware>,
    pool: Arc<BufferPool>,
    delivery: Arc<DeliveryControl>,
    max_buffers: usize,
    inner: Mutex<Inner>,
}

impl Device {
    pub fn new(name: impl Into<String>, hardware: Arc<dyn Hardware>, pipeline: &PipelineOptions) -> Self {
        let pool = Arc::new(BufferPool::new(pipeline.pool_budget_bytes));
        let delivery = Arc::new(DeliveryControl::default());
        delivery.set_transform(hardware.readout_transform());
        let options = AcquirerOptions {
            wait_timeout: pipeline.wait_timeout(),
            max_errors: pipeline.max_hardware_errors,
        };
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                acquirer: Acquirer::new(hardware.clone(), options),
                delivery: DeliveryWorker::new(pool.clone(), delivery.clone()),
                settings: DeviceSettings::full_sensor(hardware.sensor_shape()),
                enabled: false,
                initialized: false,
                shut_down: false,
            }),
            hardware,
            pool,
            delivery,
            max_buffers: pipeline.max_buffers,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hardware(&self) -> &Arc<dyn Hardware> {
        &self.hardware
    }

    pub fn is_floating(&self) -> bool {
        self.hardware.floating_identity().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the hardware and size the pool for the full sensor.
    #[instrument(skip(self), fields(device = %self.name))]
    pub fn initialize(&self) -> DeviceResult<()> {
        let mut inner = self.lock();
        if inner.shut_down {
            return Err(DeviceError::ShutDown);
        }
        self.hardware
            .open()
            .map_err(|e| DeviceError::hardware("open", e))?;
        let settings = DeviceSettings::full_sensor(self.hardware.sensor_shape());
        if let Err(e) = self.apply(&mut inner, settings) {
            let _ = self.hardware.close();
            return Err(e);
        }
        inner.initialized = true;
        info!("device initialized");
        Ok(())
    }

    /// Register a local sink directly, bypassing the network.
    pub fn set_sink(&self, sink: Option<Arc<dyn FrameSink>>) {
        self.delivery.set_sink(sink);
    }

    /// Frame size consumers currently receive.
    pub fn frame_shape(&self) -> (u32, u32) {
        self.lock().settings.frame_shape()
    }

    /// Stop everything and release the pool and the hardware. Safe to call twice.
    #[instrument(skip(self), fields(device = %self.name))]
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        if inner.shut_down {
            return;
        }
        Self::stop_locked(&mut inner);
        self.delivery.set_sink(None);
        self.pool.clear();
        if let Err(e) = self.hardware.close() {
            warn!("failed to close hardware: {}", e);
        }
        inner.shut_down = true;
        info!("device shut down");
    }

    fn geometry(&self, settings: &DeviceSettings) -> DeviceResult<FrameGeometry> {
        let bpp = self.hardware.bytes_per_pixel();
        let format = PixelFormat::from_bytes_per_pixel(bpp).ok_or_else(|| {
            DeviceError::InvalidSettings(format!("unsupported pixel depth of {bpp} bytes"))
        })?;
        let (width, height) = settings.frame_shape();
        Ok(FrameGeometry {
            width,
            height,
            format,
        })
    }

    /// Arm the hardware and resize the pool. On error the previous
    /// settings and pool stay in force.
    fn apply(&self, inner: &mut Inner, settings: DeviceSettings) -> DeviceResult<()> {
        settings.validate(self.hardware.sensor_shape())?;
        let geometry = self.geometry(&settings)?;
        let frame_bytes = geometry.frame_bytes();
        let count = self.pool.buffers_for(frame_bytes, self.max_buffers);
        if count == 0 {
            return Err(DeviceError::OutOfMemory {
                requested: frame_bytes,
                budget: self.pool.budget(),
            });
        }

        inner.acquirer.arm(&settings)?;
        self.pool.allocate(count, geometry)?;
        inner.settings = settings;
        Ok(())
    }

    fn start_locked(&self, inner: &mut Inner) -> DeviceResult<()> {
        inner.acquirer.arm(&inner.settings)?;
        inner.acquirer.start(self.pool.clone())?;
        if let Err(e) = inner.delivery.start() {
            inner.acquirer.stop();
            return Err(e);
        }
        inner.enabled = true;
        Ok(())
    }

    fn stop_locked(inner: &mut Inner) {
        inner.acquirer.stop();
        inner.delivery.stop();
        inner.enabled = false;
    }
}

impl DeviceControl for Device {
    #[instrument(skip(self), fields(device = %self.name))]
    fn enable(&self) -> DeviceResult<()> {
        let mut inner = self.lock();
        if inner.shut_down {
            return Err(DeviceError::ShutDown);
        }
        if !inner.initialized {
            return Err(DeviceError::InvalidState("device not initialized"));
        }
        if inner.enabled && inner.acquirer.state() == AcquirerState::Running {
            return Ok(());
        }
        // A previous run may have ended on its own.
        Self::stop_locked(&mut inner);
        self.start_locked(&mut inner)?;
        info!("enabled");
        Ok(())
    }

    #[instrument(skip(self), fields(device = %self.name))]
    fn disable(&self) -> DeviceResult<()> {
        let mut inner = self.lock();
        Self::stop_locked(&mut inner);
        info!("disabled");
        Ok(())
    }

    #[instrument(skip(self, settings), fields(device = %self.name))]
    fn configure(&self, settings: DeviceSettings) -> DeviceResult<()> {
        settings.validate(self.hardware.sensor_shape())?;
        let mut inner = self.lock();
        if inner.shut_down {
            return Err(DeviceError::ShutDown);
        }
        let was_running = inner.enabled;
        if was_running {
            Self::stop_locked(&mut inner);
        }

        let applied = self.apply(&mut inner, settings);
        if let Err(e) = &applied {
            warn!("settings rejected, keeping previous: {}", e);
        }

        if was_running {
            self.start_locked(&mut inner)?;
        }
        let (width, height) = inner.settings.frame_shape();
        info!(width, height, restarted = was_running, "configured");
        applied
    }

    fn settings(&self) -> DeviceResult<DeviceSettings> {
        Ok(self.lock().settings.clone())
    }

    fn status(&self) -> DeviceResult<DeviceStatus> {
        let inner = self.lock();
        let (width, height) = inner.settings.frame_shape();
        Ok(DeviceStatus {
            name: self.name.clone(),
            enabled: inner.enabled,
            acquirer: inner.acquirer.state(),
            width,
            height,
            delivery_enabled: self.delivery.is_enabled(),
            has_client: self.delivery.has_sink(),
            pool: self.pool.stats(),
            failure: inner.acquirer.failure().map(|e| e.to_string()),
        })
    }

    fn set_client(&self, endpoint: Option<EndpointRef>) -> DeviceResult<()> {
        let sink = match endpoint {
            Some(endpoint) => Some(Arc::new(RemoteSink::new(endpoint)?) as Arc<dyn FrameSink>),
            None => None,
        };
        self.delivery.set_sink(sink);
        Ok(())
    }

    fn trigger(&self) -> DeviceResult<()> {
        if !self.hardware.supports_soft_trigger() {
            return Err(DeviceError::NoSoftTrigger);
        }
        if !self.lock().enabled {
            return Err(DeviceError::InvalidState("device not enabled"));
        }
        self.hardware
            .soft_trigger()
            .map_err(|e| DeviceError::hardware("softTrigger", e))
    }

    fn go_silent(&self) -> DeviceResult<()> {
        self.delivery.go_silent();
        Ok(())
    }

    fn go_loud(&self) -> DeviceResult<()> {
        self.delivery.go_loud();
        Ok(())
    }

    fn set_correction(&self, correction: Option<CorrectionFrame>) -> DeviceResult<()> {
        self.delivery.set_correction(correction);
        Ok(())
    }

    fn get_id(&self) -> DeviceResult<String> {
        match self.hardware.floating_identity() {
            Some(identity) => identity.uid().map_err(|e| DeviceError::hardware("getID", e)),
            None => Ok(self.name.clone()),
        }
    }

    fn set_transform(&self, transform: Transform) -> DeviceResult<()> {
        self.delivery
            .set_transform(self.hardware.readout_transform().combine(transform));
        Ok(())
    }

    fn transform(&self) -> DeviceResult<Transform> {
        Ok(self.delivery.transform().combine(self.hardware.readout_transform()))
    }

    fn describe_settings(&self) -> DeviceResult<Vec<ParamDescriptor>> {
        let described = self
            .hardware
            .describe_params()
            .into_iter()
            .map(|d| {
                if param::MANAGED.contains(&d.name.as_str()) {
                    d.read_only()
                } else {
                    d
                }
            })
            .collect();
        Ok(described)
    }

    fn get_setting(&self, name: &str) -> DeviceResult<ParamValue> {
        self.hardware
            .get_param(name)
            .map_err(|e| DeviceError::hardware("getParam", e))
    }

    #[instrument(skip(self, value), fields(device = %self.name))]
    fn set_setting(&self, name: &str, value: ParamValue) -> DeviceResult<()> {
        if param::MANAGED.contains(&name) {
            return Err(DeviceError::InvalidSettings(format!(
                "`{name}` is part of the device settings, use configure"
            )));
        }
        let inner = self.lock();
        if inner.shut_down {
            return Err(DeviceError::ShutDown);
        }
        self.hardware
            .set_param(name, value)
            .map_err(|e| DeviceError::hardware("setParam", e))?;
        info!(%name, "setting changed");
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.shutdown();
    }
}
