//! Simulated camera for tests and demos.
//!
//! Produces gradient frames shifted by the frame counter. In software
//! trigger mode exactly one frame is produced per trigger; in continuous
//! mode one per exposure interval; external mode never fires on its own.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::{
    param, status, FloatingIdentity, Hardware, HardwareError, HwResult, ParamDescriptor, ParamKind,
    ParamValue, WaitOutcome,
};
use crate::device::settings::{Binning, Roi, TriggerMode};
use crate::pipeline::Transform;

const FAN_SPEEDS: [&str; 3] = ["Off", "Low", "On"];
const SENSOR_TEMPERATURE_C: f64 = -25.0;

/// Construction parameters of a [`SimulatedCamera`].
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: usize,
    pub serial: String,
    pub soft_trigger: bool,
    pub floating: bool,
    pub readout: Transform,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            bytes_per_pixel: 2,
            serial: "SIM0000".into(),
            soft_trigger: true,
            floating: false,
            readout: Transform::IDENTITY,
        }
    }
}

#[derive(Debug)]
struct SimState {
    opened: bool,
    acquiring: bool,
    pending_triggers: u32,
    exposure: Duration,
    roi: Roi,
    binning: Binning,
    trigger_mode: TriggerMode,
    fan_speed: &'static str,
    next_due: Instant,
    sent: u64,
    injected_errors: u32,
}

pub struct SimulatedCamera {
    config: SimulatedConfig,
    state: Mutex<SimState>,
    wake: Condvar,
    epoch: Instant,
    open_failures: Arc<AtomicU32>,
}

impl SimulatedCamera {
    pub fn new(config: SimulatedConfig) -> Self {
        let sensor = (config.width, config.height);
        Self {
            state: Mutex::new(SimState {
                opened: false,
                acquiring: false,
                pending_triggers: 0,
                exposure: Duration::from_millis(10),
                roi: Roi::full(sensor),
                binning: Binning::default(),
                trigger_mode: TriggerMode::Software,
                fan_speed: "On",
                next_due: Instant::now(),
                sent: 0,
                injected_errors: 0,
            }),
            config,
            wake: Condvar::new(),
            epoch: Instant::now(),
            open_failures: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Fail `open` while the shared counter is non-zero, decrementing it each time.
    pub fn with_open_failures(mut self, remaining: Arc<AtomicU32>) -> Self {
        self.open_failures = remaining;
        self
    }

    /// Make the next `count` waits fail with a communication error.
    pub fn inject_errors(&self, count: u32) {
        self.lock().injected_errors = count;
        self.wake.notify_all();
    }

    /// Frames produced since the last start of acquisition.
    pub fn frames_sent(&self) -> u64 {
        self.lock().sent
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fill(&self, state: &mut SimState, buffer: &mut [u8]) -> HwResult<usize> {
        let width = (state.roi.width / state.binning.h) as usize;
        let height = (state.roi.height / state.binning.v) as usize;
        let bpp = self.config.bytes_per_pixel;
        let bytes = width * height * bpp;
        if buffer.len() < bytes {
            return Err(HardwareError::new(status::INVALID_SIZE));
        }
        let shift = state.sent as usize;
        for (i, pixel) in buffer[..bytes].chunks_exact_mut(bpp).enumerate() {
            let (x, y) = (i % width, i / width);
            let value = (x + y + shift) as u64;
            for (b, byte) in pixel.iter_mut().enumerate() {
                *byte = (value >> (8 * b)) as u8;
            }
        }
        state.sent += 1;
        Ok(bytes)
    }
}

impl Hardware for SimulatedCamera {
    fn open(&self) -> HwResult<()> {
        let failed = self
            .open_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(HardwareError::new(status::CONNECTION));
        }
        self.lock().opened = true;
        info!(serial = %self.config.serial, "simulated camera opened");
        Ok(())
    }

    fn close(&self) -> HwResult<()> {
        let mut state = self.lock();
        state.opened = false;
        state.acquiring = false;
        self.wake.notify_all();
        Ok(())
    }

    fn get_param(&self, name: &str) -> HwResult<ParamValue> {
        let state = self.lock();
        let value = match name {
            param::EXPOSURE_TIME => ParamValue::Float(state.exposure.as_secs_f64() * 1000.0),
            param::AOI_LEFT => ParamValue::Int(state.roi.left.into()),
            param::AOI_TOP => ParamValue::Int(state.roi.top.into()),
            param::AOI_WIDTH => ParamValue::Int(state.roi.width.into()),
            param::AOI_HEIGHT => ParamValue::Int(state.roi.height.into()),
            param::AOI_HBIN => ParamValue::Int(state.binning.h.into()),
            param::AOI_VBIN => ParamValue::Int(state.binning.v.into()),
            param::TRIGGER_MODE => ParamValue::Text(state.trigger_mode.to_string()),
            param::SERIAL_NUMBER => ParamValue::Text(self.config.serial.clone()),
            param::SENSOR_TEMPERATURE => ParamValue::Float(SENSOR_TEMPERATURE_C),
            param::FAN_SPEED => ParamValue::Text(state.fan_speed.to_string()),
            _ => return Err(HardwareError::new(status::NOT_IMPLEMENTED)),
        };
        Ok(value)
    }

    fn set_param(&self, name: &str, value: ParamValue) -> HwResult<()> {
        let mut state = self.lock();
        let out_of_range = || HardwareError::new(status::OUT_OF_RANGE);
        match name {
            param::FAN_SPEED => {
                let speed = value.as_text().ok_or_else(out_of_range)?;
                state.fan_speed = FAN_SPEEDS
                    .into_iter()
                    .find(|s| *s == speed)
                    .ok_or_else(out_of_range)?;
                return Ok(());
            }
            param::SERIAL_NUMBER | param::SENSOR_TEMPERATURE => {
                return Err(HardwareError::new(status::READ_ONLY))
            }
            _ => {}
        }
        if state.acquiring {
            return Err(HardwareError::new(status::NOT_WRITABLE));
        }
        let as_u32 = |v: &ParamValue| {
            v.as_int()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(out_of_range)
        };
        match name {
            param::EXPOSURE_TIME => {
                state.exposure = value
                    .as_float()
                    .filter(|ms| *ms > 0.0)
                    .and_then(|ms| Duration::try_from_secs_f64(ms / 1000.0).ok())
                    .ok_or_else(out_of_range)?;
            }
            param::AOI_LEFT => state.roi.left = as_u32(&value)?,
            param::AOI_TOP => state.roi.top = as_u32(&value)?,
            param::AOI_WIDTH => state.roi.width = as_u32(&value)?,
            param::AOI_HEIGHT => state.roi.height = as_u32(&value)?,
            param::AOI_HBIN => state.binning.h = as_u32(&value)?.max(1),
            param::AOI_VBIN => state.binning.v = as_u32(&value)?.max(1),
            param::TRIGGER_MODE => {
                let mode = value.as_text().ok_or_else(out_of_range)?;
                state.trigger_mode = mode.parse().map_err(|_| out_of_range())?;
            }
            _ => return Err(HardwareError::new(status::NOT_IMPLEMENTED)),
        }
        Ok(())
    }

    fn describe_params(&self) -> Vec<ParamDescriptor> {
        let int = |name| ParamDescriptor::new(name, ParamKind::Int);
        let modes = [TriggerMode::Continuous, TriggerMode::Software, TriggerMode::External];
        vec![
            ParamDescriptor::new(param::EXPOSURE_TIME, ParamKind::Float),
            int(param::AOI_LEFT),
            int(param::AOI_TOP),
            int(param::AOI_WIDTH),
            int(param::AOI_HEIGHT),
            int(param::AOI_HBIN),
            int(param::AOI_VBIN),
            ParamDescriptor::new(param::TRIGGER_MODE, ParamKind::Enum)
                .with_values(modes.iter().map(TriggerMode::as_str)),
            ParamDescriptor::new(param::SERIAL_NUMBER, ParamKind::Text).read_only(),
            ParamDescriptor::new(param::SENSOR_TEMPERATURE, ParamKind::Float).read_only(),
            ParamDescriptor::new(param::FAN_SPEED, ParamKind::Enum).with_values(FAN_SPEEDS),
        ]
    }

    fn start_acquisition(&self) -> HwResult<()> {
        let mut state = self.lock();
        if !state.opened {
            return Err(HardwareError::new(status::NOT_INITIALISED));
        }
        state.acquiring = true;
        state.pending_triggers = 0;
        state.sent = 0;
        state.next_due = Instant::now() + state.exposure;
        debug!(mode = %state.trigger_mode, "simulated acquisition started");
        self.wake.notify_all();
        Ok(())
    }

    fn stop_acquisition(&self) -> HwResult<()> {
        let mut state = self.lock();
        state.acquiring = false;
        state.pending_triggers = 0;
        self.wake.notify_all();
        Ok(())
    }

    fn wait_for_frame(&self, buffer: &mut [u8], timeout: Duration) -> HwResult<WaitOutcome> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if !state.opened {
                return Err(HardwareError::new(status::NOT_INITIALISED));
            }
            if state.injected_errors > 0 {
                state.injected_errors -= 1;
                return Err(HardwareError::new(status::COMM));
            }
            let now = Instant::now();
            let ready = state.acquiring
                && match state.trigger_mode {
                    TriggerMode::Software => state.pending_triggers > 0,
                    TriggerMode::Continuous => now >= state.next_due,
                    TriggerMode::External => false,
                };
            if ready {
                if state.trigger_mode == TriggerMode::Software {
                    state.pending_triggers -= 1;
                } else {
                    state.next_due = now + state.exposure;
                }
                let bytes_written = self.fill(&mut state, buffer)?;
                return Ok(WaitOutcome::Frame {
                    bytes_written,
                    timestamp: self.epoch.elapsed(),
                });
            }
            if now >= deadline {
                return Ok(WaitOutcome::Timeout);
            }
            let mut wake_at = deadline;
            if state.acquiring && state.trigger_mode == TriggerMode::Continuous {
                wake_at = wake_at.min(state.next_due);
            }
            let (guard, _) = self
                .wake
                .wait_timeout(state, wake_at.saturating_duration_since(now))
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    fn sensor_shape(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }

    fn bytes_per_pixel(&self) -> usize {
        self.config.bytes_per_pixel
    }

    fn supports_soft_trigger(&self) -> bool {
        self.config.soft_trigger
    }

    fn soft_trigger(&self) -> HwResult<()> {
        if !self.config.soft_trigger {
            return Err(HardwareError::new(status::NOT_IMPLEMENTED));
        }
        let mut state = self.lock();
        if state.acquiring {
            state.pending_triggers += 1;
            self.wake.notify_all();
        } else {
            debug!("trigger received while not acquiring; ignored");
        }
        Ok(())
    }

    fn readout_transform(&self) -> Transform {
        self.config.readout
    }

    fn floating_identity(&self) -> Option<&dyn FloatingIdentity> {
        if self.config.floating {
            Some(self)
        } else {
            None
        }
    }
}

impl FloatingIdentity for SimulatedCamera {
    fn uid(&self) -> HwResult<String> {
        if !self.lock().opened {
            return Err(HardwareError::new(status::NOT_INITIALISED));
        }
        Ok(self.config.serial.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> SimulatedCamera {
        SimulatedCamera::new(SimulatedConfig {
            width: 8,
            height: 4,
            bytes_per_pixel: 1,
            ..Default::default()
        })
    }

    #[test]
    fn test_software_trigger_produces_one_frame() {
        let cam = small();
        cam.open().unwrap();
        cam.start_acquisition().unwrap();
        cam.soft_trigger().unwrap();

        let mut buf = vec![0u8; 32];
        let first = cam.wait_for_frame(&mut buf, Duration::from_millis(100)).unwrap();
        assert!(matches!(first, WaitOutcome::Frame { bytes_written: 32, .. }));
        assert_eq!(buf[1], 1);

        let second = cam.wait_for_frame(&mut buf, Duration::from_millis(20)).unwrap();
        assert_eq!(second, WaitOutcome::Timeout);
    }

    #[test]
    fn test_continuous_mode_free_runs() {
        let cam = small();
        cam.open().unwrap();
        cam.set_param(param::TRIGGER_MODE, ParamValue::Text("Continuous".into()))
            .unwrap();
        cam.set_param(param::EXPOSURE_TIME, ParamValue::Float(1.0)).unwrap();
        cam.start_acquisition().unwrap();

        let mut buf = vec![0u8; 32];
        for _ in 0..3 {
            let outcome = cam.wait_for_frame(&mut buf, Duration::from_millis(200)).unwrap();
            assert!(matches!(outcome, WaitOutcome::Frame { .. }));
        }
        assert_eq!(cam.frames_sent(), 3);
    }

    #[test]
    fn test_set_param_rejected_while_acquiring() {
        let cam = small();
        cam.open().unwrap();
        cam.start_acquisition().unwrap();
        let err = cam.set_param(param::AOI_WIDTH, ParamValue::Int(4)).unwrap_err();
        assert_eq!(err.code, status::NOT_WRITABLE);
    }

    #[test]
    fn test_fan_speed_writable_while_acquiring() {
        let cam = small();
        cam.open().unwrap();
        cam.start_acquisition().unwrap();
        cam.set_param(param::FAN_SPEED, ParamValue::Text("Low".into())).unwrap();
        assert_eq!(
            cam.get_param(param::FAN_SPEED).unwrap(),
            ParamValue::Text("Low".into())
        );
        let err = cam
            .set_param(param::FAN_SPEED, ParamValue::Text("Turbo".into()))
            .unwrap_err();
        assert_eq!(err.code, status::OUT_OF_RANGE);
        let err = cam
            .set_param(param::SENSOR_TEMPERATURE, ParamValue::Float(0.0))
            .unwrap_err();
        assert_eq!(err.code, status::READ_ONLY);
    }

    #[test]
    fn test_every_described_param_is_readable() {
        let cam = small();
        cam.open().unwrap();
        let described = cam.describe_params();
        assert!(described.iter().any(|d| d.name == param::FAN_SPEED && d.values.len() == 3));
        for descriptor in described {
            assert!(cam.get_param(&descriptor.name).is_ok(), "{}", descriptor.name);
        }
    }

    #[test]
    fn test_unrepresentable_exposure_out_of_range() {
        let cam = small();
        cam.open().unwrap();
        let err = cam
            .set_param(param::EXPOSURE_TIME, ParamValue::Float(1e300))
            .unwrap_err();
        assert_eq!(err.code, status::OUT_OF_RANGE);
        cam.set_param(param::EXPOSURE_TIME, ParamValue::Float(2.5)).unwrap();
    }

    #[test]
    fn test_open_failures_are_shared() {
        let remaining = Arc::new(AtomicU32::new(1));
        let cam = small().with_open_failures(remaining.clone());
        assert_eq!(cam.open().unwrap_err().code, status::CONNECTION);
        assert!(cam.open().is_ok());
        assert_eq!(remaining.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_floating_identity_requires_open() {
        let cam = SimulatedCamera::new(SimulatedConfig {
            serial: "foo".into(),
            floating: true,
            ..Default::default()
        });
        let identity = cam.floating_identity().unwrap();
        assert!(identity.uid().is_err());
        cam.open().unwrap();
        assert_eq!(cam.floating_identity().unwrap().uid().unwrap(), "foo");
    }
}
