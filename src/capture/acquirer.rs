//! Drives the hardware to fill pool slots on a dedicated thread.
//!
//! `Stopped -> Armed -> Running -> Stopping -> Stopped`. Arming pushes the
//! acquisition parameters and requires the loop to be stopped; pausing and
//! resuming around a reconfiguration is the device's job.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::frame::{Frame, FrameMetadata};
use super::pool::{BufferPool, FrameGeometry};
use crate::device::settings::DeviceSettings;
use crate::error::{DeviceError, DeviceResult};
use crate::hardware::{param, Hardware, ParamValue, WaitOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquirerState {
    Stopped,
    Armed,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Copy)]
pub struct AcquirerOptions {
    /// Bound on each hardware wait so a stop request is seen promptly
    pub wait_timeout: Duration,
    /// Consecutive hardware errors tolerated before giving up
    pub max_errors: u32,
}

impl Default for AcquirerOptions {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_millis(500),
            max_errors: 5,
        }
    }
}

struct Shared {
    state: Mutex<AcquirerState>,
    stop: AtomicBool,
    failure: Mutex<Option<DeviceError>>,
    sequence: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: AcquirerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

pub struct Acquirer {
    hardware: Arc<dyn Hardware>,
    options: AcquirerOptions,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Acquirer {
    pub fn new(hardware: Arc<dyn Hardware>, options: AcquirerOptions) -> Self {
        Self {
            hardware,
            options,
            shared: Arc::new(Shared {
                state: Mutex::new(AcquirerState::Stopped),
                stop: AtomicBool::new(false),
                failure: Mutex::new(None),
                sequence: AtomicU64::new(0),
            }),
            thread: None,
        }
    }

    pub fn state(&self) -> AcquirerState {
        *self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Why the last run ended on its own, if it did.
    pub fn failure(&self) -> Option<DeviceError> {
        self.shared
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Push mode, exposure, crop and binning to the hardware.
    pub fn arm(&mut self, settings: &DeviceSettings) -> DeviceResult<()> {
        self.reap();
        match self.state() {
            AcquirerState::Stopped | AcquirerState::Armed => {}
            _ => return Err(DeviceError::InvalidState("cannot arm while acquiring")),
        }

        let roi = settings.roi;
        let params = [
            (param::TRIGGER_MODE, ParamValue::Text(settings.trigger_mode.to_string())),
            (param::EXPOSURE_TIME, ParamValue::Float(settings.exposure_ms)),
            (param::AOI_HBIN, ParamValue::Int(settings.binning.h.into())),
            (param::AOI_VBIN, ParamValue::Int(settings.binning.v.into())),
            (param::AOI_WIDTH, ParamValue::Int(roi.width.into())),
            (param::AOI_HEIGHT, ParamValue::Int(roi.height.into())),
            (param::AOI_LEFT, ParamValue::Int(roi.left.into())),
            (param::AOI_TOP, ParamValue::Int(roi.top.into())),
        ];
        for (name, value) in params {
            debug!(param = name, %value, "set");
            self.hardware
                .set_param(name, value)
                .map_err(|e| DeviceError::hardware("setParam", e))?;
        }

        self.shared.set_state(AcquirerState::Armed);
        Ok(())
    }

    /// Start the hardware and the fill loop.
    pub fn start(&mut self, pool: Arc<BufferPool>) -> DeviceResult<()> {
        if self.state() != AcquirerState::Armed {
            return Err(DeviceError::InvalidState("acquirer must be armed before starting"));
        }
        let geometry = pool
            .geometry()
            .ok_or(DeviceError::InvalidState("buffer pool is not allocated"))?;

        self.hardware
            .start_acquisition()
            .map_err(|e| DeviceError::hardware("startAcquisition", e))?;

        self.shared.stop.store(false, Ordering::SeqCst);
        *self.shared.failure.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.shared.set_state(AcquirerState::Running);

        let hardware = self.hardware.clone();
        let shared = self.shared.clone();
        let options = self.options;
        let spawned = thread::Builder::new()
            .name("acquirer".into())
            .spawn(move || run_loop(hardware, pool, shared, options, geometry));
        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                error!("failed to spawn acquirer thread: {}", e);
                let _ = self.hardware.stop_acquisition();
                self.shared.set_state(AcquirerState::Stopped);
                Err(DeviceError::InvalidState("could not spawn acquirer thread"))
            }
        }
    }

    /// Ask the loop to exit after its current wait and join it. Idempotent.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.reap();
        self.shared.set_state(AcquirerState::Stopped);
    }

    fn reap(&mut self) {
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("acquirer thread panicked");
                let _ = self.hardware.stop_acquisition();
            }
        }
    }
}

impl Drop for Acquirer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A slot for a frame the hardware has already produced. Waits while the
/// delivery side holds every slot; `None` once asked to stop.
fn next_slot(pool: &BufferPool, shared: &Shared) -> Option<Frame> {
    loop {
        if let Some(frame) = pool.acquire_free() {
            return Some(frame);
        }
        if shared.stop.load(Ordering::SeqCst) {
            return None;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

fn backoff(errors: u32) -> Duration {
    Duration::from_millis((10 * u64::from(errors)).min(100))
}

fn run_loop(
    hardware: Arc<dyn Hardware>,
    pool: Arc<BufferPool>,
    shared: Arc<Shared>,
    options: AcquirerOptions,
    geometry: FrameGeometry,
) {
    info!(
        width = geometry.width,
        height = geometry.height,
        "acquisition running"
    );
    let mut errors = 0u32;
    // The hardware writes here first; a pool slot is only taken once a
    // frame exists, so an undelivered frame is never given up for nothing.
    let mut spare = vec![0u8; geometry.frame_bytes()];

    while !shared.stop.load(Ordering::SeqCst) {
        let outcome = hardware
            .queue_buffer(spare.len())
            .and_then(|()| hardware.wait_for_frame(&mut spare, options.wait_timeout));

        match outcome {
            Ok(WaitOutcome::Frame {
                bytes_written,
                timestamp,
            }) => {
                errors = 0;
                let Some(mut frame) = next_slot(&pool, &shared) else {
                    break;
                };
                frame.swap_buffer(&mut spare);
                frame.len = bytes_written.min(frame.capacity());
                frame.meta = FrameMetadata {
                    sequence: shared.sequence.fetch_add(1, Ordering::SeqCst) + 1,
                    width: geometry.width,
                    height: geometry.height,
                    stride: geometry.format.bytes_per_pixel() as u32,
                    format: geometry.format,
                    timestamp,
                };
                pool.mark_filled(frame);
                metrics::counter!("labcam_frames_acquired_total").increment(1);
            }
            Ok(WaitOutcome::Timeout) => {}
            Err(e) => {
                errors += 1;
                metrics::counter!("labcam_hardware_errors_total").increment(1);
                if errors > options.max_errors {
                    error!(errors, "giving up on acquisition: {}", e);
                    *shared.failure.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some(DeviceError::AcquisitionFailed { errors });
                    break;
                }
                warn!(errors, "hardware error while waiting for frame: {}", e);
                thread::sleep(backoff(errors));
            }
        }
    }

    shared.set_state(AcquirerState::Stopping);
    if let Err(e) = hardware.stop_acquisition() {
        warn!("failed to stop hardware acquisition: {}", e);
    }
    shared.set_state(AcquirerState::Stopped);
    debug!("acquisition loop exited");
}
