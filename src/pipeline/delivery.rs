//! Drains filled frames, applies offset correction and the orientation
//! transform, and pushes them to the registered consumer.
//!
//! Delivery is best effort and at most once per frame. Whatever happens to
//! the push, the slot goes back to the pool.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::correction::CorrectionFrame;
use super::transform::Transform;
use crate::capture::frame::FrameMetadata;
use crate::capture::pool::BufferPool;
use crate::error::{DeviceError, DeviceResult};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A corrected frame copied out of the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveredFrame {
    pub data: Bytes,
    pub meta: FrameMetadata,
}

/// Push target for delivered frames.
pub trait FrameSink: Send + Sync {
    fn deliver(&self, frame: DeliveredFrame) -> DeviceResult<()>;

    /// Where frames go, for logs.
    fn describe(&self) -> String;
}

impl fmt::Debug for dyn FrameSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameSink({})", self.describe())
    }
}

struct Switches {
    enabled: bool,
    sink: Option<Arc<dyn FrameSink>>,
    transform: Transform,
}

/// The two delivery switches, the correction frame and the transform,
/// shared between the control surface and the worker.
pub struct DeliveryControl {
    switches: Mutex<Switches>,
    correction: ArcSwapOption<CorrectionFrame>,
}

impl Default for DeliveryControl {
    fn default() -> Self {
        Self {
            switches: Mutex::new(Switches {
                enabled: true,
                sink: None,
                transform: Transform::IDENTITY,
            }),
            correction: ArcSwapOption::empty(),
        }
    }
}

impl DeliveryControl {
    fn lock(&self) -> MutexGuard<'_, Switches> {
        self.switches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn go_silent(&self) {
        self.lock().enabled = false;
        info!("delivery silenced");
    }

    pub fn go_loud(&self) {
        self.lock().enabled = true;
        info!("delivery resumed");
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    /// Register the consumer, or clear it with `None`.
    pub fn set_sink(&self, sink: Option<Arc<dyn FrameSink>>) {
        match &sink {
            Some(s) => info!(client = %s.describe(), "client registered"),
            None => info!("client cleared"),
        }
        self.lock().sink = sink;
    }

    pub fn has_sink(&self) -> bool {
        self.lock().sink.is_some()
    }

    pub fn set_correction(&self, correction: Option<CorrectionFrame>) {
        self.correction.store(correction.map(Arc::new));
    }

    pub fn correction(&self) -> Option<Arc<CorrectionFrame>> {
        self.correction.load_full()
    }

    /// Applied to every frame after correction.
    pub fn set_transform(&self, transform: Transform) {
        self.lock().transform = transform;
        info!(?transform, "transform set");
    }

    pub fn transform(&self) -> Transform {
        self.lock().transform
    }

    /// Sink and transform for the next frame, read once per frame.
    fn target(&self) -> Option<(Arc<dyn FrameSink>, Transform)> {
        let switches = self.lock();
        if switches.enabled {
            switches.sink.clone().map(|sink| (sink, switches.transform))
        } else {
            None
        }
    }
}

pub struct DeliveryWorker {
    pool: Arc<BufferPool>,
    control: Arc<DeliveryControl>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DeliveryWorker {
    pub fn new(pool: Arc<BufferPool>, control: Arc<DeliveryControl>) -> Self {
        Self {
            pool,
            control,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    pub fn start(&mut self) -> DeviceResult<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);
        let pool = self.pool.clone();
        let control = self.control.clone();
        let running = self.running.clone();
        let handle = thread::Builder::new()
            .name("delivery".into())
            .spawn(move || dispatch_loop(pool, control, running))
            .map_err(|e| {
                error!("failed to spawn delivery thread: {}", e);
                DeviceError::InvalidState("could not spawn delivery thread")
            })?;
        self.thread = Some(handle);
        Ok(())
    }

    /// Finish the frame in hand, then exit. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("delivery thread panicked");
            }
        }
    }
}

impl Drop for DeliveryWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch_loop(pool: Arc<BufferPool>, control: Arc<DeliveryControl>, running: Arc<AtomicBool>) {
    debug!("delivery loop started");
    let mut scratch = BytesMut::new();
    let mut turned = BytesMut::new();

    while running.load(Ordering::SeqCst) {
        let Some(frame) = pool.next_filled(POLL_INTERVAL) else {
            continue;
        };

        let Some((sink, transform)) = control.target() else {
            pool.release(frame);
            continue;
        };

        scratch.extend_from_slice(frame.data());
        if let Some(correction) = control.correction() {
            if !correction.apply(&frame.meta, &mut scratch) {
                debug!(sequence = frame.meta.sequence, "correction shape mismatch, skipped");
            }
        }
        let meta = frame.meta;
        pool.release(frame);

        let delivered = if transform.is_identity() {
            DeliveredFrame {
                data: scratch.split().freeze(),
                meta,
            }
        } else {
            match transform.apply(&meta, &scratch, &mut turned) {
                Some(meta) => {
                    scratch.clear();
                    DeliveredFrame {
                        data: turned.split().freeze(),
                        meta,
                    }
                }
                None => {
                    debug!(sequence = meta.sequence, "frame shorter than its shape, not transformed");
                    DeliveredFrame {
                        data: scratch.split().freeze(),
                        meta,
                    }
                }
            }
        };

        let sequence = delivered.meta.sequence;
        match sink.deliver(delivered) {
            Ok(()) => {
                metrics::counter!("labcam_frames_delivered_total").increment(1);
            }
            Err(e) => {
                metrics::counter!("labcam_delivery_failures_total").increment(1);
                warn!(sequence, client = %sink.describe(), "delivery failed: {}", e);
            }
        }
    }
    debug!("delivery loop exited");
}
