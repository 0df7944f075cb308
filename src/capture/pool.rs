//! Fixed set of reusable frame buffers shared by the acquirer and the
//! delivery worker.
//!
//! Every slot is in exactly one place: the free queue, checked out (with the
//! hardware or being delivered), or the filled queue awaiting delivery. The
//! pool lock only covers moving slots between queues; nothing holds it
//! across a hardware call.
//!
//! When the acquirer finds no free slot it reclaims the oldest filled slot
//! instead of waiting: a late frame is worth less than a stalled sensor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::frame::{Frame, PixelFormat};
use crate::error::{DeviceError, DeviceResult};

/// Shape of the frames a pool is sized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl FrameGeometry {
    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

/// Snapshot of pool occupancy and counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub free: usize,
    pub filled: usize,
    pub checked_out: usize,
    pub frame_bytes: usize,
    pub frames_filled: u64,
    pub frames_dropped: u64,
}

#[derive(Default)]
struct Counters {
    frames_filled: AtomicU64,
    frames_dropped: AtomicU64,
}

struct PoolState {
    free: VecDeque<Frame>,
    filled: VecDeque<Frame>,
    checked_out: usize,
    capacity: usize,
    geometry: Option<FrameGeometry>,
    generation: u64,
}

pub struct BufferPool {
    state: Mutex<PoolState>,
    filled_ready: Condvar,
    budget: usize,
    counters: CachePadded<Counters>,
}

impl BufferPool {
    /// Empty pool that will refuse allocations above `budget` bytes.
    pub fn new(budget: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                free: VecDeque::new(),
                filled: VecDeque::new(),
                checked_out: 0,
                capacity: 0,
                geometry: None,
                generation: 0,
            }),
            filled_ready: Condvar::new(),
            budget,
            counters: CachePadded::new(Counters::default()),
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// How many frames of `frame_bytes` fit the budget, capped at `max_count`.
    pub fn buffers_for(&self, frame_bytes: usize, max_count: usize) -> usize {
        if frame_bytes == 0 {
            return 0;
        }
        (self.budget / frame_bytes).min(max_count)
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop all buffers and allocate `count` zeroed frames for `geometry`.
    ///
    /// On `OutOfMemory` the previous allocation is left untouched. Slots
    /// still checked out from an earlier allocation are discarded when
    /// they come back.
    pub fn allocate(&self, count: usize, geometry: FrameGeometry) -> DeviceResult<()> {
        let frame_bytes = geometry.frame_bytes();
        let requested = count.checked_mul(frame_bytes).unwrap_or(usize::MAX);
        if requested > self.budget {
            return Err(DeviceError::OutOfMemory {
                requested,
                budget: self.budget,
            });
        }

        let generation = self.lock().generation + 1;
        let frames: VecDeque<Frame> = (0..count)
            .map(|_| Frame::zeroed(frame_bytes, generation))
            .collect();

        let mut state = self.lock();
        state.generation = generation;
        state.free = frames;
        state.filled.clear();
        state.checked_out = 0;
        state.capacity = count;
        state.geometry = Some(geometry);
        drop(state);
        self.filled_ready.notify_all();

        info!(
            count,
            frame_bytes,
            total_mb = requested as f64 / (1024.0 * 1024.0),
            "allocated frame pool"
        );
        Ok(())
    }

    /// Release every buffer.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.generation += 1;
        state.free.clear();
        state.filled.clear();
        state.checked_out = 0;
        state.capacity = 0;
        state.geometry = None;
        drop(state);
        self.filled_ready.notify_all();
    }

    pub fn geometry(&self) -> Option<FrameGeometry> {
        self.lock().geometry
    }

    /// Take a slot for the hardware to fill. Never blocks.
    ///
    /// Falls back to overwriting the oldest undelivered frame; returns
    /// `None` only when every slot is checked out.
    pub fn acquire_free(&self) -> Option<Frame> {
        let mut state = self.lock();
        if let Some(frame) = state.free.pop_front() {
            state.checked_out += 1;
            return Some(frame);
        }
        let mut frame = state.filled.pop_front()?;
        state.checked_out += 1;
        drop(state);

        self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("labcam_frames_dropped_total").increment(1);
        debug!(sequence = frame.meta.sequence, "overwriting undelivered frame");
        frame.len = 0;
        Some(frame)
    }

    /// Queue a filled slot for delivery and wake the delivery worker.
    pub fn mark_filled(&self, frame: Frame) {
        let mut state = self.lock();
        if frame.generation != state.generation {
            return;
        }
        state.checked_out = state.checked_out.saturating_sub(1);
        state.filled.push_back(frame);
        drop(state);

        self.counters.frames_filled.fetch_add(1, Ordering::Relaxed);
        self.filled_ready.notify_one();
    }

    /// Zero a slot and return it to the free queue.
    pub fn release(&self, mut frame: Frame) {
        if frame.generation != self.lock().generation {
            return;
        }
        frame.reset();
        let mut state = self.lock();
        if frame.generation != state.generation {
            return;
        }
        state.checked_out = state.checked_out.saturating_sub(1);
        state.free.push_back(frame);
    }

    /// Next filled frame in fill order, waiting up to `timeout`.
    pub fn next_filled(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(frame) = state.filled.pop_front() {
                state.checked_out += 1;
                return Some(frame);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .filled_ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            capacity: state.capacity,
            free: state.free.len(),
            filled: state.filled.len(),
            checked_out: state.checked_out,
            frame_bytes: state.geometry.map(|g| g.frame_bytes()).unwrap_or(0),
            frames_filled: self.counters.frames_filled.load(Ordering::Relaxed),
            frames_dropped: self.counters.frames_dropped.load(Ordering::Relaxed),
        }
    }
}
