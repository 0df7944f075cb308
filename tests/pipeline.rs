use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use labcam::capture::{AcquirerState, PixelFormat};
use labcam::device::{Device, DeviceControl, DeviceSettings, Roi, TriggerMode};
use labcam::hardware::simulated::{SimulatedCamera, SimulatedConfig};
use labcam::pipeline::{CorrectionFrame, DeliveredFrame, FrameSink, Transform};
use labcam::{DeviceError, DeviceResult, PipelineOptions};

const WAIT: Duration = Duration::from_secs(3);

struct ChannelSink(flume::Sender<DeliveredFrame>);

impl FrameSink for ChannelSink {
    fn deliver(&self, frame: DeliveredFrame) -> DeviceResult<()> {
        self.0
            .send(frame)
            .map_err(|e| DeviceError::DeliveryFailed(e.to_string()))
    }

    fn describe(&self) -> String {
        "test channel".into()
    }
}

fn camera(width: u32, height: u32, bytes_per_pixel: usize) -> Arc<SimulatedCamera> {
    Arc::new(SimulatedCamera::new(SimulatedConfig {
        width,
        height,
        bytes_per_pixel,
        ..Default::default()
    }))
}

fn device_with_sink(cam: &Arc<SimulatedCamera>) -> (Device, flume::Receiver<DeliveredFrame>) {
    let device = Device::new("sim", cam.clone(), &PipelineOptions::default());
    device.initialize().unwrap();
    let (tx, rx) = flume::unbounded();
    device.set_sink(Some(Arc::new(ChannelSink(tx))));
    (device, rx)
}

fn continuous(device: &Device) -> DeviceSettings {
    let mut settings = device.settings().unwrap();
    settings.trigger_mode = TriggerMode::Continuous;
    settings.exposure_ms = 2.0;
    settings
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn reconfigure_mid_stream_changes_frame_size() {
    let cam = camera(64, 32, 2);
    let (device, rx) = device_with_sink(&cam);
    device.configure(continuous(&device)).unwrap();
    device.enable().unwrap();

    let before = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(before.data.len(), 64 * 32 * 2);
    assert_eq!((before.meta.width, before.meta.height), (64, 32));

    let mut cropped = continuous(&device);
    cropped.roi = Roi {
        left: 8,
        top: 4,
        width: 32,
        height: 16,
    };
    device.configure(cropped).unwrap();
    // Frames delivered before the change.
    while rx.try_recv().is_ok() {}

    let after = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(after.data.len(), 32 * 16 * 2);
    assert_eq!((after.meta.width, after.meta.height), (32, 16));
    assert!(after.meta.sequence > before.meta.sequence);

    let status = device.status().unwrap();
    assert!(status.enabled);
    assert_eq!(status.acquirer, AcquirerState::Running);
    assert_eq!((status.width, status.height), (32, 16));
    device.shutdown();
}

#[test]
fn frames_arrive_in_fill_order() {
    let cam = camera(16, 16, 1);
    let (device, rx) = device_with_sink(&cam);
    device.configure(continuous(&device)).unwrap();
    device.enable().unwrap();

    let sequences: Vec<u64> = (0..10)
        .map(|_| rx.recv_timeout(WAIT).unwrap().meta.sequence)
        .collect();
    assert!(sequences.windows(2).all(|w| w[0] < w[1]), "{sequences:?}");
    device.shutdown();
}

#[test]
fn software_trigger_produces_one_frame() {
    let cam = camera(16, 8, 1);
    let (device, rx) = device_with_sink(&cam);
    device.enable().unwrap();

    device.trigger().unwrap();
    let frame = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(frame.data.len(), 16 * 8);
    assert_eq!(frame.meta.format, PixelFormat::Mono8);
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    assert_eq!(cam.frames_sent(), 1);
    device.shutdown();
}

#[test]
fn trigger_requires_enabled_device() {
    let cam = camera(16, 8, 1);
    let (device, _rx) = device_with_sink(&cam);
    assert!(matches!(device.trigger(), Err(DeviceError::InvalidState(_))));
}

#[test]
fn silent_device_drops_frames() {
    let cam = camera(16, 8, 1);
    let (device, rx) = device_with_sink(&cam);
    device.enable().unwrap();
    device.go_silent().unwrap();

    device.trigger().unwrap();
    assert!(wait_until(|| cam.frames_sent() == 1));
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    device.go_loud().unwrap();
    device.trigger().unwrap();
    assert!(rx.recv_timeout(WAIT).is_ok());
    device.shutdown();
}

#[test]
fn correction_frame_is_subtracted() {
    let cam = camera(8, 4, 1);
    let (device, rx) = device_with_sink(&cam);
    device
        .set_correction(Some(CorrectionFrame {
            width: 8,
            height: 4,
            format: PixelFormat::Mono8,
            data: vec![1; 32],
        }))
        .unwrap();
    device.enable().unwrap();

    device.trigger().unwrap();
    let frame = rx.recv_timeout(WAIT).unwrap();
    // First frame of a run is the plain x + y gradient.
    assert_eq!(&frame.data[..4], &[0, 0, 1, 2]);
    assert_eq!(frame.data[8], 0);
    assert_eq!(frame.data[9], 1);

    // Wrong shape is ignored.
    device
        .set_correction(Some(CorrectionFrame {
            width: 4,
            height: 4,
            format: PixelFormat::Mono8,
            data: vec![1; 16],
        }))
        .unwrap();
    device.trigger().unwrap();
    let frame = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(&frame.data[..3], &[1, 2, 3]);
    device.shutdown();
}

#[test]
fn repeated_hardware_errors_stop_acquisition() {
    let cam = camera(16, 8, 1);
    let (device, rx) = device_with_sink(&cam);
    device.enable().unwrap();
    cam.inject_errors(9);

    assert!(wait_until(|| device.status().unwrap().acquirer == AcquirerState::Stopped));
    let status = device.status().unwrap();
    assert!(status.failure.unwrap().contains("6 consecutive"));

    // Re-enabling restarts the run; the leftover errors stay under the limit.
    device.enable().unwrap();
    device.trigger().unwrap();
    assert!(rx.recv_timeout(WAIT).is_ok());
    assert!(device.status().unwrap().failure.is_none());
    device.shutdown();
}

#[test]
fn disable_then_enable_resumes() {
    let cam = camera(16, 8, 1);
    let (device, rx) = device_with_sink(&cam);
    device.enable().unwrap();
    device.disable().unwrap();
    assert_eq!(device.status().unwrap().acquirer, AcquirerState::Stopped);

    device.enable().unwrap();
    device.trigger().unwrap();
    assert!(rx.recv_timeout(WAIT).is_ok());
    device.shutdown();
}

#[test]
fn single_slot_pool_delivers_every_triggered_frame() {
    let cam = camera(64, 64, 2);
    let pipeline = PipelineOptions {
        pool_budget_bytes: 64 * 64 * 2,
        ..Default::default()
    };
    let device = Device::new("sim", cam.clone(), &pipeline);
    device.initialize().unwrap();
    assert_eq!(device.status().unwrap().pool.capacity, 1);
    let (tx, rx) = flume::unbounded();
    device.set_sink(Some(Arc::new(ChannelSink(tx))));
    device.enable().unwrap();

    for expected in 1..=10u64 {
        device.trigger().unwrap();
        let frame = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(frame.meta.sequence, expected);
        // Let the acquirer sit through a few empty waits.
        thread::sleep(Duration::from_millis(30));
    }
    assert_eq!(device.status().unwrap().pool.frames_dropped, 0);
    device.shutdown();
}

#[test]
fn transform_reorients_delivered_frames() {
    let cam = camera(8, 4, 1);
    let (device, rx) = device_with_sink(&cam);
    device.set_transform(Transform::new(false, false, true)).unwrap();
    device.enable().unwrap();

    device.trigger().unwrap();
    let frame = rx.recv_timeout(WAIT).unwrap();
    assert_eq!((frame.meta.width, frame.meta.height), (4, 8));
    // Top row after a quarter turn is the old right column, x + y for x = 7.
    assert_eq!(&frame.data[..4], &[7, 8, 9, 10]);
    device.shutdown();
}
