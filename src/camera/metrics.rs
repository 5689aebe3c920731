use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};

use ffmpeg::{codec::Parameters, Rational};

use crate::{
    frame::SharedFrame,
    output::{PacketHub, PacketRingBuffer},
    queue::BoundedQueue,
};

const FRAME_QUEUE_CAPACITY: usize = 2;

/// What the capture thread learned about its input's video stream; consumed
/// by remuxers to copy codec parameters bit-exact.
#[derive(Clone)]
pub struct StreamInfo {
    pub parameters: Parameters,
    pub time_base: Rational,
}

type Watcher = Box<dyn Fn(&'static str, f64) + Send + Sync>;

/// Per-camera shared observable state.
///
/// Counters are plain atomics updated through a compare-and-swap so that
/// watchers are only notified when the value actually changed. The frame
/// queue, packet ring and packet hub ride along here so every stage can
/// reach its camera's plumbing through one handle.
pub struct CameraMetrics {
    name: String,
    pull_based: bool,
    enabled: AtomicBool,
    frame_queue: Arc<BoundedQueue<SharedFrame>>,
    ring_buffer: Arc<PacketRingBuffer>,
    packet_hub: Arc<PacketHub>,
    stream_info: Mutex<Option<StreamInfo>>,
    camera_fps: AtomicU64,
    detection_fps: AtomicU64,
    process_fps: AtomicU64,
    skipped_fps: AtomicU64,
    detection_frame: AtomicU64,
    watchers: Mutex<Vec<Watcher>>,
}

pub type SharedCameraMetrics = Arc<CameraMetrics>;

impl CameraMetrics {
    pub fn new(name: impl Into<String>, pull_based: bool) -> CameraMetrics {
        CameraMetrics {
            name: name.into(),
            pull_based,
            enabled: AtomicBool::new(true),
            frame_queue: Arc::new(BoundedQueue::new(FRAME_QUEUE_CAPACITY)),
            ring_buffer: Arc::new(PacketRingBuffer::default()),
            packet_hub: Arc::new(PacketHub::new()),
            stream_info: Mutex::new(None),
            camera_fps: AtomicU64::new(0),
            detection_fps: AtomicU64::new(0),
            process_fps: AtomicU64::new(0),
            skipped_fps: AtomicU64::new(0),
            detection_frame: AtomicU64::new(0),
            watchers: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_pull_based(&self) -> bool {
        self.pull_based
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn frame_queue(&self) -> &Arc<BoundedQueue<SharedFrame>> {
        &self.frame_queue
    }

    pub fn ring_buffer(&self) -> &Arc<PacketRingBuffer> {
        &self.ring_buffer
    }

    pub fn packet_hub(&self) -> &Arc<PacketHub> {
        &self.packet_hub
    }

    pub fn stream_info(&self) -> Option<StreamInfo> {
        self.stream_info.lock().unwrap().clone()
    }

    pub fn set_stream_info(&self, info: StreamInfo) {
        *self.stream_info.lock().unwrap() = Some(info);
    }

    /// Runs `watcher` on every counter change, with the counter name.
    pub fn watch(&self, watcher: impl Fn(&'static str, f64) + Send + Sync + 'static) {
        self.watchers.lock().unwrap().push(Box::new(watcher));
    }

    pub fn camera_fps(&self) -> f64 {
        f64::from_bits(self.camera_fps.load(Ordering::Acquire))
    }

    pub fn set_camera_fps(&self, fps: f64) {
        self.update(&self.camera_fps, "camera_fps", fps);
    }

    pub fn detection_fps(&self) -> f64 {
        f64::from_bits(self.detection_fps.load(Ordering::Acquire))
    }

    pub fn set_detection_fps(&self, fps: f64) {
        self.update(&self.detection_fps, "detection_fps", fps);
    }

    pub fn process_fps(&self) -> f64 {
        f64::from_bits(self.process_fps.load(Ordering::Acquire))
    }

    pub fn set_process_fps(&self, fps: f64) {
        self.update(&self.process_fps, "process_fps", fps);
    }

    pub fn skipped_fps(&self) -> f64 {
        f64::from_bits(self.skipped_fps.load(Ordering::Acquire))
    }

    pub fn set_skipped_fps(&self, fps: f64) {
        self.update(&self.skipped_fps, "skipped_fps", fps);
    }

    pub fn detection_frame(&self) -> u64 {
        self.detection_frame.load(Ordering::Acquire)
    }

    pub fn set_detection_frame(&self, frame_index: u64) {
        self.detection_frame.store(frame_index, Ordering::Release);
    }

    /// CAS update; only the thread that actually changed the value notifies.
    fn update(&self, cell: &AtomicU64, field: &'static str, value: f64) {
        let new_bits = value.to_bits();
        let mut current = cell.load(Ordering::Relaxed);
        loop {
            if current == new_bits {
                return;
            }
            match cell.compare_exchange_weak(
                current,
                new_bits,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        for watcher in self.watchers.lock().unwrap().iter() {
            watcher(field, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn watchers_fire_only_on_change() {
        let metrics = CameraMetrics::new("cam", false);
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            metrics.watch(move |field, _| {
                assert_eq!(field, "camera_fps");
                calls.fetch_add(1, Ordering::Relaxed);
            });
        }

        metrics.set_camera_fps(24.0);
        metrics.set_camera_fps(24.0);
        metrics.set_camera_fps(25.0);
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.camera_fps(), 25.0);
    }

    #[test]
    fn enabled_flag_toggles() {
        let metrics = CameraMetrics::new("cam", true);
        assert!(metrics.is_enabled());
        assert!(metrics.is_pull_based());
        metrics.set_enabled(false);
        assert!(!metrics.is_enabled());
    }
}
