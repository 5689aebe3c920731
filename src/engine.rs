use std::{
    collections::HashMap,
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use crossbeam::channel::{bounded, unbounded, Receiver};
use tracing::{info, instrument, warn};

use crate::{
    bus::Bus,
    camera::{CameraCapture, CameraMetrics, CameraProcessor, CameraWait, CameraWaitMap},
    config::{AppConfig, ModelConfig, PredictorConfig, RECORD_DIR},
    db::Database,
    detect::{KeypointDetectorSession, ObjectDetectorSession},
    events::{EventTracker, TrackedObjectProcessor},
    frame::SharedFrame,
    ocr::OcrEngine,
    output::RecordingsManager,
    queue::BoundedQueue,
    util::{FrameStore, Shutdown},
};

const KEYPOINT_QUEUE_CAPACITY: usize = 10;
const TRACKED_QUEUE_CAPACITY: usize = 20;
const FRAMES_PER_CAMERA_IN_STORE: usize = 5;
const GRACEFUL_JOIN: Duration = Duration::from_millis(500);

/// Owns the whole pipeline: queues, sessions, per-camera threads, the
/// event processor, the recordings manager and the bus. Everything is
/// created at startup and passed by reference to the stages that need it.
pub struct Engine {
    config: AppConfig,
    stop: Shutdown,
    db: Arc<Database>,
    frame_store: Arc<FrameStore>,
    camera_metrics: HashMap<String, Arc<CameraMetrics>>,
    camera_waits: CameraWaitMap,
    obj_detector_queue: Arc<BoundedQueue<SharedFrame>>,
    keypoint_queue: Arc<BoundedQueue<SharedFrame>>,
    tracked_queue: Arc<BoundedQueue<SharedFrame>>,
    bus: Option<Bus>,
    bus_proxy: Option<JoinHandle<()>>,
    frame_feed: Option<Receiver<SharedFrame>>,
    threads: Vec<(String, JoinHandle<()>)>,
}

impl Engine {
    pub fn new(config: AppConfig) -> Result<Engine> {
        let db_path = config
            .database
            .as_ref()
            .map(|db| db.path.clone())
            .unwrap_or_else(|| "db/vigil.sqlite3".to_owned());
        let db = Arc::new(Database::open(&db_path).context("failed to open database")?);

        let enabled_cameras = config.cameras.values().filter(|c| c.enabled).count();
        let mut camera_metrics = HashMap::new();
        let mut waits = HashMap::new();
        for (name, camera) in &config.cameras {
            camera_metrics.insert(
                name.clone(),
                Arc::new(CameraMetrics::new(name.clone(), camera.pull_based_order)),
            );
            waits.insert(name.clone(), Arc::new(CameraWait::new()));
        }

        Ok(Engine {
            stop: Shutdown::new(),
            db,
            frame_store: Arc::new(FrameStore::new()),
            camera_metrics,
            camera_waits: Arc::new(waits),
            obj_detector_queue: Arc::new(BoundedQueue::new((2 * enabled_cameras).max(4))),
            keypoint_queue: Arc::new(BoundedQueue::new(KEYPOINT_QUEUE_CAPACITY)),
            tracked_queue: Arc::new(BoundedQueue::new(TRACKED_QUEUE_CAPACITY)),
            bus: None,
            bus_proxy: None,
            frame_feed: None,
            threads: Vec::new(),
            config,
        })
    }

    /// Processed frames for UI consumers; available once `start` ran.
    pub fn take_frame_feed(&mut self) -> Option<Receiver<SharedFrame>> {
        self.frame_feed.take()
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.stop.clone()
    }

    #[instrument(skip_all, err)]
    pub fn start(&mut self) -> Result<()> {
        info!("starting engine");
        let (bus, proxy) = Bus::start();

        for name in self.camera_metrics.keys() {
            self.frame_store
                .set_max_frames(name, FRAMES_PER_CAMERA_IN_STORE);
        }

        self.start_config_listener(&bus);
        let record_frames = self.start_recordings_manager();
        self.start_tracked_object_processor(&bus, record_frames);
        self.start_detector_sessions();
        self.start_camera_processors();
        self.start_camera_captures();

        self.bus = Some(bus);
        self.bus_proxy = Some(proxy);
        info!(threads = self.threads.len(), "engine started");
        Ok(())
    }

    fn spawn(&mut self, name: String, body: impl FnOnce() + Send + 'static) {
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(body)
            .expect("failed to spawn thread");
        self.threads.push((name, handle));
    }

    fn start_config_listener(&mut self, bus: &Bus) {
        let subscriber = bus.subscriber("config/enabled/");
        let cameras = self.camera_metrics.clone();
        let stop = self.stop.clone();
        self.spawn("config-listener".to_owned(), move || {
            while !stop.is_requested() {
                let Some((token, payload)) =
                    subscriber.check_for_updates(Duration::from_millis(250))
                else {
                    continue;
                };
                let camera = token.trim_start_matches("config/enabled/");
                let Some(metrics) = cameras.get(camera) else {
                    continue;
                };
                let enabled = payload.trim() == "true";
                info!(camera, enabled, "camera toggled over the bus");
                metrics.set_enabled(enabled);
            }
        });
    }

    fn start_recordings_manager(
        &mut self,
    ) -> crossbeam::channel::Sender<(SharedFrame, Vec<i64>)> {
        let (tx, rx) = unbounded();
        let mut manager = RecordingsManager::new(
            self.db.clone(),
            self.camera_metrics
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            RECORD_DIR,
        );
        let stop = self.stop.clone();
        self.spawn("recordings-manager".to_owned(), move || {
            manager.init();
            manager.run(rx, stop);
        });
        tx
    }

    fn start_tracked_object_processor(
        &mut self,
        bus: &Bus,
        record_frames: crossbeam::channel::Sender<(SharedFrame, Vec<i64>)>,
    ) {
        let (frame_tx, frame_rx) = bounded(8);
        self.frame_feed = Some(frame_rx);

        let tracker = EventTracker::new(self.db.clone(), Some(self.frame_store.clone()));
        let mut processor = TrackedObjectProcessor::new(
            self.tracked_queue.clone(),
            tracker,
            Some(frame_tx),
            Some(record_frames),
            Some(bus.publisher("detection/")),
            self.stop.clone(),
        );
        self.spawn("tracked-object-processor".to_owned(), move || {
            processor.run();
        });
    }

    fn start_detector_sessions(&mut self) {
        let predictors: Vec<(String, PredictorConfig)> = self
            .config
            .predictors
            .iter()
            .map(|(name, predictor)| (name.clone(), predictor.clone()))
            .collect();

        for (name, predictor) in &predictors {
            if predictor.kpt_shape.is_some() {
                continue;
            }
            let session = ObjectDetectorSession::new(
                name.clone(),
                self.obj_detector_queue.clone(),
                self.camera_waits.clone(),
                predictor.clone(),
                self.stop.clone(),
            );
            self.spawn(format!("detector-{name}"), move || {
                let _ = session.run();
            });
        }

        // The keypoint stage takes the configured pose predictor, or a
        // stock single-image one.
        let pose_config = predictors
            .iter()
            .find(|(_, p)| p.kpt_shape.is_some())
            .map(|(_, p)| p.clone())
            .unwrap_or_else(|| PredictorConfig {
                model: ModelConfig {
                    path: "models/yolo11n-pose.onnx".to_owned(),
                    ..ModelConfig::default()
                },
                ..PredictorConfig::default()
            });
        let session = KeypointDetectorSession::new(
            self.keypoint_queue.clone(),
            self.camera_waits.clone(),
            pose_config,
            self.config.lpr.clone(),
            self.stop.clone(),
        );
        self.spawn("keypoint-detector".to_owned(), move || {
            let _ = session.run();
        });
    }

    fn enabled_cameras(&self) -> Vec<(String, crate::config::CameraConfig)> {
        self.config
            .cameras
            .iter()
            .filter(|(_, camera)| camera.enabled)
            .map(|(name, camera)| (name.clone(), camera.clone()))
            .collect()
    }

    fn start_camera_processors(&mut self) {
        let lpr = self.config.lpr.clone();
        for (name, camera) in self.enabled_cameras() {
            let ocr = if lpr.enabled {
                match OcrEngine::new(&lpr) {
                    Ok(engine) => Some(engine),
                    Err(e) => {
                        warn!(camera = %name, error = %e, "ocr disabled, models not loadable");
                        None
                    }
                }
            } else {
                None
            };
            let mut processor = CameraProcessor::new(
                name.clone(),
                camera,
                lpr.clone(),
                self.obj_detector_queue.clone(),
                self.keypoint_queue.clone(),
                self.tracked_queue.clone(),
                self.camera_waits[&name].clone(),
                self.camera_metrics[&name].clone(),
                Some(self.frame_store.clone()),
                ocr,
                self.stop.clone(),
            );
            self.spawn(format!("processor-{name}"), move || {
                processor.run();
            });
        }
    }

    fn start_camera_captures(&mut self) {
        for (name, camera) in self.enabled_cameras() {
            let capture = CameraCapture::new(
                name.clone(),
                camera,
                self.camera_metrics[&name].clone(),
                self.stop.clone(),
            );
            self.spawn(format!("capture-{name}"), move || {
                let _ = capture.run();
            });
        }
    }

    /// Graceful shutdown: raise the interruption flag, abort every queue so
    /// blocked threads wake, then give each thread a bounded grace period.
    /// A thread that will not exit is detached and reported rather than
    /// blocking the process.
    #[instrument(skip_all)]
    pub fn stop(&mut self) {
        info!("stopping engine");
        self.stop.request();

        for metrics in self.camera_metrics.values() {
            metrics.frame_queue().abort();
        }
        self.obj_detector_queue.abort();
        self.keypoint_queue.abort();
        self.tracked_queue.abort();

        // Reverse spawn order: captures first, then processors, sessions,
        // the tracked-object processor and the recordings manager.
        for (name, handle) in self.threads.drain(..).rev() {
            join_with_timeout(&name, handle, GRACEFUL_JOIN);
        }

        if let Some(bus) = self.bus.take() {
            bus.stop();
        }
        if let Some(proxy) = self.bus_proxy.take() {
            join_with_timeout("bus-proxy", proxy, GRACEFUL_JOIN);
        }
        info!("engine stopped");
    }
}

fn join_with_timeout(name: &str, handle: JoinHandle<()>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    if handle.is_finished() {
        if handle.join().is_err() {
            warn!(thread = name, "thread panicked");
        }
    } else {
        warn!(thread = name, "graceful termination timed out, detaching");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_CONFIG;

    fn test_config() -> AppConfig {
        let mut config: AppConfig = serde_yaml::from_str(DEFAULT_CONFIG).unwrap();
        config.database = Some(crate::config::DatabaseConfig {
            path: ":memory:".to_owned(),
        });
        // No real camera input in tests; captures exit on their own.
        for camera in config.cameras.values_mut() {
            camera.enabled = false;
        }
        config
    }

    #[test]
    fn queues_report_aborted_after_stop() {
        let mut engine = Engine::new(test_config()).unwrap();
        engine.start().unwrap();
        engine.stop();

        assert!(engine.obj_detector_queue.is_aborted());
        assert!(engine.keypoint_queue.is_aborted());
        assert!(engine.tracked_queue.is_aborted());
        assert!(engine.threads.is_empty());
    }

    #[test]
    fn stop_within_bounded_grace() {
        let mut engine = Engine::new(test_config()).unwrap();
        engine.start().unwrap();
        let started = Instant::now();
        engine.stop();
        // Two 500ms grace periods, with headroom for slow CI.
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
