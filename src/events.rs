use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use crossbeam::channel::Sender;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    bus::Publisher,
    config::{THUMB_DIR, TRACKER_OBJECT_LOSS_LIMIT},
    db::{Database, EventRecord},
    detect::ops::crop,
    frame::{Prediction, PredictionList, SharedFrame},
    queue::BoundedQueue,
    util::{FrameStore, Shutdown},
};

#[derive(Debug, Clone)]
struct ActiveEvent {
    id: String,
    start_time: OffsetDateTime,
    top_score: f32,
    score: f32,
    first_frame_id: String,
}

/// Converts per-frame tracked detections into discrete events.
///
/// An event opens the first time a tracker id appears, is updated on every
/// frame it is seen, and is finalized and persisted once the id has been
/// absent for more than the loss limit of consecutive frames. Persisting
/// happens exactly once, at finalization; a crash before that loses the
/// in-flight event.
pub struct EventTracker {
    db: Arc<Database>,
    frame_store: Option<Arc<FrameStore>>,
    loss_limit: u32,
    active_events: HashMap<i64, ActiveEvent>,
    object_history: HashMap<i64, PredictionList>,
    lost_counts: HashMap<i64, u32>,
    last_seen: HashMap<i64, OffsetDateTime>,
}

impl EventTracker {
    pub fn new(db: Arc<Database>, frame_store: Option<Arc<FrameStore>>) -> EventTracker {
        EventTracker::with_loss_limit(db, frame_store, TRACKER_OBJECT_LOSS_LIMIT)
    }

    pub fn with_loss_limit(
        db: Arc<Database>,
        frame_store: Option<Arc<FrameStore>>,
        loss_limit: u32,
    ) -> EventTracker {
        EventTracker {
            db,
            frame_store,
            loss_limit,
            active_events: HashMap::new(),
            object_history: HashMap::new(),
            lost_counts: HashMap::new(),
            last_seen: HashMap::new(),
        }
    }

    /// Feeds one frame through the lifecycle. Returns the ids that opened
    /// an event on this frame, then the ids still active afterwards.
    pub fn observe(&mut self, frame: &SharedFrame) -> (Vec<i64>, Vec<i64>) {
        let predictions = frame.predictions();
        let frame_time = frame.timestamp();

        // Age out or refresh the objects we already know.
        let known: Vec<i64> = self.object_history.keys().copied().collect();
        for tracker_id in known {
            let found = predictions.iter().any(|p| p.tracker_id == tracker_id);
            if found {
                self.lost_counts.insert(tracker_id, 0);
                continue;
            }
            let lost = self.lost_counts.entry(tracker_id).or_insert(0);
            *lost += 1;
            if *lost > self.loss_limit {
                self.finalize(tracker_id, frame);
            }
        }

        // Open or update events for this frame's tracked predictions.
        let mut created = Vec::new();
        for prediction in &predictions {
            if prediction.tracker_id < 0 {
                continue;
            }
            let tracker_id = prediction.tracker_id;
            self.last_seen.insert(tracker_id, frame_time);
            match self.object_history.get_mut(&tracker_id) {
                None => {
                    let id = event_id(frame_time);
                    self.object_history.insert(tracker_id, vec![prediction.clone()]);
                    self.active_events.insert(
                        tracker_id,
                        ActiveEvent {
                            id,
                            start_time: frame_time,
                            top_score: prediction.conf,
                            score: prediction.conf,
                            first_frame_id: frame.id(),
                        },
                    );
                    created.push(tracker_id);
                }
                Some(history) => {
                    history.push(prediction.clone());
                    if let Some(event) = self.active_events.get_mut(&tracker_id) {
                        event.top_score = event.top_score.max(prediction.conf);
                        event.score = prediction.conf;
                    }
                }
            }
        }

        let mut active: Vec<i64> = self.active_events.keys().copied().collect();
        active.sort_unstable();
        (created, active)
    }

    /// Persists the event transactionally and drops the id from all maps.
    /// On a persistence failure the event is lost, by design of the error
    /// taxonomy: no retry.
    fn finalize(&mut self, tracker_id: i64, frame: &SharedFrame) {
        let history = self.object_history.remove(&tracker_id).unwrap_or_default();
        let lost_entry = self.active_events.remove(&tracker_id);
        self.lost_counts.remove(&tracker_id);
        let end_time = self.last_seen.remove(&tracker_id);

        let Some(event) = lost_entry else {
            warn!(tracker_id, "missing event during cleanup");
            return;
        };

        let label = history
            .first()
            .map(|p| p.class_name.clone())
            .unwrap_or_else(|| "unknown".to_owned());
        let data = serde_json::to_string(&history).unwrap_or_else(|_| "[]".to_owned());
        let record = EventRecord {
            id: event.id.clone(),
            tracker_id,
            label,
            camera: frame.camera().to_owned(),
            start_time: event.start_time,
            end_time: end_time.unwrap_or(event.start_time),
            top_score: event.top_score,
            score: event.score,
            data,
        };
        if let Err(e) = self.db.insert_event(&record) {
            error!(tracker_id, error = %e, "failed to persist event");
            return;
        }
        info!(tracker_id, event_id = %event.id, "event finalized");

        self.save_thumbnail(&event, history.first());
    }

    /// Best-effort: the first frame may already have left the store.
    fn save_thumbnail(&self, event: &ActiveEvent, first_prediction: Option<&Prediction>) {
        let (Some(store), Some(prediction)) = (self.frame_store.as_ref(), first_prediction)
        else {
            return;
        };
        let Some(image) = store.get(&event.first_frame_id) else {
            return;
        };
        let cropped = crop(&image, &prediction.rect);
        if let Err(e) = write_jpeg(&cropped, &thumbnail_path(&event.id)) {
            warn!(event_id = %event.id, error = %e, "failed to write thumbnail");
        }
    }

    #[cfg(test)]
    fn active_len(&self) -> usize {
        self.active_events.len()
    }
}

fn event_id(start: OffsetDateTime) -> String {
    let stamp = start
        .format(&Rfc3339)
        .unwrap_or_else(|_| start.unix_timestamp().to_string());
    format!("{stamp}-{}", Uuid::new_v4())
}

fn thumbnail_path(event_id: &str) -> PathBuf {
    Path::new(THUMB_DIR).join(format!("{event_id}.jpg"))
}

fn write_jpeg(image: &ndarray::Array3<u8>, path: &Path) -> Result<()> {
    let (h, w) = (image.shape()[0] as u32, image.shape()[1] as u32);
    // BGR to RGB for the encoder.
    let mut rgb = Vec::with_capacity((h * w * 3) as usize);
    for y in 0..h as usize {
        for x in 0..w as usize {
            rgb.push(image[(y, x, 2)]);
            rgb.push(image[(y, x, 1)]);
            rgb.push(image[(y, x, 0)]);
        }
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(path)?;
    let mut encoder = image::codecs::jpeg::JpegEncoder::new(&mut file);
    encoder.encode(&rgb, w, h, image::ColorType::Rgb8)?;
    Ok(())
}

/// Thread that drains the tracked-frame queue, runs the event lifecycle and
/// fans the frame out to UI consumers and the recordings manager.
pub struct TrackedObjectProcessor {
    queue: Arc<BoundedQueue<SharedFrame>>,
    tracker: EventTracker,
    frame_changed: Option<Sender<SharedFrame>>,
    record_frames: Option<Sender<(SharedFrame, Vec<i64>)>>,
    detections: Option<Publisher>,
    stop: Shutdown,
}

impl TrackedObjectProcessor {
    pub fn new(
        queue: Arc<BoundedQueue<SharedFrame>>,
        tracker: EventTracker,
        frame_changed: Option<Sender<SharedFrame>>,
        record_frames: Option<Sender<(SharedFrame, Vec<i64>)>>,
        detections: Option<Publisher>,
        stop: Shutdown,
    ) -> TrackedObjectProcessor {
        TrackedObjectProcessor {
            queue,
            tracker,
            frame_changed,
            record_frames,
            detections,
            stop,
        }
    }

    /// Thread body; exits when the queue aborts or shutdown is requested.
    #[instrument(name = "tracked_object_processor", skip_all)]
    pub fn run(&mut self) {
        info!("started");
        while !self.stop.is_requested() {
            let Ok(frame) = self.queue.pop() else {
                break;
            };

            let (created, active) = self.tracker.observe(&frame);
            if let Some(detections) = &self.detections {
                for tracker_id in created {
                    detections.publish("new", &format!("{} {tracker_id}", frame.camera()));
                }
            }
            if let Some(frame_changed) = &self.frame_changed {
                // UI consumers are best-effort; never block the pipeline.
                let _ = frame_changed.try_send(frame.clone());
            }
            if let Some(record_frames) = &self.record_frames {
                let _ = record_frames.send((frame, active));
            }
        }
        info!("stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ndarray::Array3;

    use super::*;
    use crate::frame::{Frame, Rect};

    fn frame_with(camera: &str, index: u64, predictions: PredictionList) -> SharedFrame {
        let frame = Frame::new(camera, index, Array3::zeros((8, 8, 3)));
        frame.set_predictions(predictions);
        Arc::new(frame)
    }

    fn tracked(id: i64, class_name: &str, conf: f32) -> Prediction {
        Prediction {
            rect: Rect::new(0, 0, 100, 100),
            class_name: class_name.to_owned(),
            conf,
            class_id: 2,
            tracker_id: id,
            ..Prediction::default()
        }
    }

    #[test]
    fn one_event_per_track_with_top_score() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let mut tracker = EventTracker::with_loss_limit(db.clone(), None, 2);

        // Seen for three frames with varying confidence...
        for (index, conf) in [(0, 0.8f32), (1, 0.95), (2, 0.7)] {
            let (created, active) =
                tracker.observe(&frame_with("cam", index, vec![tracked(5, "car", conf)]));
            assert_eq!(created.len(), usize::from(index == 0));
            assert_eq!(active, vec![5]);
        }
        assert_eq!(db.event_count().unwrap(), 0);

        // ...then absent past the loss limit.
        for index in 3..7 {
            tracker.observe(&frame_with("cam", index, Vec::new()));
        }
        assert_eq!(db.event_count().unwrap(), 1);
        assert_eq!(tracker.active_len(), 0);

        let event = db.events_for_camera("cam").unwrap().remove(0);
        assert_eq!(event.top_score, 0.95);
        assert_eq!(event.score, 0.7);
        assert!(event.top_score >= event.score);
    }

    #[test]
    fn finalized_event_fields_are_consistent() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let mut tracker = EventTracker::with_loss_limit(db.clone(), None, 1);

        tracker.observe(&frame_with("cam", 0, vec![tracked(9, "person", 0.6)]));
        tracker.observe(&frame_with("cam", 1, vec![tracked(9, "person", 0.9)]));
        tracker.observe(&frame_with("cam", 2, vec![tracked(9, "person", 0.8)]));
        for index in 3..6 {
            tracker.observe(&frame_with("cam", index, Vec::new()));
        }

        assert_eq!(db.event_count().unwrap(), 1);
        assert_eq!(tracker.active_len(), 0);

        let event = db.events_for_camera("cam").unwrap().remove(0);
        assert_eq!(event.tracker_id, 9);
        assert_eq!(event.label, "person");
        assert_eq!(event.top_score, 0.9);
        assert_eq!(event.score, 0.8);
        assert!(event.end_time >= event.start_time);
        let history: PredictionList = serde_json::from_str(&event.data).unwrap();
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn intermittent_sightings_reset_the_loss_counter() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let mut tracker = EventTracker::with_loss_limit(db.clone(), None, 2);

        tracker.observe(&frame_with("cam", 0, vec![tracked(3, "car", 0.9)]));
        for index in 1..3 {
            tracker.observe(&frame_with("cam", index, Vec::new()));
        }
        // Reappears just in time: still the same active event.
        let (created, active) =
            tracker.observe(&frame_with("cam", 3, vec![tracked(3, "car", 0.9)]));
        assert!(created.is_empty());
        assert_eq!(active, vec![3]);
        assert_eq!(db.event_count().unwrap(), 0);
    }

    #[test]
    fn concurrent_tracks_stay_separate() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let mut tracker = EventTracker::with_loss_limit(db.clone(), None, 1);

        tracker.observe(&frame_with(
            "cam",
            0,
            vec![tracked(1, "car", 0.9), tracked(2, "person", 0.8)],
        ));
        // Track 1 drops out, track 2 stays.
        for index in 1..4 {
            tracker.observe(&frame_with("cam", index, vec![tracked(2, "person", 0.8)]));
        }
        assert_eq!(db.event_count().unwrap(), 1);
        assert_eq!(tracker.active_len(), 1);
    }
}
