use std::{sync::Arc, time::Duration};

use tracing::{error, info, instrument, warn};

use crate::{
    camera::{CameraWait, SharedCameraMetrics},
    config::{CameraConfig, FilterConfig, LprConfig},
    detect::ops::perspective_crop_points,
    frame::{PredictionList, SharedFrame},
    ocr::{quad_area, OcrEngine},
    queue::{BoundedQueue, PushError},
    track::{DeltaPolicy, Tracker},
    util::{EventsPerSecond, FrameStore, Shutdown},
};

/// Classes whose keypoints outline a readable plate.
const LICENSE_PLATE_CLASSES: [&str; 1] = ["license_plate"];

/// Per-camera orchestrator: pull frame -> object detection -> filter ->
/// track -> delta policy -> keypoint detection -> OCR -> tracked queue.
///
/// The detector stages run on shared sessions; this thread parks on the
/// camera's condition for each stage with a per-mode deadline. Push-based
/// cameras prioritize completeness, pull-based ones liveness.
pub struct CameraProcessor {
    name: String,
    config: CameraConfig,
    lpr: LprConfig,
    obj_detector_queue: Arc<BoundedQueue<SharedFrame>>,
    keypoint_queue: Arc<BoundedQueue<SharedFrame>>,
    tracked_queue: Arc<BoundedQueue<SharedFrame>>,
    wait: Arc<CameraWait>,
    metrics: SharedCameraMetrics,
    frame_store: Option<Arc<FrameStore>>,
    ocr: Option<OcrEngine>,
    stop: Shutdown,
}

impl CameraProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        config: CameraConfig,
        lpr: LprConfig,
        obj_detector_queue: Arc<BoundedQueue<SharedFrame>>,
        keypoint_queue: Arc<BoundedQueue<SharedFrame>>,
        tracked_queue: Arc<BoundedQueue<SharedFrame>>,
        wait: Arc<CameraWait>,
        metrics: SharedCameraMetrics,
        frame_store: Option<Arc<FrameStore>>,
        ocr: Option<OcrEngine>,
        stop: Shutdown,
    ) -> CameraProcessor {
        CameraProcessor {
            name: name.into(),
            config,
            lpr,
            obj_detector_queue,
            keypoint_queue,
            tracked_queue,
            wait,
            metrics,
            frame_store,
            ocr,
            stop,
        }
    }

    /// Thread body.
    #[instrument(skip_all, fields(camera = %self.name))]
    pub fn run(&mut self) {
        let mut tracker = Tracker::new(self.config.objects.track.clone());
        let mut delta_policy = DeltaPolicy::new(tracker.track_buffer());

        let mut process_eps = EventsPerSecond::default();
        process_eps.start();
        let mut detectors_eps = EventsPerSecond::default();
        detectors_eps.start();

        let frame_queue = self.metrics.frame_queue().clone();
        info!("processor started");
        while !self.stop.is_requested() {
            let Ok(frame) = frame_queue.pop() else {
                break;
            };
            if frame.has_expired() {
                continue;
            }
            if let Some(store) = &self.frame_store {
                store.write(&frame.id(), frame.image().clone());
            }

            if !self.predict(&frame, &self.obj_detector_queue) {
                continue;
            }
            self.metrics.set_detection_frame(frame.index());

            // Track and filter predictions.
            let mut predictions = frame.predictions();
            if !self.config.objects.filters.is_empty() {
                predictions = filter_object_predictions(predictions, &self.config.objects.filters);
            }
            let track_ids = tracker.track(&predictions);
            delta_policy.apply(&mut predictions, &track_ids);
            frame.set_predictions(predictions);

            if !self.predict(&frame, &self.keypoint_queue) {
                continue;
            }
            detectors_eps.update();
            self.metrics.set_detection_fps(detectors_eps.eps());

            if self.lpr.enabled {
                self.recognize_license_plates(&frame);
            }

            process_eps.update();
            self.metrics.set_process_fps(process_eps.eps());

            // Downstream backpressure is best-effort.
            if let Err(PushError::Full(_)) = self.tracked_queue.try_push(frame) {
                warn!("tracked frame queue full, dropping frame");
            }
        }
        info!("processor stopped");
    }

    /// Hands the frame to a shared detector stage and waits for it to come
    /// back, bounded by the backpressure mode's timeout. Returns false when
    /// the frame should be dropped.
    fn predict(&self, frame: &SharedFrame, queue: &BoundedQueue<SharedFrame>) -> bool {
        if self.metrics.is_pull_based() {
            let timeout = Duration::from_millis(self.config.pull_based_timeout);
            if frame.has_expired() || queue.try_push(frame.clone()).is_err() {
                return false;
            }
            if !frame.has_been_processed()
                && !self.wait.wait_timeout(timeout, || frame.has_been_processed())
            {
                frame.set_has_expired(true);
                warn!(
                    frame_id = %frame.id(),
                    timeout_ms = timeout.as_millis() as u64,
                    "frame expired, system seems to be overloaded"
                );
                return false;
            }
        } else {
            let timeout = Duration::from_millis(self.config.push_based_timeout);
            if queue.push(frame.clone()).is_err() {
                return false;
            }
            if !frame.has_been_processed()
                && !self.wait.wait_timeout(timeout, || frame.has_been_processed())
            {
                // Keep going with whatever state the stage managed to set.
                error!(
                    frame_id = %frame.id(),
                    timeout_ms = timeout.as_millis() as u64,
                    "frame deadline missed in push-based mode"
                );
            }
        }

        // Reset so the next stage waits for its own completion.
        frame.set_has_been_processed(false);
        true
    }

    /// Perspective-crops every plate prediction and runs the OCR pipeline
    /// over the crops.
    fn recognize_license_plates(&mut self, frame: &SharedFrame) {
        let Some(ocr) = self.ocr.as_mut() else {
            return;
        };
        let predictions = frame.predictions();
        if predictions.is_empty() {
            return;
        }

        let crops: Vec<_> = predictions
            .iter()
            .filter(|p| LICENSE_PLATE_CLASSES.contains(&p.class_name.as_str()))
            .filter_map(|p| perspective_crop_points(frame.image(), &p.points))
            .collect();
        if crops.is_empty() {
            return;
        }

        match ocr.predict(&crops) {
            Ok(mut results_list) => {
                // Largest, most confident region first within each crop.
                for results in &mut results_list {
                    results.sort_by(|a, b| {
                        quad_area(&b.quad)
                            .cmp(&quad_area(&a.quad))
                            .then(b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal))
                    });
                }
                frame.set_ocr_results(results_list);
            }
            Err(e) => error!(error = %e, "ocr failed"),
        }
    }
}

/// Class-specific gate on area, aspect ratio and confidence. Classes with
/// no configured filter are dropped entirely.
pub fn filter_object_predictions(
    predictions: PredictionList,
    filters: &std::collections::BTreeMap<String, FilterConfig>,
) -> PredictionList {
    predictions
        .into_iter()
        .filter(|prediction| {
            let Some(filter) = filters.get(&prediction.class_name) else {
                return false;
            };
            let area = prediction.rect.area();
            if area < filter.min_area || area > filter.max_area {
                return false;
            }
            let ratio = prediction.rect.aspect_ratio();
            if ratio < filter.min_ratio || ratio > filter.max_ratio {
                return false;
            }
            prediction.conf >= filter.threshold
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::frame::{Prediction, Rect};

    fn prediction(class_name: &str, rect: Rect, conf: f32) -> Prediction {
        Prediction {
            rect,
            class_name: class_name.to_owned(),
            conf,
            ..Prediction::default()
        }
    }

    #[test]
    fn filters_gate_area_ratio_and_confidence() {
        let mut filters = BTreeMap::new();
        filters.insert(
            "car".to_owned(),
            FilterConfig {
                min_area: 1_000,
                max_area: 100_000,
                min_ratio: 0.5,
                max_ratio: 3.0,
                threshold: 0.7,
                min_score: 0.5,
            },
        );

        let kept = filter_object_predictions(
            vec![
                prediction("car", Rect::new(0, 0, 100, 100), 0.9), // passes
                prediction("car", Rect::new(0, 0, 10, 10), 0.9),   // too small
                prediction("car", Rect::new(0, 0, 1000, 200), 0.9), // too wide
                prediction("car", Rect::new(0, 0, 100, 100), 0.5), // low conf
                prediction("tree", Rect::new(0, 0, 100, 100), 0.9), // unfiltered class
            ],
            &filters,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].class_name, "car");
        assert_eq!(kept[0].conf, 0.9);
    }

    #[test]
    fn empty_filter_map_drops_everything() {
        let filters = BTreeMap::new();
        let kept = filter_object_predictions(
            vec![prediction("car", Rect::new(0, 0, 100, 100), 0.9)],
            &filters,
        );
        assert!(kept.is_empty());
    }
}
