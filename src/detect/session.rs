use std::sync::Arc;

use anyhow::Result;
use ndarray::Array3;
use tracing::{error, info, instrument, warn};

use crate::{
    camera::CameraWaitMap,
    config::{
        LprConfig, PredictorConfig, MODEL_IOU_THRESHOLD, MODEL_LP_CONFIDENCE_THRESHOLD,
        MODEL_OBJECTS_CONFIDENCE_THRESHOLD,
    },
    detect::ops::crop,
    detect::yolo::{decode_detections, decode_poses, load_labelmap, COCO_CLASSES},
    detect::OnnxPredictor,
    frame::{Prediction, SharedFrame},
    queue::BoundedQueue,
    util::{EventsPerSecond, Shutdown},
};

pub const LICENSE_PLATE_CLASS: &str = "license_plate";

/// Primary-model session shared by all cameras.
///
/// Pops frames off its input queue, accumulating a batch until the
/// configured size is reached or the queue runs momentarily empty, runs one
/// inference over the whole batch and hands each frame its predictions,
/// then wakes the camera processor parked on that frame.
pub struct ObjectDetectorSession {
    name: String,
    in_queue: Arc<BoundedQueue<SharedFrame>>,
    camera_waits: CameraWaitMap,
    config: PredictorConfig,
    labels: Vec<String>,
    stop: Shutdown,
}

impl ObjectDetectorSession {
    pub fn new(
        name: impl Into<String>,
        in_queue: Arc<BoundedQueue<SharedFrame>>,
        camera_waits: CameraWaitMap,
        config: PredictorConfig,
        stop: Shutdown,
    ) -> ObjectDetectorSession {
        let labels = match &config.model.labelmap_path {
            Some(path) => match load_labelmap(path) {
                Ok(labels) => labels,
                Err(e) => {
                    warn!(error = %e, "labelmap not loadable, using the built-in set");
                    COCO_CLASSES.iter().map(|s| s.to_string()).collect()
                }
            },
            None => COCO_CLASSES.iter().map(|s| s.to_string()).collect(),
        };
        ObjectDetectorSession {
            name: name.into(),
            in_queue,
            camera_waits,
            config,
            labels,
            stop,
        }
    }

    /// Thread body. The model is loaded here so the session owns its whole
    /// inference context.
    #[instrument(skip_all, fields(detector = %self.name), err)]
    pub fn run(&self) -> Result<()> {
        let mut detector = OnnxPredictor::load(&self.config)?;
        let max_batch_size = self.config.batch_size.max(1);
        let mut eps = EventsPerSecond::default();
        eps.start();

        info!("detector session started");
        'session: while !self.stop.is_requested() {
            let mut frames: Vec<SharedFrame> = Vec::new();
            while frames.len() < max_batch_size {
                let frame = if frames.is_empty() {
                    match self.in_queue.pop() {
                        Ok(frame) => frame,
                        Err(_) => break 'session,
                    }
                } else {
                    match self.in_queue.try_pop() {
                        Ok(frame) => frame,
                        Err(_) => break,
                    }
                };
                if frame.has_expired() {
                    continue;
                }
                frames.push(frame);
            }
            if frames.is_empty() {
                continue;
            }

            let images: Vec<&Array3<u8>> = frames.iter().map(|f| f.image()).collect();
            let results = match detector.predict(&images) {
                Ok(results) => results,
                Err(e) => {
                    // Inference failure skips this batch only.
                    error!(error = %e, batch = frames.len(), "inference failed");
                    continue;
                }
            };

            for (frame, ((shape, data), letterbox)) in frames.iter().zip(results) {
                if frame.has_expired() {
                    continue;
                }
                let (src_h, src_w) = frame.shape();
                let predictions = decode_detections(
                    &shape,
                    &data,
                    &letterbox,
                    src_w,
                    src_h,
                    &self.labels,
                    MODEL_OBJECTS_CONFIDENCE_THRESHOLD,
                    MODEL_IOU_THRESHOLD,
                );
                frame.set_predictions(predictions);
                frame.set_has_been_processed(true);
                if let Some(wait) = self.camera_waits.get(frame.camera()) {
                    wait.notify_all();
                }
            }
            eps.update();
        }

        info!("detector session stopped");
        Ok(())
    }
}

/// Secondary-model session: crops tracked vehicles flagged by the delta
/// policy, runs the keypoint model per crop and appends the displaced
/// results to the frame.
pub struct KeypointDetectorSession {
    in_queue: Arc<BoundedQueue<SharedFrame>>,
    camera_waits: CameraWaitMap,
    config: PredictorConfig,
    lpr: LprConfig,
    stop: Shutdown,
}

impl KeypointDetectorSession {
    pub fn new(
        in_queue: Arc<BoundedQueue<SharedFrame>>,
        camera_waits: CameraWaitMap,
        config: PredictorConfig,
        lpr: LprConfig,
        stop: Shutdown,
    ) -> KeypointDetectorSession {
        KeypointDetectorSession {
            in_queue,
            camera_waits,
            config,
            lpr,
            stop,
        }
    }

    #[instrument(name = "keypoint_session", skip_all, err)]
    pub fn run(&self) -> Result<()> {
        let mut detector = OnnxPredictor::load(&self.config)?;
        info!("keypoint session started");

        while !self.stop.is_requested() {
            let Ok(frame) = self.in_queue.pop() else {
                break;
            };
            if frame.has_expired() {
                continue;
            }

            // Only vehicles of interest that the delta policy flagged.
            let vehicles: Vec<Prediction> = frame
                .predictions()
                .into_iter()
                .filter(|p| self.lpr.voi.contains(&p.class_name) && p.has_deltas)
                .collect();

            let mut plates: Vec<Prediction> = Vec::new();
            if !vehicles.is_empty() {
                let crops: Vec<Array3<u8>> = vehicles
                    .iter()
                    .map(|vehicle| crop(frame.image(), &vehicle.rect))
                    .collect();
                let crop_refs: Vec<&Array3<u8>> = crops.iter().collect();
                match detector.predict(&crop_refs) {
                    Ok(results) => {
                        for (((shape, data), letterbox), (vehicle, vehicle_crop)) in
                            results.into_iter().zip(vehicles.iter().zip(&crops))
                        {
                            let (crop_h, crop_w) =
                                (vehicle_crop.shape()[0], vehicle_crop.shape()[1]);
                            let mut found = decode_poses(
                                &shape,
                                &data,
                                &letterbox,
                                crop_w,
                                crop_h,
                                LICENSE_PLATE_CLASS,
                                MODEL_LP_CONFIDENCE_THRESHOLD,
                                MODEL_IOU_THRESHOLD,
                            );
                            // Back into full-frame coordinates, then the
                            // configured confidence gate.
                            for plate in &mut found {
                                plate.rect.x += vehicle.rect.x;
                                plate.rect.y += vehicle.rect.y;
                                for point in &mut plate.points {
                                    point.x += vehicle.rect.x as f32;
                                    point.y += vehicle.rect.y as f32;
                                }
                            }
                            plates.extend(
                                found
                                    .into_iter()
                                    .filter(|p| p.conf >= self.lpr.detection_threshold),
                            );
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "keypoint inference failed");
                    }
                }
            }

            if frame.has_expired() {
                continue;
            }
            frame.add_predictions(plates);
            // Without this the camera processor would block until timeout
            // even when we finished early.
            frame.set_has_been_processed(true);
            if let Some(wait) = self.camera_waits.get(frame.camera()) {
                wait.notify_all();
            }
        }

        info!("keypoint session stopped");
        Ok(())
    }
}
