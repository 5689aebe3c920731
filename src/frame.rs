use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock,
};

use ndarray::Array3;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Axis-aligned box in full-frame pixel coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Rect {
        Rect {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> i64 {
        self.width as i64 * self.height as i64
    }

    pub fn aspect_ratio(&self) -> f32 {
        if self.height == 0 {
            return f32::INFINITY;
        }
        self.width as f32 / self.height as f32
    }
}

/// One keypoint with its visibility score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyPoint {
    pub x: f32,
    pub y: f32,
    pub conf: f32,
}

/// One detection or keypoint result. Only the members relevant to the task
/// at hand are meaningful.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub rect: Rect,
    /// Keypoints, when produced by a pose model.
    pub points: Vec<KeyPoint>,
    pub class_name: String,
    pub conf: f32,
    pub class_id: i32,
    /// >= 0 when associated with a persistent track, -1 otherwise.
    pub tracker_id: i64,
    /// Downstream stages re-examine this object on the current frame.
    pub has_deltas: bool,
}

impl Default for Prediction {
    fn default() -> Prediction {
        Prediction {
            rect: Rect::default(),
            points: Vec::new(),
            class_name: String::new(),
            conf: 0.0,
            class_id: -1,
            tracker_id: -1,
            has_deltas: false,
        }
    }
}

pub type PredictionList = Vec<Prediction>;

/// One recognized text region inside a crop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OcrResult {
    /// Quadrilateral in crop coordinates, clockwise from top-left.
    pub quad: [[i32; 2]; 4],
    pub text: String,
    pub score: f32,
    pub cls_label: i32,
    pub cls_score: f32,
}

pub type OcrResultList = Vec<OcrResult>;

#[derive(Default)]
struct FrameState {
    predictions: PredictionList,
    ocr_results: Vec<OcrResultList>,
}

/// One decoded image plus its per-stage annotations.
///
/// Identity (camera, index), the BGR payload and the capture timestamp are
/// immutable; predictions and OCR results live behind a reader-writer lock
/// and the expiry/processed flags are plain atomics, so sharing one frame
/// across stages stays cheap. Pass it around as a [`SharedFrame`]; the image
/// is never copied unless [`Frame::clone_frame`] is asked for.
pub struct Frame {
    camera: String,
    index: u64,
    timestamp: OffsetDateTime,
    image: Array3<u8>,
    state: RwLock<FrameState>,
    has_expired: AtomicBool,
    has_been_processed: AtomicBool,
}

pub type SharedFrame = Arc<Frame>;

impl Frame {
    /// `image` is height x width x 3, BGR.
    pub fn new(camera: impl Into<String>, index: u64, image: Array3<u8>) -> Frame {
        Frame::with_timestamp(camera, index, image, OffsetDateTime::now_utc())
    }

    pub fn with_timestamp(
        camera: impl Into<String>,
        index: u64,
        image: Array3<u8>,
        timestamp: OffsetDateTime,
    ) -> Frame {
        Frame {
            camera: camera.into(),
            index,
            timestamp,
            image,
            state: RwLock::new(FrameState::default()),
            has_expired: AtomicBool::new(false),
            has_been_processed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> String {
        make_id(&self.camera, self.index)
    }

    pub fn camera(&self) -> &str {
        &self.camera
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    pub fn image(&self) -> &Array3<u8> {
        &self.image
    }

    /// (height, width)
    pub fn shape(&self) -> (usize, usize) {
        let s = self.image.shape();
        (s[0], s[1])
    }

    pub fn predictions(&self) -> PredictionList {
        self.state.read().unwrap().predictions.clone()
    }

    pub fn set_predictions(&self, predictions: PredictionList) {
        self.state.write().unwrap().predictions = predictions;
    }

    pub fn add_predictions(&self, mut predictions: PredictionList) {
        self.state.write().unwrap().predictions.append(&mut predictions);
    }

    pub fn ocr_results(&self) -> Vec<OcrResultList> {
        self.state.read().unwrap().ocr_results.clone()
    }

    pub fn set_ocr_results(&self, results: Vec<OcrResultList>) {
        self.state.write().unwrap().ocr_results = results;
    }

    pub fn has_expired(&self) -> bool {
        self.has_expired.load(Ordering::Acquire)
    }

    pub fn set_has_expired(&self, expired: bool) {
        if self.has_expired.load(Ordering::Relaxed) != expired {
            self.has_expired.store(expired, Ordering::Release);
        }
    }

    pub fn has_been_processed(&self) -> bool {
        self.has_been_processed.load(Ordering::Acquire)
    }

    pub fn set_has_been_processed(&self, processed: bool) {
        if self.has_been_processed.load(Ordering::Relaxed) != processed {
            self.has_been_processed.store(processed, Ordering::Release);
        }
    }

    /// Independent frame: the image is deep-copied, the prediction list is
    /// copied shallowly and the flags start out cleared.
    pub fn clone_frame(&self) -> Frame {
        let state = self.state.read().unwrap();
        let frame = Frame::with_timestamp(
            self.camera.clone(),
            self.index,
            self.image.clone(),
            self.timestamp,
        );
        frame.state.write().unwrap().predictions = state.predictions.clone();
        frame
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id())
            .field("shape", &self.shape())
            .field("timestamp", &self.timestamp)
            .field("has_expired", &self.has_expired())
            .field("has_been_processed", &self.has_been_processed())
            .finish()
    }
}

/// `camera` and `index` rendered as `camera_index`.
pub fn make_id(camera: &str, index: u64) -> String {
    format!("{camera}_{index}")
}

/// Inverse of [`make_id`]. Fails when the separator is missing, a part is
/// empty, or the suffix is not an unsigned integer.
pub fn split_id(id: &str) -> Option<(String, u64)> {
    let mut parts = id.split('_').filter(|p| !p.is_empty());
    let camera = parts.next()?;
    let index = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let index = index.parse::<u64>().ok()?;
    Some((camera.to_owned(), index))
}
