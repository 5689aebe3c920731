mod onnx;
pub mod ops;
mod session;
mod yolo;

pub use onnx::OnnxPredictor;
pub use session::{KeypointDetectorSession, ObjectDetectorSession};
pub use yolo::{decode_detections, decode_poses, load_labelmap, COCO_CLASSES};
