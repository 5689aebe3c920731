use std::{fs, path::Path};

use anyhow::{Context, Result};

use crate::{
    detect::ops::{nms, Letterbox},
    frame::{KeyPoint, Prediction, PredictionList, Rect},
};

/// Default labelmap when the model ships without one.
pub const COCO_CLASSES: [&str; 80] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];

/// One class name per line.
pub fn load_labelmap<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let raw = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read labelmap {}", path.as_ref().display()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect())
}

fn class_name(labels: &[String], class_id: usize) -> String {
    labels
        .get(class_id)
        .cloned()
        .unwrap_or_else(|| class_id.to_string())
}

/// Decodes one YOLO11 detection output (`[1, 4 + nc, boxes]`, cxcywh in
/// letterbox coordinates) into predictions in full-frame coordinates.
pub fn decode_detections(
    shape: &[usize],
    data: &[f32],
    letterbox: &Letterbox,
    src_w: usize,
    src_h: usize,
    labels: &[String],
    conf_threshold: f32,
    iou_threshold: f32,
) -> PredictionList {
    let (channels, boxes) = match shape {
        [1, c, b] => (*c, *b),
        _ => return Vec::new(),
    };
    if channels < 5 || data.len() < channels * boxes {
        return Vec::new();
    }
    let at = |c: usize, b: usize| data[c * boxes + b];
    let num_classes = channels - 4;

    let mut rects = Vec::new();
    let mut scores = Vec::new();
    let mut class_ids = Vec::new();
    for b in 0..boxes {
        let mut best_class = 0;
        let mut best_score = 0.0f32;
        for class in 0..num_classes {
            let score = at(4 + class, b);
            if score > best_score {
                best_score = score;
                best_class = class;
            }
        }
        if best_score < conf_threshold {
            continue;
        }
        let (cx, cy, w, h) = (at(0, b), at(1, b), at(2, b), at(3, b));
        let model_rect = Rect::new(
            (cx - w / 2.0).round() as i32,
            (cy - h / 2.0).round() as i32,
            w.round() as i32,
            h.round() as i32,
        );
        rects.push(letterbox.unmap_rect(model_rect, src_w, src_h));
        scores.push(best_score);
        class_ids.push(best_class);
    }

    nms(&rects, &scores, iou_threshold)
        .into_iter()
        .map(|i| Prediction {
            rect: rects[i],
            class_name: class_name(labels, class_ids[i]),
            conf: scores[i],
            class_id: class_ids[i] as i32,
            ..Prediction::default()
        })
        .collect()
}

/// Decodes one YOLO11 pose output (`[1, 5 + kpt * 3, boxes]`, single class)
/// into predictions carrying keypoints, in full-frame coordinates.
#[allow(clippy::too_many_arguments)]
pub fn decode_poses(
    shape: &[usize],
    data: &[f32],
    letterbox: &Letterbox,
    src_w: usize,
    src_h: usize,
    class_label: &str,
    conf_threshold: f32,
    iou_threshold: f32,
) -> PredictionList {
    let (channels, boxes) = match shape {
        [1, c, b] => (*c, *b),
        _ => return Vec::new(),
    };
    if channels < 5 || data.len() < channels * boxes {
        return Vec::new();
    }
    let at = |c: usize, b: usize| data[c * boxes + b];
    let kpt_count = (channels - 5) / 3;

    let mut rects = Vec::new();
    let mut scores = Vec::new();
    let mut points = Vec::new();
    for b in 0..boxes {
        let conf = at(4, b);
        if conf < conf_threshold {
            continue;
        }
        let (cx, cy, w, h) = (at(0, b), at(1, b), at(2, b), at(3, b));
        let model_rect = Rect::new(
            (cx - w / 2.0).round() as i32,
            (cy - h / 2.0).round() as i32,
            w.round() as i32,
            h.round() as i32,
        );
        rects.push(letterbox.unmap_rect(model_rect, src_w, src_h));
        scores.push(conf);
        points.push(
            (0..kpt_count)
                .map(|k| {
                    let (x, y) =
                        letterbox.unmap_point(at(5 + k * 3, b), at(5 + k * 3 + 1, b));
                    KeyPoint {
                        x,
                        y,
                        conf: at(5 + k * 3 + 2, b),
                    }
                })
                .collect::<Vec<_>>(),
        );
    }

    nms(&rects, &scores, iou_threshold)
        .into_iter()
        .map(|i| Prediction {
            rect: rects[i],
            points: points[i].clone(),
            class_name: class_label.to_owned(),
            conf: scores[i],
            class_id: 0,
            ..Prediction::default()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_letterbox() -> Letterbox {
        Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        }
    }

    fn labels() -> Vec<String> {
        COCO_CLASSES.iter().map(|s| s.to_string()).collect()
    }

    /// Builds a `[1, channels, boxes]` tensor from per-box channel values.
    fn tensor(boxes: Vec<Vec<f32>>) -> (Vec<usize>, Vec<f32>) {
        let channels = boxes[0].len();
        let count = boxes.len();
        let mut data = vec![0.0; channels * count];
        for (b, row) in boxes.iter().enumerate() {
            for (c, &v) in row.iter().enumerate() {
                data[c * count + b] = v;
            }
        }
        (vec![1, channels, count], data)
    }

    #[test]
    fn detections_decode_and_filter_by_confidence() {
        // Two boxes, 3 classes: one confident car, one low-score person.
        let mut car = vec![100.0, 100.0, 40.0, 20.0];
        car.extend([0.1, 0.0, 0.9]); // class 2
        let mut person = vec![200.0, 200.0, 30.0, 60.0];
        person.extend([0.3, 0.0, 0.0]);
        let (shape, data) = tensor(vec![car, person]);

        let predictions = decode_detections(
            &shape,
            &data,
            &identity_letterbox(),
            320,
            320,
            &labels(),
            0.7,
            0.4,
        );
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].class_name, "car");
        assert_eq!(predictions[0].class_id, 2);
        assert_eq!(predictions[0].rect, Rect::new(80, 90, 40, 20));
        assert_eq!(predictions[0].tracker_id, -1);
    }

    #[test]
    fn overlapping_detections_collapse_to_best() {
        let mut a = vec![100.0, 100.0, 40.0, 40.0];
        a.extend([0.0, 0.95, 0.0]);
        let mut b = vec![102.0, 101.0, 40.0, 40.0];
        b.extend([0.0, 0.85, 0.0]);
        let (shape, data) = tensor(vec![a, b]);

        let predictions = decode_detections(
            &shape,
            &data,
            &identity_letterbox(),
            320,
            320,
            &labels(),
            0.7,
            0.4,
        );
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].conf, 0.95);
    }

    #[test]
    fn poses_carry_displaced_keypoints() {
        let letterbox = Letterbox {
            scale: 0.5,
            pad_x: 10.0,
            pad_y: 0.0,
        };
        // One plate with 4 keypoints.
        let mut row = vec![60.0, 40.0, 20.0, 10.0, 0.9];
        for k in 0..4 {
            row.extend([50.0 + k as f32 * 4.0, 36.0, 0.8]);
        }
        let (shape, data) = tensor(vec![row]);

        let predictions = decode_poses(
            &shape,
            &data,
            &letterbox,
            640,
            360,
            "license_plate",
            0.4,
            0.4,
        );
        assert_eq!(predictions.len(), 1);
        let prediction = &predictions[0];
        assert_eq!(prediction.class_name, "license_plate");
        assert_eq!(prediction.points.len(), 4);
        // (50 - 10) / 0.5 = 80 in source coordinates.
        assert_eq!(prediction.points[0].x, 80.0);
        assert_eq!(prediction.points[0].y, 72.0);
        // Box: cx 60 -> x (60 - 10 - 10) ... unmap applies to the corner.
        assert_eq!(prediction.rect, Rect::new(80, 70, 40, 20));
    }

    #[test]
    fn malformed_shapes_produce_nothing() {
        assert!(decode_detections(
            &[84, 2100],
            &[],
            &identity_letterbox(),
            320,
            320,
            &labels(),
            0.7,
            0.4
        )
        .is_empty());
    }
}
