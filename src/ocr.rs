use anyhow::Result;
use ndarray::Array3;
use tracing::{debug, instrument};

use crate::{
    config::{LprConfig, ModelConfig, PredictorConfig},
    detect::ops::{get_rotate_crop_image, rotate180, sort_quads, Letterbox},
    detect::OnnxPredictor,
    frame::{OcrResult, OcrResultList},
};

const DET_MODEL_PATH: &str = "models/ppocr_mobile_det/inference.onnx";
const CLS_MODEL_PATH: &str = "models/ppocr_textline_ori/inference.onnx";
const REC_MODEL_PATH: &str = "models/ppocr_mobile_rec/inference.onnx";

/// Binarization threshold on the detection probability map.
const DET_BIN_THRESHOLD: f32 = 0.3;
/// Mean-score floor for a candidate region.
const DET_BOX_THRESHOLD: f32 = 0.6;
/// Regions smaller than this many pixels on the map are noise.
const DET_MIN_REGION: usize = 10;

/// Index 0 of the recognizer output is the CTC blank.
const REC_CHARSET: &str =
    "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ:-./() ";

/// Three-stage text reading pipeline over cropped regions:
/// detection -> orientation classification -> CTC recognition.
/// The sub-models are external ONNX collaborators; this type owns their
/// sessions and the glue between the stages.
pub struct OcrEngine {
    det: OnnxPredictor,
    cls: OnnxPredictor,
    rec: OnnxPredictor,
    cls_threshold: f32,
    charset: Vec<char>,
}

fn stage_config(path: &str, width: u32, height: u32) -> PredictorConfig {
    PredictorConfig {
        model: ModelConfig {
            path: path.to_owned(),
            width,
            height,
            ..ModelConfig::default()
        },
        ..PredictorConfig::default()
    }
}

impl OcrEngine {
    #[instrument(skip_all, err)]
    pub fn new(lpr: &LprConfig) -> Result<OcrEngine> {
        Ok(OcrEngine {
            det: OnnxPredictor::load(&stage_config(DET_MODEL_PATH, 640, 640))?,
            cls: OnnxPredictor::load(&stage_config(CLS_MODEL_PATH, 192, 48))?,
            rec: OnnxPredictor::load(&stage_config(REC_MODEL_PATH, 320, 48))?,
            cls_threshold: lpr.cls_threshold,
            charset: REC_CHARSET.chars().collect(),
        })
    }

    /// One result list per input crop.
    pub fn predict(&mut self, batch: &[Array3<u8>]) -> Result<Vec<OcrResultList>> {
        let mut results_list = Vec::with_capacity(batch.len());
        for image in batch {
            results_list.push(self.predict_one(image)?);
        }
        Ok(results_list)
    }

    fn predict_one(&mut self, image: &Array3<u8>) -> Result<OcrResultList> {
        let (src_h, src_w) = (image.shape()[0], image.shape()[1]);

        // 1. det: probability map to quadrilaterals, reading order.
        let det_out = self.det.predict(&[image])?;
        let Some(((shape, data), letterbox)) = det_out.into_iter().next() else {
            return Ok(Vec::new());
        };
        let mut quads = extract_text_quads(
            &shape,
            &data,
            &letterbox,
            src_w,
            src_h,
            DET_BIN_THRESHOLD,
            DET_BOX_THRESHOLD,
        );
        sort_quads(&mut quads);
        if quads.is_empty() {
            return Ok(Vec::new());
        }

        // 2. rotate-crop each region.
        let mut crops: Vec<Array3<u8>> = quads
            .iter()
            .map(|quad| get_rotate_crop_image(image, quad))
            .collect();

        let mut results: OcrResultList = quads
            .into_iter()
            .map(|quad| OcrResult {
                quad,
                ..OcrResult::default()
            })
            .collect();

        // 3. cls: flip upside-down crops.
        let mut flips = Vec::new();
        for (index, (crop, result)) in crops.iter().zip(results.iter_mut()).enumerate() {
            let cls_out = self.cls.predict(&[crop])?;
            if let Some(((shape, data), _)) = cls_out.into_iter().next() {
                let (label, score) = classify_orientation(&shape, &data);
                result.cls_label = label;
                result.cls_score = score;
                if label % 2 == 1 && score > self.cls_threshold {
                    flips.push(index);
                }
            }
        }
        for index in flips {
            crops[index] = rotate180(&crops[index]);
        }

        // 4. rec: CTC decode to text.
        for (crop, result) in crops.iter().zip(results.iter_mut()) {
            let rec_out = self.rec.predict(&[crop])?;
            if let Some(((shape, data), _)) = rec_out.into_iter().next() {
                let (text, score) = ctc_decode(&shape, &data, &self.charset);
                result.text = text;
                result.score = score;
            }
        }

        debug!(regions = results.len(), "crop read");
        Ok(results)
    }
}

pub fn quad_area(quad: &[[i32; 2]; 4]) -> i64 {
    // Shoelace; quads from detection are convex.
    let mut doubled = 0i64;
    for i in 0..4 {
        let [x0, y0] = quad[i];
        let [x1, y1] = quad[(i + 1) % 4];
        doubled += x0 as i64 * y1 as i64 - x1 as i64 * y0 as i64;
    }
    doubled.abs() / 2
}

/// Extracts axis-aligned quadrilaterals from a `[1, 1, H, W]` probability
/// map via thresholding and connected components, mapped back to source
/// coordinates.
pub fn extract_text_quads(
    shape: &[usize],
    data: &[f32],
    letterbox: &Letterbox,
    src_w: usize,
    src_h: usize,
    bin_threshold: f32,
    box_threshold: f32,
) -> Vec<[[i32; 2]; 4]> {
    let (map_h, map_w) = match shape {
        [1, 1, h, w] => (*h, *w),
        [1, h, w] => (*h, *w),
        _ => return Vec::new(),
    };
    if data.len() < map_h * map_w {
        return Vec::new();
    }
    let at = |x: usize, y: usize| data[y * map_w + x];

    let mut visited = vec![false; map_h * map_w];
    let mut quads = Vec::new();
    for start_y in 0..map_h {
        for start_x in 0..map_w {
            if visited[start_y * map_w + start_x] || at(start_x, start_y) < bin_threshold {
                continue;
            }
            // Flood fill one component, tracking its bounds and mass.
            let (mut min_x, mut max_x, mut min_y, mut max_y) =
                (start_x, start_x, start_y, start_y);
            let mut score_sum = 0.0f32;
            let mut count = 0usize;
            let mut stack = vec![(start_x, start_y)];
            visited[start_y * map_w + start_x] = true;
            while let Some((x, y)) = stack.pop() {
                min_x = min_x.min(x);
                max_x = max_x.max(x);
                min_y = min_y.min(y);
                max_y = max_y.max(y);
                score_sum += at(x, y);
                count += 1;
                let neighbors = [
                    (x.wrapping_sub(1), y),
                    (x + 1, y),
                    (x, y.wrapping_sub(1)),
                    (x, y + 1),
                ];
                for (nx, ny) in neighbors {
                    if nx < map_w
                        && ny < map_h
                        && !visited[ny * map_w + nx]
                        && at(nx, ny) >= bin_threshold
                    {
                        visited[ny * map_w + nx] = true;
                        stack.push((nx, ny));
                    }
                }
            }

            if count < DET_MIN_REGION || score_sum / count as f32 < box_threshold {
                continue;
            }
            // Pad the box a little; the shrunken probability map undershoots
            // the true glyph extent.
            let pad_x = ((max_x - min_x) as f32 * 0.1).ceil();
            let pad_y = ((max_y - min_y) as f32 * 0.3).ceil();
            let clamp = |v: f32, hi: usize| v.clamp(0.0, hi as f32 - 1.0);
            let (x0, y0) = letterbox.unmap_point(min_x as f32 - pad_x, min_y as f32 - pad_y);
            let (x1, y1) = letterbox.unmap_point(max_x as f32 + pad_x, max_y as f32 + pad_y);
            let (x0, y0) = (clamp(x0, src_w), clamp(y0, src_h));
            let (x1, y1) = (clamp(x1, src_w), clamp(y1, src_h));
            quads.push([
                [x0 as i32, y0 as i32],
                [x1 as i32, y0 as i32],
                [x1 as i32, y1 as i32],
                [x0 as i32, y1 as i32],
            ]);
        }
    }
    quads
}

/// Argmax over a `[1, num_labels]` orientation output.
pub fn classify_orientation(shape: &[usize], data: &[f32]) -> (i32, f32) {
    let labels = match shape {
        [1, n] => *n,
        [1, 1, n] => *n,
        _ => return (0, 0.0),
    };
    let mut best = 0;
    let mut best_score = f32::MIN;
    for (label, &score) in data.iter().take(labels).enumerate() {
        if score > best_score {
            best = label;
            best_score = score;
        }
    }
    (best as i32, best_score)
}

/// Collapses a `[1, T, C]` (or `[T, C]`) CTC output into text plus the mean
/// per-kept-step confidence. Class 0 is the blank.
pub fn ctc_decode(shape: &[usize], data: &[f32], charset: &[char]) -> (String, f32) {
    let (steps, classes) = match shape {
        [1, t, c] => (*t, *c),
        [t, c] => (*t, *c),
        _ => return (String::new(), 0.0),
    };
    if classes == 0 || data.len() < steps * classes {
        return (String::new(), 0.0);
    }

    let mut text = String::new();
    let mut score_sum = 0.0f32;
    let mut kept = 0usize;
    let mut previous = 0usize;
    for t in 0..steps {
        let row = &data[t * classes..(t + 1) * classes];
        let (argmax, &score) = row
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .unwrap_or((0, &0.0));
        if argmax != 0 && argmax != previous {
            if let Some(&ch) = charset.get(argmax - 1) {
                text.push(ch);
                score_sum += score;
                kept += 1;
            }
        }
        previous = argmax;
    }
    let confidence = if kept == 0 { 0.0 } else { score_sum / kept as f32 };
    (text, confidence)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn charset() -> Vec<char> {
        REC_CHARSET.chars().collect()
    }

    /// Builds a [T, C] matrix with 1.0 at each step's argmax.
    fn steps(indices: &[usize], classes: usize) -> (Vec<usize>, Vec<f32>) {
        let mut data = vec![0.0; indices.len() * classes];
        for (t, &c) in indices.iter().enumerate() {
            data[t * classes + c] = 1.0;
        }
        (vec![1, indices.len(), classes], data)
    }

    #[test]
    fn ctc_collapses_repeats_and_blanks() {
        // charset[0] = '0' is class 1, charset[1] = '1' is class 2.
        let (shape, data) = steps(&[1, 1, 0, 1, 2, 2, 0, 0, 2], 71);
        let (text, score) = ctc_decode(&shape, &data, &charset());
        assert_eq!(text, "0011");
        assert_eq!(score, 1.0);
    }

    #[test]
    fn ctc_of_all_blanks_is_empty() {
        let (shape, data) = steps(&[0, 0, 0], 71);
        let (text, score) = ctc_decode(&shape, &data, &charset());
        assert!(text.is_empty());
        assert_eq!(score, 0.0);
    }

    #[test]
    fn orientation_argmax() {
        assert_eq!(classify_orientation(&[1, 2], &[0.9, 0.1]), (0, 0.9));
        assert_eq!(classify_orientation(&[1, 2], &[0.2, 0.8]), (1, 0.8));
    }

    #[test]
    fn quad_area_of_rectangle() {
        let quad = [[0, 0], [10, 0], [10, 4], [0, 4]];
        assert_eq!(quad_area(&quad), 40);
    }

    #[test]
    fn text_quads_found_in_synthetic_map() {
        // A 32x32 map with one bright 8x4 blob.
        let (map_w, map_h) = (32, 32);
        let mut data = vec![0.0f32; map_w * map_h];
        for y in 10..14 {
            for x in 4..12 {
                data[y * map_w + x] = 0.95;
            }
        }
        let letterbox = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        let quads = extract_text_quads(
            &[1, 1, map_h, map_w],
            &data,
            &letterbox,
            map_w,
            map_h,
            0.3,
            0.6,
        );
        assert_eq!(quads.len(), 1);
        let quad = quads[0];
        // The padded box still contains the blob.
        assert!(quad[0][0] <= 4 && quad[0][1] <= 10);
        assert!(quad[2][0] >= 11 && quad[2][1] >= 13);
    }

    #[test]
    fn faint_or_tiny_regions_are_dropped() {
        let (map_w, map_h) = (16, 16);
        let mut data = vec![0.0f32; map_w * map_h];
        // Tiny: 2 pixels.
        data[0] = 0.9;
        data[1] = 0.9;
        // Faint: big but below the box threshold mean.
        for y in 8..12 {
            for x in 0..12 {
                data[y * map_w + x] = 0.4;
            }
        }
        let letterbox = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        let quads = extract_text_quads(
            &[1, 1, map_h, map_w],
            &data,
            &letterbox,
            map_w,
            map_h,
            0.3,
            0.6,
        );
        assert!(quads.is_empty());
    }
}
