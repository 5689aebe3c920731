//! Image and box operations shared by the detector stages, written as pure
//! functions over arrays so they are testable with synthetic inputs.

use nalgebra::{DMatrix, DVector, Matrix3};
use ndarray::{s, Array3};

use crate::frame::{KeyPoint, Rect};

pub const LETTERBOX_FILL: u8 = 114;

/// How a letterboxed image maps back to its source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

/// Resizes with preserved aspect ratio onto a `dst_h` x `dst_w` canvas,
/// padding the borders with neutral gray.
pub fn letterbox(image: &Array3<u8>, dst_w: usize, dst_h: usize) -> (Array3<u8>, Letterbox) {
    let (src_h, src_w) = (image.shape()[0], image.shape()[1]);
    let scale = (dst_w as f32 / src_w as f32).min(dst_h as f32 / src_h as f32);
    let new_w = ((src_w as f32 * scale).round() as usize).max(1);
    let new_h = ((src_h as f32 * scale).round() as usize).max(1);
    let pad_x = (dst_w - new_w) as f32 / 2.0;
    let pad_y = (dst_h - new_h) as f32 / 2.0;

    let resized = resize_bilinear(image, new_w, new_h);
    let mut canvas = Array3::from_elem((dst_h, dst_w, 3), LETTERBOX_FILL);
    let y0 = pad_y as usize;
    let x0 = pad_x as usize;
    canvas
        .slice_mut(s![y0..y0 + new_h, x0..x0 + new_w, ..])
        .assign(&resized);

    (canvas, Letterbox { scale, pad_x, pad_y })
}

impl Letterbox {
    /// Maps a box from letterbox coordinates back to source coordinates,
    /// clamped to the source bounds.
    pub fn unmap_rect(&self, rect: Rect, src_w: usize, src_h: usize) -> Rect {
        let x = ((rect.x as f32 - self.pad_x) / self.scale).round() as i32;
        let y = ((rect.y as f32 - self.pad_y) / self.scale).round() as i32;
        let w = (rect.width as f32 / self.scale).round() as i32;
        let h = (rect.height as f32 / self.scale).round() as i32;

        let x = x.clamp(0, src_w as i32 - 1);
        let y = y.clamp(0, src_h as i32 - 1);
        let w = w.clamp(0, src_w as i32 - x);
        let h = h.clamp(0, src_h as i32 - y);
        Rect::new(x, y, w, h)
    }

    pub fn unmap_point(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

pub fn resize_bilinear(image: &Array3<u8>, dst_w: usize, dst_h: usize) -> Array3<u8> {
    let (src_h, src_w) = (image.shape()[0], image.shape()[1]);
    let mut out = Array3::zeros((dst_h, dst_w, 3));
    let sx = src_w as f32 / dst_w as f32;
    let sy = src_h as f32 / dst_h as f32;
    for y in 0..dst_h {
        let fy = ((y as f32 + 0.5) * sy - 0.5).max(0.0);
        let y0 = (fy as usize).min(src_h - 1);
        let y1 = (y0 + 1).min(src_h - 1);
        let wy = fy - y0 as f32;
        for x in 0..dst_w {
            let fx = ((x as f32 + 0.5) * sx - 0.5).max(0.0);
            let x0 = (fx as usize).min(src_w - 1);
            let x1 = (x0 + 1).min(src_w - 1);
            let wx = fx - x0 as f32;
            for c in 0..3 {
                let top = image[(y0, x0, c)] as f32 * (1.0 - wx) + image[(y0, x1, c)] as f32 * wx;
                let bottom =
                    image[(y1, x0, c)] as f32 * (1.0 - wx) + image[(y1, x1, c)] as f32 * wx;
                out[(y, x, c)] = (top * (1.0 - wy) + bottom * wy).round() as u8;
            }
        }
    }
    out
}

pub fn iou(a: &Rect, b: &Rect) -> f32 {
    let ix = (a.x + a.width).min(b.x + b.width) - a.x.max(b.x);
    let iy = (a.y + a.height).min(b.y + b.height) - a.y.max(b.y);
    if ix <= 0 || iy <= 0 {
        return 0.0;
    }
    let inter = ix as i64 * iy as i64;
    let union = a.area() + b.area() - inter;
    if union <= 0 {
        0.0
    } else {
        inter as f32 / union as f32
    }
}

/// Non-maximum suppression; returns indices of the surviving boxes, in
/// descending score order.
pub fn nms(boxes: &[Rect], scores: &[f32], iou_threshold: f32) -> Vec<usize> {
    assert_eq!(boxes.len(), scores.len());
    let mut order: Vec<usize> = (0..boxes.len()).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(boxes[a].area().cmp(&boxes[b].area()))
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; boxes.len()];
    for &i in &order {
        if suppressed[i] {
            continue;
        }
        keep.push(i);
        for &j in &order {
            if !suppressed[j] && j != i && iou(&boxes[i], &boxes[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }
    keep
}

/// Axis-aligned crop, clamped to the image bounds.
pub fn crop(image: &Array3<u8>, rect: &Rect) -> Array3<u8> {
    let (h, w) = (image.shape()[0] as i32, image.shape()[1] as i32);
    let x0 = rect.x.clamp(0, w - 1);
    let y0 = rect.y.clamp(0, h - 1);
    let x1 = (rect.x + rect.width).clamp(x0 + 1, w);
    let y1 = (rect.y + rect.height).clamp(y0 + 1, h);
    image
        .slice(s![y0 as usize..y1 as usize, x0 as usize..x1 as usize, ..])
        .to_owned()
}

fn bilinear_sample(image: &Array3<u8>, x: f32, y: f32, c: usize) -> f32 {
    let (h, w) = (image.shape()[0], image.shape()[1]);
    let x = x.clamp(0.0, w as f32 - 1.0);
    let y = y.clamp(0.0, h as f32 - 1.0);
    let x0 = x as usize;
    let y0 = y as usize;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let wx = x - x0 as f32;
    let wy = y - y0 as f32;
    let top = image[(y0, x0, c)] as f32 * (1.0 - wx) + image[(y0, x1, c)] as f32 * wx;
    let bottom = image[(y1, x0, c)] as f32 * (1.0 - wx) + image[(y1, x1, c)] as f32 * wx;
    top * (1.0 - wy) + bottom * wy
}

/// Solves the homography that maps `dst` (corners of the output rectangle)
/// onto `src` (the quadrilateral in the input image).
fn homography(src: &[(f32, f32); 4], dst: &[(f32, f32); 4]) -> Option<Matrix3<f64>> {
    let mut a = DMatrix::<f64>::zeros(8, 8);
    let mut b = DVector::<f64>::zeros(8);
    for i in 0..4 {
        let (x, y) = (dst[i].0 as f64, dst[i].1 as f64);
        let (u, v) = (src[i].0 as f64, src[i].1 as f64);
        a.set_row(i * 2, &nalgebra::RowDVector::from_row_slice(&[
            x, y, 1.0, 0.0, 0.0, 0.0, -x * u, -y * u,
        ]));
        a.set_row(i * 2 + 1, &nalgebra::RowDVector::from_row_slice(&[
            0.0, 0.0, 0.0, x, y, 1.0, -x * v, -y * v,
        ]));
        b[i * 2] = u;
        b[i * 2 + 1] = v;
    }
    let h = a.lu().solve(&b)?;
    Some(Matrix3::new(
        h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0,
    ))
}

/// Warps the quadrilateral `quad` (top-left, top-right, bottom-right,
/// bottom-left) into an upright rectangle sized after the quad's edges.
pub fn perspective_crop(image: &Array3<u8>, quad: &[(f32, f32); 4]) -> Array3<u8> {
    let dist = |a: (f32, f32), b: (f32, f32)| ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt();
    let out_w = dist(quad[0], quad[1]).max(dist(quad[3], quad[2])).round() as usize;
    let out_h = dist(quad[0], quad[3]).max(dist(quad[1], quad[2])).round() as usize;
    let out_w = out_w.max(1);
    let out_h = out_h.max(1);

    let dst = [
        (0.0, 0.0),
        (out_w as f32 - 1.0, 0.0),
        (out_w as f32 - 1.0, out_h as f32 - 1.0),
        (0.0, out_h as f32 - 1.0),
    ];
    let Some(h) = homography(quad, &dst) else {
        // Degenerate quad, fall back to the bounding box.
        let min_x = quad.iter().map(|p| p.0).fold(f32::INFINITY, f32::min) as i32;
        let min_y = quad.iter().map(|p| p.1).fold(f32::INFINITY, f32::min) as i32;
        return crop(
            image,
            &Rect::new(min_x, min_y, out_w as i32, out_h as i32),
        );
    };

    let mut out = Array3::zeros((out_h, out_w, 3));
    for y in 0..out_h {
        for x in 0..out_w {
            let p = h * nalgebra::Vector3::new(x as f64, y as f64, 1.0);
            let sx = (p[0] / p[2]) as f32;
            let sy = (p[1] / p[2]) as f32;
            for c in 0..3 {
                out[(y, x, c)] = bilinear_sample(image, sx, sy, c).round() as u8;
            }
        }
    }
    out
}

/// Perspective-crops `quad` from keypoints.
pub fn perspective_crop_points(image: &Array3<u8>, points: &[KeyPoint]) -> Option<Array3<u8>> {
    if points.len() < 4 {
        return None;
    }
    let quad = [
        (points[0].x, points[0].y),
        (points[1].x, points[1].y),
        (points[2].x, points[2].y),
        (points[3].x, points[3].y),
    ];
    Some(perspective_crop(image, &quad))
}

/// Extracts a text region the way the OCR recognizer expects it: perspective
/// crop, then a 90° rotation when the region is markedly taller than wide.
pub fn get_rotate_crop_image(image: &Array3<u8>, quad: &[[i32; 2]; 4]) -> Array3<u8> {
    let quad_f = [
        (quad[0][0] as f32, quad[0][1] as f32),
        (quad[1][0] as f32, quad[1][1] as f32),
        (quad[2][0] as f32, quad[2][1] as f32),
        (quad[3][0] as f32, quad[3][1] as f32),
    ];
    let cropped = perspective_crop(image, &quad_f);
    let (h, w) = (cropped.shape()[0], cropped.shape()[1]);
    if h as f32 / w as f32 >= 1.5 {
        rotate90_ccw(&cropped)
    } else {
        cropped
    }
}

pub fn rotate90_ccw(image: &Array3<u8>) -> Array3<u8> {
    let (h, w) = (image.shape()[0], image.shape()[1]);
    let mut out = Array3::zeros((w, h, 3));
    for y in 0..h {
        for x in 0..w {
            for c in 0..3 {
                out[(w - 1 - x, y, c)] = image[(y, x, c)];
            }
        }
    }
    out
}

pub fn rotate180(image: &Array3<u8>) -> Array3<u8> {
    let (h, w) = (image.shape()[0], image.shape()[1]);
    let mut out = Array3::zeros((h, w, 3));
    for y in 0..h {
        for x in 0..w {
            for c in 0..3 {
                out[(h - 1 - y, w - 1 - x, c)] = image[(y, x, c)];
            }
        }
    }
    out
}

/// Orders detected quads top-left to bottom-right: primarily by the top
/// edge, with a small tolerance inside which the left edge decides.
pub fn sort_quads(quads: &mut [[[i32; 2]; 4]]) {
    quads.sort_by(|a, b| {
        let (ax, ay) = (a[0][0], a[0][1]);
        let (bx, by) = (b[0][0], b[0][1]);
        if (ay - by).abs() < 10 {
            ax.cmp(&bx)
        } else {
            ay.cmp(&by)
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_image(h: usize, w: usize) -> Array3<u8> {
        let mut image = Array3::zeros((h, w, 3));
        for y in 0..h {
            for x in 0..w {
                for c in 0..3 {
                    image[(y, x, c)] = ((x + y + c) % 256) as u8;
                }
            }
        }
        image
    }

    #[test]
    fn letterbox_pads_the_short_side() {
        let image = gradient_image(100, 200);
        let (boxed, params) = letterbox(&image, 64, 64);
        assert_eq!(boxed.shape(), &[64, 64, 3]);
        assert_eq!(params.scale, 64.0 / 200.0);
        assert_eq!(params.pad_x, 0.0);
        assert_eq!(params.pad_y, 16.0);
        // Padding rows carry the fill value.
        assert_eq!(boxed[(0, 0, 0)], LETTERBOX_FILL);
        assert_eq!(boxed[(63, 63, 0)], LETTERBOX_FILL);
    }

    #[test]
    fn letterbox_round_trips_boxes() {
        let image = gradient_image(100, 200);
        let (_, params) = letterbox(&image, 64, 64);
        let model_box = Rect::new(10, 20, 20, 10);
        let unmapped = params.unmap_rect(model_box, 200, 100);
        assert_eq!(unmapped.x, (10.0 / params.scale).round() as i32);
        assert_eq!(unmapped.y, ((20.0 - 16.0) / params.scale).round() as i32);
        assert_eq!(unmapped.width, (20.0 / params.scale).round() as i32);
    }

    #[test]
    fn nms_suppresses_overlapping_boxes() {
        let boxes = vec![
            Rect::new(0, 0, 100, 100),
            Rect::new(5, 5, 100, 100),
            Rect::new(300, 300, 50, 50),
        ];
        let scores = vec![0.9, 0.8, 0.7];
        let keep = nms(&boxes, &scores, 0.4);
        assert_eq!(keep, vec![0, 2]);
    }

    #[test]
    fn nms_keeps_everything_below_threshold() {
        let boxes = vec![Rect::new(0, 0, 10, 10), Rect::new(100, 0, 10, 10)];
        let keep = nms(&boxes, &[0.5, 0.6], 0.4);
        assert_eq!(keep, vec![1, 0]);
    }

    #[test]
    fn crop_clamps_to_bounds() {
        let image = gradient_image(50, 50);
        let cropped = crop(&image, &Rect::new(40, 40, 100, 100));
        assert_eq!(cropped.shape(), &[10, 10, 3]);
        assert_eq!(cropped[(0, 0, 0)], image[(40, 40, 0)]);
    }

    #[test]
    fn perspective_crop_of_axis_aligned_quad_matches_crop() {
        let image = gradient_image(60, 80);
        let quad = [(10.0, 10.0), (49.0, 10.0), (49.0, 29.0), (10.0, 29.0)];
        let warped = perspective_crop(&image, &quad);
        assert_eq!(warped.shape(), &[19, 39, 3]);
        // The identity warp reproduces the source pixels.
        assert_eq!(warped[(0, 0, 0)], image[(10, 10, 0)]);
        assert_eq!(warped[(18, 38, 1)], image[(29, 49, 1)]);
    }

    #[test]
    fn rotate_crop_flips_tall_regions_upright() {
        let image = gradient_image(100, 100);
        let tall = [[10, 10], [20, 10], [20, 70], [10, 70]];
        let rotated = get_rotate_crop_image(&image, &tall);
        // 60-high x 10-wide region comes out 10 x 60 after rotation.
        assert_eq!(rotated.shape()[0], 10);
        assert_eq!(rotated.shape()[1], 60);

        let wide = [[10, 10], [70, 10], [70, 20], [10, 20]];
        let kept = get_rotate_crop_image(&image, &wide);
        assert_eq!(kept.shape()[0], 10);
        assert_eq!(kept.shape()[1], 60);
    }

    #[test]
    fn rotations_are_involutive_where_expected() {
        let image = gradient_image(13, 17);
        assert_eq!(rotate180(&rotate180(&image)), image);
        let ccw = rotate90_ccw(&image);
        assert_eq!(ccw.shape(), &[17, 13, 3]);
    }

    #[test]
    fn quads_sort_reading_order() {
        let mut quads = vec![
            [[50, 40], [90, 40], [90, 60], [50, 60]],
            [[0, 0], [40, 0], [40, 20], [0, 20]],
            [[45, 3], [85, 3], [85, 23], [45, 23]], // same line as the second
        ];
        sort_quads(&mut quads);
        assert_eq!(quads[0][0], [0, 0]);
        assert_eq!(quads[1][0], [45, 3]);
        assert_eq!(quads[2][0], [50, 40]);
    }
}
