use nalgebra::{SMatrix, SVector};

use crate::frame::Rect;

type Vec8 = SVector<f64, 8>;
type Mat8 = SMatrix<f64, 8, 8>;
type Vec4 = SVector<f64, 4>;
type Mat4 = SMatrix<f64, 4, 4>;
type Mat4x8 = SMatrix<f64, 4, 8>;

const STD_WEIGHT_POSITION: f64 = 1.0 / 20.0;
const STD_WEIGHT_VELOCITY: f64 = 1.0 / 160.0;

/// Constant-velocity filter over `[cx, cy, aspect, h]` plus velocities.
struct KalmanFilter {
    motion: Mat8,
    update: Mat4x8,
}

impl KalmanFilter {
    fn new() -> KalmanFilter {
        let mut motion = Mat8::identity();
        for i in 0..4 {
            motion[(i, i + 4)] = 1.0;
        }
        let mut update = Mat4x8::zeros();
        for i in 0..4 {
            update[(i, i)] = 1.0;
        }
        KalmanFilter { motion, update }
    }

    fn initiate(&self, measurement: Vec4) -> (Vec8, Mat8) {
        let mut mean = Vec8::zeros();
        for i in 0..4 {
            mean[i] = measurement[i];
        }
        let h = measurement[3];
        let std = [
            2.0 * STD_WEIGHT_POSITION * h,
            2.0 * STD_WEIGHT_POSITION * h,
            1e-2,
            2.0 * STD_WEIGHT_POSITION * h,
            10.0 * STD_WEIGHT_VELOCITY * h,
            10.0 * STD_WEIGHT_VELOCITY * h,
            1e-5,
            10.0 * STD_WEIGHT_VELOCITY * h,
        ];
        let mut cov = Mat8::zeros();
        for (i, s) in std.iter().enumerate() {
            cov[(i, i)] = s * s;
        }
        (mean, cov)
    }

    fn predict(&self, mean: &mut Vec8, cov: &mut Mat8) {
        let h = mean[3];
        let std = [
            STD_WEIGHT_POSITION * h,
            STD_WEIGHT_POSITION * h,
            1e-2,
            STD_WEIGHT_POSITION * h,
            STD_WEIGHT_VELOCITY * h,
            STD_WEIGHT_VELOCITY * h,
            1e-5,
            STD_WEIGHT_VELOCITY * h,
        ];
        let mut motion_cov = Mat8::zeros();
        for (i, s) in std.iter().enumerate() {
            motion_cov[(i, i)] = s * s;
        }
        *mean = self.motion * *mean;
        *cov = self.motion * *cov * self.motion.transpose() + motion_cov;
    }

    fn update(&self, mean: &mut Vec8, cov: &mut Mat8, measurement: Vec4) {
        let h = mean[3];
        let std = [
            STD_WEIGHT_POSITION * h,
            STD_WEIGHT_POSITION * h,
            1e-1,
            STD_WEIGHT_POSITION * h,
        ];
        let mut innovation_cov = Mat4::zeros();
        for (i, s) in std.iter().enumerate() {
            innovation_cov[(i, i)] = s * s;
        }

        let projected_mean: Vec4 = self.update * *mean;
        let projected_cov: Mat4 =
            self.update * *cov * self.update.transpose() + innovation_cov;
        let Some(inv) = projected_cov.try_inverse() else {
            return;
        };
        let gain = *cov * self.update.transpose() * inv;
        let innovation = measurement - projected_mean;
        *mean += gain * innovation;
        *cov -= gain * (self.update * *cov);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackState {
    Tentative,
    Confirmed,
    Lost,
}

/// One persistent object hypothesis.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: i64,
    pub score: f32,
    mean: Vec8,
    cov: Mat8,
    state: TrackState,
    frames_since_update: u32,
}

impl Track {
    /// Current estimate as `(x, y, w, h)`.
    pub fn tlwh(&self) -> (f64, f64, f64, f64) {
        let h = self.mean[3];
        let w = self.mean[2] * h;
        (self.mean[0] - w / 2.0, self.mean[1] - h / 2.0, w, h)
    }

    pub fn is_active(&self) -> bool {
        self.state == TrackState::Confirmed && self.frames_since_update == 0
    }
}

fn to_xyah(rect: &Rect) -> Vec4 {
    let w = rect.width.max(1) as f64;
    let h = rect.height.max(1) as f64;
    Vec4::new(rect.x as f64 + w / 2.0, rect.y as f64 + h / 2.0, w / h, h)
}

pub fn iou(a: (f64, f64, f64, f64), b: (f64, f64, f64, f64)) -> f64 {
    let (ax, ay, aw, ah) = a;
    let (bx, by, bw, bh) = b;
    let ix = (ax + aw).min(bx + bw) - ax.max(bx);
    let iy = (ay + ah).min(by + bh) - ay.max(by);
    if ix <= 0.0 || iy <= 0.0 {
        return 0.0;
    }
    let inter = ix * iy;
    let union = aw * ah + bw * bh - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Greedy IoU assignment, deterministic: candidate pairs are visited by
/// descending IoU, ties broken by detection order (which the caller has
/// already sorted by descending confidence, then ascending area).
fn assign(
    track_boxes: &[(f64, f64, f64, f64)],
    det_boxes: &[(f64, f64, f64, f64)],
    iou_threshold: f64,
) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for (t, tb) in track_boxes.iter().enumerate() {
        for (d, db) in det_boxes.iter().enumerate() {
            let overlap = iou(*tb, *db);
            if overlap >= iou_threshold {
                pairs.push((overlap, t, d));
            }
        }
    }
    pairs.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.2.cmp(&b.2))
            .then(a.1.cmp(&b.1))
    });

    let mut used_tracks = vec![false; track_boxes.len()];
    let mut used_dets = vec![false; det_boxes.len()];
    let mut matches = Vec::new();
    for (_, t, d) in pairs {
        if !used_tracks[t] && !used_dets[d] {
            used_tracks[t] = true;
            used_dets[d] = true;
            matches.push((t, d));
        }
    }
    matches
}

/// ByteTrack-style multi-object tracker: detections are associated in two
/// passes (confident first, then the low-score remainder), unmatched tracks
/// survive `track_buffer` frames of loss before removal.
pub struct ByteTracker {
    kf: KalmanFilter,
    tracks: Vec<Track>,
    next_id: i64,
    track_thresh: f32,
    match_thresh: f64,
    max_time_lost: u32,
}

impl ByteTracker {
    pub fn new(
        track_thresh: f32,
        track_buffer: u32,
        match_thresh: f32,
        frame_rate: u32,
    ) -> ByteTracker {
        ByteTracker {
            kf: KalmanFilter::new(),
            tracks: Vec::new(),
            next_id: 0,
            track_thresh,
            match_thresh: match_thresh as f64,
            max_time_lost: (frame_rate as f32 / 30.0 * track_buffer as f32) as u32,
        }
    }

    /// One step. `detections` are `(box, confidence)` pairs; returns the
    /// tracks that matched a detection this frame.
    pub fn update(&mut self, detections: &[(Rect, f32)]) -> Vec<Track> {
        for track in &mut self.tracks {
            self.kf.predict(&mut track.mean, &mut track.cov);
            track.frames_since_update += 1;
        }

        let mut order: Vec<usize> = (0..detections.len()).collect();
        order.sort_by(|&a, &b| {
            detections[b]
                .1
                .partial_cmp(&detections[a].1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(detections[a].0.area().cmp(&detections[b].0.area()))
        });
        let (high, low): (Vec<usize>, Vec<usize>) = order
            .into_iter()
            .partition(|&i| detections[i].1 >= self.track_thresh);

        let track_boxes: Vec<_> = self.tracks.iter().map(Track::tlwh).collect();
        let rect_of = |i: usize| {
            let r = detections[i].0;
            (r.x as f64, r.y as f64, r.width as f64, r.height as f64)
        };

        // First pass: confident detections against everything alive.
        let high_boxes: Vec<_> = high.iter().map(|&i| rect_of(i)).collect();
        let first = assign(&track_boxes, &high_boxes, 1.0 - self.match_thresh);
        let mut matched_tracks = vec![false; self.tracks.len()];
        let mut matched_dets = vec![false; detections.len()];
        for &(t, d) in &first {
            self.touch(t, detections[high[d]]);
            matched_tracks[t] = true;
            matched_dets[high[d]] = true;
        }

        // Second pass: low-score leftovers may still sustain a track.
        let remaining: Vec<usize> = (0..self.tracks.len())
            .filter(|&t| !matched_tracks[t] && self.tracks[t].state != TrackState::Tentative)
            .collect();
        let remaining_boxes: Vec<_> = remaining.iter().map(|&t| track_boxes[t]).collect();
        let low_boxes: Vec<_> = low.iter().map(|&i| rect_of(i)).collect();
        for (t, d) in assign(&remaining_boxes, &low_boxes, 0.5) {
            self.touch(remaining[t], detections[low[d]]);
            matched_tracks[remaining[t]] = true;
            matched_dets[low[d]] = true;
        }

        // Unmatched confident detections seed new tracks.
        for &i in &high {
            if !matched_dets[i] {
                let (rect, score) = detections[i];
                let (mean, cov) = self.kf.initiate(to_xyah(&rect));
                self.tracks.push(Track {
                    id: self.next_id,
                    score,
                    mean,
                    cov,
                    state: TrackState::Tentative,
                    frames_since_update: 0,
                });
                self.next_id += 1;
            }
        }

        // Unmatched tracks decay; tentative ones die immediately.
        let max_time_lost = self.max_time_lost;
        self.tracks.retain(|track| {
            if track.frames_since_update == 0 {
                return true;
            }
            track.state == TrackState::Confirmed && track.frames_since_update <= max_time_lost
        });
        for track in &mut self.tracks {
            if track.frames_since_update > 0 {
                track.state = TrackState::Lost;
            }
        }

        self.tracks
            .iter()
            .filter(|t| t.frames_since_update == 0)
            .cloned()
            .collect()
    }

    fn touch(&mut self, track_index: usize, detection: (Rect, f32)) {
        let track = &mut self.tracks[track_index];
        let (rect, score) = detection;
        self.kf
            .update(&mut track.mean, &mut track.cov, to_xyah(&rect));
        track.score = score;
        track.frames_since_update = 0;
        track.state = TrackState::Confirmed;
    }
}

/// Pairs detections with the tracks returned by [`ByteTracker::update`];
/// the result is aligned with `boxes`, -1 where nothing matched.
pub fn match_detections_with_tracks(boxes: &[Rect], tracks: &[Track]) -> Vec<i64> {
    let det_boxes: Vec<_> = boxes
        .iter()
        .map(|r| (r.x as f64, r.y as f64, r.width as f64, r.height as f64))
        .collect();
    let track_boxes: Vec<_> = tracks.iter().map(Track::tlwh).collect();
    let mut ids = vec![-1; boxes.len()];
    for (t, d) in assign(&track_boxes, &det_boxes, 1e-6) {
        ids[d] = tracks[t].id;
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: i32, y: i32, w: i32, h: i32, conf: f32) -> (Rect, f32) {
        (Rect::new(x, y, w, h), conf)
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = (10.0, 10.0, 100.0, 50.0);
        assert!((iou(b, b) - 1.0).abs() < 1e-9);
        assert_eq!(iou(b, (500.0, 500.0, 10.0, 10.0)), 0.0);
    }

    #[test]
    fn track_keeps_id_across_motion() {
        let mut tracker = ByteTracker::new(0.25, 30, 0.8, 30);
        let mut last_id = None;
        for step in 0..10 {
            let tracks = tracker.update(&[det(100 + step * 5, 100, 80, 60, 0.9)]);
            assert_eq!(tracks.len(), 1);
            if let Some(id) = last_id {
                assert_eq!(tracks[0].id, id);
            }
            last_id = Some(tracks[0].id);
        }
    }

    #[test]
    fn two_objects_get_distinct_ids() {
        let mut tracker = ByteTracker::new(0.25, 30, 0.8, 30);
        for _ in 0..3 {
            let tracks = tracker.update(&[
                det(0, 0, 50, 50, 0.9),
                det(300, 300, 50, 50, 0.9),
            ]);
            assert_eq!(tracks.len(), 2);
            assert_ne!(tracks[0].id, tracks[1].id);
        }
    }

    #[test]
    fn lost_track_reassociates_within_buffer() {
        let mut tracker = ByteTracker::new(0.25, 30, 0.8, 30);
        tracker.update(&[det(100, 100, 80, 60, 0.9)]);
        let id = tracker.update(&[det(102, 100, 80, 60, 0.9)])[0].id;

        for _ in 0..5 {
            assert!(tracker.update(&[]).is_empty());
        }
        let tracks = tracker.update(&[det(110, 100, 80, 60, 0.9)]);
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].id, id);
    }

    #[test]
    fn track_expires_past_buffer() {
        let mut tracker = ByteTracker::new(0.25, 5, 0.8, 30);
        tracker.update(&[det(100, 100, 80, 60, 0.9)]);
        tracker.update(&[det(100, 100, 80, 60, 0.9)]);
        for _ in 0..10 {
            tracker.update(&[]);
        }
        // Far past max_time_lost, the object comes back as a fresh id.
        let before = tracker.next_id;
        tracker.update(&[det(100, 100, 80, 60, 0.9)]);
        assert_eq!(tracker.next_id, before + 1);
    }

    #[test]
    fn low_score_detection_sustains_but_does_not_create() {
        let mut tracker = ByteTracker::new(0.5, 30, 0.8, 30);
        assert!(tracker.update(&[det(0, 0, 50, 50, 0.3)]).is_empty());

        tracker.update(&[det(0, 0, 50, 50, 0.9)]);
        tracker.update(&[det(2, 0, 50, 50, 0.9)]);
        let sustained = tracker.update(&[det(4, 0, 50, 50, 0.3)]);
        assert_eq!(sustained.len(), 1);
    }

    #[test]
    fn match_alignment_marks_unmatched_with_minus_one() {
        let mut tracker = ByteTracker::new(0.25, 30, 0.8, 30);
        tracker.update(&[det(100, 100, 80, 60, 0.9)]);
        let tracks = tracker.update(&[det(101, 100, 80, 60, 0.9)]);

        let ids = match_detections_with_tracks(
            &[Rect::new(900, 900, 10, 10), Rect::new(101, 100, 80, 60)],
            &tracks,
        );
        assert_eq!(ids[0], -1);
        assert_eq!(ids[1], tracks[0].id);
    }
}
