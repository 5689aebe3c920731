mod bytetrack;
mod delta;

use std::collections::BTreeSet;

pub use bytetrack::{match_detections_with_tracks, ByteTracker, Track};
pub use delta::DeltaPolicy;

use crate::frame::PredictionList;

pub const DEFAULT_TRACK_THRESH: f32 = 0.25;
pub const DEFAULT_TRACK_BUFFER: u32 = 30;
pub const DEFAULT_MATCH_THRESH: f32 = 0.8;
pub const DEFAULT_VIDEO_FRAME_RATE: u32 = 30;

/// Associates per-frame detections with persistent ids.
///
/// Only predictions whose class is in the configured track-set take part in
/// association; everything else stays at -1. The returned id list is aligned
/// by index with the input.
pub struct Tracker {
    tracker: ByteTracker,
    objects_to_track: BTreeSet<String>,
    track_buffer: u32,
}

impl Tracker {
    pub fn new(objects_to_track: impl IntoIterator<Item = String>) -> Tracker {
        Tracker::with_params(
            objects_to_track,
            DEFAULT_TRACK_THRESH,
            DEFAULT_TRACK_BUFFER,
            DEFAULT_MATCH_THRESH,
            DEFAULT_VIDEO_FRAME_RATE,
        )
    }

    pub fn with_params(
        objects_to_track: impl IntoIterator<Item = String>,
        track_thresh: f32,
        track_buffer: u32,
        match_thresh: f32,
        video_frame_rate: u32,
    ) -> Tracker {
        Tracker {
            tracker: ByteTracker::new(track_thresh, track_buffer, match_thresh, video_frame_rate),
            objects_to_track: objects_to_track.into_iter().collect(),
            track_buffer,
        }
    }

    pub fn track_buffer(&self) -> u32 {
        self.track_buffer
    }

    /// Returns tracker ids aligned with `predictions`; -1 marks predictions
    /// that are untracked classes or failed to associate this frame.
    pub fn track(&mut self, predictions: &PredictionList) -> Vec<i64> {
        let tracked_indices: Vec<usize> = (0..predictions.len())
            .filter(|&i| self.objects_to_track.contains(&predictions[i].class_name))
            .collect();

        let mut ids = vec![-1; predictions.len()];
        if tracked_indices.is_empty() {
            return ids;
        }

        let detections: Vec<_> = tracked_indices
            .iter()
            .map(|&i| (predictions[i].rect, predictions[i].conf))
            .collect();
        let tracks = self.tracker.update(&detections);

        let boxes: Vec<_> = tracked_indices.iter().map(|&i| predictions[i].rect).collect();
        let matched = match_detections_with_tracks(&boxes, &tracks);
        for (slot, id) in tracked_indices.into_iter().zip(matched) {
            ids[slot] = id;
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Prediction, Rect};

    fn prediction(class_name: &str, rect: Rect, conf: f32) -> Prediction {
        Prediction {
            rect,
            class_name: class_name.to_owned(),
            conf,
            class_id: 0,
            ..Prediction::default()
        }
    }

    #[test]
    fn untracked_classes_stay_at_minus_one() {
        let mut tracker = Tracker::new(["car".to_owned(), "person".to_owned()]);
        let predictions = vec![
            prediction("tree", Rect::new(0, 0, 400, 300), 0.95),
            prediction("car", Rect::new(500, 100, 200, 150), 0.9),
            prediction("person", Rect::new(50, 600, 120, 300), 0.85),
        ];

        let ids = tracker.track(&predictions);
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0], -1);
        assert!(ids[1] >= 0);
        assert!(ids[2] >= 0);
        assert_ne!(ids[1], ids[2]);
    }

    #[test]
    fn ids_are_stable_per_object_across_frames() {
        let mut tracker = Tracker::new(["car".to_owned()]);
        let first = tracker.track(&vec![prediction("car", Rect::new(100, 100, 200, 150), 0.9)]);
        let second = tracker.track(&vec![prediction("car", Rect::new(104, 100, 200, 150), 0.9)]);
        assert_eq!(first[0], second[0]);
    }

    #[test]
    fn empty_track_set_tracks_nothing() {
        let mut tracker = Tracker::new(std::iter::empty::<String>());
        let ids = tracker.track(&vec![prediction("car", Rect::new(0, 0, 100, 100), 0.9)]);
        assert_eq!(ids, vec![-1]);
    }
}
