use std::collections::HashMap;

use crate::frame::Prediction;

/// (125 x 125) minimum area to consider.
const MIN_AREA: i64 = 15_625;
/// Max w/h for a valid view; wider boxes are side views.
const MAX_ASPECT_RATIO: f32 = 2.5;
/// 10% area increase.
const APPROACH_THRESHOLD: f32 = 1.1;
/// 20% area decrease.
const DEPART_THRESHOLD: f32 = 0.8;

#[derive(Debug, Default)]
struct TrackedObjectHistory {
    last_seen_frame: u64,
    /// -1 = never triggered.
    last_triggered_area: i64,
    max_observed_area: i64,
}

/// Decides per tracked object whether the downstream keypoint/OCR stages
/// should look at it again on the current frame: a newly arriving or
/// approaching object triggers, a stationary or receding one does not.
pub struct DeltaPolicy {
    frame_counter: u64,
    histories: HashMap<i64, TrackedObjectHistory>,
    track_buffer: u64,
}

impl DeltaPolicy {
    pub fn new(track_buffer: u32) -> DeltaPolicy {
        DeltaPolicy {
            frame_counter: 0,
            histories: HashMap::new(),
            track_buffer: track_buffer as u64,
        }
    }

    /// Writes `tracker_id` and `has_deltas` into `predictions`; `track_ids`
    /// is the tracker output aligned with the prediction list.
    pub fn apply(&mut self, predictions: &mut [Prediction], track_ids: &[i64]) {
        self.frame_counter += 1;

        // Drop histories not seen within the tracker's own loss tolerance.
        let frame_counter = self.frame_counter;
        let track_buffer = self.track_buffer;
        self.histories
            .retain(|_, h| frame_counter - h.last_seen_frame <= track_buffer);

        for (prediction, &id) in predictions.iter_mut().zip(track_ids) {
            if id == -1 {
                continue;
            }
            prediction.tracker_id = id;

            let history = self.histories.entry(id).or_insert_with(|| {
                TrackedObjectHistory {
                    last_triggered_area: -1,
                    ..TrackedObjectHistory::default()
                }
            });
            history.last_seen_frame = self.frame_counter;

            let box_area = prediction.rect.area();
            let aspect_ratio = prediction.rect.aspect_ratio();
            history.max_observed_area = history.max_observed_area.max(box_area);

            // Too small or a side view.
            if box_area < MIN_AREA || aspect_ratio > MAX_ASPECT_RATIO {
                prediction.has_deltas = false;
                continue;
            }

            let mut is_approaching = false;
            let mut is_departing = false;
            if history.last_triggered_area != -1 {
                let ref_area = history.last_triggered_area as f32;
                is_approaching = box_area as f32 >= ref_area * APPROACH_THRESHOLD;
                is_departing = box_area as f32 <= ref_area * DEPART_THRESHOLD;
            }

            // Trigger on the first valid observation, a significant
            // approach, or a new maximum even while stationary.
            if history.last_triggered_area == -1
                || is_approaching
                || box_area > history.max_observed_area
            {
                prediction.has_deltas = true;
                history.last_triggered_area = box_area;
                history.max_observed_area = box_area;
            } else if is_departing {
                prediction.has_deltas = false;
                history.last_triggered_area = -1;
            } else {
                prediction.has_deltas = false;
            }
        }
    }

    #[cfg(test)]
    fn history_len(&self) -> usize {
        self.histories.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Rect;

    fn prediction(class_name: &str, rect: Rect) -> Prediction {
        Prediction {
            rect,
            class_name: class_name.to_owned(),
            conf: 0.9,
            class_id: 0,
            ..Prediction::default()
        }
    }

    fn square(area_side: i32) -> Rect {
        Rect::new(0, 0, area_side, area_side)
    }

    #[test]
    fn only_large_enough_box_triggers_on_first_sighting() {
        // 100x100 = 10,000 px^2 and 142x142 ~ 20,164 px^2 around the
        // 15,625 px^2 floor.
        let mut policy = DeltaPolicy::new(30);
        let mut predictions = vec![
            prediction("car", square(100)),
            prediction("car", square(142)),
        ];
        policy.apply(&mut predictions, &[3, 4]);

        assert!(!predictions[0].has_deltas);
        assert!(predictions[1].has_deltas);
        assert_eq!(predictions[0].tracker_id, 3);
        assert_eq!(predictions[1].tracker_id, 4);
    }

    #[test]
    fn wide_side_view_never_triggers() {
        let mut policy = DeltaPolicy::new(30);
        // 600x200: plenty of area but w/h = 3.0 > 2.5.
        let mut predictions = vec![prediction("car", Rect::new(0, 0, 600, 200))];
        policy.apply(&mut predictions, &[1]);
        assert!(!predictions[0].has_deltas);
    }

    #[test]
    fn untracked_and_shared_id_predictions() {
        // Tracker output [-1, 5, 5, 7] over [tree, car, car, person]:
        // the tree stays untracked, the small car is below the area floor,
        // the big car and the first-seen person trigger.
        let mut policy = DeltaPolicy::new(30);
        let mut predictions = vec![
            prediction("tree", square(400)),
            prediction("car", square(118)),   // ~13,924 px^2, too small
            prediction("car", square(160)),   // 25,600 px^2
            prediction("person", square(130)), // 16,900 px^2
        ];
        policy.apply(&mut predictions, &[-1, 5, 5, 7]);

        assert_eq!(
            predictions.iter().map(|p| p.tracker_id).collect::<Vec<_>>(),
            vec![-1, 5, 5, 7]
        );
        assert!(!predictions[0].has_deltas);
        assert!(!predictions[1].has_deltas);
        assert!(predictions[2].has_deltas);
        assert!(predictions[3].has_deltas);
    }

    #[test]
    fn approach_retriggers_every_ten_percent_growth() {
        let mut policy = DeltaPolicy::new(30);
        let mut triggers = 0;
        // Strictly increasing by >= 10% between frames: every frame triggers.
        for side in [130, 137, 144, 152, 160] {
            let mut predictions = vec![prediction("car", square(side))];
            policy.apply(&mut predictions, &[1]);
            if predictions[0].has_deltas {
                triggers += 1;
            }
        }
        assert_eq!(triggers, 5);
    }

    #[test]
    fn stationary_object_triggers_once() {
        let mut policy = DeltaPolicy::new(30);
        let mut triggers = 0;
        for _ in 0..10 {
            let mut predictions = vec![prediction("car", square(150))];
            policy.apply(&mut predictions, &[1]);
            if predictions[0].has_deltas {
                triggers += 1;
            }
        }
        assert_eq!(triggers, 1);
    }

    #[test]
    fn departing_resets_then_approach_retriggers() {
        let mut policy = DeltaPolicy::new(30);

        let mut predictions = vec![prediction("car", square(200))]; // 40,000
        policy.apply(&mut predictions, &[1]);
        assert!(predictions[0].has_deltas);

        // <= 80% of the last trigger: untriggers and resets the baseline.
        let mut predictions = vec![prediction("car", square(170))]; // 28,900
        policy.apply(&mut predictions, &[1]);
        assert!(!predictions[0].has_deltas);

        // Next valid observation re-triggers because the baseline is gone.
        let mut predictions = vec![prediction("car", square(171))];
        policy.apply(&mut predictions, &[1]);
        assert!(predictions[0].has_deltas);
    }

    #[test]
    fn histories_are_pruned_after_track_buffer_frames() {
        let mut policy = DeltaPolicy::new(3);
        let mut predictions = vec![prediction("car", square(150))];
        policy.apply(&mut predictions, &[9]);
        assert_eq!(policy.history_len(), 1);

        for _ in 0..4 {
            policy.apply(&mut [], &[]);
        }
        assert_eq!(policy.history_len(), 0);
    }
}
