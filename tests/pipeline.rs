//! Cross-module flow without real video or models: a fake detector stage
//! wakes a waiting consumer through the camera condition, tracked
//! predictions run through the delta policy and the event lifecycle, and
//! shutdown unblocks everything within the grace period.

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use ndarray::Array3;
use vigil::{
    camera::CameraWait,
    db::Database,
    events::EventTracker,
    frame::{Frame, Prediction, Rect, SharedFrame},
    queue::{BoundedQueue, PopError},
    track::DeltaPolicy,
};

fn frame(camera: &str, index: u64) -> SharedFrame {
    Arc::new(Frame::new(camera, index, Array3::zeros((16, 16, 3))))
}

fn car(tracker_id: i64, side: i32, conf: f32) -> Prediction {
    Prediction {
        rect: Rect::new(0, 0, side, side),
        class_name: "car".to_owned(),
        conf,
        class_id: 2,
        tracker_id,
        ..Prediction::default()
    }
}

#[test]
fn detector_stage_wakes_waiting_consumer() {
    let queue: Arc<BoundedQueue<SharedFrame>> = Arc::new(BoundedQueue::new(4));
    let wait = Arc::new(CameraWait::new());

    let detector = {
        let queue = queue.clone();
        let wait = wait.clone();
        thread::spawn(move || {
            while let Ok(frame) = queue.pop() {
                frame.set_predictions(vec![car(-1, 150, 0.9)]);
                frame.set_has_been_processed(true);
                wait.notify_all();
            }
        })
    };

    for index in 0..10 {
        let f = frame("cam", index);
        queue.push(f.clone()).unwrap();
        let done = wait.wait_timeout(Duration::from_millis(500), || f.has_been_processed());
        assert!(done, "frame {index} missed its deadline");
        assert_eq!(f.predictions().len(), 1);
        f.set_has_been_processed(false);
    }

    queue.abort();
    detector.join().unwrap();
}

#[test]
fn slow_detector_expires_frames_in_pull_mode() {
    let wait = CameraWait::new();
    let f = frame("cam", 0);
    // Nobody processes the frame; the 20ms pull deadline lapses.
    let done = wait.wait_timeout(Duration::from_millis(20), || f.has_been_processed());
    assert!(!done);
    f.set_has_expired(true);
    assert!(f.has_expired());
}

#[test]
fn tracked_car_becomes_exactly_one_event() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let mut delta_policy = DeltaPolicy::new(30);
    let mut events = EventTracker::with_loss_limit(db.clone(), None, 4);

    let mut delta_frames = 0;
    // A car approaching over 24 frames, always visible.
    for index in 0..24u64 {
        let f = frame("driveway", index);
        let mut predictions = vec![car(-1, 130 + index as i32 * 4, 0.8 + (index % 3) as f32 * 0.05)];
        delta_policy.apply(&mut predictions, &[7]);
        if predictions[0].has_deltas {
            delta_frames += 1;
        }
        f.set_predictions(predictions);
        let (created, active) = events.observe(&f);
        assert_eq!(created.len(), usize::from(index == 0));
        assert_eq!(active, vec![7]);
    }
    // The first sighting triggers; later growth re-triggers at least once.
    assert!(delta_frames >= 2);
    assert_eq!(db.event_count().unwrap(), 0);

    // Gone long enough to finalize.
    for index in 24..30u64 {
        events.observe(&frame("driveway", index));
    }
    assert_eq!(db.event_count().unwrap(), 1);

    let event = db.events_for_camera("driveway").unwrap().remove(0);
    assert_eq!(event.label, "car");
    assert_eq!(event.tracker_id, 7);
    assert!(event.top_score >= event.score);
    assert!(event.end_time >= event.start_time);
}

#[test]
fn shutdown_unblocks_all_queue_waiters_quickly() {
    let queues: Vec<Arc<BoundedQueue<SharedFrame>>> = (0..3)
        .map(|_| Arc::new(BoundedQueue::new(2)))
        .collect();

    let waiters: Vec<_> = queues
        .iter()
        .map(|queue| {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        })
        .collect();
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    for queue in &queues {
        queue.abort();
    }
    for waiter in waiters {
        assert_eq!(waiter.join().unwrap().unwrap_err(), PopError::Aborted);
    }
    assert!(started.elapsed() < Duration::from_secs(1));
    for queue in &queues {
        assert!(queue.is_aborted());
    }
}
