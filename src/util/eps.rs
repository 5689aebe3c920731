use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Rolling throughput meter over the last `window` seconds.
#[derive(Debug, Clone)]
pub struct EventsPerSecond {
    start: Option<Instant>,
    max_events: usize,
    window: Duration,
    timestamps: VecDeque<Instant>,
}

impl Default for EventsPerSecond {
    fn default() -> EventsPerSecond {
        EventsPerSecond::new(1000, Duration::from_secs(10))
    }
}

impl EventsPerSecond {
    pub fn new(max_events: usize, window: Duration) -> EventsPerSecond {
        EventsPerSecond {
            start: None,
            max_events,
            window,
            timestamps: VecDeque::new(),
        }
    }

    pub fn start(&mut self) {
        self.start = Some(Instant::now());
    }

    pub fn update(&mut self) {
        let now = Instant::now();
        self.start.get_or_insert(now);
        self.timestamps.push_back(now);
        // Truncate once the list runs 100 over the cap.
        if self.timestamps.len() > self.max_events + 100 {
            let excess = self.timestamps.len() - self.max_events;
            self.timestamps.drain(..excess);
        }
        self.expire(now);
    }

    pub fn eps(&mut self) -> f64 {
        let now = Instant::now();
        let start = *self.start.get_or_insert(now);
        self.expire(now);
        let mut seconds = now
            .saturating_duration_since(start)
            .min(self.window)
            .as_secs_f64();
        if seconds == 0.0 {
            seconds = 1.0;
        }
        self.timestamps.len() as f64 / seconds
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&first) = self.timestamps.front() {
            if now.saturating_duration_since(first) > self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}
