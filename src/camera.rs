mod capture;
mod metrics;
mod processor;

use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

pub use capture::CameraCapture;
pub use metrics::{CameraMetrics, SharedCameraMetrics, StreamInfo};
pub use processor::CameraProcessor;

/// Per-camera condition a processor parks on while a detector session works
/// on its frame.
#[derive(Default)]
pub struct CameraWait {
    lock: Mutex<()>,
    condvar: Condvar,
}

impl CameraWait {
    pub fn new() -> CameraWait {
        CameraWait::default()
    }

    pub fn notify_all(&self) {
        self.condvar.notify_all();
    }

    /// Parks until `done()` holds or `timeout` elapses. Returns whether the
    /// condition was met.
    pub fn wait_timeout(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let guard = self.lock.lock().unwrap();
        let (_, result) = self
            .condvar
            .wait_timeout_while(guard, timeout, |_| !done())
            .unwrap();
        !result.timed_out()
    }
}

pub type CameraWaitMap = Arc<HashMap<String, Arc<CameraWait>>>;
