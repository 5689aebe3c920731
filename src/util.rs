mod eps;
mod frame_store;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

pub use eps::EventsPerSecond;
pub use frame_store::FrameStore;

/// Cooperative interruption flag shared by every pipeline thread.
#[derive(Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Shutdown {
        Shutdown::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
