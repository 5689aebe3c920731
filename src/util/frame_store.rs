use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use ndarray::Array3;

use crate::frame::split_id;

type Slots = Vec<Option<(u64, Array3<u8>)>>;

/// Per-camera bounded ring of in-flight decoded images, keyed by frame id.
///
/// Slots are reused modulo the per-camera capacity, so `get` is best-effort:
/// a slot overwritten by a newer frame no longer answers for the old one.
/// One process-wide store is created at startup and passed by reference to
/// the stages that need it.
#[derive(Default)]
pub struct FrameStore {
    cameras: RwLock<HashMap<String, Arc<Mutex<Slots>>>>,
}

impl FrameStore {
    pub fn new() -> FrameStore {
        FrameStore::default()
    }

    pub fn set_max_frames(&self, camera: &str, max_frames: usize) {
        assert!(max_frames >= 1);
        self.cameras
            .write()
            .unwrap()
            .entry(camera.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(vec![None; max_frames])));
    }

    fn slots(&self, camera: &str) -> Option<Arc<Mutex<Slots>>> {
        self.cameras.read().unwrap().get(camera).cloned()
    }

    pub fn write(&self, frame_id: &str, image: Array3<u8>) {
        let Some((camera, index)) = split_id(frame_id) else {
            return;
        };
        let Some(slots) = self.slots(&camera) else {
            return;
        };
        let mut slots = slots.lock().unwrap();
        let len = slots.len();
        slots[index as usize % len] = Some((index, image));
    }

    pub fn get(&self, frame_id: &str) -> Option<Array3<u8>> {
        let (camera, index) = split_id(frame_id)?;
        let slots = self.slots(&camera)?;
        let slots = slots.lock().unwrap();
        let len = slots.len();
        match &slots[index as usize % len] {
            Some((occupant, image)) if *occupant == index => Some(image.clone()),
            _ => None,
        }
    }

    pub fn retire(&self, frame_id: &str) -> bool {
        let Some((camera, index)) = split_id(frame_id) else {
            return false;
        };
        let Some(slots) = self.slots(&camera) else {
            return false;
        };
        let mut slots = slots.lock().unwrap();
        let len = slots.len();
        slots[index as usize % len] = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::make_id;

    fn filled(value: u8) -> Array3<u8> {
        Array3::from_elem((2, 2, 3), value)
    }

    #[test]
    fn write_get_retire_round_trip() {
        let store = FrameStore::new();
        store.set_max_frames("cam", 5);

        store.write(&make_id("cam", 3), filled(7));
        assert_eq!(store.get(&make_id("cam", 3)).unwrap()[(0, 0, 0)], 7);

        assert!(store.retire(&make_id("cam", 3)));
        assert!(store.get(&make_id("cam", 3)).is_none());
    }

    #[test]
    fn reused_slot_no_longer_answers_for_old_frame() {
        let store = FrameStore::new();
        store.set_max_frames("cam", 5);

        store.write(&make_id("cam", 1), filled(1));
        store.write(&make_id("cam", 6), filled(6)); // same slot, 6 % 5 == 1
        assert!(store.get(&make_id("cam", 1)).is_none());
        assert_eq!(store.get(&make_id("cam", 6)).unwrap()[(0, 0, 0)], 6);
    }

    #[test]
    fn unknown_camera_and_bad_id_are_noops() {
        let store = FrameStore::new();
        store.write("ghost_0", filled(1));
        assert!(store.get("ghost_0").is_none());
        assert!(store.get("not-an-id").is_none());
        assert!(!store.retire("ghost_0"));
    }
}
