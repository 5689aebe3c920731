use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use crossbeam::channel::{Receiver, RecvTimeoutError};
use time::{format_description::well_known::Rfc3339, macros::format_description, OffsetDateTime};
use tracing::{error, info, instrument, warn};

use crate::{
    camera::SharedCameraMetrics,
    db::{Database, RecordingRecord},
    frame::SharedFrame,
    output::remux::{Remuxer, RemuxerWorker},
    util::Shutdown,
};

const REMUXERS_PER_CAMERA: usize = 5;

struct RemuxerSlot {
    remuxer: Remuxer,
    thread: Option<JoinHandle<()>>,
    assigned_to: i64,
    camera: String,
    start_time: Option<OffsetDateTime>,
    path: Option<PathBuf>,
}

impl RemuxerSlot {
    fn is_free(&self) -> bool {
        self.assigned_to < 0
    }
}

/// Allocates one remuxer per live event and copies the camera's compressed
/// packets into it until the event ends, never decoding or re-encoding.
///
/// New event: pick a free remuxer (or spawn one), open an output named
/// after the event's start, copy codec parameters from the camera's input
/// stream, optionally prepend the packet ring for a clean GOP start, then
/// subscribe the remuxer to the camera's live packets. Ended event: close
/// the file and persist the Recording row.
pub struct RecordingsManager {
    db: Arc<Database>,
    cameras: HashMap<String, SharedCameraMetrics>,
    record_dir: PathBuf,
    pool: Vec<RemuxerSlot>,
    next_remuxer_id: usize,
    /// Prepend the GOP rewind buffer to each new file.
    prepend_ring: bool,
}

impl RecordingsManager {
    pub fn new(
        db: Arc<Database>,
        cameras: HashMap<String, SharedCameraMetrics>,
        record_dir: impl Into<PathBuf>,
    ) -> RecordingsManager {
        RecordingsManager {
            db,
            cameras,
            record_dir: record_dir.into(),
            pool: Vec::new(),
            next_remuxer_id: 0,
            prepend_ring: true,
        }
    }

    /// Pre-spawns the worker pool.
    pub fn init(&mut self) {
        let target = self.cameras.len() * REMUXERS_PER_CAMERA;
        while self.pool.len() < target {
            self.spawn_slot();
        }
        info!(remuxers = self.pool.len(), "recordings manager ready");
    }

    fn spawn_slot(&mut self) -> usize {
        let id = self.next_remuxer_id;
        self.next_remuxer_id += 1;
        let (remuxer, worker) = Remuxer::new(id);
        let thread = std::thread::Builder::new()
            .name(format!("remuxer-{id}"))
            .spawn(move || worker.run())
            .expect("failed to spawn remuxer worker");
        self.pool.push(RemuxerSlot {
            remuxer,
            thread: Some(thread),
            assigned_to: -1,
            camera: String::new(),
            start_time: None,
            path: None,
        });
        self.pool.len() - 1
    }

    /// Consumes tracked frames with their active event ids until shutdown.
    #[instrument(name = "recordings_manager", skip_all)]
    pub fn run(&mut self, frames: Receiver<(SharedFrame, Vec<i64>)>, stop: Shutdown) {
        info!("started");
        while !stop.is_requested() {
            match frames.recv_timeout(Duration::from_millis(500)) {
                Ok((frame, active_ids)) => self.on_record_frame(&frame, &active_ids),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.stop();
        info!("stopped");
    }

    pub fn on_record_frame(&mut self, frame: &SharedFrame, active_ids: &[i64]) {
        let camera = frame.camera().to_owned();
        let Some(metrics) = self.cameras.get(&camera).cloned() else {
            warn!(%camera, "frame for unknown camera, skipping");
            return;
        };
        let Some(stream) = metrics.stream_info() else {
            warn!(%camera, "no stream info yet, skipping record frame");
            return;
        };

        for &tracker_id in active_ids {
            if self.pool.iter().any(|slot| slot.assigned_to == tracker_id) {
                continue;
            }

            let slot_index = self
                .pool
                .iter()
                .position(RemuxerSlot::is_free)
                .unwrap_or_else(|| self.spawn_slot());

            let start_time = frame.timestamp();
            let path = make_recording_path(&self.record_dir, start_time, &camera, tracker_id);
            if let Some(parent) = path.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    error!(error = %e, "failed to create recording directory");
                    continue;
                }
            }

            let slot = &mut self.pool[slot_index];
            let opened = slot
                .remuxer
                .open_output(path.clone(), stream.parameters.clone(), stream.time_base)
                .and_then(|()| slot.remuxer.write_header());
            if let Err(e) = opened {
                error!(tracker_id, error = %e, "failed to start recording");
                continue;
            }
            slot.assigned_to = tracker_id;
            slot.camera = camera.clone();
            slot.start_time = Some(start_time);
            slot.path = Some(path.clone());

            // Rewind to the most recent keyframe, then go live.
            if self.prepend_ring {
                for packet in metrics.ring_buffer().extract_all() {
                    slot.remuxer.write_packet(packet, stream.time_base);
                }
            }
            slot.remuxer.attach(metrics.packet_hub().subscribe());
            info!(tracker_id, path = %path.display(), "recording started");
        }

        // Close remuxers whose event ended. Ids are scoped per camera, so
        // only this camera's slots are candidates.
        for slot_index in 0..self.pool.len() {
            let slot = &self.pool[slot_index];
            if slot.is_free() || slot.camera != camera || active_ids.contains(&slot.assigned_to) {
                continue;
            }
            self.finish_slot(slot_index, frame.timestamp());
        }
    }

    fn finish_slot(&mut self, slot_index: usize, end_time: OffsetDateTime) {
        let slot = &mut self.pool[slot_index];
        if let Err(e) = slot.remuxer.close() {
            error!(tracker_id = slot.assigned_to, error = %e, "failed to close recording");
        }

        if let (Some(start_time), Some(path)) = (slot.start_time, slot.path.take()) {
            let start_stamp = start_time
                .format(&Rfc3339)
                .unwrap_or_else(|_| start_time.unix_timestamp().to_string());
            let record = RecordingRecord {
                id: format!("{}_{start_stamp}", slot.camera),
                camera: slot.camera.clone(),
                path: path.display().to_string(),
                thumb_path: None,
                start_time,
                end_time: end_time.max(start_time),
                duration_ms: ((end_time - start_time).whole_milliseconds() as f64).max(0.0),
            };
            if let Err(e) = self.db.insert_recording(&record) {
                error!(error = %e, "failed to persist recording");
            } else {
                info!(id = %record.id, duration_ms = record.duration_ms, "recording saved");
            }
        }

        slot.assigned_to = -1;
        slot.camera.clear();
        slot.start_time = None;
    }

    /// Closes every live file and joins the worker pool.
    pub fn stop(&mut self) {
        let now = OffsetDateTime::now_utc();
        for slot_index in 0..self.pool.len() {
            if !self.pool[slot_index].is_free() {
                self.finish_slot(slot_index, now);
            }
        }
        for slot in &mut self.pool {
            slot.remuxer.shutdown();
            if let Some(thread) = slot.thread.take() {
                if thread.join().is_err() {
                    warn!("remuxer worker panicked");
                }
            }
        }
        self.pool.clear();
    }
}

/// `{record_dir}/{yyyy-MM-dd}/{HH}/{camera}/{mm.ss.zzz}_{tracker_id}.mkv`
pub fn make_recording_path(
    record_dir: &Path,
    timestamp: OffsetDateTime,
    camera: &str,
    tracker_id: i64,
) -> PathBuf {
    let date = timestamp
        .format(format_description!("[year]-[month]-[day]"))
        .unwrap_or_default();
    let hour = timestamp
        .format(format_description!("[hour]"))
        .unwrap_or_default();
    let name = timestamp
        .format(format_description!("[minute].[second].[subsecond digits:3]"))
        .unwrap_or_default();
    record_dir
        .join(date)
        .join(hour)
        .join(camera)
        .join(format!("{name}_{tracker_id}.mkv"))
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn recording_path_layout() {
        let path = make_recording_path(
            Path::new("recordings"),
            datetime!(2026-08-01 14:03:07.250 UTC),
            "driveway",
            42,
        );
        assert_eq!(
            path,
            Path::new("recordings/2026-08-01/14/driveway/03.07.250_42.mkv")
        );
    }

    #[test]
    fn single_digit_fields_are_zero_padded() {
        let path = make_recording_path(
            Path::new("r"),
            datetime!(2026-01-05 05:01:02.007 UTC),
            "cam",
            0,
        );
        assert_eq!(path, Path::new("r/2026-01-05/05/cam/01.02.007_0.mkv"));
    }
}
