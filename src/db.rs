use std::{path::Path, sync::Mutex};

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::instrument;

/// A finalized tracked-object event, one row per event id.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub id: String,
    pub tracker_id: i64,
    pub label: String,
    pub camera: String,
    pub start_time: OffsetDateTime,
    pub end_time: OffsetDateTime,
    pub top_score: f32,
    pub score: f32,
    /// Serialized prediction history.
    pub data: String,
}

/// One output video file tied to one event.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingRecord {
    pub id: String,
    pub camera: String,
    pub path: String,
    pub thumb_path: Option<String>,
    pub start_time: OffsetDateTime,
    pub end_time: OffsetDateTime,
    pub duration_ms: f64,
}

/// SQLite storage for events and recordings. All writes are transactional;
/// a failed transaction rolls back and the row is lost, never half-written.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    #[instrument(err)]
    pub fn open(path: &str) -> Result<Database> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to create/open database at {path}"))?;
        Database::init(conn)
    }

    pub fn open_in_memory() -> Result<Database> {
        Database::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Database> {
        conn.execute_batch(include_str!("../db/schema.sql"))
            .context("failed to create database schema")?;
        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    /// Upsert keyed on the event id, so re-finalizing an event stays a
    /// single row.
    pub fn insert_event(&self, event: &EventRecord) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO events \
             (id, tracker_id, label, camera, start_time, end_time, top_score, score, data) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event.id,
                event.tracker_id,
                event.label,
                event.camera,
                event.start_time.format(&Rfc3339)?,
                event.end_time.format(&Rfc3339)?,
                event.top_score,
                event.score,
                event.data,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn insert_recording(&self, recording: &RecordingRecord) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO recordings \
             (id, camera, path, thumb_path, start_time, end_time, duration_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                recording.id,
                recording.camera,
                recording.path,
                recording.thumb_path,
                recording.start_time.format(&Rfc3339)?,
                recording.end_time.format(&Rfc3339)?,
                recording.duration_ms,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn event_count(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?)
    }

    pub fn recording_count(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM recordings", [], |row| row.get(0))?)
    }

    pub fn event(&self, id: &str) -> Result<Option<EventRecord>> {
        Ok(self
            .select_events("WHERE id = ?1", params![id])?
            .into_iter()
            .next())
    }

    /// Events for one camera, oldest first.
    pub fn events_for_camera(&self, camera: &str) -> Result<Vec<EventRecord>> {
        self.select_events("WHERE camera = ?1 ORDER BY start_time", params![camera])
    }

    fn select_events(
        &self,
        filter: &str,
        filter_params: impl rusqlite::Params,
    ) -> Result<Vec<EventRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, tracker_id, label, camera, start_time, end_time, top_score, score, data \
             FROM events {filter}"
        ))?;
        let mut rows = stmt.query(filter_params)?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            let start_time: String = row.get(4)?;
            let end_time: String = row.get(5)?;
            events.push(EventRecord {
                id: row.get(0)?,
                tracker_id: row.get(1)?,
                label: row.get(2)?,
                camera: row.get(3)?,
                start_time: OffsetDateTime::parse(&start_time, &Rfc3339)?,
                end_time: OffsetDateTime::parse(&end_time, &Rfc3339)?,
                top_score: row.get(6)?,
                score: row.get(7)?,
                data: row.get(8)?,
            });
        }
        Ok(events)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;

    fn sample_event(id: &str) -> EventRecord {
        let start = OffsetDateTime::now_utc();
        EventRecord {
            id: id.to_owned(),
            tracker_id: 12,
            label: "car".to_owned(),
            camera: "driveway".to_owned(),
            start_time: start,
            end_time: start + Duration::seconds(9),
            top_score: 0.93,
            score: 0.88,
            data: "[]".to_owned(),
        }
    }

    #[test]
    fn event_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let event = sample_event("ev-1");
        db.insert_event(&event).unwrap();

        let loaded = db.event("ev-1").unwrap().unwrap();
        assert_eq!(loaded.tracker_id, 12);
        assert_eq!(loaded.label, "car");
        assert!(loaded.top_score >= loaded.score);
        assert!(loaded.end_time >= loaded.start_time);
        assert!(db.event("missing").unwrap().is_none());
    }

    #[test]
    fn repeated_finalization_keeps_one_row() {
        let db = Database::open_in_memory().unwrap();
        let event = sample_event("ev-dup");
        db.insert_event(&event).unwrap();
        db.insert_event(&event).unwrap();
        assert_eq!(db.event_count().unwrap(), 1);
    }

    #[test]
    fn recording_insert_counts() {
        let db = Database::open_in_memory().unwrap();
        let start = OffsetDateTime::now_utc();
        let recording = RecordingRecord {
            id: "driveway_2026-01-01T00:00:00Z".to_owned(),
            camera: "driveway".to_owned(),
            path: "recordings/x.mkv".to_owned(),
            thumb_path: None,
            start_time: start,
            end_time: start + Duration::seconds(12),
            duration_ms: 12_000.0,
        };
        db.insert_recording(&recording).unwrap();
        db.insert_recording(&recording).unwrap();
        assert_eq!(db.recording_count().unwrap(), 1);
    }
}
