//! SQLite-backed subject directory, attendance log and model storage.
//!
//! # Schema
//!
//! - `subjects`: `id`, `display_name`, `external_id` (unique), `profile_sample`, `created_at`
//! - `attendance`: `id`, `subject_id`, `display_name`, `external_id`, `timestamp`
//! - `system_storage`: `key` (primary), `value`
//!
//! Timestamps are fixed-width RFC 3339 UTC strings, so they sort as text.

use chrono::{DateTime, SecondsFormat, Utc};
use rollcall_core::collab::{AttendanceSink, PersistenceError, PersistentModelStore, SubjectDirectory};
use rollcall_core::types::{AttendanceRecord, NewSubject, Subject, SubjectId};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// `system_storage` key holding the serialized recognition model.
const MODEL_KEY: &str = "trainer_model";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn backend(e: rusqlite::Error) -> PersistenceError {
    PersistenceError::Backend(e.to_string())
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(backend)?;
        Self::init_schema(&conn).map_err(backend)?;
        tracing::info!(path = %path.display(), "database opened");
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        Self::init_schema(&conn).map_err(backend)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS subjects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                display_name TEXT NOT NULL,
                external_id TEXT NOT NULL UNIQUE,
                profile_sample BLOB,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS attendance (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                subject_id INTEGER NOT NULL,
                display_name TEXT NOT NULL,
                external_id TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_attendance_timestamp ON attendance(timestamp);
            CREATE TABLE IF NOT EXISTS system_storage (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );",
        )
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, PersistenceError> {
        self.conn
            .lock()
            .map_err(|_| PersistenceError::Unavailable("connection lock poisoned".into()))
    }

    /// Attendance recorded at or after `since`, oldest first.
    pub fn attendance_since(&self, since: DateTime<Utc>) -> Result<Vec<AttendanceRecord>, PersistenceError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT subject_id, display_name, external_id, timestamp FROM attendance
                 WHERE timestamp >= ?1 ORDER BY timestamp, id",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![timestamp(&since)], |row| {
                let ts: String = row.get(3)?;
                Ok(AttendanceRecord {
                    subject_id: row.get(0)?,
                    display_name: row.get(1)?,
                    external_id: row.get(2)?,
                    timestamp: parse_timestamp(3, &ts)?,
                })
            })
            .map_err(backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)
    }

    /// Delete every subject, attendance record and stored model.
    pub fn reset(&self) -> Result<(), PersistenceError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(backend)?;
        tx.execute("DELETE FROM subjects", []).map_err(backend)?;
        tx.execute("DELETE FROM attendance", []).map_err(backend)?;
        tx.execute("DELETE FROM system_storage", []).map_err(backend)?;
        tx.commit().map_err(backend)?;
        tracing::warn!("database reset");
        Ok(())
    }
}

fn subject_from_row(row: &Row<'_>) -> rusqlite::Result<Subject> {
    Ok(Subject {
        internal_id: row.get(0)?,
        display_name: row.get(1)?,
        external_id: row.get(2)?,
        profile_sample: row.get(3)?,
    })
}

impl SubjectDirectory for SqliteStore {
    fn lookup_by_external_id(&self, external_id: &str) -> Result<Option<Subject>, PersistenceError> {
        self.conn()?
            .query_row(
                "SELECT id, display_name, external_id, profile_sample FROM subjects WHERE external_id = ?1",
                params![external_id],
                subject_from_row,
            )
            .optional()
            .map_err(backend)
    }

    fn upsert(&self, subject: &NewSubject) -> Result<SubjectId, PersistenceError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO subjects (display_name, external_id, profile_sample, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(external_id) DO UPDATE SET
                display_name = excluded.display_name,
                profile_sample = COALESCE(excluded.profile_sample, subjects.profile_sample)",
            params![
                subject.display_name,
                subject.external_id,
                subject.profile_sample,
                timestamp(&Utc::now())
            ],
        )
        .map_err(backend)?;
        let id: SubjectId = conn
            .query_row(
                "SELECT id FROM subjects WHERE external_id = ?1",
                params![subject.external_id],
                |row| row.get(0),
            )
            .map_err(backend)?;
        tracing::debug!(id, external_id = %subject.external_id, "subject upserted");
        Ok(id)
    }

    fn all(&self) -> Result<Vec<Subject>, PersistenceError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, display_name, external_id, profile_sample FROM subjects ORDER BY id")
            .map_err(backend)?;
        let rows = stmt.query_map([], subject_from_row).map_err(backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)
    }
}

impl AttendanceSink for SqliteStore {
    fn append(&self, record: &AttendanceRecord) -> Result<(), PersistenceError> {
        self.conn()?
            .execute(
                "INSERT INTO attendance (subject_id, display_name, external_id, timestamp)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.subject_id,
                    record.display_name,
                    record.external_id,
                    timestamp(&record.timestamp)
                ],
            )
            .map_err(backend)?;
        Ok(())
    }
}

impl PersistentModelStore for SqliteStore {
    fn load_model_blob(&self) -> Result<Option<Vec<u8>>, PersistenceError> {
        self.conn()?
            .query_row(
                "SELECT value FROM system_storage WHERE key = ?1",
                params![MODEL_KEY],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)
    }

    fn save_model_blob(&self, blob: &[u8]) -> Result<(), PersistenceError> {
        self.conn()?
            .execute(
                "INSERT INTO system_storage (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![MODEL_KEY, blob],
            )
            .map_err(backend)?;
        Ok(())
    }
}
