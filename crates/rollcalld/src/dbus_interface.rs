use crate::engine::{EngineError, EngineHandle};
use chrono::{DateTime, Local, Utc};
use rollcall_core::{Mode, SubjectDirectory, Tracker};
use rollcall_store::{FileModelStore, SqliteStore};
use std::sync::Arc;
use zbus::{fdo, interface};

/// D-Bus interface for the rollcall attendance daemon.
///
/// Bus name: org.rollcall.Daemon1
/// Object path: /org/rollcall/Daemon1
///
/// Structured replies are JSON strings.
pub struct RollcallService {
    tracker: Arc<Tracker>,
    engine: EngineHandle,
    db: Arc<SqliteStore>,
    model_file: Arc<FileModelStore>,
}

impl RollcallService {
    pub fn new(
        tracker: Arc<Tracker>,
        engine: EngineHandle,
        db: Arc<SqliteStore>,
        model_file: Arc<FileModelStore>,
    ) -> Self {
        Self {
            tracker,
            engine,
            db,
            model_file,
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("encoding reply: {e}")))
}

/// Local midnight today, in UTC.
fn start_of_today() -> DateTime<Utc> {
    Local::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| midnight.and_local_timezone(Local).earliest())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| Utc::now() - chrono::Duration::hours(24))
}

#[interface(name = "org.rollcall.Daemon1")]
impl RollcallService {
    /// Switch to "idle" or "recognizing". Returns the new mode.
    async fn set_mode(&self, mode: &str) -> fdo::Result<String> {
        tracing::info!(mode, "set_mode requested");
        let mode: Mode = mode
            .parse()
            .map_err(|e: rollcall_core::ModeError| fdo::Error::InvalidArgs(e.to_string()))?;
        let transition = self
            .tracker
            .set_mode(mode)
            .map_err(|e| fdo::Error::InvalidArgs(e.to_string()))?;
        Ok(transition.to.to_string())
    }

    /// Begin enrolling a subject; frames start counting immediately.
    async fn start_enrollment(&self, display_name: &str, external_id: &str) -> fdo::Result<()> {
        tracing::info!(external_id, "start_enrollment requested");
        self.tracker
            .start_enrollment(display_name, external_id)
            .map_err(|e| fdo::Error::Failed(e.to_string()))
    }

    /// Mode, enrollment phase and progress, and model summary.
    async fn status(&self) -> fdo::Result<String> {
        let status = self.tracker.status(Utc::now());
        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "status": status,
        }))
    }

    /// The latest recognition within the freshness window, or `null`.
    async fn current_recognition(&self) -> fdo::Result<String> {
        to_json(&self.tracker.current_recognition(Utc::now()))
    }

    /// Today's attendance from the database.
    async fn attendance(&self) -> fdo::Result<String> {
        match self.db.attendance_since(start_of_today()) {
            Ok(records) => to_json(&records),
            Err(e) => {
                tracing::warn!(error = %e, "attendance query failed; serving in-memory log");
                to_json(&self.tracker.attendance())
            }
        }
    }

    /// Process an uploaded JPEG/PNG frame. Returns the per-face report.
    async fn submit_frame(&self, frame: Vec<u8>) -> fdo::Result<String> {
        let report = self.engine.submit_frame(frame).await.map_err(|e| match e {
            EngineError::Frame(e) => fdo::Error::InvalidArgs(e.to_string()),
            other => fdo::Error::Failed(other.to_string()),
        })?;
        to_json(&report)
    }

    /// JPEG profile image captured at enrollment; empty if none.
    async fn profile_image(&self, external_id: &str) -> fdo::Result<Vec<u8>> {
        let subject = self
            .db
            .lookup_by_external_id(external_id)
            .map_err(|e| fdo::Error::Failed(e.to_string()))?
            .ok_or_else(|| fdo::Error::InvalidArgs(format!("unknown subject: {external_id}")))?;
        Ok(subject.profile_sample.unwrap_or_default())
    }

    /// Forget every subject, attendance record and the trained model.
    ///
    /// Stores are wiped before memory. The model file goes first: if the
    /// database reset then fails, the next start restores the file from the
    /// database copy and the old state comes back intact.
    async fn reset(&self) -> fdo::Result<()> {
        tracing::warn!("reset requested");
        self.tracker
            .reset(|| {
                self.model_file.remove()?;
                self.db.reset()
            })
            .map_err(|e| fdo::Error::Failed(e.to_string()))
    }
}
