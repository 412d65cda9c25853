//! Narrow interfaces to the durable collaborators the core depends on.

use crate::types::{AttendanceRecord, NewSubject, Subject, SubjectId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage backend: {0}")]
    Backend(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable home of the serialized classifier model.
pub trait PersistentModelStore: Send + Sync {
    fn load_model_blob(&self) -> Result<Option<Vec<u8>>, PersistenceError>;
    fn save_model_blob(&self, blob: &[u8]) -> Result<(), PersistenceError>;
}

/// Registry of enrolled subjects keyed by their external id.
pub trait SubjectDirectory: Send + Sync {
    fn lookup_by_external_id(&self, external_id: &str) -> Result<Option<Subject>, PersistenceError>;

    /// Insert or update a subject, returning its stable internal id. An
    /// existing external id keeps the id it was first assigned.
    fn upsert(&self, subject: &NewSubject) -> Result<SubjectId, PersistenceError>;

    fn all(&self) -> Result<Vec<Subject>, PersistenceError>;
}

/// Durable attendance log.
pub trait AttendanceSink: Send + Sync {
    fn append(&self, record: &AttendanceRecord) -> Result<(), PersistenceError>;
}
