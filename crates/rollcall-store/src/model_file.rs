//! Model blob kept in a local file, with a secondary store as backup.
//!
//! The file is the primary copy. When it is missing the blob is recovered
//! from the secondary store and the file is rewritten; every save is
//! mirrored to the secondary store on a best-effort basis.

use rollcall_core::collab::{PersistenceError, PersistentModelStore};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct FileModelStore {
    path: PathBuf,
    secondary: Option<Arc<dyn PersistentModelStore>>,
}

impl FileModelStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            secondary: None,
        }
    }

    pub fn with_secondary(mut self, secondary: Arc<dyn PersistentModelStore>) -> Self {
        self.secondary = Some(secondary);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the model file. A file that is already gone is not an error.
    pub fn remove(&self) -> Result<(), PersistenceError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_file(&self, blob: &[u8]) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write-then-rename so a crash never leaves a truncated model.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, blob)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn recover(&self) -> Result<Option<Vec<u8>>, PersistenceError> {
        let Some(secondary) = &self.secondary else {
            return Ok(None);
        };
        let Some(blob) = secondary.load_model_blob()? else {
            return Ok(None);
        };
        tracing::info!(
            path = %self.path.display(),
            bytes = blob.len(),
            "model file missing; recovered from secondary store"
        );
        if let Err(e) = self.write_file(&blob) {
            tracing::warn!(path = %self.path.display(), error = %e, "could not restore model file");
        }
        Ok(Some(blob))
    }
}

impl PersistentModelStore for FileModelStore {
    fn load_model_blob(&self) -> Result<Option<Vec<u8>>, PersistenceError> {
        match std::fs::read(&self.path) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == ErrorKind::NotFound => self.recover(),
            Err(e) => Err(e.into()),
        }
    }

    fn save_model_blob(&self, blob: &[u8]) -> Result<(), PersistenceError> {
        self.write_file(blob)?;
        if let Some(secondary) = &self.secondary {
            if let Err(e) = secondary.save_model_blob(blob) {
                tracing::warn!(error = %e, "model saved to file but not mirrored to secondary store");
            }
        }
        tracing::debug!(path = %self.path.display(), bytes = blob.len(), "model saved");
        Ok(())
    }
}
