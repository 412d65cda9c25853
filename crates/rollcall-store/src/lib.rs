//! rollcall-store: Durable storage for the attendance tracker.
//!
//! A SQLite database holds subjects, attendance and a backup of the
//! recognition model; the model's primary copy lives in a plain file.

pub mod model_file;
pub mod sqlite;

pub use model_file::FileModelStore;
pub use sqlite::SqliteStore;

use std::path::PathBuf;

/// `$XDG_DATA_HOME/rollcall`, falling back to `~/.local/share/rollcall`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}
