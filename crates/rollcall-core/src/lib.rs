//! rollcall-core: Face attendance engine.
//!
//! SCRFD face detection via ONNX Runtime, LBPH recognition, the enrollment
//! state machine and a cooldown-deduplicated attendance ledger. Durable
//! storage is reached only through the traits in [`collab`].

pub mod classifier;
pub mod collab;
pub mod detector;
pub mod enrollment;
pub mod lbph;
pub mod ledger;
pub mod mode;
pub mod normalizer;
pub mod recognition;
mod state;
mod trainer;
pub mod tracker;
pub mod types;

#[cfg(test)]
mod testutil;

pub use classifier::ClassifierStore;
pub use collab::{AttendanceSink, PersistenceError, PersistentModelStore, SubjectDirectory};
pub use detector::{DetectionError, FaceDetector, ScaledDetector, ScrfdDetector};
pub use enrollment::{EnrollError, EnrollmentPhase};
pub use mode::{Mode, ModeError};
pub use recognition::{FaceLabel, FaceReport};
pub use state::RosterEntry;
pub use trainer::TrainingJobError;
pub use tracker::{
    Collaborators, FrameReport, ResetError, StatusSnapshot, Tracker, TrackerConfig, TrackerError,
};
pub use types::{AttendanceRecord, BoundingBox, NewSubject, RecognitionEvent, Subject, SubjectId};
