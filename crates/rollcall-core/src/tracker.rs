//! The attendance tracker: mode, enrollment, recognition and ledger wired
//! together behind one thread-safe handle.
//!
//! Lock discipline: state, classifier and ledger each sit behind their own
//! mutex and are only ever taken one at a time.

use crate::classifier::{ClassifierStore, ModelCodecError};
use crate::collab::{AttendanceSink, PersistenceError, PersistentModelStore, SubjectDirectory};
use crate::detector::FaceDetector;
use crate::enrollment::{EnrollError, EnrollmentPhase};
use crate::ledger::AttendanceLedger;
use crate::mode::{Mode, ModeError, Transition};
use crate::normalizer::{crop_color, normalize};
use crate::recognition::{FaceLabel, FaceReport, RecognitionLoop, DEFAULT_CONFIDENCE_THRESHOLD};
use crate::state::{CoreState, RosterEntry};
use crate::trainer::TrainingQueue;
use crate::types::{AttendanceRecord, BoundingBox, Prediction, RecognitionEvent};
use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Samples collected per enrollment.
    pub enrollment_quota: usize,
    /// Minimum gap between two attendance records for one identity.
    pub cooldown: Duration,
    /// Maximum LBPH distance accepted as a match.
    pub confidence_threshold: f64,
    /// How long the latest recognition stays visible to pollers.
    pub recognition_window: Duration,
    /// How long a finished enrollment stays visible before returning to idle.
    pub status_hold: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            enrollment_quota: 40,
            cooldown: Duration::from_secs(30),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            recognition_window: Duration::from_secs(4),
            status_hold: Duration::from_secs(2),
        }
    }
}

/// Durable collaborators. One object may play every role.
#[derive(Clone)]
pub struct Collaborators {
    pub models: Arc<dyn PersistentModelStore>,
    pub directory: Arc<dyn SubjectDirectory>,
    pub sink: Arc<dyn AttendanceSink>,
}

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("loading persisted state: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("stored model is unreadable: {0}")]
    Model(#[from] ModelCodecError),
    #[error("failed to start training worker: {0}")]
    Worker(#[source] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ResetError {
    #[error(transparent)]
    Busy(#[from] EnrollError),
    #[error("clearing stored state: {0}")]
    Durable(#[from] PersistenceError),
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<CoreState>,
    pub(crate) classifier: Mutex<ClassifierStore>,
    pub(crate) ledger: Mutex<AttendanceLedger>,
    pub(crate) directory: Arc<dyn SubjectDirectory>,
    pub(crate) models: Arc<dyn PersistentModelStore>,
}

/// A poisoned lock only means another thread panicked mid-update; the data
/// it guards is still the best state we have.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub mode: Mode,
    pub phase: EnrollmentPhase,
    pub progress: usize,
    pub quota: usize,
    /// External id of the subject being (or last) enrolled.
    pub external_id: Option<String>,
    pub last_error: Option<String>,
    pub trained: bool,
    pub subjects: usize,
    pub model_samples: usize,
}

/// Outcome of one processed frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameReport {
    pub mode: Mode,
    pub faces: Vec<FaceReport>,
}

pub struct Tracker {
    shared: Arc<Shared>,
    trainer: TrainingQueue,
    recognizer: RecognitionLoop,
    config: TrackerConfig,
}

impl Tracker {
    /// Restore the persisted model and roster, then start the training worker.
    ///
    /// An unreadable stored model is an error rather than a silent reset.
    pub fn open(config: TrackerConfig, collab: Collaborators) -> Result<Self, TrackerError> {
        let classifier = match collab.models.load_model_blob()? {
            Some(blob) => ClassifierStore::deserialize(&blob)?,
            None => ClassifierStore::default(),
        };
        let roster = collab
            .directory
            .all()?
            .iter()
            .map(|s| (s.internal_id, RosterEntry::from(s)))
            .collect();

        let state = CoreState::new(config.enrollment_quota, roster);
        tracing::info!(
            trained = classifier.is_trained(),
            model_samples = classifier.sample_count(),
            roster = state.roster.len(),
            "tracker state restored"
        );

        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            classifier: Mutex::new(classifier),
            ledger: Mutex::new(AttendanceLedger::new(config.cooldown, collab.sink)),
            directory: collab.directory,
            models: collab.models,
        });
        let trainer = TrainingQueue::spawn(shared.clone()).map_err(TrackerError::Worker)?;

        Ok(Self {
            shared,
            trainer,
            recognizer: RecognitionLoop::new(config.confidence_threshold),
            config,
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        lock(&self.shared.state).mode.current()
    }

    /// Switch to `Idle` or `Recognizing`.
    pub fn set_mode(&self, mode: Mode) -> Result<Transition, ModeError> {
        lock(&self.shared.state).set_mode(mode)
    }

    /// Start collecting samples for a subject and enter `Enrolling`.
    pub fn start_enrollment(&self, display_name: &str, external_id: &str) -> Result<(), EnrollError> {
        lock(&self.shared.state).start_enrollment(display_name, external_id)
    }

    pub fn status(&self, now: DateTime<Utc>) -> StatusSnapshot {
        let (mode, phase, progress, quota, external_id, last_error, subjects) = {
            let mut st = lock(&self.shared.state);
            st.settle(now, self.config.status_hold);
            (
                st.mode.current(),
                st.session.phase(),
                st.session.progress(),
                st.session.quota(),
                st.session.subject().map(|(_, id)| id.to_string()),
                st.session.last_error().map(str::to_string),
                st.roster.len(),
            )
        };
        let (trained, model_samples) = {
            let classifier = lock(&self.shared.classifier);
            (classifier.is_trained(), classifier.sample_count())
        };
        StatusSnapshot {
            mode,
            phase,
            progress,
            quota,
            external_id,
            last_error,
            trained,
            subjects,
            model_samples,
        }
    }

    /// The most recent recognition, if it is still fresh.
    pub fn current_recognition(&self, now: DateTime<Utc>) -> Option<RecognitionEvent> {
        lock(&self.shared.state).recent_recognition(now, self.config.recognition_window)
    }

    /// Attendance accepted since startup (or the last reset).
    pub fn attendance(&self) -> Vec<AttendanceRecord> {
        lock(&self.shared.ledger).records().to_vec()
    }

    /// Forget every subject, the model and the attendance log.
    ///
    /// `clear_durable` wipes the stores and runs first, with the state lock
    /// held so no enrollment can start in between. Memory is only cleared
    /// once it succeeds. Refused while an enrollment is collecting or
    /// training.
    pub fn reset(
        &self,
        clear_durable: impl FnOnce() -> Result<(), PersistenceError>,
    ) -> Result<(), ResetError> {
        {
            let mut st = lock(&self.shared.state);
            if st.session.is_active() {
                return Err(EnrollError::SessionActive(st.session.phase()).into());
            }
            clear_durable()?;
            // Idle is always a valid request target.
            let _ = st.set_mode(Mode::Idle);
            st.latest = None;
            st.roster.clear();
        }
        *lock(&self.shared.classifier) = ClassifierStore::default();
        lock(&self.shared.ledger).clear();
        tracing::warn!("tracker reset: stores, model, roster and attendance cleared");
        Ok(())
    }

    /// Run one frame through whichever pipeline the current mode selects.
    ///
    /// Idle frames are not even passed to the detector. Detection failures
    /// are logged and treated as a frame without faces.
    pub fn process_frame(
        &self,
        detector: &mut dyn FaceDetector,
        frame: &RgbImage,
        now: DateTime<Utc>,
    ) -> FrameReport {
        let mode = {
            let mut st = lock(&self.shared.state);
            st.settle(now, self.config.status_hold);
            st.mode.current()
        };
        if mode == Mode::Idle {
            return FrameReport { mode, faces: Vec::new() };
        }

        let boxes = match detector.detect(frame) {
            Ok(boxes) => boxes,
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed; treating frame as empty");
                Vec::new()
            }
        };
        if boxes.is_empty() {
            return FrameReport { mode, faces: Vec::new() };
        }

        let faces = match mode {
            Mode::Enrolling => self.collect_samples(frame, &boxes, now),
            Mode::Recognizing => self.recognize(frame, &boxes, now),
            Mode::Idle => Vec::new(),
        };
        FrameReport { mode, faces }
    }

    fn collect_samples(&self, frame: &RgbImage, boxes: &[BoundingBox], now: DateTime<Utc>) -> Vec<FaceReport> {
        let prepared: Vec<_> = boxes
            .iter()
            .map(|b| (*b, normalize(frame, b), crop_color(frame, b)))
            .collect();

        let mut reports = Vec::with_capacity(prepared.len());
        let mut jobs = Vec::new();
        {
            let mut st = lock(&self.shared.state);
            for (bbox, face, crop) in prepared {
                let label = match face {
                    Ok(face) if st.session.phase() == EnrollmentPhase::Collecting => {
                        jobs.extend(st.session.offer(face, crop));
                        FaceLabel::Captured
                    }
                    Ok(_) => FaceLabel::Unknown,
                    Err(e) => {
                        tracing::debug!(error = %e, "skipping face");
                        FaceLabel::Unknown
                    }
                };
                reports.push(FaceReport { bbox, label, distance: None });
            }
        }

        for job in jobs {
            let generation = job.generation;
            if self.trainer.submit(job).is_err() {
                tracing::error!(generation, "training worker is gone; enrollment failed");
                lock(&self.shared.state).session.finish(
                    generation,
                    Err("training worker unavailable".into()),
                    now,
                );
            }
        }
        reports
    }

    fn recognize(&self, frame: &RgbImage, boxes: &[BoundingBox], now: DateTime<Utc>) -> Vec<FaceReport> {
        let faces: Vec<_> = boxes.iter().map(|b| normalize(frame, b).ok()).collect();

        let predictions: Vec<Option<Prediction>> = {
            let classifier = lock(&self.shared.classifier);
            if !classifier.is_trained() {
                tracing::debug!(faces = faces.len(), "classifier untrained; every face is unknown");
            }
            faces
                .iter()
                .map(|face| face.as_ref().and_then(|f| classifier.predict(f).ok()))
                .collect()
        };

        let mut reports = Vec::with_capacity(boxes.len());
        let mut events = Vec::new();
        {
            let mut st = lock(&self.shared.state);
            for (bbox, prediction) in boxes.iter().zip(predictions) {
                let (report, event) = self.recognizer.evaluate(*bbox, prediction, &st.roster, now);
                if let Some(event) = event {
                    st.latest = Some(event.clone());
                    events.push(event);
                }
                reports.push(report);
            }
        }

        if !events.is_empty() {
            let mut ledger = lock(&self.shared.ledger);
            for event in &events {
                ledger.record(event);
            }
        }
        reports
    }
}
