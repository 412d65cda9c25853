//! Enrollment session state machine.
//!
//! `Idle → Collecting → Training → Complete | Failed → Idle`
//!
//! The session only gathers samples. Once the quota is reached it hands the
//! batch off as a [`TrainingJob`] and waits for the worker to report back.

use crate::types::CanonicalFace;
use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrollmentPhase {
    #[default]
    Idle,
    Collecting,
    Training,
    Complete,
    Failed,
}

impl fmt::Display for EnrollmentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EnrollmentPhase::Idle => "idle",
            EnrollmentPhase::Collecting => "collecting",
            EnrollmentPhase::Training => "training",
            EnrollmentPhase::Complete => "complete",
            EnrollmentPhase::Failed => "failed",
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnrollError {
    #[error("display name must not be empty")]
    MissingName,
    #[error("external id must not be empty")]
    MissingExternalId,
    #[error("an enrollment session is already {0}")]
    SessionActive(EnrollmentPhase),
}

/// A full sample batch ready to be absorbed into the classifier.
#[derive(Debug)]
pub struct TrainingJob {
    /// Identifies the session that produced the job.
    pub generation: u64,
    pub display_name: String,
    pub external_id: String,
    pub samples: Vec<CanonicalFace>,
    /// Color crop of the middle sample, kept for the subject's profile image.
    pub profile: Option<RgbImage>,
}

#[derive(Debug)]
pub struct EnrollmentSession {
    quota: usize,
    phase: EnrollmentPhase,
    generation: u64,
    display_name: String,
    external_id: String,
    collected: usize,
    samples: Vec<CanonicalFace>,
    crops: Vec<RgbImage>,
    settled_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl EnrollmentSession {
    pub fn new(quota: usize) -> Self {
        Self {
            quota: quota.max(1),
            phase: EnrollmentPhase::Idle,
            generation: 0,
            display_name: String::new(),
            external_id: String::new(),
            collected: 0,
            samples: Vec::new(),
            crops: Vec::new(),
            settled_at: None,
            last_error: None,
        }
    }

    pub fn phase(&self) -> EnrollmentPhase {
        self.phase
    }

    pub fn quota(&self) -> usize {
        self.quota
    }

    /// Samples gathered by the current (or last settled) session.
    pub fn progress(&self) -> usize {
        self.collected
    }

    /// Samples still needed before training starts; zero unless collecting.
    pub fn remaining(&self) -> usize {
        match self.phase {
            EnrollmentPhase::Collecting => self.quota - self.collected,
            _ => 0,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.phase, EnrollmentPhase::Collecting | EnrollmentPhase::Training)
    }

    pub fn subject(&self) -> Option<(&str, &str)> {
        if self.phase == EnrollmentPhase::Idle {
            return None;
        }
        Some((&self.display_name, &self.external_id))
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Begin collecting for a subject. Overlapping sessions are rejected.
    pub fn start(&mut self, display_name: &str, external_id: &str) -> Result<(), EnrollError> {
        if self.is_active() {
            return Err(EnrollError::SessionActive(self.phase));
        }
        let display_name = display_name.trim();
        let external_id = external_id.trim();
        if display_name.is_empty() {
            return Err(EnrollError::MissingName);
        }
        if external_id.is_empty() {
            return Err(EnrollError::MissingExternalId);
        }

        self.clear();
        self.generation += 1;
        self.display_name = display_name.to_string();
        self.external_id = external_id.to_string();
        self.phase = EnrollmentPhase::Collecting;
        tracing::info!(
            generation = self.generation,
            external_id,
            quota = self.quota,
            "enrollment started"
        );
        Ok(())
    }

    /// Add one sample. Returns the training job when this sample fills the quota.
    pub fn offer(&mut self, face: CanonicalFace, crop: Option<RgbImage>) -> Option<TrainingJob> {
        if self.phase != EnrollmentPhase::Collecting {
            return None;
        }
        self.samples.push(face);
        if let Some(crop) = crop {
            self.crops.push(crop);
        }
        self.collected += 1;
        tracing::debug!(collected = self.collected, quota = self.quota, "enrollment sample");

        if self.collected < self.quota {
            return None;
        }

        self.phase = EnrollmentPhase::Training;
        let mut crops = std::mem::take(&mut self.crops);
        let profile = if crops.is_empty() {
            None
        } else {
            Some(crops.swap_remove(crops.len() / 2))
        };
        tracing::info!(generation = self.generation, "enrollment quota reached; training queued");

        Some(TrainingJob {
            generation: self.generation,
            display_name: self.display_name.clone(),
            external_id: self.external_id.clone(),
            samples: std::mem::take(&mut self.samples),
            profile,
        })
    }

    /// Record the worker's verdict for `generation`. Stale verdicts are ignored.
    pub fn finish(&mut self, generation: u64, outcome: Result<(), String>, now: DateTime<Utc>) -> bool {
        if self.phase != EnrollmentPhase::Training || generation != self.generation {
            tracing::warn!(generation, current = self.generation, "ignoring stale training result");
            return false;
        }
        match outcome {
            Ok(()) => {
                self.phase = EnrollmentPhase::Complete;
                self.last_error = None;
            }
            Err(reason) => {
                self.phase = EnrollmentPhase::Failed;
                self.last_error = Some(reason);
            }
        }
        self.settled_at = Some(now);
        true
    }

    /// Drop an in-progress collection without committing anything.
    pub fn abandon(&mut self) -> bool {
        if self.phase != EnrollmentPhase::Collecting {
            return false;
        }
        tracing::info!(
            generation = self.generation,
            collected = self.collected,
            "enrollment abandoned"
        );
        self.clear();
        self.phase = EnrollmentPhase::Idle;
        true
    }

    /// Return to `Idle` once a settled session has been visible for `hold`.
    pub fn tick(&mut self, now: DateTime<Utc>, hold: Duration) -> bool {
        if !matches!(self.phase, EnrollmentPhase::Complete | EnrollmentPhase::Failed) {
            return false;
        }
        let elapsed = self
            .settled_at
            .and_then(|at| (now - at).to_std().ok())
            .unwrap_or(Duration::ZERO);
        if elapsed < hold {
            return false;
        }
        self.clear();
        self.phase = EnrollmentPhase::Idle;
        true
    }

    fn clear(&mut self) {
        self.samples.clear();
        self.crops.clear();
        self.collected = 0;
        self.settled_at = None;
        self.last_error = None;
    }
}
