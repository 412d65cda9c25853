//! Mutable tracker state guarded by a single lock.

use crate::enrollment::{EnrollError, EnrollmentSession};
use crate::mode::{Mode, ModeController, ModeError, Transition};
use crate::types::{RecognitionEvent, Subject, SubjectId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// Cached identity of an enrolled subject, keyed by internal id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RosterEntry {
    pub display_name: String,
    pub external_id: String,
}

impl From<&Subject> for RosterEntry {
    fn from(s: &Subject) -> Self {
        Self {
            display_name: s.display_name.clone(),
            external_id: s.external_id.clone(),
        }
    }
}

pub(crate) struct CoreState {
    pub(crate) mode: ModeController,
    pub(crate) session: EnrollmentSession,
    pub(crate) latest: Option<RecognitionEvent>,
    pub(crate) roster: HashMap<SubjectId, RosterEntry>,
}

impl CoreState {
    pub(crate) fn new(quota: usize, roster: HashMap<SubjectId, RosterEntry>) -> Self {
        Self {
            mode: ModeController::default(),
            session: EnrollmentSession::new(quota),
            latest: None,
            roster,
        }
    }

    /// Switch to `Idle` or `Recognizing`, dropping a half-collected enrollment.
    pub(crate) fn set_mode(&mut self, to: Mode) -> Result<Transition, ModeError> {
        let transition = self.mode.request(to)?;
        if transition.left_enrolling() {
            self.session.abandon();
        }
        Ok(transition)
    }

    pub(crate) fn start_enrollment(&mut self, display_name: &str, external_id: &str) -> Result<(), EnrollError> {
        self.session.start(display_name, external_id)?;
        self.mode.enter_enrolling();
        Ok(())
    }

    /// Retire a settled enrollment once it has been visible for `hold`.
    pub(crate) fn settle(&mut self, now: DateTime<Utc>, hold: Duration) {
        if self.session.tick(now, hold) && self.mode.current() == Mode::Enrolling {
            // Idle is always a valid request target.
            let _ = self.mode.request(Mode::Idle);
        }
    }

    /// The latest recognition, if it is younger than `window`.
    pub(crate) fn recent_recognition(&self, now: DateTime<Utc>, window: Duration) -> Option<RecognitionEvent> {
        let event = self.latest.as_ref()?;
        let age = (now - event.observed_at).to_std().unwrap_or(Duration::ZERO);
        (age < window).then(|| event.clone())
    }
}
