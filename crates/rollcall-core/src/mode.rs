use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Which pipeline processes incoming frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Idle,
    Enrolling,
    Recognizing,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Idle => "idle",
            Mode::Enrolling => "enrolling",
            Mode::Recognizing => "recognizing",
        })
    }
}

impl FromStr for Mode {
    type Err = ModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "idle" => Ok(Mode::Idle),
            "enrolling" | "registration" => Ok(Mode::Enrolling),
            "recognizing" | "attendance" => Ok(Mode::Recognizing),
            other => Err(ModeError::Unknown(other.to_string())),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModeError {
    #[error("unknown mode: {0:?}")]
    Unknown(String),
    #[error("enrollment mode is entered by starting an enrollment with a name and external id")]
    EnrollmentRequiresSubject,
}

/// A completed mode change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Mode,
    pub to: Mode,
}

impl Transition {
    pub fn left_enrolling(&self) -> bool {
        self.from == Mode::Enrolling && self.to != Mode::Enrolling
    }
}

/// Three-state mode holder. Every request replaces the current mode outright.
#[derive(Debug, Default)]
pub struct ModeController {
    mode: Mode,
}

impl ModeController {
    pub fn current(&self) -> Mode {
        self.mode
    }

    /// Switch to `Idle` or `Recognizing`.
    pub fn request(&mut self, to: Mode) -> Result<Transition, ModeError> {
        if to == Mode::Enrolling {
            return Err(ModeError::EnrollmentRequiresSubject);
        }
        Ok(self.replace(to))
    }

    /// Enter `Enrolling`; callers validate the enrollment parameters first.
    pub(crate) fn enter_enrolling(&mut self) -> Transition {
        self.replace(Mode::Enrolling)
    }

    fn replace(&mut self, to: Mode) -> Transition {
        let from = std::mem::replace(&mut self.mode, to);
        if from != to {
            tracing::info!(%from, %to, "mode changed");
        }
        Transition { from, to }
    }
}
