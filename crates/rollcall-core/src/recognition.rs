//! Per-face recognition gate and frame reports.

use crate::state::RosterEntry;
use crate::types::{BoundingBox, Prediction, RecognitionEvent, SubjectId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Default maximum LBPH distance accepted as a match.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 75.0;

/// What the tracker concluded about one detected face.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FaceLabel {
    Recognized {
        subject_id: SubjectId,
        display_name: String,
        external_id: String,
    },
    Unknown,
    /// Taken as an enrollment sample.
    Captured,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceReport {
    pub bbox: BoundingBox,
    pub label: FaceLabel,
    pub distance: Option<f64>,
}

/// Decides whether a prediction names a known subject.
#[derive(Debug, Clone, Copy)]
pub struct RecognitionLoop {
    threshold: f64,
}

impl Default for RecognitionLoop {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIDENCE_THRESHOLD)
    }
}

impl RecognitionLoop {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Gate one prediction. A match needs a distance strictly below the
    /// threshold and a label that resolves in the roster.
    pub fn evaluate(
        &self,
        bbox: BoundingBox,
        prediction: Option<Prediction>,
        roster: &HashMap<SubjectId, RosterEntry>,
        now: DateTime<Utc>,
    ) -> (FaceReport, Option<RecognitionEvent>) {
        let Some(p) = prediction else {
            return (FaceReport { bbox, label: FaceLabel::Unknown, distance: None }, None);
        };

        let known = roster.get(&p.subject_id).filter(|_| p.distance < self.threshold);
        let Some(entry) = known else {
            tracing::trace!(subject_id = p.subject_id, distance = p.distance, "face unknown");
            return (FaceReport { bbox, label: FaceLabel::Unknown, distance: Some(p.distance) }, None);
        };

        let event = RecognitionEvent {
            subject_id: p.subject_id,
            display_name: entry.display_name.clone(),
            external_id: entry.external_id.clone(),
            distance: p.distance,
            observed_at: now,
        };
        let report = FaceReport {
            bbox,
            label: FaceLabel::Recognized {
                subject_id: p.subject_id,
                display_name: entry.display_name.clone(),
                external_id: entry.external_id.clone(),
            },
            distance: Some(p.distance),
        };
        (report, Some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster() -> HashMap<SubjectId, RosterEntry> {
        HashMap::from([(
            7,
            RosterEntry { display_name: "Alice".into(), external_id: "E1".into() },
        )])
    }

    fn bbox() -> BoundingBox {
        BoundingBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0, confidence: 0.9 }
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_match_below_threshold_emits_event() {
        let gate = RecognitionLoop::default();
        let (report, event) = gate.evaluate(bbox(), Some(Prediction { subject_id: 7, distance: 40.0 }), &roster(), now());
        let event = event.unwrap();
        assert_eq!(event.external_id, "E1");
        assert_eq!(event.observed_at, now());
        assert!(matches!(report.label, FaceLabel::Recognized { subject_id: 7, .. }));
        assert_eq!(report.distance, Some(40.0));
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let gate = RecognitionLoop::new(40.0);
        let (report, event) = gate.evaluate(bbox(), Some(Prediction { subject_id: 7, distance: 40.0 }), &roster(), now());
        assert!(event.is_none());
        assert_eq!(report.label, FaceLabel::Unknown);
    }

    #[test]
    fn test_label_missing_from_roster_is_unknown() {
        let gate = RecognitionLoop::default();
        let (report, event) = gate.evaluate(bbox(), Some(Prediction { subject_id: 9, distance: 1.0 }), &roster(), now());
        assert!(event.is_none());
        assert_eq!(report.label, FaceLabel::Unknown);
    }

    #[test]
    fn test_no_prediction_is_unknown() {
        let (report, event) = RecognitionLoop::default().evaluate(bbox(), None, &roster(), now());
        assert!(event.is_none());
        assert_eq!(report.distance, None);
    }

    #[test]
    fn test_report_json_shape() {
        let report = FaceReport { bbox: bbox(), label: FaceLabel::Unknown, distance: None };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["label"]["kind"], "unknown");
    }
}
