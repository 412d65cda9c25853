//! Attendance deduplication and recording.

use crate::collab::AttendanceSink;
use crate::types::{AttendanceRecord, RecognitionEvent};
use chrono::{DateTime, Local, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Attendance log with a per-identity cooldown.
///
/// The cooldown is measured from the last *accepted* record for an external
/// id, so a steady stream of sightings yields one record per window. The
/// in-memory log only holds the current local day; the sink keeps history.
pub struct AttendanceLedger {
    cooldown: Duration,
    last_accepted: HashMap<String, DateTime<Utc>>,
    records: Vec<AttendanceRecord>,
    sink: Arc<dyn AttendanceSink>,
}

impl AttendanceLedger {
    pub fn new(cooldown: Duration, sink: Arc<dyn AttendanceSink>) -> Self {
        Self {
            cooldown,
            last_accepted: HashMap::new(),
            records: Vec::new(),
            sink,
        }
    }

    /// Record `event` unless the same identity was accepted within the cooldown.
    ///
    /// Durable write failures are logged; the in-memory log stays authoritative.
    pub fn record(&mut self, event: &RecognitionEvent) -> Option<AttendanceRecord> {
        if let Some(&last) = self.last_accepted.get(&event.external_id) {
            // Out-of-order sightings count as zero elapsed.
            let elapsed = (event.observed_at - last).to_std().unwrap_or(Duration::ZERO);
            if elapsed < self.cooldown {
                tracing::trace!(
                    external_id = %event.external_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "attendance suppressed by cooldown"
                );
                return None;
            }
        }

        let record = AttendanceRecord::from(event);
        if let Err(e) = self.sink.append(&record) {
            tracing::warn!(
                external_id = %record.external_id,
                error = %e,
                "failed to persist attendance record; kept in memory"
            );
        }
        tracing::info!(
            external_id = %record.external_id,
            name = %record.display_name,
            distance = event.distance,
            "attendance recorded"
        );
        self.expire_cooldowns(record.timestamp);
        self.last_accepted
            .insert(record.external_id.clone(), record.timestamp);
        if self.records.last().is_some_and(|r| local_day(r.timestamp) < local_day(record.timestamp)) {
            tracing::debug!(dropped = self.records.len(), "new day; in-memory attendance log rolled over");
            self.records.clear();
        }
        self.records.push(record.clone());
        Some(record)
    }

    /// Drop identities whose cooldown has run out by `now`.
    fn expire_cooldowns(&mut self, now: DateTime<Utc>) {
        let cooldown = self.cooldown;
        self.last_accepted
            .retain(|_, last| (now - *last).to_std().map_or(true, |age| age < cooldown));
    }

    /// Today's accepted records, oldest first.
    pub fn records(&self) -> &[AttendanceRecord] {
        &self.records
    }

    /// Forget every record and cooldown. The durable sink is not touched.
    pub fn clear(&mut self) {
        self.last_accepted.clear();
        self.records.clear();
    }
}

fn local_day(at: DateTime<Utc>) -> NaiveDate {
    at.with_timezone(&Local).date_naive()
}
