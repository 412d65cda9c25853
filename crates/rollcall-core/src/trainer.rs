//! Background training worker.
//!
//! Enrollment batches are absorbed on a dedicated thread so the frame path
//! never blocks on model training or persistence.

use crate::classifier::{ModelCodecError, TrainingError};
use crate::collab::PersistenceError;
use crate::enrollment::TrainingJob;
use crate::state::RosterEntry;
use crate::tracker::{lock, Shared};
use crate::types::{FaceSample, NewSubject, SubjectId};
use chrono::Utc;
use image::{DynamicImage, ImageFormat, RgbImage};
use std::io::Cursor;
use std::sync::mpsc;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainingJobError {
    #[error("subject directory: {0}")]
    Directory(#[source] PersistenceError),
    #[error("training: {0}")]
    Training(#[from] TrainingError),
    #[error("model encoding: {0}")]
    Codec(#[from] ModelCodecError),
    #[error("model persistence: {0}")]
    Persist(#[source] PersistenceError),
}

/// Sending half of the training queue.
pub(crate) struct TrainingQueue {
    tx: mpsc::Sender<TrainingJob>,
}

impl TrainingQueue {
    pub(crate) fn spawn(shared: Arc<Shared>) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<TrainingJob>();
        std::thread::Builder::new()
            .name("rollcall-trainer".into())
            .spawn(move || {
                tracing::debug!("training worker started");
                while let Ok(job) = rx.recv() {
                    let generation = job.generation;
                    let outcome = run_job(&shared, job).map_err(|e| {
                        tracing::error!(generation, error = %e, "enrollment training failed");
                        e.to_string()
                    });
                    lock(&shared.state).session.finish(generation, outcome, Utc::now());
                }
                tracing::debug!("training worker exiting");
            })?;
        Ok(Self { tx })
    }

    /// Queue a job. Returns it back if the worker is gone.
    pub(crate) fn submit(&self, job: TrainingJob) -> Result<(), TrainingJob> {
        self.tx.send(job).map_err(|e| e.0)
    }
}

fn run_job(shared: &Shared, job: TrainingJob) -> Result<(), TrainingJobError> {
    let profile_sample = job.profile.as_ref().and_then(|crop| match encode_jpeg(crop) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::warn!(error = %e, "could not encode profile image; enrolling without one");
            None
        }
    });

    let subject_id = shared
        .directory
        .upsert(&NewSubject {
            display_name: job.display_name.clone(),
            external_id: job.external_id.clone(),
            profile_sample,
        })
        .map_err(TrainingJobError::Directory)?;

    let samples: Vec<FaceSample> = job
        .samples
        .into_iter()
        .map(|face| FaceSample { face, subject_id })
        .collect();

    let blob = {
        let mut classifier = lock(&shared.classifier);
        if classifier.is_trained() {
            classifier.update_incremental(&samples)?;
        } else {
            classifier.train_initial(&samples)?;
        }
        classifier.serialize()?
    };

    // The model now knows the subject, so the roster must too, even if the
    // save below fails.
    register(shared, subject_id, &job.display_name, &job.external_id);

    shared
        .models
        .save_model_blob(&blob)
        .map_err(TrainingJobError::Persist)?;

    tracing::info!(
        subject_id,
        external_id = %job.external_id,
        samples = samples.len(),
        model_bytes = blob.len(),
        "enrollment committed"
    );
    Ok(())
}

fn register(shared: &Shared, subject_id: SubjectId, display_name: &str, external_id: &str) {
    lock(&shared.state).roster.insert(
        subject_id,
        RosterEntry {
            display_name: display_name.to_string(),
            external_id: external_id.to_string(),
        },
    );
}

fn encode_jpeg(crop: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(crop.clone()).write_to(&mut buf, ImageFormat::Jpeg)?;
    Ok(buf.into_inner())
}
