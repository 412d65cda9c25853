//! Owner of the trained recognition model.
//!
//! The store is trained from empty exactly once and only grows afterwards
//! through incremental updates, so historical samples never need to be kept
//! around for retraining. Persistence is the caller's job: the store only
//! converts to and from a byte blob.

use crate::lbph::{LbphModel, LbphParams};
use crate::types::{CanonicalFace, FaceSample, Prediction, SubjectId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

const MODEL_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrainingError {
    #[error("no samples supplied")]
    EmptyBatch,
    #[error("classifier is already trained; use an incremental update")]
    AlreadyTrained,
    #[error("classifier has not been trained; initial training required first")]
    NotTrained,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PredictionError {
    #[error("classifier has not been trained")]
    NotTrained,
}

#[derive(Error, Debug)]
pub enum ModelCodecError {
    #[error("model codec: {0}")]
    Codec(#[from] bincode::Error),
    #[error("unsupported model format version {0} (expected {MODEL_FORMAT_VERSION})")]
    UnsupportedVersion(u32),
    #[error("invalid model: {0}")]
    Invalid(String),
}

#[derive(Serialize)]
struct ModelBlobRef<'a> {
    version: u32,
    model: Option<&'a LbphModel>,
}

#[derive(Deserialize)]
struct ModelBlob {
    version: u32,
    model: Option<LbphModel>,
}

/// LBPH classifier with train-once / update-after semantics.
#[derive(Debug, Clone, Default)]
pub struct ClassifierStore {
    params: LbphParams,
    model: Option<LbphModel>,
}

impl ClassifierStore {
    pub fn new(params: LbphParams) -> Self {
        Self { params, model: None }
    }

    pub fn is_trained(&self) -> bool {
        self.model.as_ref().is_some_and(|m| !m.is_empty())
    }

    /// Train a fresh model. Valid only on an untrained store.
    pub fn train_initial(&mut self, samples: &[FaceSample]) -> Result<(), TrainingError> {
        if samples.is_empty() {
            return Err(TrainingError::EmptyBatch);
        }
        if self.is_trained() {
            return Err(TrainingError::AlreadyTrained);
        }

        let mut model = LbphModel::new(self.params);
        for sample in samples {
            model.add(sample.face.image(), sample.subject_id);
        }
        tracing::info!(samples = samples.len(), "classifier trained from empty");
        self.model = Some(model);
        Ok(())
    }

    /// Absorb a new batch into an already trained model.
    pub fn update_incremental(&mut self, samples: &[FaceSample]) -> Result<(), TrainingError> {
        if samples.is_empty() {
            return Err(TrainingError::EmptyBatch);
        }
        let model = match self.model.as_mut() {
            Some(m) if !m.is_empty() => m,
            _ => return Err(TrainingError::NotTrained),
        };

        for sample in samples {
            model.add(sample.face.image(), sample.subject_id);
        }
        tracing::info!(
            samples = samples.len(),
            total = model.len(),
            "classifier updated incrementally"
        );
        Ok(())
    }

    pub fn predict(&self, face: &CanonicalFace) -> Result<Prediction, PredictionError> {
        let model = self.model.as_ref().ok_or(PredictionError::NotTrained)?;
        let (subject_id, distance) = model
            .nearest(face.image())
            .ok_or(PredictionError::NotTrained)?;
        Ok(Prediction { subject_id, distance })
    }

    /// Number of distinct subjects the model can recognize.
    pub fn subject_count(&self) -> usize {
        self.model
            .as_ref()
            .map(|m| m.labels().iter().collect::<BTreeSet<&SubjectId>>().len())
            .unwrap_or(0)
    }

    pub fn sample_count(&self) -> usize {
        self.model.as_ref().map_or(0, LbphModel::len)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, ModelCodecError> {
        let blob = ModelBlobRef {
            version: MODEL_FORMAT_VERSION,
            model: self.model.as_ref(),
        };
        Ok(bincode::serialize(&blob)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, ModelCodecError> {
        let blob: ModelBlob = bincode::deserialize(bytes)?;
        if blob.version != MODEL_FORMAT_VERSION {
            return Err(ModelCodecError::UnsupportedVersion(blob.version));
        }
        if let Some(model) = &blob.model {
            model.validate().map_err(ModelCodecError::Invalid)?;
        }
        let params = blob.model.as_ref().map(LbphModel::params).unwrap_or_default();
        Ok(Self {
            params,
            model: blob.model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CANONICAL_SIZE;
    use image::{GrayImage, Luma};

    fn face(seed: u32) -> CanonicalFace {
        let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
        let img = GrayImage::from_fn(CANONICAL_SIZE, CANONICAL_SIZE, |_, _| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            Luma([(state & 0xFF) as u8])
        });
        CanonicalFace::from_image(img).unwrap()
    }

    fn batch(seed: u32, subject_id: SubjectId, n: u32) -> Vec<FaceSample> {
        (0..n)
            .map(|i| FaceSample { face: face(seed * 100 + i), subject_id })
            .collect()
    }

    #[test]
    fn test_untrained_store() {
        let store = ClassifierStore::default();
        assert!(!store.is_trained());
        assert_eq!(store.predict(&face(1)), Err(PredictionError::NotTrained));
        assert_eq!(store.subject_count(), 0);
    }

    #[test]
    fn test_train_initial_rejects_empty_and_repeat() {
        let mut store = ClassifierStore::default();
        assert_eq!(store.train_initial(&[]), Err(TrainingError::EmptyBatch));
        store.train_initial(&batch(1, 7, 3)).unwrap();
        assert!(store.is_trained());
        assert_eq!(store.train_initial(&batch(2, 8, 3)), Err(TrainingError::AlreadyTrained));
    }

    #[test]
    fn test_update_requires_trained_store() {
        let mut store = ClassifierStore::default();
        assert_eq!(store.update_incremental(&batch(1, 7, 3)), Err(TrainingError::NotTrained));
        store.train_initial(&batch(1, 7, 3)).unwrap();
        assert_eq!(store.update_incremental(&[]), Err(TrainingError::EmptyBatch));
        store.update_incremental(&batch(2, 8, 3)).unwrap();
        assert_eq!(store.subject_count(), 2);
        assert_eq!(store.sample_count(), 6);
    }

    #[test]
    fn test_predict_finds_enrolled_sample() {
        let mut store = ClassifierStore::default();
        let first = batch(1, 7, 4);
        let second = batch(2, 8, 4);
        store.train_initial(&first).unwrap();
        store.update_incremental(&second).unwrap();

        let p = store.predict(&second[2].face).unwrap();
        assert_eq!(p.subject_id, 8);
        assert_eq!(p.distance, 0.0);

        let p = store.predict(&first[0].face).unwrap();
        assert_eq!(p.subject_id, 7);
    }

    #[test]
    fn test_roundtrip_preserves_predictions() {
        let mut store = ClassifierStore::default();
        store.train_initial(&batch(1, 7, 5)).unwrap();
        store.update_incremental(&batch(2, 8, 5)).unwrap();

        let restored = ClassifierStore::deserialize(&store.serialize().unwrap()).unwrap();
        assert!(restored.is_trained());
        for seed in [3u32, 4, 5, 201, 102] {
            let query = face(seed);
            assert_eq!(store.predict(&query), restored.predict(&query));
        }
    }

    #[test]
    fn test_roundtrip_of_untrained_store() {
        let blob = ClassifierStore::default().serialize().unwrap();
        let restored = ClassifierStore::deserialize(&blob).unwrap();
        assert!(!restored.is_trained());
    }

    #[test]
    fn test_deserialize_rejects_unknown_version() {
        let blob = bincode::serialize(&ModelBlobRef { version: 99, model: None }).unwrap();
        assert!(matches!(
            ClassifierStore::deserialize(&blob),
            Err(ModelCodecError::UnsupportedVersion(99))
        ));
    }

    /// Same wire layout as a stored model, with every field writable.
    #[derive(Serialize)]
    struct RawModel {
        params: LbphParams,
        histograms: Vec<Vec<f32>>,
        labels: Vec<SubjectId>,
    }

    #[derive(Serialize)]
    struct RawBlob {
        version: u32,
        model: Option<RawModel>,
    }

    fn raw_blob(params: LbphParams, histograms: Vec<Vec<f32>>, labels: Vec<SubjectId>) -> Vec<u8> {
        bincode::serialize(&RawBlob {
            version: MODEL_FORMAT_VERSION,
            model: Some(RawModel { params, histograms, labels }),
        })
        .unwrap()
    }

    #[test]
    fn test_deserialize_rejects_oversized_neighbourhood() {
        let params = LbphParams { neighbors: 40, ..Default::default() };
        let blob = raw_blob(params, vec![vec![0.0]], vec![1]);
        assert!(matches!(
            ClassifierStore::deserialize(&blob),
            Err(ModelCodecError::Invalid(_))
        ));
    }

    #[test]
    fn test_deserialize_rejects_mismatched_histograms() {
        let params = LbphParams::default();
        let full = vec![0.0; params.histogram_len()];

        let short = raw_blob(params, vec![full.clone(), vec![0.0; 16]], vec![1, 2]);
        assert!(matches!(
            ClassifierStore::deserialize(&short),
            Err(ModelCodecError::Invalid(_))
        ));

        let unlabelled = raw_blob(params, vec![full.clone(), full.clone()], vec![1]);
        assert!(matches!(
            ClassifierStore::deserialize(&unlabelled),
            Err(ModelCodecError::Invalid(_))
        ));

        let ok = raw_blob(params, vec![full], vec![1]);
        let store = ClassifierStore::deserialize(&ok).unwrap();
        assert!(store.is_trained());
        assert_eq!(store.predict(&face(1)).unwrap().subject_id, 1);
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        assert!(ClassifierStore::deserialize(&[1, 2]).is_err());
    }
}
