//! In-memory collaborators and synthetic frames for unit tests.

use crate::collab::{AttendanceSink, PersistenceError, PersistentModelStore, SubjectDirectory};
use crate::detector::{DetectionError, FaceDetector};
use crate::types::{AttendanceRecord, BoundingBox, NewSubject, Subject, SubjectId};
use image::{Rgb, RgbImage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    model: Option<Vec<u8>>,
    subjects: Vec<Subject>,
    attendance: Vec<AttendanceRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_model_save: AtomicBool,
    fail_attendance: AtomicBool,
}

impl MemoryStore {
    pub fn fail_model_save(&self, fail: bool) {
        self.fail_model_save.store(fail, Ordering::SeqCst);
    }

    pub fn fail_attendance(&self, fail: bool) {
        self.fail_attendance.store(fail, Ordering::SeqCst);
    }

    pub fn attendance(&self) -> Vec<AttendanceRecord> {
        self.inner.lock().unwrap().attendance.clone()
    }

    pub fn model(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().model.clone()
    }
}

impl PersistentModelStore for MemoryStore {
    fn load_model_blob(&self) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.inner.lock().unwrap().model.clone())
    }

    fn save_model_blob(&self, blob: &[u8]) -> Result<(), PersistenceError> {
        if self.fail_model_save.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("model store offline".into()));
        }
        self.inner.lock().unwrap().model = Some(blob.to_vec());
        Ok(())
    }
}

impl SubjectDirectory for MemoryStore {
    fn lookup_by_external_id(&self, external_id: &str) -> Result<Option<Subject>, PersistenceError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.subjects.iter().find(|s| s.external_id == external_id).cloned())
    }

    fn upsert(&self, subject: &NewSubject) -> Result<SubjectId, PersistenceError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner
            .subjects
            .iter_mut()
            .find(|s| s.external_id == subject.external_id)
        {
            existing.display_name = subject.display_name.clone();
            if subject.profile_sample.is_some() {
                existing.profile_sample = subject.profile_sample.clone();
            }
            return Ok(existing.internal_id);
        }
        let internal_id = inner.subjects.len() as SubjectId + 1;
        inner.subjects.push(Subject {
            internal_id,
            display_name: subject.display_name.clone(),
            external_id: subject.external_id.clone(),
            profile_sample: subject.profile_sample.clone(),
        });
        Ok(internal_id)
    }

    fn all(&self) -> Result<Vec<Subject>, PersistenceError> {
        Ok(self.inner.lock().unwrap().subjects.clone())
    }
}

impl AttendanceSink for MemoryStore {
    fn append(&self, record: &AttendanceRecord) -> Result<(), PersistenceError> {
        if self.fail_attendance.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("attendance store offline".into()));
        }
        self.inner.lock().unwrap().attendance.push(record.clone());
        Ok(())
    }
}

/// Detector that reports the same boxes for every non-empty frame.
pub struct FixedDetector {
    pub boxes: Vec<BoundingBox>,
    pub seen: Vec<(u32, u32)>,
}

impl FixedDetector {
    pub fn new(boxes: Vec<BoundingBox>) -> Self {
        Self { boxes, seen: Vec::new() }
    }

    /// One face covering the central square of a `FRAME_SIZE` frame.
    pub fn centered() -> Self {
        Self::new(vec![face_box()])
    }
}

impl FaceDetector for FixedDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectionError> {
        self.seen.push(frame.dimensions());
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }
        Ok(self.boxes.clone())
    }
}

pub const FRAME_SIZE: u32 = 200;

pub fn face_box() -> BoundingBox {
    BoundingBox { x: 50.0, y: 50.0, width: 100.0, height: 100.0, confidence: 0.99 }
}

/// A frame whose face region carries a texture unique to `seed`.
pub fn textured_frame(seed: u32) -> RgbImage {
    let mut state = seed.wrapping_mul(2_654_435_761) | 1;
    RgbImage::from_fn(FRAME_SIZE, FRAME_SIZE, |x, y| {
        if (50..150).contains(&x) && (50..150).contains(&y) {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let v = (state & 0xFF) as u8;
            Rgb([v, v.wrapping_add(17), v / 2])
        } else {
            Rgb([30, 30, 30])
        }
    })
}
