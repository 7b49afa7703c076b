//! End-to-end enrollment and recognition flows.
//!
//! A [`FacePipeline`] is immutable after construction and `Send + Sync`, so one
//! instance is shared across workers behind an `Arc`.

use crate::alignment::{self, AlignedFace, AlignmentConfig};
use crate::detector::FaceDetector;
use crate::error::{FaceError, Result};
use crate::feature::FeatureVector;
use crate::matching::{self, InsertRequest, MatchConfig, VectorStore};
use crate::recognizer::FaceRecognizer;
use crate::types::{DetectionCandidate, FaceRecord, Image, Landmark, MatchResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation, observed at stage boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the flag has been tripped.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(FaceError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Identity metadata supplied at enrollment.
#[derive(Debug, Clone, Default)]
pub struct NewIdentity {
    pub person_id: String,
    pub name: String,
    pub remark: String,
}

/// Result of an enrollment operation.
#[derive(Debug, Clone)]
pub struct Registration {
    pub record: FaceRecord,
    /// The face that was enrolled.
    pub face: DetectionCandidate,
    pub faces_detected: usize,
}

/// Result of a recognition operation.
#[derive(Debug, Clone, Default)]
pub struct Recognition {
    /// The face that was searched; `None` when the image holds no face.
    pub face: Option<DetectionCandidate>,
    pub faces_detected: usize,
    pub matches: Vec<MatchResult>,
}

/// Per-request overrides for recognition.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecognizeOptions {
    pub threshold: Option<f32>,
    pub top_k: Option<usize>,
}

pub struct FacePipeline {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    alignment: AlignmentConfig,
    matching: MatchConfig,
    store: Box<dyn VectorStore>,
}

impl FacePipeline {
    pub fn new(
        detector: FaceDetector,
        recognizer: FaceRecognizer,
        alignment: AlignmentConfig,
        matching: MatchConfig,
        store: Box<dyn VectorStore>,
    ) -> Self {
        Self {
            detector,
            recognizer,
            alignment,
            matching,
            store,
        }
    }

    pub fn matching(&self) -> &MatchConfig {
        &self.matching
    }

    /// Detected faces in original-image coordinates, best first.
    pub fn detect_faces(&self, image: &Image) -> Result<Vec<DetectionCandidate>> {
        self.detector.detect(image)
    }

    pub fn align_face(&self, image: &Image, landmarks: &[Landmark]) -> Result<AlignedFace> {
        alignment::align_face(image, landmarks, &self.alignment)
    }

    pub fn extract_feature(&self, face: &AlignedFace) -> Result<FeatureVector> {
        self.recognizer.extract(face)
    }

    /// Nearest enrolled faces at or above the configured similarity threshold.
    pub fn search_similar(&self, feature: &FeatureVector, top_k: usize) -> Result<Vec<MatchResult>> {
        let params = MatchConfig { top_k, ..self.matching };
        matching::search_similar(self.store.as_ref(), feature, &params)
    }

    /// Decode an encoded image and run detection on it.
    pub fn detect_bytes(&self, bytes: &[u8], cancel: &CancelFlag) -> Result<Vec<DetectionCandidate>> {
        cancel.check()?;
        let image = Image::decode(bytes)?;
        cancel.check()?;
        self.detect_faces(&image)
    }

    /// Enroll the highest-scoring face of an encoded image.
    pub fn register(&self, bytes: &[u8], identity: NewIdentity, cancel: &CancelFlag) -> Result<Registration> {
        let Some((face, feature, faces_detected)) = self.embed_primary_face(bytes, cancel)? else {
            return Err(FaceError::NoDetection);
        };
        if faces_detected > 1 {
            tracing::warn!(faces = faces_detected, "multiple faces detected, enrolling the highest-scoring one");
        }

        let record = FaceRecord {
            face_id: uuid::Uuid::new_v4().simple().to_string(),
            person_id: identity.person_id,
            name: identity.name,
            remark: identity.remark,
            register_time: chrono::Utc::now().timestamp_millis(),
        };

        cancel.check()?;
        self.store.insert(&InsertRequest {
            record: record.clone(),
            feature,
        })?;

        tracing::info!(
            face_id = %record.face_id,
            person_id = %record.person_id,
            name = %record.name,
            score = face.score,
            "face registered"
        );

        Ok(Registration {
            record,
            face,
            faces_detected,
        })
    }

    /// Search the gallery for the highest-scoring face of an encoded image.
    ///
    /// An image without a face is an empty outcome, not an error.
    pub fn recognize(&self, bytes: &[u8], options: RecognizeOptions, cancel: &CancelFlag) -> Result<Recognition> {
        let Some((face, feature, faces_detected)) = self.embed_primary_face(bytes, cancel)? else {
            tracing::info!("no face detected, nothing to recognize");
            return Ok(Recognition::default());
        };
        if faces_detected > 1 {
            tracing::warn!(faces = faces_detected, "multiple faces detected, recognizing the highest-scoring one");
        }

        let params = MatchConfig {
            similarity_threshold: options.threshold.unwrap_or(self.matching.similarity_threshold),
            top_k: options.top_k.unwrap_or(self.matching.top_k),
            metric: self.matching.metric,
        };

        cancel.check()?;
        let matches = matching::search_similar(self.store.as_ref(), &feature, &params)?;

        tracing::info!(
            matches = matches.len(),
            best = matches.first().map(|m| m.similarity),
            "recognition complete"
        );

        Ok(Recognition {
            face: Some(face),
            faces_detected,
            matches,
        })
    }

    /// Decode, detect, align and embed the best face. `None` when no face survives NMS.
    fn embed_primary_face(
        &self,
        bytes: &[u8],
        cancel: &CancelFlag,
    ) -> Result<Option<(DetectionCandidate, FeatureVector, usize)>> {
        cancel.check()?;
        let image = Image::decode(bytes)?;

        cancel.check()?;
        let faces = self.detect_faces(&image)?;
        let faces_detected = faces.len();
        let Some(face) = faces.into_iter().next() else {
            return Ok(None);
        };
        let landmarks = face.landmarks.ok_or_else(|| {
            FaceError::InvalidInput("detection model exports no landmarks, alignment is impossible".into())
        })?;

        cancel.check()?;
        let aligned = self.align_face(&image, &landmarks)?;

        cancel.check()?;
        let feature = self.extract_feature(&aligned)?;

        Ok(Some((face, feature, faces_detected)))
    }

    pub fn delete_face(&self, face_id: &str) -> Result<()> {
        self.store.delete_face(face_id)?;
        tracing::info!(face_id, "face deleted");
        Ok(())
    }

    pub fn delete_person(&self, person_id: &str) -> Result<()> {
        self.store.delete_person(person_id)?;
        tracing::info!(person_id, "person deleted");
        Ok(())
    }

    /// Drop and recreate the gallery.
    pub fn reset(&self) -> Result<()> {
        self.store.reset()?;
        tracing::warn!("gallery reset, all enrolled faces removed");
        Ok(())
    }

    pub fn list_faces(&self, limit: usize) -> Result<Vec<FaceRecord>> {
        Ok(self.store.list(limit)?)
    }

    pub fn query_by_person(&self, person_id: &str) -> Result<Vec<FaceRecord>> {
        Ok(self.store.query_by_person(person_id)?)
    }

    pub fn query_by_name(&self, name: &str) -> Result<Vec<FaceRecord>> {
        Ok(self.store.query_by_name(name)?)
    }
}
