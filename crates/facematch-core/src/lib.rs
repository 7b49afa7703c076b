//! facematch-core: face detection, alignment and matching engine.
//!
//! Uses SCRFD for face detection and ArcFace for face recognition, both
//! running via ONNX Runtime for CPU inference, and matches embeddings against
//! a [`VectorStore`].

pub mod alignment;
pub mod detector;
pub mod error;
pub mod feature;
pub mod gallery;
pub mod geometry;
pub mod inference;
pub mod matching;
pub mod pipeline;
pub mod recognizer;
pub mod suppress;
pub mod tensor;
pub mod types;

pub use alignment::{AlignedFace, AlignmentConfig};
pub use detector::{DetectorConfig, FaceDetector, ScoreActivation};
pub use error::{FaceError, Result};
pub use feature::FeatureVector;
pub use gallery::MemoryStore;
pub use inference::{InferenceEngine, InferenceOutput, OrtEngine, SessionOptions};
pub use matching::{InsertRequest, MatchConfig, MetricType, SearchHit, StoreError, VectorStore};
pub use pipeline::{CancelFlag, FacePipeline, NewIdentity, Recognition, RecognizeOptions, Registration};
pub use recognizer::{FaceRecognizer, RecognizerConfig};
pub use tensor::Tensor;
pub use types::{BoundingBox, DetectionCandidate, FaceRecord, Image, Landmark, MatchResult};
