//! ArcFace face recognizer.
//!
//! Extracts fixed-dimension, L2-normalized embeddings from aligned face crops.
//! The forward pass is delegated to an [`InferenceEngine`].

use crate::alignment::AlignedFace;
use crate::error::{FaceError, Result};
use crate::feature::{FeatureVector, DEFAULT_FEATURE_DIM};
use crate::geometry;
use crate::inference::{InferenceEngine, OrtEngine, SessionOptions};
use crate::tensor::Tensor;
use serde::Deserialize;
use std::path::Path;

// Default ArcFace input normalization
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 128.0;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecognizerConfig {
    /// Per-channel mean, RGB order.
    pub mean: [f32; 3],
    /// Per-channel std, RGB order.
    pub std: [f32; 3],
    /// Embedding dimension D.
    pub feature_dim: usize,
    /// Output tensor holding the embedding; the first output when unset.
    pub output_name: Option<String>,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            mean: [ARCFACE_MEAN; 3],
            std: [ARCFACE_STD; 3],
            feature_dim: DEFAULT_FEATURE_DIM,
            output_name: None,
        }
    }
}

/// ArcFace-based face recognizer.
pub struct FaceRecognizer {
    engine: Box<dyn InferenceEngine>,
    config: RecognizerConfig,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path, options: SessionOptions, config: RecognizerConfig) -> Result<Self> {
        let engine = OrtEngine::load(model_path, options)?;
        Self::new(Box::new(engine), config)
    }

    pub fn new(engine: Box<dyn InferenceEngine>, config: RecognizerConfig) -> Result<Self> {
        if let Some(name) = &config.output_name {
            if !engine.output_names().iter().any(|n| n == name) {
                return Err(FaceError::ModelLoadFailure(format!(
                    "recognition model has no output named {name:?}; outputs: {:?}",
                    engine.output_names()
                )));
            }
        } else if engine.output_names().is_empty() {
            return Err(FaceError::ModelLoadFailure("recognition model has no outputs".into()));
        }
        Ok(Self { engine, config })
    }

    pub fn config(&self) -> &RecognizerConfig {
        &self.config
    }

    /// Extract a unit-length embedding from an aligned face crop.
    pub fn extract(&self, face: &AlignedFace) -> Result<FeatureVector> {
        let input: Tensor = geometry::to_tensor_layout(&face.image, self.config.mean, self.config.std, false).into();

        let outputs = self.engine.run(&input)?;
        let embedding = match &self.config.output_name {
            Some(name) => outputs.get(name),
            None => outputs.at(0),
        }
        .ok_or_else(|| FaceError::DecodeFailure("recognition model returned no embedding".into()))?;

        let raw = embedding.flatten().into_owned();
        let dim = self.config.feature_dim;
        if raw.len() != dim {
            return Err(FaceError::DecodeFailure(format!(
                "expected {dim}-dim embedding, got {} (shape {:?})",
                raw.len(),
                embedding.shape()
            )));
        }

        FeatureVector::from_raw(raw, dim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::SimilarityTransform;
    use crate::inference::InferenceOutput;
    use crate::types::Image;
    use approx::assert_abs_diff_eq;
    use std::sync::{Arc, Mutex};

    /// Returns a fixed embedding and records the input it was given.
    struct FixedEmbedding {
        names: Vec<String>,
        embedding: Vec<f32>,
        seen: Arc<Mutex<Option<Tensor>>>,
    }

    impl FixedEmbedding {
        fn new(embedding: Vec<f32>) -> Self {
            Self {
                names: vec!["fc1".into()],
                embedding,
                seen: Arc::default(),
            }
        }
    }

    impl InferenceEngine for FixedEmbedding {
        fn output_names(&self) -> &[String] {
            &self.names
        }

        fn run(&self, input: &Tensor) -> Result<InferenceOutput> {
            *self.seen.lock().unwrap() = Some(input.clone());
            let out = Tensor::from_shape_vec(&[1, self.embedding.len()], self.embedding.clone())?;
            Ok(InferenceOutput::new(vec![(self.names[0].clone(), out)]))
        }
    }

    fn aligned(bgr: [u8; 3]) -> AlignedFace {
        AlignedFace {
            image: Image::filled(112, 112, bgr),
            transform: SimilarityTransform { scale: 1.0, theta: 0.0, tx: 0.0, ty: 0.0 },
        }
    }

    fn small_config() -> RecognizerConfig {
        RecognizerConfig {
            feature_dim: 4,
            ..RecognizerConfig::default()
        }
    }

    #[test]
    fn test_extract_normalizes() {
        let rec = FaceRecognizer::new(Box::new(FixedEmbedding::new(vec![3.0, 0.0, 4.0, 0.0])), small_config()).unwrap();
        let fv = rec.extract(&aligned([0, 0, 0])).unwrap();
        assert_abs_diff_eq!(fv.as_slice()[0], 0.6, epsilon = 1e-6);
        assert_abs_diff_eq!(fv.as_slice()[2], 0.8, epsilon = 1e-6);
    }

    #[test]
    fn test_extract_preprocess_is_rgb_planar() {
        let engine = FixedEmbedding::new(vec![1.0, 0.0, 0.0, 0.0]);
        let seen = Arc::clone(&engine.seen);
        let rec = FaceRecognizer::new(Box::new(engine), small_config()).unwrap();
        rec.extract(&aligned([255, 128, 0])).unwrap();

        let input = seen.lock().unwrap().take().unwrap();
        assert_eq!(input.shape(), &[1, 3, 112, 112]);
        let plane = 112 * 112;
        let flat = input.flatten();
        // BGR (255, 128, 0): R plane holds 0, B plane holds 255
        assert_abs_diff_eq!(flat[0], (0.0 - 127.5) / 128.0);
        assert_abs_diff_eq!(flat[plane], (128.0 - 127.5) / 128.0);
        assert_abs_diff_eq!(flat[2 * plane], (255.0 - 127.5) / 128.0);
    }

    #[test]
    fn test_extract_wrong_dimension_is_decode_failure() {
        let rec = FaceRecognizer::new(Box::new(FixedEmbedding::new(vec![1.0; 3])), small_config()).unwrap();
        let err = rec.extract(&aligned([0, 0, 0])).unwrap_err();
        assert!(matches!(err, FaceError::DecodeFailure(_)));
    }

    #[test]
    fn test_extract_zero_embedding_is_invalid() {
        let rec = FaceRecognizer::new(Box::new(FixedEmbedding::new(vec![0.0; 4])), small_config()).unwrap();
        let err = rec.extract(&aligned([0, 0, 0])).unwrap_err();
        assert!(matches!(err, FaceError::InvalidInput(_)));
    }

    #[test]
    fn test_unknown_output_name_fails_at_construction() {
        let config = RecognizerConfig {
            output_name: Some("embedding".into()),
            ..small_config()
        };
        let err = FaceRecognizer::new(Box::new(FixedEmbedding::new(vec![1.0; 4])), config).err().unwrap();
        assert!(matches!(err, FaceError::ModelLoadFailure(_)));
    }
}
