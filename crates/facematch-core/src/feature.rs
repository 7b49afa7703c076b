//! Face feature vectors and their comparison.

use crate::error::{FaceError, Result};
use serde::{Deserialize, Serialize};

/// Default embedding dimension of the ArcFace models.
pub const DEFAULT_FEATURE_DIM: usize = 512;

/// A unit-length face embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    values: Vec<f32>,
}

impl FeatureVector {
    /// Normalize a raw model output, checking it has `dim` components.
    pub fn from_raw(raw: Vec<f32>, dim: usize) -> Result<Self> {
        if raw.len() != dim {
            return Err(FaceError::InvalidInput(format!(
                "expected {dim}-dim embedding, got {}",
                raw.len()
            )));
        }
        Ok(Self { values: normalize(&raw)? })
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.values
    }

    pub fn cosine_similarity(&self, other: &FeatureVector) -> Result<f32> {
        cosine_similarity(&self.values, &other.values)
    }
}

/// Scale `v` to unit L2 norm. The norm is accumulated in f64.
pub fn normalize(v: &[f32]) -> Result<Vec<f32>> {
    let norm = v.iter().map(|&x| x as f64 * x as f64).sum::<f64>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Err(FaceError::InvalidInput(format!("cannot normalize vector with norm {norm}")));
    }
    Ok(v.iter().map(|&x| (x as f64 / norm) as f32).collect())
}

fn check_dims(a: &[f32], b: &[f32]) -> Result<()> {
    if a.len() != b.len() {
        return Err(FaceError::InvalidInput(format!(
            "feature dimensions differ: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    Ok(())
}

/// Cosine similarity of two unit vectors mapped into [0, 1]: `(a·b + 1) / 2`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    check_dims(a, b)?;
    let dot: f64 = a.iter().zip(b).map(|(&x, &y)| x as f64 * y as f64).sum();
    Ok(((dot + 1.0) / 2.0) as f32)
}

/// Squared Euclidean distance, the quantity L2 indexes report.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Result<f32> {
    check_dims(a, b)?;
    let sum: f64 = a
        .iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = x as f64 - y as f64;
            d * d
        })
        .sum();
    Ok(sum as f32)
}

/// Raw inner product.
pub fn inner_product(a: &[f32], b: &[f32]) -> Result<f32> {
    check_dims(a, b)?;
    Ok(a.iter().zip(b).map(|(&x, &y)| x as f64 * y as f64).sum::<f64>() as f32)
}
