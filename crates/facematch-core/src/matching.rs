//! Match protocol: the vector-store seam and score-to-similarity ranking.

use crate::error::{FaceError, Result};
use crate::feature::FeatureVector;
use crate::types::{FaceRecord, MatchResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.6;
const DEFAULT_TOP_K: usize = 5;

/// Distance metric of the vector index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricType {
    #[default]
    #[serde(rename = "COSINE")]
    Cosine,
    #[serde(rename = "IP")]
    InnerProduct,
    #[serde(rename = "L2")]
    L2,
}

impl MetricType {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricType::Cosine => "COSINE",
            MetricType::InnerProduct => "IP",
            MetricType::L2 => "L2",
        }
    }

    /// Convert a raw store score into a similarity where higher is closer.
    pub fn to_similarity(self, score: f32) -> f32 {
        match self {
            MetricType::Cosine => (score + 1.0) / 2.0,
            MetricType::InnerProduct => score,
            MetricType::L2 => 1.0 / (1.0 + score),
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "COSINE" => Ok(MetricType::Cosine),
            "IP" => Ok(MetricType::InnerProduct),
            "L2" => Ok(MetricType::L2),
            other => Err(format!("unknown metric type {other:?}, expected COSINE, IP or L2")),
        }
    }
}

/// A record to enroll together with its embedding.
#[derive(Debug, Clone)]
pub struct InsertRequest {
    pub record: FaceRecord,
    pub feature: FeatureVector,
}

/// A raw nearest-neighbor hit as reported by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub record: FaceRecord,
    /// Metric-dependent score: cosine or inner product, or L2 distance.
    pub score: f32,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("store rejected request (code {code}): {message}")]
    Rejected { code: i64, message: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

impl From<StoreError> for FaceError {
    fn from(err: StoreError) -> Self {
        FaceError::TransportFailure(err.to_string())
    }
}

/// An embedding store with nearest-neighbor search.
///
/// Every call is a single blocking attempt; callers decide whether to retry.
pub trait VectorStore: Send + Sync {
    fn insert(&self, request: &InsertRequest) -> Result<(), StoreError>;

    /// Up to `top_k` nearest neighbors, best first.
    fn search(&self, vector: &FeatureVector, top_k: usize) -> Result<Vec<SearchHit>, StoreError>;

    fn delete_face(&self, face_id: &str) -> Result<(), StoreError>;

    fn delete_person(&self, person_id: &str) -> Result<(), StoreError>;

    fn list(&self, limit: usize) -> Result<Vec<FaceRecord>, StoreError>;

    fn query_by_person(&self, person_id: &str) -> Result<Vec<FaceRecord>, StoreError>;

    fn query_by_name(&self, name: &str) -> Result<Vec<FaceRecord>, StoreError>;

    /// Drop every record and recreate an empty index.
    fn reset(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    pub similarity_threshold: f32,
    pub top_k: usize,
    pub metric: MetricType,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            top_k: DEFAULT_TOP_K,
            metric: MetricType::Cosine,
        }
    }
}

/// Search the store and keep hits whose similarity reaches the threshold,
/// ranked by descending similarity.
pub fn search_similar(store: &dyn VectorStore, feature: &FeatureVector, params: &MatchConfig) -> Result<Vec<MatchResult>> {
    if params.top_k == 0 {
        return Err(FaceError::InvalidInput("top_k must be at least 1".into()));
    }

    let hits = store.search(feature, params.top_k)?;
    let returned = hits.len();

    let mut matches: Vec<MatchResult> = hits
        .into_iter()
        .map(|hit| MatchResult {
            similarity: params.metric.to_similarity(hit.score),
            record: hit.record,
        })
        .filter(|m| m.similarity >= params.similarity_threshold)
        .collect();
    matches.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    matches.truncate(params.top_k);

    tracing::debug!(
        returned,
        kept = matches.len(),
        threshold = params.similarity_threshold,
        metric = %params.metric,
        "similarity search"
    );
    Ok(matches)
}
