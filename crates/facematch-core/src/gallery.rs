//! In-process brute-force vector store.
//!
//! Scores are reported the way an ANN index reports them: raw cosine or inner
//! product, or squared L2 distance.

use crate::feature::{self, FeatureVector};
use crate::matching::{InsertRequest, MetricType, SearchHit, StoreError, VectorStore};
use crate::types::FaceRecord;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

struct Entry {
    record: FaceRecord,
    feature: FeatureVector,
}

pub struct MemoryStore {
    metric: MetricType,
    dimension: usize,
    entries: RwLock<Vec<Entry>>,
}

impl MemoryStore {
    pub fn new(metric: MetricType, dimension: usize) -> Self {
        Self {
            metric,
            dimension,
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Vec<Entry>>, StoreError> {
        self.entries
            .read()
            .map_err(|_| StoreError::Transport("gallery lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<Entry>>, StoreError> {
        self.entries
            .write()
            .map_err(|_| StoreError::Transport("gallery lock poisoned".into()))
    }

    fn score(&self, a: &FeatureVector, b: &FeatureVector) -> Result<f32, StoreError> {
        let (a, b) = (a.as_slice(), b.as_slice());
        let score = match self.metric {
            MetricType::Cosine | MetricType::InnerProduct => feature::inner_product(a, b),
            MetricType::L2 => feature::euclidean_distance(a, b),
        };
        score.map_err(|e| StoreError::InvalidRequest(e.to_string()))
    }

    fn filter(&self, pred: impl Fn(&FaceRecord) -> bool) -> Result<Vec<FaceRecord>, StoreError> {
        Ok(self
            .read()?
            .iter()
            .filter(|e| pred(&e.record))
            .map(|e| e.record.clone())
            .collect())
    }
}

impl VectorStore for MemoryStore {
    fn insert(&self, request: &InsertRequest) -> Result<(), StoreError> {
        if request.feature.dim() != self.dimension {
            return Err(StoreError::InvalidRequest(format!(
                "feature has {} dimensions, gallery expects {}",
                request.feature.dim(),
                self.dimension
            )));
        }
        let mut entries = self.write()?;
        if entries.iter().any(|e| e.record.face_id == request.record.face_id) {
            return Err(StoreError::InvalidRequest(format!(
                "face_id {} already exists",
                request.record.face_id
            )));
        }
        entries.push(Entry {
            record: request.record.clone(),
            feature: request.feature.clone(),
        });
        Ok(())
    }

    fn search(&self, vector: &FeatureVector, top_k: usize) -> Result<Vec<SearchHit>, StoreError> {
        let entries = self.read()?;
        let mut hits = entries
            .iter()
            .map(|e| {
                Ok(SearchHit {
                    record: e.record.clone(),
                    score: self.score(vector, &e.feature)?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        let ascending = self.metric == MetricType::L2;
        hits.sort_by(|a, b| {
            let ord = a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal);
            if ascending {
                ord
            } else {
                ord.reverse()
            }
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    fn delete_face(&self, face_id: &str) -> Result<(), StoreError> {
        self.write()?.retain(|e| e.record.face_id != face_id);
        Ok(())
    }

    fn delete_person(&self, person_id: &str) -> Result<(), StoreError> {
        self.write()?.retain(|e| e.record.person_id != person_id);
        Ok(())
    }

    fn list(&self, limit: usize) -> Result<Vec<FaceRecord>, StoreError> {
        Ok(self.read()?.iter().take(limit).map(|e| e.record.clone()).collect())
    }

    fn query_by_person(&self, person_id: &str) -> Result<Vec<FaceRecord>, StoreError> {
        self.filter(|r| r.person_id == person_id)
    }

    fn query_by_name(&self, name: &str) -> Result<Vec<FaceRecord>, StoreError> {
        self.filter(|r| r.name == name)
    }

    fn reset(&self) -> Result<(), StoreError> {
        self.write()?.clear();
        Ok(())
    }
}
