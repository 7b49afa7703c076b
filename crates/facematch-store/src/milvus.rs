//! Milvus REST (v2) vector store.
//!
//! Every call is one blocking HTTP request with a timeout. Failures surface as
//! [`StoreError`] and are never retried here.

use facematch_core::feature::DEFAULT_FEATURE_DIM;
use facematch_core::{FaceRecord, FeatureVector, InsertRequest, MetricType, SearchHit, StoreError, VectorStore};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const FIELD_FACE_ID: &str = "face_id";
const FIELD_PERSON_ID: &str = "person_id";
const FIELD_NAME: &str = "name";
const FIELD_FEATURE: &str = "feature";
const FIELD_REMARK: &str = "remark";
const FIELD_REGISTER_TIME: &str = "register_time";
const OUTPUT_FIELDS: [&str; 5] = [FIELD_FACE_ID, FIELD_PERSON_ID, FIELD_NAME, FIELD_REMARK, FIELD_REGISTER_TIME];

const MAX_ID_LEN: usize = 64;
const MAX_NAME_LEN: usize = 128;
const MAX_REMARK_LEN: usize = 256;
/// Upper bound on rows returned by filtered queries.
const QUERY_LIMIT: usize = 16_384;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MilvusConfig {
    /// Base URL, e.g. `http://localhost:19530`.
    pub endpoint: String,
    /// `user:password` or an API key; sent as a bearer token.
    pub token: String,
    pub collection: String,
    pub dimension: usize,
    pub index_type: String,
    pub metric: MetricType,
    pub nlist: u32,
    pub nprobe: u32,
    pub timeout_secs: u64,
}

impl Default for MilvusConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:19530".into(),
            token: "root:Milvus".into(),
            collection: "face_vectors".into(),
            dimension: DEFAULT_FEATURE_DIM,
            index_type: "IVF_FLAT".into(),
            metric: MetricType::Cosine,
            nlist: 1024,
            nprobe: 10,
            timeout_secs: 10,
        }
    }
}

/// Response envelope shared by every v2 endpoint.
#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct SearchRow {
    #[serde(flatten)]
    record: FaceRecord,
    distance: f32,
}

/// [`VectorStore`] backed by a Milvus collection.
pub struct MilvusStore {
    client: reqwest::blocking::Client,
    config: MilvusConfig,
}

impl MilvusStore {
    /// Build the HTTP client without touching the server.
    pub fn new(config: MilvusConfig) -> Result<Self, StoreError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| StoreError::Transport(format!("http client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Build the client and make sure the collection exists and is loaded.
    pub fn connect(config: MilvusConfig) -> Result<Self, StoreError> {
        let store = Self::new(config)?;
        store.ensure_collection()?;
        Ok(store)
    }

    pub fn config(&self) -> &MilvusConfig {
        &self.config
    }

    pub fn ensure_collection(&self) -> Result<(), StoreError> {
        let data = self.post("/v2/vectordb/collections/has", &self.collection_body())?;
        let exists = data.get("has").and_then(Value::as_bool).unwrap_or(false);

        if exists {
            tracing::info!(collection = %self.config.collection, "collection exists");
            self.post("/v2/vectordb/collections/load", &self.collection_body())?;
        } else {
            self.create_collection()?;
        }
        Ok(())
    }

    fn create_collection(&self) -> Result<(), StoreError> {
        tracing::info!(
            collection = %self.config.collection,
            dimension = self.config.dimension,
            index_type = %self.config.index_type,
            metric = %self.config.metric,
            "creating collection"
        );
        self.post("/v2/vectordb/collections/create", &create_collection_body(&self.config))?;
        Ok(())
    }

    fn collection_body(&self) -> Value {
        json!({ "collectionName": self.config.collection })
    }

    fn query(&self, filter: &str, limit: usize) -> Result<Vec<FaceRecord>, StoreError> {
        let body = json!({
            "collectionName": self.config.collection,
            "filter": filter,
            "outputFields": OUTPUT_FIELDS,
            "limit": limit,
        });
        let data = self.post("/v2/vectordb/entities/query", &body)?;
        parse_rows(data)
    }

    fn delete_where(&self, filter: &str) -> Result<(), StoreError> {
        let body = json!({
            "collectionName": self.config.collection,
            "filter": filter,
        });
        self.post("/v2/vectordb/entities/delete", &body)?;
        Ok(())
    }

    /// POST a JSON body and unwrap the response envelope.
    fn post(&self, path: &str, body: &Value) -> Result<Value, StoreError> {
        let url = format!("{}{path}", self.config.endpoint.trim_end_matches('/'));
        tracing::debug!(%url, "milvus request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.token)
            .json(body)
            .send()
            .map_err(|e| StoreError::Transport(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Transport(format!("{url}: HTTP {status}")));
        }

        let envelope: Envelope = response
            .json()
            .map_err(|e| StoreError::InvalidResponse(format!("{url}: {e}")))?;
        unwrap_envelope(envelope)
    }
}

impl VectorStore for MilvusStore {
    fn insert(&self, request: &InsertRequest) -> Result<(), StoreError> {
        let body = insert_body(&self.config, request)?;
        self.post("/v2/vectordb/entities/insert", &body)?;
        tracing::debug!(face_id = %request.record.face_id, "inserted face vector");
        Ok(())
    }

    fn search(&self, vector: &FeatureVector, top_k: usize) -> Result<Vec<SearchHit>, StoreError> {
        let body = search_body(&self.config, vector, top_k);
        let data = self.post("/v2/vectordb/entities/search", &body)?;
        parse_search(data)
    }

    fn delete_face(&self, face_id: &str) -> Result<(), StoreError> {
        self.delete_where(&eq_filter(FIELD_FACE_ID, face_id))
    }

    fn delete_person(&self, person_id: &str) -> Result<(), StoreError> {
        self.delete_where(&eq_filter(FIELD_PERSON_ID, person_id))
    }

    fn list(&self, limit: usize) -> Result<Vec<FaceRecord>, StoreError> {
        self.query(&format!("{FIELD_FACE_ID} != \"\""), limit)
    }

    fn query_by_person(&self, person_id: &str) -> Result<Vec<FaceRecord>, StoreError> {
        self.query(&eq_filter(FIELD_PERSON_ID, person_id), QUERY_LIMIT)
    }

    fn query_by_name(&self, name: &str) -> Result<Vec<FaceRecord>, StoreError> {
        self.query(&eq_filter(FIELD_NAME, name), QUERY_LIMIT)
    }

    fn reset(&self) -> Result<(), StoreError> {
        tracing::warn!(collection = %self.config.collection, "dropping collection");
        self.post("/v2/vectordb/collections/drop", &self.collection_body())?;
        self.create_collection()
    }
}

/// `field == "value"` with the value quoted and escaped as a JSON string.
fn eq_filter(field: &str, value: &str) -> String {
    format!("{field} == {}", Value::from(value))
}

fn unwrap_envelope(envelope: Envelope) -> Result<Value, StoreError> {
    if envelope.code != 0 {
        return Err(StoreError::Rejected {
            code: envelope.code,
            message: envelope.message,
        });
    }
    Ok(envelope.data)
}

fn create_collection_body(config: &MilvusConfig) -> Value {
    json!({
        "collectionName": config.collection,
        "schema": {
            "autoId": false,
            "enableDynamicField": false,
            "fields": [
                {
                    "fieldName": FIELD_FACE_ID,
                    "dataType": "VarChar",
                    "isPrimary": true,
                    "elementTypeParams": { "max_length": MAX_ID_LEN },
                },
                {
                    "fieldName": FIELD_PERSON_ID,
                    "dataType": "VarChar",
                    "elementTypeParams": { "max_length": MAX_ID_LEN },
                },
                {
                    "fieldName": FIELD_NAME,
                    "dataType": "VarChar",
                    "elementTypeParams": { "max_length": MAX_NAME_LEN },
                },
                {
                    "fieldName": FIELD_FEATURE,
                    "dataType": "FloatVector",
                    "elementTypeParams": { "dim": config.dimension },
                },
                {
                    "fieldName": FIELD_REMARK,
                    "dataType": "VarChar",
                    "elementTypeParams": { "max_length": MAX_REMARK_LEN },
                },
                { "fieldName": FIELD_REGISTER_TIME, "dataType": "Int64" },
            ],
        },
        "indexParams": [{
            "fieldName": FIELD_FEATURE,
            "indexName": "feature_index",
            "indexType": config.index_type,
            "metricType": config.metric.as_str(),
            "params": { "nlist": config.nlist },
        }],
    })
}

fn insert_body(config: &MilvusConfig, request: &InsertRequest) -> Result<Value, StoreError> {
    let record = &request.record;
    if request.feature.dim() != config.dimension {
        return Err(StoreError::InvalidRequest(format!(
            "feature has {} dimensions, collection expects {}",
            request.feature.dim(),
            config.dimension
        )));
    }
    for (field, value, max) in [
        (FIELD_FACE_ID, &record.face_id, MAX_ID_LEN),
        (FIELD_PERSON_ID, &record.person_id, MAX_ID_LEN),
        (FIELD_NAME, &record.name, MAX_NAME_LEN),
        (FIELD_REMARK, &record.remark, MAX_REMARK_LEN),
    ] {
        if value.len() > max {
            return Err(StoreError::InvalidRequest(format!(
                "{field} is {} bytes, limit is {max}",
                value.len()
            )));
        }
    }

    Ok(json!({
        "collectionName": config.collection,
        "data": [{
            FIELD_FACE_ID: record.face_id,
            FIELD_PERSON_ID: record.person_id,
            FIELD_NAME: record.name,
            FIELD_FEATURE: request.feature.as_slice(),
            FIELD_REMARK: record.remark,
            FIELD_REGISTER_TIME: record.register_time,
        }],
    }))
}

fn search_body(config: &MilvusConfig, vector: &FeatureVector, top_k: usize) -> Value {
    json!({
        "collectionName": config.collection,
        "data": [vector.as_slice()],
        "annsField": FIELD_FEATURE,
        "limit": top_k,
        "outputFields": OUTPUT_FIELDS,
        "searchParams": {
            "metricType": config.metric.as_str(),
            "params": { "nprobe": config.nprobe },
        },
    })
}

fn parse_rows(data: Value) -> Result<Vec<FaceRecord>, StoreError> {
    serde_json::from_value(data).map_err(|e| StoreError::InvalidResponse(format!("query rows: {e}")))
}

fn parse_search(data: Value) -> Result<Vec<SearchHit>, StoreError> {
    let rows: Vec<SearchRow> =
        serde_json::from_value(data).map_err(|e| StoreError::InvalidResponse(format!("search rows: {e}")))?;
    Ok(rows
        .into_iter()
        .map(|row| SearchHit {
            record: row.record,
            score: row.distance,
        })
        .collect())
}
