use anyhow::{bail, Context, Result};
use facematch_core::{AlignmentConfig, DetectorConfig, MatchConfig, RecognizerConfig, SessionOptions};
use facematch_store::MilvusConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Runtime configuration: defaults, then an optional TOML file, then
/// `FACEMATCH_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// SCRFD model file name, relative to `model_dir`.
    pub detector_model: String,
    /// ArcFace model file name, relative to `model_dir`.
    pub recognizer_model: String,
    /// Number of pipeline worker threads.
    pub workers: usize,
    /// Requests that may wait for a worker before submitters block.
    pub queue_capacity: usize,
    pub session: SessionOptions,
    pub detector: DetectorConfig,
    pub recognizer: RecognizerConfig,
    pub alignment: AlignmentConfig,
    pub matching: MatchConfig,
    pub milvus: MilvusConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facematch");

        Self {
            model_dir: data_dir.join("models"),
            detector_model: "det_10g.onnx".into(),
            recognizer_model: "w600k_r50.onnx".into(),
            workers: 4,
            queue_capacity: 16,
            session: SessionOptions::default(),
            detector: DetectorConfig::default(),
            recognizer: RecognizerConfig::default(),
            alignment: AlignmentConfig::default(),
            matching: MatchConfig::default(),
            milvus: MilvusConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading config at {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Apply `FACEMATCH_*` overrides from `lookup`, then derive the store
    /// settings that must agree with the pipeline.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let env = Env(&lookup);

        if let Some(dir) = lookup("FACEMATCH_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        env.set("FACEMATCH_WORKERS", &mut self.workers);
        env.set("FACEMATCH_QUEUE_CAPACITY", &mut self.queue_capacity);
        env.set("FACEMATCH_INTER_THREADS", &mut self.session.inter_threads);
        env.set("FACEMATCH_INTRA_THREADS", &mut self.session.intra_threads);

        env.set("FACEMATCH_CONFIDENCE_THRESHOLD", &mut self.detector.confidence_threshold);
        env.set("FACEMATCH_INPUT_SIZE", &mut self.detector.input_size);
        env.set("FACEMATCH_NMS_THRESHOLD", &mut self.detector.nms_threshold);
        env.set("FACEMATCH_FEATURE_DIM", &mut self.recognizer.feature_dim);
        env.set("FACEMATCH_ALIGN_SIZE", &mut self.alignment.output_size);

        env.set("FACEMATCH_SIMILARITY_THRESHOLD", &mut self.matching.similarity_threshold);
        env.set("FACEMATCH_TOP_K", &mut self.matching.top_k);
        env.set("FACEMATCH_METRIC", &mut self.matching.metric);

        env.set("FACEMATCH_MILVUS_ENDPOINT", &mut self.milvus.endpoint);
        env.set("FACEMATCH_MILVUS_TOKEN", &mut self.milvus.token);
        env.set("FACEMATCH_MILVUS_COLLECTION", &mut self.milvus.collection);
        env.set("FACEMATCH_MILVUS_NPROBE", &mut self.milvus.nprobe);
        env.set("FACEMATCH_MILVUS_TIMEOUT_SECS", &mut self.milvus.timeout_secs);

        self.milvus.metric = self.matching.metric;
        self.milvus.dimension = self.recognizer.feature_dim;
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 || self.queue_capacity == 0 {
            bail!("workers and queue_capacity must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.detector.confidence_threshold) {
            bail!("confidence_threshold must be within [0, 1], got {}", self.detector.confidence_threshold);
        }
        if self.matching.top_k == 0 {
            bail!("top_k must be at least 1");
        }
        if self.recognizer.feature_dim == 0 {
            bail!("feature_dim must be at least 1");
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector_model)
    }

    /// Path to the ArcFace recognition model.
    pub fn recognizer_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.recognizer_model)
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    /// Overwrite `slot` when `key` is set and parses; unparsable values are logged and ignored.
    fn set<T: FromStr>(&self, key: &str, slot: &mut T) {
        let Some(raw) = (self.0)(key) else {
            return;
        };
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable environment override"),
        }
    }
}
