//! Inference seam: tensor in, named tensors out.
//!
//! The detector and recognizer only see [`InferenceEngine`]; [`OrtEngine`]
//! backs it with an ONNX Runtime session.

use crate::error::{FaceError, Result};
use crate::tensor::Tensor;
use ort::session::Session;
use ort::value::TensorRef;
use serde::Deserialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A forward pass executed as a black box.
pub trait InferenceEngine: Send + Sync {
    /// Output tensor names in positional order.
    fn output_names(&self) -> &[String];

    /// Run the model on a single input tensor.
    fn run(&self, input: &Tensor) -> Result<InferenceOutput>;
}

/// Model outputs, addressable by name or position.
#[derive(Debug, Clone, Default)]
pub struct InferenceOutput {
    tensors: Vec<(String, Tensor)>,
}

impl InferenceOutput {
    pub fn new(tensors: Vec<(String, Tensor)>) -> Self {
        Self { tensors }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    pub fn at(&self, index: usize) -> Option<&Tensor> {
        self.tensors.get(index).map(|(_, t)| t)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

/// ONNX Runtime thread settings.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub inter_threads: usize,
    pub intra_threads: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            inter_threads: 4,
            intra_threads: 4,
        }
    }
}

/// [`InferenceEngine`] backed by an ONNX Runtime session.
///
/// `Session::run` needs exclusive access, so concurrent callers queue on the
/// session mutex while the rest of their pipeline runs in parallel.
pub struct OrtEngine {
    session: Mutex<Session>,
    output_names: Vec<String>,
}

impl OrtEngine {
    /// Load an ONNX model. Any failure here is fatal for the process.
    pub fn load(model_path: &Path, options: SessionOptions) -> Result<Self> {
        if !model_path.exists() {
            return Err(FaceError::ModelLoadFailure(format!(
                "model file not found: {}",
                model_path.display()
            )));
        }

        let session = build_session(model_path, options)
            .map_err(|e| FaceError::ModelLoadFailure(format!("{}: {e}", model_path.display())))?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            inter_threads = options.inter_threads,
            intra_threads = options.intra_threads,
            "loaded ONNX model"
        );

        Ok(Self {
            session: Mutex::new(session),
            output_names,
        })
    }
}

fn build_session(model_path: &Path, options: SessionOptions) -> ort::Result<Session> {
    let session = Session::builder()?
        .with_inter_threads(options.inter_threads)?
        .with_intra_threads(options.intra_threads)?
        .commit_from_file(model_path)?;
    Ok(session)
}

impl InferenceEngine for OrtEngine {
    fn output_names(&self) -> &[String] {
        &self.output_names
    }

    fn run(&self, input: &Tensor) -> Result<InferenceOutput> {
        let mut session = lock_session(&self.session);

        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut tensors = Vec::with_capacity(self.output_names.len());
        for (idx, name) in self.output_names.iter().enumerate() {
            let (shape, data) = outputs[idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| FaceError::DecodeFailure(format!("output {name}: {e}")))?;
            let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
            tensors.push((name.clone(), Tensor::from_shape_vec(&dims, data.to_vec())?));
        }

        Ok(InferenceOutput::new(tensors))
    }
}

/// Lock a session, recovering from poisoning. A panic elsewhere leaves the
/// session itself untouched, so later requests may keep using it.
fn lock_session<T>(session: &Mutex<T>) -> MutexGuard<'_, T> {
    session.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("session lock was poisoned by a panicking request, recovering");
        PoisonError::into_inner(poisoned)
    })
}
