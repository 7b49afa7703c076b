use thiserror::Error;

/// Failure taxonomy shared by every pipeline stage.
///
/// Everything except [`FaceError::ModelLoadFailure`] is scoped to a single
/// request: the caller reports it and the process keeps serving.
#[derive(Error, Debug)]
pub enum FaceError {
    /// Wrong landmark count, feature dimension mismatch, zero-norm vector.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Unparseable image bytes or a model output with an unexpected shape.
    #[error("decode failure: {0}")]
    DecodeFailure(String),
    /// Enrollment needs a face; detection returned none.
    #[error("no face detected")]
    NoDetection,
    /// The vector store was unreachable or rejected the request.
    #[error("vector store: {0}")]
    TransportFailure(String),
    /// A model or session could not be initialized.
    #[error("model load failed: {0}")]
    ModelLoadFailure(String),
    /// The inference engine failed while running a loaded model.
    #[error("inference failed: {0}")]
    Inference(String),
    /// A cancellation was observed at a stage boundary.
    #[error("request cancelled")]
    Cancelled,
}

impl From<ort::Error> for FaceError {
    fn from(err: ort::Error) -> Self {
        FaceError::Inference(err.to_string())
    }
}

impl From<image::ImageError> for FaceError {
    fn from(err: image::ImageError) -> Self {
        FaceError::DecodeFailure(err.to_string())
    }
}

pub type Result<T, E = FaceError> = std::result::Result<T, E>;
