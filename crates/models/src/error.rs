use std::path::PathBuf;

use thiserror::Error;
use transforms::TransformError;

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("required model artifact not found: {}", path.display())]
    MissingArtifact { path: PathBuf },
    #[error("failed to load weights from {}: {message}", path.display())]
    LoadWeights { path: PathBuf, message: String },
    #[error("failed to save weights to {}: {message}", path.display())]
    SaveWeights { path: PathBuf, message: String },
    #[error("control network expects {expected} parameters per image, got {actual}")]
    ParameterShape { expected: usize, actual: usize },
    #[error("invalid model config: {0}")]
    InvalidConfig(String),
    #[error("could not read tensor data: {0}")]
    TensorData(String),
    #[error(transparent)]
    Transform(#[from] TransformError),
}
