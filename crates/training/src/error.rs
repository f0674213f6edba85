use std::path::PathBuf;

use data_contracts::ValidationError;
use models::ModelError;
use thiserror::Error;
use transforms::TransformError;

pub type TrainResult<T> = Result<T, TrainError>;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("toml parse error at {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("recorder error at {path}: {msg}")]
    Recorder { path: PathBuf, msg: String },
    #[error("label validation failed at {path}: {source}")]
    Validation {
        path: PathBuf,
        #[source]
        source: ValidationError,
    },
    #[error("invalid config: {0}")]
    Config(String),
    #[error("collective: {0}")]
    Collective(String),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Transform(#[from] TransformError),
}

impl TrainError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TrainError::Io {
            path: path.into(),
            source,
        }
    }
}
