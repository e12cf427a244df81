//! Error definitions shared across the crate.

use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, DatasetError>;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json parse error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("config parse error at {path}: {source}")]
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
    #[error("invalid dataset config: {0}")]
    Config(String),
    #[error("unknown augmentation method {name:?}")]
    UnknownAugmentation { name: String },
    #[error("augmentation {op} parameter {param:?}: {msg}")]
    AugmentationParam {
        op: String,
        param: String,
        msg: String,
    },
    #[error("sidecar {path} failed validation: {source}")]
    Sidecar {
        path: PathBuf,
        #[source]
        source: data_contracts::ValidationError,
    },
    #[error(
        "orientation mismatch at {path}: image {width}x{height} vs scale_to {scale_to_width}x{scale_to_height}"
    )]
    OrientationMismatch {
        path: PathBuf,
        width: u32,
        height: u32,
        scale_to_width: u32,
        scale_to_height: u32,
    },
    #[error("latent cache file {path} is malformed: {msg}")]
    CacheFormat { path: PathBuf, msg: String },
    #[error("no tensor loaded for {path}")]
    MissingTensor { path: PathBuf },
    #[error("encoder failed: {0}")]
    Encoder(String),
    #[error("tensor error: {0}")]
    Tensor(String),
    #[error("{0}")]
    Other(String),
}

impl DatasetError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DatasetError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn image(path: impl Into<PathBuf>, source: image::ImageError) -> Self {
        DatasetError::Image {
            path: path.into(),
            source,
        }
    }

    /// Per-item failures the batch loader may skip over.
    pub fn is_item_recoverable(&self) -> bool {
        matches!(
            self,
            DatasetError::Io { .. }
                | DatasetError::Image { .. }
                | DatasetError::OrientationMismatch { .. }
                | DatasetError::CacheFormat { .. }
                | DatasetError::MissingTensor { .. }
        )
    }
}
