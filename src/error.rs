use std::path::PathBuf;

use burn::record::RecorderError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TrainError>;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("checkpoint not found: {}", .0.display())]
    MissingCheckpoint(PathBuf),

    #[error("adversarial target must be 0 or 1, got {0}")]
    InvalidTarget(i64),

    #[error("gradient shape {got:?} does not match input shape {expected:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("no saved model named `{name}` in {}", .dir.display())]
    NoMatchingModel { name: String, dir: PathBuf },

    #[error("unknown model type `{0}`")]
    UnknownModelType(String),

    #[error("data source produced no batches")]
    EmptyDataSource,

    #[error("unsupported dataset `{0}`")]
    UnsupportedDataset(String),

    #[error("record error: {0}")]
    Record(#[from] RecorderError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
