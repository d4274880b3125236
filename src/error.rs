use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),
    #[error("corrupt face database in {dir}: {reason}")]
    CorruptDatabase { dir: PathBuf, reason: String },
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("frame processing failed: {0}")]
    FrameProcessing(String),
    #[error("embedding has {got} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("face database {0} is in use by another session")]
    DatabaseLocked(PathBuf),
    #[error("saving face database to {dir} did not complete: {source}")]
    PartialWrite {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding error: {0}")]
    Encoding(#[from] postcard::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(dir: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::CorruptDatabase {
            dir: dir.into(),
            reason: reason.into(),
        }
    }
}
