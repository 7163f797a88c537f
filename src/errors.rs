use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HprofScopeError {
    #[error("input file '{name}' not found")]
    InputFileNotFound { name: String },
    #[error("invalid hprof file: {message}")]
    InvalidHprofFile { message: String },
    #[error("invalid id size (must be 4 or 8 bytes)")]
    InvalidIdSize,
    #[error("truncated record: read past end of file at offset {offset}")]
    TruncatedRecord { offset: u64 },
    #[error("index file '{path}' has mismatching magic or version")]
    IndexVersionMismatch { path: PathBuf },
    #[error("operation cancelled")]
    Cancelled,
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
    #[error("worker thread panicked")]
    StdThreadError,
    #[error("i/o failure")]
    StdIoError(#[from] std::io::Error),
    #[error("json serialization failure")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("argument parsing failure")]
    ClapError(#[from] clap::Error),
}

impl HprofScopeError {
    /// A stale or foreign index is not fatal, the caller deletes and rebuilds.
    pub fn is_index_rebuild(&self) -> bool {
        matches!(self, HprofScopeError::IndexVersionMismatch { .. })
    }
}
