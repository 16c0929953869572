use std::io;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WeaveError>;

#[derive(Debug, Error)]
pub enum WeaveError {
    #[error("cannot resolve op {op} for input types {types}")]
    OpResolution { op: String, types: String },
    #[error("op {op} with signature {signature} is already registered")]
    DuplicateOp { op: String, signature: String },
    #[error("op {op} failed: {message}")]
    Execution { op: String, message: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("backend call exceeded {0:?}")]
    Timeout(Duration),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl WeaveError {
    pub fn execution(op: &str, message: impl Into<String>) -> Self {
        WeaveError::Execution {
            op: op.to_owned(),
            message: message.into(),
        }
    }

    /// Name reported as `error_kind` on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            WeaveError::OpResolution { .. } => "OpResolutionError",
            WeaveError::DuplicateOp { .. } => "DuplicateOpError",
            WeaveError::Execution { .. } => "ExecutionError",
            WeaveError::NotFound(_) => "NotFound",
            WeaveError::Type(_) => "TypeError",
            WeaveError::Serialization(_) => "SerializationError",
            WeaveError::Backend(_) => "BackendError",
            WeaveError::Timeout(_) => "TimeoutError",
            WeaveError::Io(_) => "IoError",
        }
    }

    /// Errors are memoized per node and shared between dependants, so they
    /// have to be duplicated without requiring `Clone` on `io::Error`.
    pub fn duplicate(&self) -> Self {
        match self {
            WeaveError::OpResolution { op, types } => WeaveError::OpResolution {
                op: op.clone(),
                types: types.clone(),
            },
            WeaveError::DuplicateOp { op, signature } => WeaveError::DuplicateOp {
                op: op.clone(),
                signature: signature.clone(),
            },
            WeaveError::Execution { op, message } => WeaveError::Execution {
                op: op.clone(),
                message: message.clone(),
            },
            WeaveError::NotFound(s) => WeaveError::NotFound(s.clone()),
            WeaveError::Type(s) => WeaveError::Type(s.clone()),
            WeaveError::Serialization(s) => WeaveError::Serialization(s.clone()),
            WeaveError::Backend(s) => WeaveError::Backend(s.clone()),
            WeaveError::Timeout(d) => WeaveError::Timeout(*d),
            WeaveError::Io(e) => WeaveError::Io(io::Error::new(e.kind(), e.to_string())),
        }
    }
}

impl From<serde_json::Error> for WeaveError {
    fn from(e: serde_json::Error) -> Self {
        WeaveError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for WeaveError {
    fn from(e: bincode::Error) -> Self {
        WeaveError::Serialization(e.to_string())
    }
}

impl From<arrow::error::ArrowError> for WeaveError {
    fn from(e: arrow::error::ArrowError) -> Self {
        WeaveError::Backend(e.to_string())
    }
}

impl From<rusqlite::Error> for WeaveError {
    fn from(e: rusqlite::Error) -> Self {
        WeaveError::Backend(e.to_string())
    }
}
