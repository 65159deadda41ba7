//! Error taxonomy shared by every service.

use std::io;
use thiserror::Error;

use super::blob_store::BlobError;

/// Coarse classification the HTTP layer maps to a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    InvalidInput,
    QuotaExceeded,
    Conflict,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Internal => "internal_error",
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("upload session `{0}` not found or expired")]
    SessionNotFound(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("caller does not own this resource")]
    Forbidden,
    #[error("chunk index {index} outside [0, {total})")]
    InvalidChunkIndex { index: u32, total: u32 },
    #[error("chunk {index} has {actual} bytes, expected {expected}")]
    InvalidChunkSize {
        index: u32,
        expected: i64,
        actual: i64,
    },
    #[error("chunk {index} digest mismatch")]
    ChunkDigestMismatch { index: u32 },
    #[error("upload incomplete: {uploaded} of {total} chunks received")]
    IncompleteUpload { uploaded: u32, total: u32 },
    #[error("{0}")]
    InvalidInput(String),
    #[error("storage quota exceeded: {requested} bytes requested, {available} available")]
    QuotaExceeded { requested: i64, available: i64 },
    #[error("{0}")]
    Conflict(String),
    #[error("folder ancestry deeper than {0} levels, parent chain is corrupt")]
    FolderCycle(usize),
    #[error("{0}")]
    Internal(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Cache(#[from] redis::RedisError),
    #[error(transparent)]
    Blob(#[from] BlobError),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::SessionNotFound(_) | ServiceError::NotFound(_) => ErrorKind::NotFound,
            ServiceError::Forbidden => ErrorKind::Forbidden,
            ServiceError::InvalidChunkIndex { .. }
            | ServiceError::InvalidChunkSize { .. }
            | ServiceError::ChunkDigestMismatch { .. }
            | ServiceError::IncompleteUpload { .. }
            | ServiceError::InvalidInput(_) => ErrorKind::InvalidInput,
            ServiceError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            ServiceError::Conflict(_) => ErrorKind::Conflict,
            ServiceError::FolderCycle(_)
            | ServiceError::Internal(_)
            | ServiceError::Sqlx(_)
            | ServiceError::Io(_)
            | ServiceError::Cache(_)
            | ServiceError::Blob(_) => ErrorKind::Internal,
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Return true if SQLx error indicates a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
