use std::io;
use thiserror::Error;

/// Why a request failed the bearer-token gate or a login attempt.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("authorization token is missing")]
    Missing,
    #[error("authorization token is invalid")]
    Invalid,
    #[error("authorization token has expired")]
    Expired,
    #[error("invalid username or password")]
    BadCredentials,
}

/// Underlying cause of a chunk store failure.
#[derive(Debug, Error)]
pub enum StoreFault {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("{0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Missing or malformed client input, detected before any side effect.
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("failed to store object `{name}`: {source}")]
    StorageWrite {
        name: String,
        #[source]
        source: StoreFault,
    },
    #[error("failed to read object `{name}`: {source}")]
    StorageRead {
        name: String,
        #[source]
        source: StoreFault,
    },
    /// The metadata record could not be written. `object_stored` tells
    /// whether the payload was published anyway (first upload of a name) or
    /// rolled back together with the record (replacement of an existing name).
    #[error("metadata for `{filename}` could not be indexed: {source}")]
    IndexWrite {
        filename: String,
        object_stored: bool,
        #[source]
        source: sqlx::Error,
    },
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub fn storage_write(name: &str, source: impl Into<StoreFault>) -> Self {
        Self::StorageWrite {
            name: name.to_string(),
            source: source.into(),
        }
    }

    pub fn storage_read(name: &str, source: impl Into<StoreFault>) -> Self {
        Self::StorageRead {
            name: name.to_string(),
            source: source.into(),
        }
    }

    pub fn missing_fields(fields: &[&str]) -> Self {
        Self::Validation(format!("missing required fields: {}", fields.join(", ")))
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
