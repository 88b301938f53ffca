//! Represents a chunked binary payload held by the chunk store.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle of an object record.
///
/// Only `Complete` records are visible to lookups. `Pending` covers an
/// in-flight write, `Superseded` a version replaced by a newer upload that
/// is kept around until the prune grace period ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum ObjectState {
    Pending,
    Complete,
    Superseded,
}

/// The file record of a stored object. The payload itself lives in the
/// `chunks` table, keyed by `(id, n)`.
#[derive(Clone, FromRow, Debug)]
pub struct StoredObject {
    /// Internal id of this upload attempt.
    pub id: Uuid,

    /// Public name the object is addressed by.
    pub filename: String,

    /// Content type recorded at upload time, if the client sent one.
    pub content_type: Option<String>,

    /// Total payload length in bytes.
    pub length: i64,

    /// Size of every chunk except possibly the last.
    pub chunk_size: i64,

    /// Number of chunk rows making up the payload.
    pub chunk_count: i64,

    /// Hex MD5 digest of the payload, set on completion.
    pub md5: Option<String>,

    pub state: ObjectState,

    pub created_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,
}
