//! The single error type surfaced across the crate.
//!
//! Every public operation returns [`DbResult<T>`]. Internal blob-store and
//! codec failures are mapped onto this enum at the boundary where they are
//! first observed; callers never see a raw `object_store` or `serde_json`
//! error type.

use std::fmt;

/// Result alias used throughout the crate, mirroring `DeltaResult` in the
/// teacher's kernel.
pub type DbResult<T> = Result<T, Error>;

/// The field, id, filter, etc. that failed validation, paired with a reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidKind {
    Collection,
    Id,
    Filter,
    Update,
    Data,
    Pipeline,
    Limit,
    Sort,
    Project,
    Query,
}

impl fmt::Display for InvalidKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InvalidKind::Collection => "collection",
            InvalidKind::Id => "id",
            InvalidKind::Filter => "filter",
            InvalidKind::Update => "update",
            InvalidKind::Data => "data",
            InvalidKind::Pipeline => "pipeline",
            InvalidKind::Limit => "limit",
            InvalidKind::Sort => "sort",
            InvalidKind::Project => "project",
            InvalidKind::Query => "query",
        };
        f.write_str(s)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("entity or blob not found: {0}")]
    NotFound(String),

    /// OCC-internal: a commit slot was already occupied. Never returned to
    /// callers directly -- the retry loop either succeeds or, after
    /// exhausting retries, converts this into [`Error::Conflict`].
    #[error("commit slot already exists: {0}")]
    AlreadyExists(String),

    #[error("commit could not acquire a slot after {attempts} attempt(s)")]
    Conflict { attempts: u32 },

    #[error("operation not permitted on a read-only handle")]
    ReadOnly,

    #[error("invalid {kind}: {message}")]
    Invalid { kind: InvalidKind, message: String },

    #[error("blob {key} is corrupted: {reason}")]
    Corrupted { key: String, reason: String },

    #[error("data cannot be mapped under the current schema: {0}")]
    SchemaIncompatible(String),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("transient blob-store error: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn invalid(kind: InvalidKind, message: impl Into<String>) -> Self {
        Error::Invalid {
            kind,
            message: message.into(),
        }
    }

    pub fn corrupted(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Corrupted {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }

    /// True for errors the optimistic retry loop should retry without
    /// treating as a conflict (§4.E step 6).
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::corrupted("<json>", e.to_string())
    }
}

impl From<apache_avro::Error> for Error {
    fn from(e: apache_avro::Error) -> Self {
        Error::corrupted("<avro>", e.to_string())
    }
}

impl From<object_store::Error> for Error {
    fn from(e: object_store::Error) -> Self {
        match e {
            object_store::Error::AlreadyExists { path, .. } => Error::AlreadyExists(path),
            object_store::Error::NotFound { path, .. } => Error::NotFound(path),
            other => Error::Transient(other.to_string()),
        }
    }
}
