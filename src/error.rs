use thiserror::Error;

pub type Result<T> = std::result::Result<T, MetabaseError>;

/// Errors surfaced by metabase operations.
///
/// Validation errors are returned before any write. Transactional errors roll
/// back the whole transaction: a commit either publishes the new object and
/// removes prior state, or it does neither. `ObjectAlreadyExists` and
/// `PendingObjectMissing` are concrete variants so callers can map them to
/// specific RPC codes without string matching.
#[derive(Debug, Error)]
pub enum MetabaseError {
    /// Caller-side argument error: missing project id or bucket name,
    /// malformed pieces, wrong version sentinel, inconsistent metadata,
    /// invalid lock state.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The referenced object row does not exist.
    #[error("object not found")]
    ObjectNotFound,

    /// The referenced segment row does not exist.
    #[error("segment not found")]
    SegmentNotFound,

    /// Unique-key conflict on an object insert.
    #[error("object already exists")]
    ObjectAlreadyExists,

    /// A commit referenced a pending object row that is not there.
    #[error("pending object missing")]
    PendingObjectMissing,

    /// A conditional-write predicate or multipart validation failed.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// The operation is incompatible with the row's current status.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Legal hold or active retention blocks the destructive operation.
    #[error("object protected: {0}")]
    ObjectLock(&'static str),

    /// The operation would need to delete existing state but the caller
    /// disallowed deletes.
    #[error("permission denied: {0}")]
    PermissionDenied(&'static str),

    /// Fault from the row-store backend.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored value failed to decode.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Engine invariant violated; indicates a bug, not caller error.
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl MetabaseError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        MetabaseError::InvalidRequest(msg.into())
    }
}
