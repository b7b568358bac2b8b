//! # Metabase - Object Metadata Store
//!
//! Metabase is the authoritative index of a decentralized object storage
//! system: it maps user-visible object names to the erasure-coded pieces and
//! inline bytes spread across storage nodes. It owns the object/segment
//! lifecycle (multi-stage uploads, versioning, object lock, delete markers),
//! the precommit protocol that keeps commits transactional, and the
//! S3-compatible listing iterators. It never touches node storage.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use metabase::{
//!     BeginObjectNextVersion, CipherSuite, CommitObject, Config, EncryptedUserData,
//!     EncryptionParameters, Metabase, ObjectKey, ObjectLocation, ProjectId, Retention, StreamId,
//! };
//!
//! let db = Metabase::open_sqlite("metabase.db", Config::default())?;
//!
//! let location = ObjectLocation {
//!     project_id: ProjectId::random(),
//!     bucket_name: metabase::BucketName::new("photos"),
//!     object_key: ObjectKey::from("2024/cat.jpg"),
//! };
//! let pending = db.begin_object_next_version(BeginObjectNextVersion {
//!     location,
//!     stream_id: StreamId::random(),
//!     encryption: EncryptionParameters {
//!         cipher_suite: CipherSuite::AesGcm,
//!         block_size: 29 * 256,
//!     },
//!     user_data: EncryptedUserData::default(),
//!     expires_at: None,
//!     zombie_deletion_deadline: None,
//!     retention: Retention::default(),
//!     legal_hold: false,
//! })?;
//!
//! // ... commit segments against pending.stream ...
//!
//! let committed = db.commit_object(CommitObject {
//!     stream: pending.stream,
//!     override_user_data: None,
//!     override_encryption: None,
//!     disallow_delete: false,
//!     versioned: false,
//!     if_none_match: None,
//!     only_segments: None,
//!     max_commit_delay: None,
//! })?;
//! assert!(committed.status.is_committed());
//! # Ok::<(), metabase::MetabaseError>(())
//! ```
//!
//! ## Architecture
//!
//! - **Model layer**: typed identifiers and the object/segment row shapes
//! - **Adapter layer**: dialect-neutral storage contract with row-store
//!   (SQLite) and wide-column (in-memory) backends
//! - **Engine layer**: lifecycle state machine, precommit protocol, listing
//!   iterators, delete engine, background reapers
//!
//! All mutating paths run inside serializable backend transactions; listing
//! and verification scans read in bounded batches and never hold a
//! transaction across consumer pauses.

pub mod adapter;
pub mod alias;
pub mod db;
pub mod error;
pub mod logging;
pub mod model;

// Re-export the main public API
pub use crate::adapter::{Adapter, MemoryAdapter, SqliteAdapter, TableStats, TransactionOptions};
pub use crate::alias::{AliasCache, AliasCacheMetricsSnapshot};
pub use crate::db::{
    BeginObjectExactVersion, BeginObjectNextVersion, BeginSegment, CheckSegmentPiecesAlteration,
    CommitInlineObject, CommitInlineSegment, CommitObject, CommitSegment, Config,
    DeleteExpiredObjects, DeleteObjectExactVersion, DeleteObjectLastCommitted, DeleteObjectResult,
    DeleteObjectsAllVersions, DeletePendingObject, DeleteZombieObjects, GetTableStats, IfNoneMatch,
    InlineSegmentSpec, IterateObjects, IteratePendingObjectsByKey, ListCursor, ListObjects,
    ListObjectsResult, ListSegments, ListSegmentsResult, ListVerifySegments,
    ListVerifySegmentsResult, Metabase, ObjectsIterator, PendingObjectsIterator, ReapResult,
    SegmentDetail, SetObjectExactVersionLegalHold, SetObjectExactVersionRetention,
    UpdateObjectMetadata, VerifySegment,
};
pub use crate::error::{MetabaseError, Result};
pub use crate::model::{
    AliasPiece, AliasPieces, BucketName, CipherSuite, EncryptedUserData, EncryptionParameters,
    NodeAlias, NodeId, Object, ObjectEntry, ObjectKey, ObjectLocation, ObjectStatus, ObjectStream,
    Piece, PieceId, Pieces, Placement, ProjectId, RedundancyScheme, Retention, RetentionMode,
    Segment, SegmentPosition, StreamId, Version,
};
