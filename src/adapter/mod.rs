#![forbid(unsafe_code)]

//! Dialect-neutral storage contract. The engine core talks to `Adapter` and
//! `AdapterTx` only; it never sees SQL, mutations, or any other backend
//! idiom. Two dialects ship in-tree: a row-store RDBMS (`SqliteAdapter`) and
//! a transactional wide-column store (`MemoryAdapter`).

mod memory;
mod sqlite;

pub use memory::MemoryAdapter;
pub use sqlite::SqliteAdapter;

use time::OffsetDateTime;

use crate::error::Result;
use crate::model::{
    BucketName, EncryptedUserData, NodeAlias, NodeId, Object, ObjectKey, ObjectLocation,
    ObjectStatus, ObjectStream, ProjectId, Retention, Segment, SegmentPosition, StreamId, Version,
};

/// Hints forwarded to backends that batch or stream their commits. Backends
/// without the capability ignore them.
#[derive(Clone, Copy, Debug, Default)]
pub struct TransactionOptions {
    pub max_commit_delay: Option<time::Duration>,
    /// Side-effect-free internal mutations may ask to stay out of change
    /// streams.
    pub exclude_from_change_streams: bool,
}

/// Reference to the pending row a precommit query should fetch.
#[derive(Clone, Copy, Debug)]
pub struct PendingRef {
    pub version: Version,
    pub stream_id: StreamId,
}

/// Selects which sub-results a precommit query produces. All requested
/// results come from the same transactional snapshot.
#[derive(Clone, Debug)]
pub struct PrecommitConstraint<'a> {
    pub location: &'a ObjectLocation,
    /// `None` skips the pending lookup entirely (the operation will not
    /// consult it).
    pub pending: Option<PendingRef>,
    /// Fetch the pending row's segments for part validation.
    pub include_pending_segments: bool,
    /// Fetch the unversioned incumbent (committed or delete marker).
    pub include_unversioned: bool,
    /// Compute the highest version ever assigned to the key.
    pub include_highest: bool,
    /// Compute the newest committed-or-marker version.
    pub include_highest_visible: bool,
}

impl<'a> PrecommitConstraint<'a> {
    pub fn new(location: &'a ObjectLocation) -> Self {
        PrecommitConstraint {
            location,
            pending: None,
            include_pending_segments: false,
            include_unversioned: false,
            include_highest: false,
            include_highest_visible: false,
        }
    }
}

/// Snapshot of the target key's state at the start of a commit or delete
/// transaction.
#[derive(Debug, Default)]
pub struct PrecommitInfo {
    pub pending: Option<Object>,
    pub pending_segments: Vec<Segment>,
    pub unversioned: Option<Object>,
    /// Highest version ever assigned; `Version(0)` when the key is unused.
    pub highest_version: Version,
    pub highest_visible: Option<(Version, ObjectStatus)>,
}

/// Where a listing batch starts, in the iterator's ordering.
#[derive(Clone, Debug)]
pub enum BatchBound {
    /// All rows whose key is `>=` the given key.
    KeyInclusive(ObjectKey),
    /// All rows strictly after `(key, version)` in the iterator's ordering:
    /// later keys, or the same key at a version the ordering has not visited
    /// yet.
    AfterKeyVersion(ObjectKey, Version),
}

/// Version ordering within one key. Keys themselves always ascend.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VersionOrder {
    Descending,
    Ascending,
}

/// One page of raw object rows for the listing engine.
#[derive(Clone, Debug)]
pub struct BatchQuery {
    pub project_id: ProjectId,
    pub bucket_name: BucketName,
    pub start: BatchBound,
    /// Exclusive upper key bound derived from the listing prefix.
    pub end_before: Option<ObjectKey>,
    pub order: VersionOrder,
    /// Restrict to pending rows; otherwise only committed-or-marker rows are
    /// returned.
    pub pending_only: bool,
    pub limit: usize,
}

/// Offset finalization for one segment row at commit time.
#[derive(Clone, Copy, Debug)]
pub struct SegmentOffsetUpdate {
    pub position: SegmentPosition,
    pub plain_offset: i64,
    pub plain_size: i32,
    pub encrypted_size: i32,
}

/// Exclusive cursor of the segment-verification scan.
#[derive(Clone, Copy, Debug, Default)]
pub struct VerifyCursor {
    pub stream_id: Option<StreamId>,
    pub position: SegmentPosition,
}

/// Approximate table statistics.
#[derive(Clone, Copy, Debug)]
pub struct TableStats {
    pub segment_count: u64,
}

/// Operations available inside a storage transaction. Every call sees the
/// transaction's own snapshot plus its earlier writes.
pub trait AdapterTx {
    /// The read-then-write protocol's read step; see `PrecommitConstraint`.
    fn precommit_query(&mut self, constraint: &PrecommitConstraint<'_>) -> Result<PrecommitInfo>;

    /// Next monotonic version for the key: strictly greater than any version
    /// assigned so far within this transaction's snapshot.
    fn next_version(&mut self, location: &ObjectLocation) -> Result<Version>;

    fn get_object_exact_version(
        &mut self,
        location: &ObjectLocation,
        version: Version,
    ) -> Result<Option<Object>>;

    /// The pending row at the exact `(location, version, stream)` coordinate.
    fn get_pending_object(&mut self, stream: &ObjectStream) -> Result<Option<Object>>;

    /// The committed row carrying this stream id, if any.
    fn get_committed_by_stream(
        &mut self,
        location: &ObjectLocation,
        stream_id: StreamId,
    ) -> Result<Option<Object>>;

    /// Every row of the key, any status, ascending version.
    fn list_object_versions(&mut self, location: &ObjectLocation) -> Result<Vec<Object>>;

    /// Insert a fresh object row. Duplicate primary key surfaces as
    /// `ObjectAlreadyExists`.
    fn insert_object(&mut self, object: &Object) -> Result<()>;

    /// Overwrite the row at `object`'s primary key with `object`'s fields.
    /// Used by the overwrite-in-place commit path.
    fn update_object(&mut self, object: &Object) -> Result<()>;

    /// Remove one row, returning it.
    fn delete_object(
        &mut self,
        location: &ObjectLocation,
        version: Version,
    ) -> Result<Option<Object>>;

    /// Update the opaque metadata of a committed row matched by stream id.
    /// Returns false when no committed row matches.
    fn update_object_user_data(
        &mut self,
        location: &ObjectLocation,
        stream_id: StreamId,
        user_data: &EncryptedUserData,
    ) -> Result<bool>;

    /// Update lock state of the row at `(location, version)`. Returns false
    /// when the row is missing.
    fn update_object_lock(
        &mut self,
        location: &ObjectLocation,
        version: Version,
        retention: Retention,
        legal_hold: bool,
    ) -> Result<bool>;

    /// Insert-or-update one segment row, clearing whichever content family
    /// (inline or remote) the new row does not carry.
    fn upsert_segment(&mut self, segment: &Segment) -> Result<()>;

    fn insert_segments(&mut self, segments: &[Segment]) -> Result<()>;

    fn update_segment_offsets(
        &mut self,
        stream_id: StreamId,
        updates: &[SegmentOffsetUpdate],
    ) -> Result<()>;

    fn list_stream_segments(&mut self, stream_id: StreamId) -> Result<Vec<Segment>>;

    fn delete_segments(&mut self, stream_id: StreamId) -> Result<usize>;

    fn delete_segments_at(
        &mut self,
        stream_id: StreamId,
        positions: &[SegmentPosition],
    ) -> Result<usize>;
}

/// A storage backend dialect. Object safety is required: the engine holds
/// `Arc<dyn Adapter>`.
pub trait Adapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run `f` inside a serializable transaction. The closure may run more
    /// than once when the backend retries a transient abort; it must be
    /// idempotent up to its writes, which are discarded on retry.
    fn with_tx(
        &self,
        opts: &TransactionOptions,
        f: &mut dyn FnMut(&mut dyn AdapterTx) -> Result<()>,
    ) -> Result<()>;

    fn get_object_exact_version(
        &self,
        location: &ObjectLocation,
        version: Version,
    ) -> Result<Option<Object>>;

    /// The newest committed-or-marker row of the key.
    fn get_highest_visible(&self, location: &ObjectLocation) -> Result<Option<Object>>;

    fn get_segment(
        &self,
        stream_id: StreamId,
        position: SegmentPosition,
    ) -> Result<Option<Segment>>;

    /// Ascending positions after the exclusive cursor.
    fn list_segments(
        &self,
        stream_id: StreamId,
        after: Option<SegmentPosition>,
        limit: usize,
    ) -> Result<Vec<Segment>>;

    /// Best-effort existence probe used as an early check in BeginSegment;
    /// non-authoritative.
    fn pending_object_exists(&self, stream: &ObjectStream) -> Result<bool>;

    fn list_objects_batch(&self, query: &BatchQuery) -> Result<Vec<Object>>;

    /// Pending rows of one key ordered by stream id, after the exclusive
    /// cursor.
    fn list_pending_by_key(
        &self,
        location: &ObjectLocation,
        after: Option<StreamId>,
        limit: usize,
    ) -> Result<Vec<Object>>;

    /// Remote segments in `(stream_id, position)` order after the exclusive
    /// cursor. Inline segments are skipped.
    fn list_verify_segments(&self, cursor: &VerifyCursor, limit: usize) -> Result<Vec<Segment>>;

    /// Approximate statistics; backends may serve cached values.
    fn table_stats(&self) -> Result<TableStats>;

    /// Pending rows whose zombie deadline passed before `deadline_before`.
    fn find_zombie_objects(
        &self,
        deadline_before: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<ObjectStream>>;

    /// Rows of any status whose TTL passed.
    fn find_expired_objects(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<ObjectStream>>;

    /// Segments whose own TTL passed; catches rows orphaned by earlier
    /// partial cleanups.
    fn find_expired_segments(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<(StreamId, SegmentPosition)>>;

    /// Mint aliases for any unknown node ids, keeping existing assignments,
    /// and return the mapping for every requested node in one round trip.
    fn ensure_node_aliases(&self, nodes: &[NodeId]) -> Result<Vec<(NodeId, NodeAlias)>>;

    /// The full alias table.
    fn load_node_aliases(&self) -> Result<Vec<(NodeId, NodeAlias)>>;
}
