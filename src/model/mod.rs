#![forbid(unsafe_code)]

//! Domain model: typed identifiers, object keys, versions, statuses, and the
//! object/segment row shapes shared by every backend.

mod encryption;
mod lock;
mod redundancy;

pub use encryption::{CipherSuite, EncryptionParameters};
pub use lock::{check_removal, LockCheck, Retention, RetentionMode};
pub(crate) use lock::verify_lock_and_expiry;
pub use redundancy::{AliasPiece, AliasPieces, NodeAlias, Piece, Pieces, RedundancyScheme};

use std::fmt;

use bytes::Bytes;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{MetabaseError, Result};

/// Project owning a bucket. Zero is invalid.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProjectId(pub Uuid);

impl ProjectId {
    pub fn is_zero(&self) -> bool {
        self.0.is_nil()
    }

    pub fn random() -> Self {
        ProjectId(Uuid::new_v4())
    }
}

impl fmt::Debug for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProjectId({})", self.0)
    }
}

/// Identifier of one specific version of an object. Globally unique.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub Uuid);

impl StreamId {
    pub fn is_zero(&self) -> bool {
        self.0.is_nil()
    }

    pub fn random() -> Self {
        StreamId(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self.0)
    }
}

/// Storage node identity, 32 opaque bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    pub fn from_slice(src: &[u8]) -> Result<Self> {
        let bytes: [u8; 32] = src
            .try_into()
            .map_err(|_| MetabaseError::Encoding(format!("node id length {}", src.len())))?;
        Ok(NodeId(bytes))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..8]))
    }
}

/// Root piece identity of a remote segment, 32 opaque bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PieceId(pub [u8; 32]);

impl PieceId {
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn from_slice(src: &[u8]) -> Result<Self> {
        let bytes: [u8; 32] = src
            .try_into()
            .map_err(|_| MetabaseError::Encoding(format!("piece id length {}", src.len())))?;
        Ok(PieceId(bytes))
    }
}

impl fmt::Debug for PieceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PieceId({})", hex::encode(&self.0[..8]))
    }
}

/// Bucket name within a project.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct BucketName(pub String);

impl BucketName {
    pub fn new(name: impl Into<String>) -> Self {
        BucketName(name.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Encrypted object key, ordered bytewise. The listing engine relies on the
/// raw byte ordering matching the storage ordering.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjectKey(pub Vec<u8>);

impl ObjectKey {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        ObjectKey(key.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn starts_with(&self, prefix: &ObjectKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Concatenates `self` and `suffix`.
    pub fn joined(&self, suffix: &[u8]) -> ObjectKey {
        let mut out = Vec::with_capacity(self.0.len() + suffix.len());
        out.extend_from_slice(&self.0);
        out.extend_from_slice(suffix);
        ObjectKey(out)
    }

    /// The smallest key strictly greater than `self`: `self` with a zero byte
    /// appended. Every key under the `self` prefix except `self` itself
    /// compares greater or equal to it.
    pub fn successor(&self) -> ObjectKey {
        self.joined(&[0u8])
    }

    /// The smallest key greater than every key carrying `self` as a prefix,
    /// or `None` when no such key exists (all bytes are 0xFF).
    pub fn after_prefix(&self) -> Option<ObjectKey> {
        let mut out = self.0.clone();
        while matches!(out.last(), Some(&0xFF)) {
            out.pop();
        }
        let last = out.last_mut()?;
        *last += 1;
        Some(ObjectKey(out))
    }
}

impl fmt::Debug for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "ObjectKey({s:?})"),
            Err(_) => write!(f, "ObjectKey(0x{})", hex::encode(&self.0)),
        }
    }
}

impl From<&str> for ObjectKey {
    fn from(s: &str) -> Self {
        ObjectKey(s.as_bytes().to_vec())
    }
}

/// Object row version. Versions are positive; zero is reserved and negative
/// one stands for "no version" in cursor arithmetic.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct Version(pub i64);

impl Version {
    /// Cursor sentinel: no version.
    pub const NONE: Version = Version(-1);
    /// Saturating upper bound for version cursors.
    pub const MAX: Version = Version(i64::MAX);

    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }

    pub fn next(&self) -> Version {
        Version(self.0 + 1)
    }
}

/// Object row status. `Prefix` is synthetic and only ever appears on listing
/// entries, never in storage.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ObjectStatus {
    Pending,
    CommittedUnversioned,
    CommittedVersioned,
    DeleteMarkerUnversioned,
    DeleteMarkerVersioned,
    Prefix,
}

impl ObjectStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, ObjectStatus::Pending)
    }

    pub fn is_committed(&self) -> bool {
        matches!(
            self,
            ObjectStatus::CommittedUnversioned | ObjectStatus::CommittedVersioned
        )
    }

    pub fn is_delete_marker(&self) -> bool {
        matches!(
            self,
            ObjectStatus::DeleteMarkerUnversioned | ObjectStatus::DeleteMarkerVersioned
        )
    }

    /// Unversioned rows are unique per key; committed or marker.
    pub fn is_unversioned(&self) -> bool {
        matches!(
            self,
            ObjectStatus::CommittedUnversioned | ObjectStatus::DeleteMarkerUnversioned
        )
    }

    /// Committed or delete-marker rows participate in visible listings.
    pub fn is_visible(&self) -> bool {
        self.is_committed() || self.is_delete_marker()
    }

    pub fn to_db(self) -> i64 {
        match self {
            ObjectStatus::Pending => 1,
            ObjectStatus::CommittedUnversioned => 3,
            ObjectStatus::CommittedVersioned => 4,
            ObjectStatus::DeleteMarkerUnversioned => 5,
            ObjectStatus::DeleteMarkerVersioned => 6,
            ObjectStatus::Prefix => 7,
        }
    }

    pub fn from_db(raw: i64) -> Result<Self> {
        match raw {
            1 => Ok(ObjectStatus::Pending),
            3 => Ok(ObjectStatus::CommittedUnversioned),
            4 => Ok(ObjectStatus::CommittedVersioned),
            5 => Ok(ObjectStatus::DeleteMarkerUnversioned),
            6 => Ok(ObjectStatus::DeleteMarkerVersioned),
            _ => Err(MetabaseError::Encoding(format!("object status {raw}"))),
        }
    }
}

/// Segment coordinate within a stream: `(part, index)` packed into 64 bits
/// with the part in the high half, so the packed integer orders the same way
/// as the pair.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct SegmentPosition {
    pub part: u32,
    pub index: u32,
}

impl SegmentPosition {
    pub fn new(part: u32, index: u32) -> Self {
        SegmentPosition { part, index }
    }

    pub fn encode(&self) -> u64 {
        (u64::from(self.part) << 32) | u64::from(self.index)
    }

    pub fn decode(raw: u64) -> Self {
        SegmentPosition {
            part: (raw >> 32) as u32,
            index: raw as u32,
        }
    }
}

/// The user-visible coordinate of an object, minus its version.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ObjectLocation {
    pub project_id: ProjectId,
    pub bucket_name: BucketName,
    pub object_key: ObjectKey,
}

impl ObjectLocation {
    pub fn verify(&self) -> Result<()> {
        if self.project_id.is_zero() {
            return Err(MetabaseError::invalid("project id missing"));
        }
        if self.bucket_name.is_empty() {
            return Err(MetabaseError::invalid("bucket name missing"));
        }
        if self.object_key.is_empty() {
            return Err(MetabaseError::invalid("object key missing"));
        }
        Ok(())
    }
}

/// One specific version of an object, the coordinate every segment operation
/// works against.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ObjectStream {
    pub location: ObjectLocation,
    pub version: Version,
    pub stream_id: StreamId,
}

impl ObjectStream {
    pub fn verify(&self) -> Result<()> {
        self.location.verify()?;
        if !self.version.is_valid() {
            return Err(MetabaseError::invalid("version invalid"));
        }
        if self.stream_id.is_zero() {
            return Err(MetabaseError::invalid("stream id missing"));
        }
        Ok(())
    }
}

/// Opaque encrypted payload attached to an object. The engine never looks
/// inside; it only enforces that the pieces arrive consistently.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct EncryptedUserData {
    pub encrypted_metadata: Option<Bytes>,
    pub encrypted_metadata_nonce: Option<Bytes>,
    pub encrypted_metadata_encrypted_key: Option<Bytes>,
    pub encrypted_etag: Option<Bytes>,
}

impl EncryptedUserData {
    pub fn is_empty(&self) -> bool {
        self.encrypted_metadata.is_none()
            && self.encrypted_metadata_nonce.is_none()
            && self.encrypted_metadata_encrypted_key.is_none()
            && self.encrypted_etag.is_none()
    }

    /// Metadata and its nonce/key must arrive together.
    pub fn verify(&self) -> Result<()> {
        let has_meta = self.encrypted_metadata.is_some();
        let has_nonce = self.encrypted_metadata_nonce.is_some();
        let has_key = self.encrypted_metadata_encrypted_key.is_some();
        if has_meta != has_nonce || has_meta != has_key {
            return Err(MetabaseError::invalid(
                "encrypted metadata nonce and key must be set together with metadata",
            ));
        }
        Ok(())
    }
}

/// A full object row.
#[derive(Clone, Debug)]
pub struct Object {
    pub stream: ObjectStream,
    pub status: ObjectStatus,
    pub created_at: OffsetDateTime,
    pub expires_at: Option<OffsetDateTime>,
    /// Only meaningful while pending.
    pub zombie_deletion_deadline: Option<OffsetDateTime>,
    pub encryption: EncryptionParameters,
    pub user_data: EncryptedUserData,
    pub segment_count: i32,
    pub total_plain_size: i64,
    pub total_encrypted_size: i64,
    /// Common plain size of all segments except possibly the last; -1 when
    /// the segments are heterogeneous.
    pub fixed_segment_size: i64,
    pub retention: Retention,
    pub legal_hold: bool,
}

impl Object {
    pub fn location(&self) -> &ObjectLocation {
        &self.stream.location
    }

    pub fn version(&self) -> Version {
        self.stream.version
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream.stream_id
    }
}

/// A full segment row. A segment is either inline or remote; the unused
/// family of columns stays empty.
#[derive(Clone, Debug)]
pub struct Segment {
    pub stream_id: StreamId,
    pub position: SegmentPosition,
    pub created_at: OffsetDateTime,
    /// Mirrors the owning object when known.
    pub expires_at: Option<OffsetDateTime>,
    pub root_piece_id: Option<PieceId>,
    pub redundancy: RedundancyScheme,
    pub remote_alias_pieces: Option<AliasPieces>,
    pub placement: Placement,
    pub encrypted_key_nonce: Option<Bytes>,
    pub encrypted_key: Option<Bytes>,
    pub encrypted_etag: Option<Bytes>,
    pub encrypted_size: i32,
    pub plain_offset: i64,
    pub plain_size: i32,
    pub inline_data: Option<Bytes>,
}

impl Segment {
    pub fn is_inline(&self) -> bool {
        self.inline_data.is_some()
    }

    pub fn is_remote(&self) -> bool {
        self.remote_alias_pieces.is_some()
    }
}

/// Constraint tag restricting which nodes may hold a segment's pieces.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Placement(pub u16);

/// One entry produced by the listing engine. For synthesized common-prefix
/// entries only `object_key`, `status`, and `is_prefix` are meaningful.
#[derive(Clone, Debug)]
pub struct ObjectEntry {
    pub is_prefix: bool,
    pub object_key: ObjectKey,
    pub version: Version,
    pub stream_id: StreamId,
    pub status: ObjectStatus,
    pub created_at: Option<OffsetDateTime>,
    pub expires_at: Option<OffsetDateTime>,
    pub segment_count: i32,
    pub total_plain_size: i64,
    pub total_encrypted_size: i64,
    pub fixed_segment_size: i64,
    pub encryption: EncryptionParameters,
    pub user_data: EncryptedUserData,
}

impl ObjectEntry {
    pub(crate) fn prefix(object_key: ObjectKey) -> Self {
        ObjectEntry {
            is_prefix: true,
            object_key,
            version: Version::NONE,
            stream_id: StreamId(Uuid::nil()),
            status: ObjectStatus::Prefix,
            created_at: None,
            expires_at: None,
            segment_count: 0,
            total_plain_size: 0,
            total_encrypted_size: 0,
            fixed_segment_size: 0,
            encryption: EncryptionParameters::default(),
            user_data: EncryptedUserData::default(),
        }
    }
}
