//! Segment lifecycle: the begin/commit pair for remote and inline content,
//! point reads with alias resolution, and the audit-facing piece-alteration
//! check.

use bytes::Bytes;
use time::OffsetDateTime;
use tracing::{debug, trace};

use crate::adapter::TransactionOptions;
use crate::db::Metabase;
use crate::error::{MetabaseError, Result};
use crate::model::{
    ObjectStream, PieceId, Pieces, Placement, RedundancyScheme, Segment, SegmentPosition, StreamId,
};

/// Reserve a segment slot. Validation only; no row is written.
#[derive(Clone, Debug)]
pub struct BeginSegment {
    pub stream: ObjectStream,
    pub position: SegmentPosition,
    pub root_piece_id: PieceId,
    pub pieces: Pieces,
}

/// Publish a remote segment under a pending (or, for the single-call upload
/// path, a not-yet-committed) stream.
#[derive(Clone, Debug)]
pub struct CommitSegment {
    pub stream: ObjectStream,
    pub position: SegmentPosition,
    pub root_piece_id: PieceId,
    pub pieces: Pieces,
    pub redundancy: RedundancyScheme,
    pub placement: Placement,
    pub encrypted_key_nonce: Option<Bytes>,
    pub encrypted_key: Option<Bytes>,
    pub encrypted_etag: Option<Bytes>,
    pub encrypted_size: i32,
    pub plain_size: i32,
    pub plain_offset: i64,
    /// TTL applied when the pending row is not consulted.
    pub expires_at: Option<OffsetDateTime>,
    /// Skip the pending-row requirement for the single-call direct upload
    /// path. A committed row already carrying this stream id still rejects
    /// the write, so a retried upload cannot attach segments to a finished
    /// object.
    pub skip_pending_object: bool,
}

/// Publish an inline segment.
#[derive(Clone, Debug)]
pub struct CommitInlineSegment {
    pub stream: ObjectStream,
    pub position: SegmentPosition,
    pub encrypted_key_nonce: Option<Bytes>,
    pub encrypted_key: Option<Bytes>,
    pub encrypted_etag: Option<Bytes>,
    pub plain_size: i32,
    pub plain_offset: i64,
    pub inline_data: Bytes,
}

/// Compare a segment's stored piece list against the caller's copy.
#[derive(Clone, Debug)]
pub struct CheckSegmentPiecesAlteration {
    pub stream_id: StreamId,
    pub position: SegmentPosition,
    pub pieces: Pieces,
}

/// One segment with its aliases resolved back to node ids.
#[derive(Clone, Debug)]
pub struct SegmentDetail {
    pub segment: Segment,
    /// Empty for inline segments.
    pub pieces: Pieces,
}

#[derive(Clone, Debug)]
pub struct ListSegments {
    pub stream_id: StreamId,
    pub cursor: Option<SegmentPosition>,
    pub limit: usize,
}

#[derive(Clone, Debug)]
pub struct ListSegmentsResult {
    pub segments: Vec<Segment>,
    pub more: bool,
}

impl Metabase {
    /// Checks the upload can proceed; the authoritative gate runs at
    /// CommitSegment.
    pub fn begin_segment(&self, opts: BeginSegment) -> Result<()> {
        opts.stream.verify()?;
        if opts.root_piece_id.is_zero() {
            return Err(MetabaseError::invalid("root piece id missing"));
        }
        opts.pieces.verify()?;
        if !self.pending_object_exists(&opts.stream)? {
            return Err(MetabaseError::PendingObjectMissing);
        }
        trace!(position = opts.position.encode(), "segment.begin");
        Ok(())
    }

    pub fn commit_segment(&self, opts: CommitSegment) -> Result<()> {
        opts.stream.verify()?;
        if opts.root_piece_id.is_zero() {
            return Err(MetabaseError::invalid("root piece id missing"));
        }
        opts.pieces.verify()?;
        if opts.redundancy.is_zero() {
            return Err(MetabaseError::invalid("redundancy is missing"));
        }
        if opts.pieces.len() < opts.redundancy.optimal_shares as usize {
            return Err(MetabaseError::invalid(format!(
                "number of pieces is less than redundancy optimal shares value ({} < {})",
                opts.pieces.len(),
                opts.redundancy.optimal_shares
            )));
        }
        self.verify_segment_sizes(opts.encrypted_size, opts.plain_size, opts.plain_offset)?;
        verify_segment_keys(&opts.encrypted_key, &opts.encrypted_key_nonce)?;

        let alias_pieces = self.aliases.ensure_pieces_to_aliases(&opts.pieces)?;
        let now = OffsetDateTime::now_utc();

        self.run_tx(&TransactionOptions::default(), |tx| {
            let expires_at = if opts.skip_pending_object {
                if tx
                    .get_committed_by_stream(&opts.stream.location, opts.stream.stream_id)?
                    .is_some()
                {
                    return Err(MetabaseError::ObjectAlreadyExists);
                }
                opts.expires_at
            } else {
                let object = tx
                    .get_pending_object(&opts.stream)?
                    .ok_or(MetabaseError::PendingObjectMissing)?;
                object.expires_at
            };
            tx.upsert_segment(&Segment {
                stream_id: opts.stream.stream_id,
                position: opts.position,
                created_at: now,
                expires_at,
                root_piece_id: Some(opts.root_piece_id),
                redundancy: opts.redundancy,
                remote_alias_pieces: Some(alias_pieces.clone()),
                placement: opts.placement,
                encrypted_key_nonce: opts.encrypted_key_nonce.clone(),
                encrypted_key: opts.encrypted_key.clone(),
                encrypted_etag: opts.encrypted_etag.clone(),
                encrypted_size: opts.encrypted_size,
                plain_offset: opts.plain_offset,
                plain_size: opts.plain_size,
                inline_data: None,
            })
        })?;
        debug!(position = opts.position.encode(), "segment.commit");
        Ok(())
    }

    pub fn commit_inline_segment(&self, opts: CommitInlineSegment) -> Result<()> {
        opts.stream.verify()?;
        if opts.inline_data.len() > i32::MAX as usize {
            return Err(MetabaseError::invalid("inline data too large"));
        }
        let encrypted_size = opts.inline_data.len() as i32;
        self.verify_segment_sizes(encrypted_size, opts.plain_size, opts.plain_offset)?;
        verify_segment_keys(&opts.encrypted_key, &opts.encrypted_key_nonce)?;

        let now = OffsetDateTime::now_utc();
        self.run_tx(&TransactionOptions::default(), |tx| {
            let object = tx
                .get_pending_object(&opts.stream)?
                .ok_or(MetabaseError::PendingObjectMissing)?;
            tx.upsert_segment(&Segment {
                stream_id: opts.stream.stream_id,
                position: opts.position,
                created_at: now,
                expires_at: object.expires_at,
                root_piece_id: None,
                redundancy: RedundancyScheme::default(),
                remote_alias_pieces: None,
                placement: Placement::default(),
                encrypted_key_nonce: opts.encrypted_key_nonce.clone(),
                encrypted_key: opts.encrypted_key.clone(),
                encrypted_etag: opts.encrypted_etag.clone(),
                encrypted_size,
                plain_offset: opts.plain_offset,
                plain_size: opts.plain_size,
                inline_data: Some(opts.inline_data.clone()),
            })
        })?;
        debug!(position = opts.position.encode(), "segment.commit_inline");
        Ok(())
    }

    /// Point read with alias resolution for the data path.
    pub fn get_segment_by_position(
        &self,
        stream_id: StreamId,
        position: SegmentPosition,
    ) -> Result<SegmentDetail> {
        if stream_id.is_zero() {
            return Err(MetabaseError::invalid("stream id missing"));
        }
        let segment = self
            .adapter()
            .get_segment(stream_id, position)?
            .ok_or(MetabaseError::SegmentNotFound)?;
        let pieces = match &segment.remote_alias_pieces {
            Some(alias_pieces) => self.aliases.pieces_from_aliases(alias_pieces)?,
            None => Pieces::default(),
        };
        Ok(SegmentDetail { segment, pieces })
    }

    /// Ascending position enumeration of one stream.
    pub fn list_segments(&self, opts: ListSegments) -> Result<ListSegmentsResult> {
        if opts.stream_id.is_zero() {
            return Err(MetabaseError::invalid("stream id missing"));
        }
        if opts.limit == 0 {
            return Err(MetabaseError::invalid("limit must be positive"));
        }
        let mut segments =
            self.adapter()
                .list_segments(opts.stream_id, opts.cursor, opts.limit + 1)?;
        let more = segments.len() > opts.limit;
        segments.truncate(opts.limit);
        Ok(ListSegmentsResult { segments, more })
    }

    /// Byte-for-byte comparison of the caller's piece list against storage,
    /// including ordering. Returns true when they differ.
    pub fn check_segment_pieces_alteration(
        &self,
        opts: CheckSegmentPiecesAlteration,
    ) -> Result<bool> {
        if opts.stream_id.is_zero() {
            return Err(MetabaseError::invalid("stream id missing"));
        }
        if opts.pieces.is_empty() {
            return Err(MetabaseError::invalid("pieces missing"));
        }
        let segment = self
            .adapter()
            .get_segment(opts.stream_id, opts.position)?
            .ok_or(MetabaseError::SegmentNotFound)?;
        let Some(alias_pieces) = &segment.remote_alias_pieces else {
            return Err(MetabaseError::invalid("segment is inline"));
        };
        let stored = self.aliases.pieces_from_aliases(alias_pieces)?;
        Ok(stored != opts.pieces)
    }

    fn verify_segment_sizes(
        &self,
        encrypted_size: i32,
        plain_size: i32,
        plain_offset: i64,
    ) -> Result<()> {
        if encrypted_size <= 0 {
            return Err(MetabaseError::invalid("encrypted size is negative or zero"));
        }
        if self.config.validate_plain_size {
            if plain_size <= 0 {
                return Err(MetabaseError::invalid("plain size is negative or zero"));
            }
        } else if plain_size < 0 {
            return Err(MetabaseError::invalid("plain size is negative"));
        }
        if plain_offset < 0 {
            return Err(MetabaseError::invalid("plain offset is negative"));
        }
        Ok(())
    }
}

fn verify_segment_keys(
    encrypted_key: &Option<Bytes>,
    encrypted_key_nonce: &Option<Bytes>,
) -> Result<()> {
    if encrypted_key.as_ref().map_or(true, |key| key.is_empty()) {
        return Err(MetabaseError::invalid("encrypted key is missing"));
    }
    if encrypted_key_nonce
        .as_ref()
        .map_or(true, |nonce| nonce.is_empty())
    {
        return Err(MetabaseError::invalid("encrypted key nonce is missing"));
    }
    Ok(())
}
