//! CommitObject and the single-call inline upload: offset finalization,
//! multipart validation, conditional writes, and the unversioned overwrite
//! protocol.

use std::collections::BTreeMap;

use bytes::Bytes;
use time::OffsetDateTime;
use tracing::debug;

use crate::adapter::{PrecommitConstraint, SegmentOffsetUpdate, TransactionOptions};
use crate::db::precommit::{
    check_if_none_match, committed_version, resolve_unversioned_incumbent, IncumbentAction,
};
use crate::db::{Config, Metabase};
use crate::error::{MetabaseError, Result};
use crate::model::verify_lock_and_expiry;
use crate::model::{
    EncryptedUserData, EncryptionParameters, Object, ObjectLocation, ObjectStatus, ObjectStream,
    Placement, RedundancyScheme, Retention, Segment, SegmentPosition, StreamId,
};

/// Conditional-write predicate. Only the "any existing committed object
/// blocks the write" form is supported.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IfNoneMatch {
    All,
}

/// Finalize a multi-stage upload.
#[derive(Clone, Debug)]
pub struct CommitObject {
    pub stream: ObjectStream,
    /// Replaces the metadata captured at begin when set.
    pub override_user_data: Option<EncryptedUserData>,
    pub override_encryption: Option<EncryptionParameters>,
    /// Fail with `PermissionDenied` instead of deleting existing state.
    pub disallow_delete: bool,
    pub versioned: bool,
    pub if_none_match: Option<IfNoneMatch>,
    /// Commit only the listed positions, deleting the rest of the pending
    /// segments. Positions must be strictly ascending.
    pub only_segments: Option<Vec<SegmentPosition>>,
    pub max_commit_delay: Option<time::Duration>,
}

/// The single inline segment carried by a one-call upload.
#[derive(Clone, Debug)]
pub struct InlineSegmentSpec {
    pub encrypted_key_nonce: Option<Bytes>,
    pub encrypted_key: Option<Bytes>,
    pub encrypted_etag: Option<Bytes>,
    pub plain_size: i32,
    pub inline_data: Bytes,
}

/// Upload a small object in one call: no pending row ever exists.
#[derive(Clone, Debug)]
pub struct CommitInlineObject {
    pub location: ObjectLocation,
    pub stream_id: StreamId,
    pub encryption: EncryptionParameters,
    pub user_data: EncryptedUserData,
    pub expires_at: Option<OffsetDateTime>,
    /// Direct-upload mode applies lock state at commit.
    pub retention: Retention,
    pub legal_hold: bool,
    pub versioned: bool,
    pub if_none_match: Option<IfNoneMatch>,
    pub disallow_delete: bool,
    pub segment: InlineSegmentSpec,
}

/// Aggregates derived from the final segment list.
struct SegmentTotals {
    updates: Vec<SegmentOffsetUpdate>,
    segment_count: i32,
    total_plain_size: i64,
    total_encrypted_size: i64,
    fixed_segment_size: i64,
}

impl Metabase {
    pub fn commit_object(&self, opts: CommitObject) -> Result<Object> {
        opts.stream.verify()?;
        if let Some(user_data) = &opts.override_user_data {
            user_data.verify()?;
        }
        if let Some(encryption) = &opts.override_encryption {
            encryption.verify()?;
        }
        if let Some(positions) = &opts.only_segments {
            for pair in positions.windows(2) {
                if pair[0] >= pair[1] {
                    return Err(MetabaseError::FailedPrecondition(
                        "segments are not in ascending order".into(),
                    ));
                }
            }
        }

        let now = OffsetDateTime::now_utc();
        let tx_opts = TransactionOptions {
            max_commit_delay: opts.max_commit_delay,
            exclude_from_change_streams: false,
        };
        let object = self.run_tx(&tx_opts, |tx| {
            let mut constraint = Metabase::pending_ref(&opts.stream);
            constraint.include_pending_segments = true;
            constraint.include_highest = true;
            constraint.include_unversioned = !opts.versioned;
            constraint.include_highest_visible =
                !opts.versioned || opts.if_none_match.is_some();
            let info = tx.precommit_query(&constraint)?;

            let pending = info
                .pending
                .clone()
                .ok_or(MetabaseError::PendingObjectMissing)?;
            check_if_none_match(opts.if_none_match, &info)?;
            let action = resolve_unversioned_incumbent(
                tx,
                &info,
                opts.versioned,
                opts.disallow_delete,
                now,
            )?;

            let (finals, dropped) =
                partition_segments(&info.pending_segments, opts.only_segments.as_deref())?;
            validate_parts(&finals, &self.config)?;
            let totals = finalize_offsets(&finals);

            let mut committed = pending.clone();
            committed.status = if opts.versioned {
                ObjectStatus::CommittedVersioned
            } else {
                ObjectStatus::CommittedUnversioned
            };
            committed.zombie_deletion_deadline = None;
            committed.segment_count = totals.segment_count;
            committed.total_plain_size = totals.total_plain_size;
            committed.total_encrypted_size = totals.total_encrypted_size;
            committed.fixed_segment_size = totals.fixed_segment_size;
            if let Some(user_data) = &opts.override_user_data {
                committed.user_data = user_data.clone();
            }
            if let Some(encryption) = opts.override_encryption {
                committed.encryption = encryption;
            }
            verify_lock_and_expiry(
                committed.expires_at,
                &committed.retention,
                committed.legal_hold,
            )?;

            match &action {
                IncumbentAction::Reuse(incumbent) => {
                    committed.stream.version = incumbent.version();
                    tx.delete_object(&opts.stream.location, pending.version())?;
                    tx.update_object(&committed)?;
                }
                _ => {
                    committed.stream.version =
                        committed_version(pending.version(), info.highest_version);
                    tx.delete_object(&opts.stream.location, pending.version())?;
                    tx.insert_object(&committed)?;
                }
            }

            if !dropped.is_empty() {
                tx.delete_segments_at(opts.stream.stream_id, &dropped)?;
            }
            tx.update_segment_offsets(opts.stream.stream_id, &totals.updates)?;
            Ok(committed)
        })?;
        debug!(
            version = object.version().0,
            segments = object.segment_count,
            versioned = opts.versioned,
            "object.commit"
        );
        Ok(object)
    }

    pub fn commit_inline_object(&self, opts: CommitInlineObject) -> Result<Object> {
        opts.location.verify()?;
        if opts.stream_id.is_zero() {
            return Err(MetabaseError::invalid("stream id missing"));
        }
        opts.encryption.verify()?;
        opts.user_data.verify()?;
        verify_lock_and_expiry(opts.expires_at, &opts.retention, opts.legal_hold)?;
        if opts.segment.inline_data.len() > i32::MAX as usize {
            return Err(MetabaseError::invalid("inline data too large"));
        }
        let encrypted_size = opts.segment.inline_data.len() as i32;
        if encrypted_size == 0 && self.config.validate_plain_size {
            return Err(MetabaseError::invalid("inline data is empty"));
        }
        if self.config.validate_plain_size && opts.segment.plain_size <= 0 {
            return Err(MetabaseError::invalid("plain size is negative or zero"));
        }

        let now = OffsetDateTime::now_utc();
        let object = self.run_tx(&TransactionOptions::default(), |tx| {
            let mut constraint = PrecommitConstraint::new(&opts.location);
            constraint.include_highest = true;
            constraint.include_unversioned = !opts.versioned;
            constraint.include_highest_visible =
                !opts.versioned || opts.if_none_match.is_some();
            let info = tx.precommit_query(&constraint)?;

            check_if_none_match(opts.if_none_match, &info)?;
            let action = resolve_unversioned_incumbent(
                tx,
                &info,
                opts.versioned,
                opts.disallow_delete,
                now,
            )?;

            let version = match &action {
                IncumbentAction::Reuse(incumbent) => incumbent.version(),
                _ => info.highest_version.next(),
            };
            let committed = Object {
                stream: ObjectStream {
                    location: opts.location.clone(),
                    version,
                    stream_id: opts.stream_id,
                },
                status: if opts.versioned {
                    ObjectStatus::CommittedVersioned
                } else {
                    ObjectStatus::CommittedUnversioned
                },
                created_at: now,
                expires_at: opts.expires_at,
                zombie_deletion_deadline: None,
                encryption: opts.encryption,
                user_data: opts.user_data.clone(),
                segment_count: 1,
                total_plain_size: i64::from(opts.segment.plain_size),
                total_encrypted_size: i64::from(encrypted_size),
                fixed_segment_size: i64::from(opts.segment.plain_size),
                retention: opts.retention,
                legal_hold: opts.legal_hold,
            };
            match &action {
                IncumbentAction::Reuse(_) => tx.update_object(&committed)?,
                _ => tx.insert_object(&committed)?,
            }
            tx.insert_segments(&[Segment {
                stream_id: opts.stream_id,
                position: SegmentPosition::new(0, 0),
                created_at: now,
                expires_at: opts.expires_at,
                root_piece_id: None,
                redundancy: RedundancyScheme::default(),
                remote_alias_pieces: None,
                placement: Placement::default(),
                encrypted_key_nonce: opts.segment.encrypted_key_nonce.clone(),
                encrypted_key: opts.segment.encrypted_key.clone(),
                encrypted_etag: opts.segment.encrypted_etag.clone(),
                encrypted_size,
                plain_offset: 0,
                plain_size: opts.segment.plain_size,
                inline_data: Some(opts.segment.inline_data.clone()),
            }])?;
            Ok(committed)
        })?;
        debug!(version = object.version().0, "object.commit_inline");
        Ok(object)
    }
}

/// Splits the pending segments into the committed set and the positions to
/// drop. In specific-segments mode every listed position must exist.
fn partition_segments(
    pending: &[Segment],
    only: Option<&[SegmentPosition]>,
) -> Result<(Vec<Segment>, Vec<SegmentPosition>)> {
    let Some(only) = only else {
        return Ok((pending.to_vec(), Vec::new()));
    };
    let mut finals = Vec::with_capacity(only.len());
    let mut dropped = Vec::new();
    for segment in pending {
        if only.binary_search(&segment.position).is_ok() {
            finals.push(segment.clone());
        } else {
            dropped.push(segment.position);
        }
    }
    if finals.len() != only.len() {
        return Err(MetabaseError::FailedPrecondition(
            "segments and querySegments do not match".into(),
        ));
    }
    Ok((finals, dropped))
}

/// Multipart shape rules: bounded part count, and every part but the
/// largest-numbered must reach the minimum size. Part numbering need not be
/// contiguous.
fn validate_parts(segments: &[Segment], config: &Config) -> Result<()> {
    let mut part_sizes: BTreeMap<u32, i64> = BTreeMap::new();
    for segment in segments {
        *part_sizes.entry(segment.position.part).or_default() +=
            i64::from(segment.plain_size);
    }
    if part_sizes.len() > config.max_number_of_parts {
        return Err(MetabaseError::FailedPrecondition(format!(
            "exceeded maximum number of parts: {}",
            config.max_number_of_parts
        )));
    }
    if part_sizes.len() > 1 {
        let last_part = part_sizes
            .keys()
            .next_back()
            .copied()
            .unwrap_or_default();
        for (part, size) in &part_sizes {
            if *part != last_part && *size < config.min_part_size {
                return Err(MetabaseError::FailedPrecondition(format!(
                    "size of part number {part} is below minimum threshold, got: {size}, min: {}",
                    config.min_part_size
                )));
            }
        }
    }
    Ok(())
}

/// Assigns plain offsets in `(part, index)` order and derives the aggregate
/// columns.
fn finalize_offsets(segments: &[Segment]) -> SegmentTotals {
    let mut ordered: Vec<&Segment> = segments.iter().collect();
    ordered.sort_by_key(|segment| segment.position);

    let mut updates = Vec::with_capacity(ordered.len());
    let mut offset: i64 = 0;
    let mut total_encrypted: i64 = 0;
    let mut fixed_segment_size: i64 = 0;
    let mut fixed = true;
    for (index, segment) in ordered.iter().enumerate() {
        updates.push(SegmentOffsetUpdate {
            position: segment.position,
            plain_offset: offset,
            plain_size: segment.plain_size,
            encrypted_size: segment.encrypted_size,
        });
        offset += i64::from(segment.plain_size);
        total_encrypted += i64::from(segment.encrypted_size);
        let size = i64::from(segment.plain_size);
        if index == 0 {
            fixed_segment_size = size;
        } else if size != fixed_segment_size {
            // Only the last segment may fall short of the common size.
            if index != ordered.len() - 1 || size > fixed_segment_size {
                fixed = false;
            }
        }
    }
    if ordered.is_empty() {
        fixed_segment_size = 0;
    } else if !fixed {
        fixed_segment_size = -1;
    }
    SegmentTotals {
        updates,
        segment_count: ordered.len() as i32,
        total_plain_size: offset,
        total_encrypted_size: total_encrypted,
        fixed_segment_size,
    }
}
