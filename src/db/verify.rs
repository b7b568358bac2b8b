//! Streaming scans for the audit subsystem and approximate table
//! statistics.

use time::Duration;

use crate::adapter::{TableStats, VerifyCursor};
use crate::db::Metabase;
use crate::error::{MetabaseError, Result};
use crate::model::{AliasPieces, PieceId, Placement, RedundancyScheme, SegmentPosition, StreamId};

/// Page request for the remote-segment verification stream. The cursor is
/// exclusive on `(stream_id, position)`.
#[derive(Clone, Debug)]
pub struct ListVerifySegments {
    pub cursor_stream_id: Option<StreamId>,
    pub cursor_position: SegmentPosition,
    pub limit: usize,
    /// Staleness hint for backends that can read from a slightly old
    /// snapshot; others ignore it.
    pub as_of_system_interval: Option<Duration>,
}

/// The slice of a remote segment the audit path needs.
#[derive(Clone, Debug)]
pub struct VerifySegment {
    pub stream_id: StreamId,
    pub position: SegmentPosition,
    pub root_piece_id: PieceId,
    pub redundancy: RedundancyScheme,
    pub placement: Placement,
    pub alias_pieces: AliasPieces,
}

#[derive(Clone, Debug)]
pub struct ListVerifySegmentsResult {
    pub segments: Vec<VerifySegment>,
}

/// Statistics request; the interval is a staleness hint like the one above.
#[derive(Clone, Copy, Debug, Default)]
pub struct GetTableStats {
    pub as_of_system_interval: Option<Duration>,
}

impl Metabase {
    /// Remote segments in `(stream_id, position)` order; inline segments are
    /// skipped.
    pub fn list_verify_segments(
        &self,
        opts: &ListVerifySegments,
    ) -> Result<ListVerifySegmentsResult> {
        if opts.limit == 0 {
            return Err(MetabaseError::invalid("limit must be positive"));
        }
        let rows = self.adapter().list_verify_segments(
            &VerifyCursor {
                stream_id: opts.cursor_stream_id,
                position: opts.cursor_position,
            },
            opts.limit,
        )?;
        let mut segments = Vec::with_capacity(rows.len());
        for segment in rows {
            let root_piece_id = segment.root_piece_id.ok_or(MetabaseError::Encoding(
                "remote segment missing root piece id".into(),
            ))?;
            let alias_pieces = segment.remote_alias_pieces.ok_or(MetabaseError::Encoding(
                "remote segment missing alias pieces".into(),
            ))?;
            segments.push(VerifySegment {
                stream_id: segment.stream_id,
                position: segment.position,
                root_piece_id,
                redundancy: segment.redundancy,
                placement: segment.placement,
                alias_pieces,
            });
        }
        Ok(ListVerifySegmentsResult { segments })
    }

    /// Approximate segment count; backends with cached statistics may serve
    /// from them.
    pub fn get_table_stats(&self, _opts: GetTableStats) -> Result<TableStats> {
        self.adapter().table_stats()
    }
}
