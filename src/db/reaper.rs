//! Background removal of abandoned state: pending rows past their zombie
//! deadline, and rows (plus orphaned segments) whose TTL has passed. Scans
//! are batched, and each batch commits in its own transaction so no pass
//! holds a long-running transaction.

use time::OffsetDateTime;
use tracing::{debug, info};

use crate::adapter::TransactionOptions;
use crate::db::Metabase;
use crate::error::Result;

/// Remove pending objects whose zombie deadline passed before
/// `deadline_before`.
#[derive(Clone, Debug)]
pub struct DeleteZombieObjects {
    pub deadline_before: OffsetDateTime,
    /// Rows per batch; zero takes the configured default.
    pub batch_size: usize,
}

/// Remove objects and segments whose TTL passed before `expired_before`.
#[derive(Clone, Debug)]
pub struct DeleteExpiredObjects {
    pub expired_before: OffsetDateTime,
    pub batch_size: usize,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ReapResult {
    pub objects_deleted: u64,
    pub segments_deleted: u64,
}

impl Metabase {
    pub fn delete_zombie_objects(&self, opts: DeleteZombieObjects) -> Result<ReapResult> {
        let batch_size = self.reaper_batch_size(opts.batch_size);
        let tx_opts = reaper_tx_options();
        let mut result = ReapResult::default();
        loop {
            let candidates = self
                .adapter()
                .find_zombie_objects(opts.deadline_before, batch_size)?;
            if candidates.is_empty() {
                break;
            }
            let batch = self.run_tx(&tx_opts, |tx| {
                let mut batch = ReapResult::default();
                for stream in &candidates {
                    // Re-check under the transaction: the upload may have
                    // committed since the scan.
                    let Some(object) = tx.get_pending_object(stream)? else {
                        continue;
                    };
                    let still_zombie = object
                        .zombie_deletion_deadline
                        .map_or(false, |deadline| deadline < opts.deadline_before);
                    if !still_zombie {
                        continue;
                    }
                    tx.delete_object(&stream.location, stream.version)?;
                    batch.segments_deleted += tx.delete_segments(stream.stream_id)? as u64;
                    batch.objects_deleted += 1;
                }
                Ok(batch)
            })?;
            result.objects_deleted += batch.objects_deleted;
            result.segments_deleted += batch.segments_deleted;
            debug!(
                objects = batch.objects_deleted,
                segments = batch.segments_deleted,
                "reaper.zombie.batch"
            );
            if candidates.len() < batch_size {
                break;
            }
        }
        info!(
            objects = result.objects_deleted,
            segments = result.segments_deleted,
            "reaper.zombie.done"
        );
        Ok(result)
    }

    pub fn delete_expired_objects(&self, opts: DeleteExpiredObjects) -> Result<ReapResult> {
        let batch_size = self.reaper_batch_size(opts.batch_size);
        let tx_opts = reaper_tx_options();
        let mut result = ReapResult::default();
        loop {
            let candidates = self
                .adapter()
                .find_expired_objects(opts.expired_before, batch_size)?;
            if candidates.is_empty() {
                break;
            }
            let batch = self.run_tx(&tx_opts, |tx| {
                let mut batch = ReapResult::default();
                for stream in &candidates {
                    if tx.delete_object(&stream.location, stream.version)?.is_some() {
                        batch.objects_deleted += 1;
                    }
                    batch.segments_deleted += tx.delete_segments(stream.stream_id)? as u64;
                }
                Ok(batch)
            })?;
            result.objects_deleted += batch.objects_deleted;
            result.segments_deleted += batch.segments_deleted;
            debug!(
                objects = batch.objects_deleted,
                segments = batch.segments_deleted,
                "reaper.expired.batch"
            );
            if candidates.len() < batch_size {
                break;
            }
        }

        // Orphaned segments can outlive their object row after a partial
        // cleanup; their own TTL catches them.
        loop {
            let candidates = self
                .adapter()
                .find_expired_segments(opts.expired_before, batch_size)?;
            if candidates.is_empty() {
                break;
            }
            let removed = self.run_tx(&tx_opts, |tx| {
                let mut removed = 0u64;
                for (stream_id, position) in &candidates {
                    removed += tx.delete_segments_at(*stream_id, &[*position])? as u64;
                }
                Ok(removed)
            })?;
            result.segments_deleted += removed;
            debug!(segments = removed, "reaper.expired.segments_batch");
            if candidates.len() < batch_size {
                break;
            }
        }
        info!(
            objects = result.objects_deleted,
            segments = result.segments_deleted,
            "reaper.expired.done"
        );
        Ok(result)
    }

    fn reaper_batch_size(&self, requested: usize) -> usize {
        if requested == 0 {
            self.config.reaper_batch_size
        } else {
            requested
        }
    }
}

fn reaper_tx_options() -> TransactionOptions {
    TransactionOptions {
        max_commit_delay: None,
        exclude_from_change_streams: true,
    }
}
