//! Pending streams of a single key, in stream-id order with an exclusive
//! cursor. Used by the multipart upload listing.

use std::collections::VecDeque;

use crate::db::Metabase;
use crate::error::Result;
use crate::model::{Object, ObjectLocation, StreamId};

#[derive(Clone, Debug)]
pub struct IteratePendingObjectsByKey {
    pub location: ObjectLocation,
    /// Exclusive stream-id cursor.
    pub cursor: Option<StreamId>,
    /// Rows per fetch; zero takes the configured default.
    pub batch_size: usize,
}

pub struct PendingObjectsIterator<'a> {
    db: &'a Metabase,
    location: ObjectLocation,
    cursor: Option<StreamId>,
    batch_size: usize,
    batch: VecDeque<Object>,
    last_fetch_full: bool,
    started: bool,
}

impl<'a> PendingObjectsIterator<'a> {
    pub(crate) fn new(db: &'a Metabase, opts: &IteratePendingObjectsByKey) -> Result<Self> {
        opts.location.verify()?;
        let batch_size = if opts.batch_size == 0 {
            db.config().list_batch_size
        } else {
            opts.batch_size
        };
        Ok(PendingObjectsIterator {
            db,
            location: opts.location.clone(),
            cursor: opts.cursor,
            batch_size,
            batch: VecDeque::new(),
            last_fetch_full: false,
            started: false,
        })
    }

    pub fn next_entry(&mut self) -> Result<Option<Object>> {
        if self.batch.is_empty() {
            if self.started && !self.last_fetch_full {
                return Ok(None);
            }
            let rows = self.db.adapter().list_pending_by_key(
                &self.location,
                self.cursor,
                self.batch_size,
            )?;
            self.started = true;
            self.last_fetch_full = rows.len() == self.batch_size;
            if let Some(last) = rows.last() {
                self.cursor = Some(last.stream_id());
            }
            self.batch = rows.into();
        }
        match self.batch.pop_front() {
            Some(object) => Ok(Some(object)),
            None => Ok(None),
        }
    }
}
