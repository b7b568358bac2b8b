//! The stateful listing iterator. Each batch reads under its own short-lived
//! snapshot with the cursor carrying state across batches; prefix emission
//! rewrites the lower bound so no key under an emitted prefix is ever
//! visited.

use std::collections::VecDeque;

use crate::adapter::{BatchBound, BatchQuery, VersionOrder};
use crate::db::list::IterateObjects;
use crate::db::Metabase;
use crate::error::{MetabaseError, Result};
use crate::model::{BucketName, Object, ObjectEntry, ObjectKey, ProjectId};

#[derive(Clone, Copy, Debug)]
pub(crate) struct Projection {
    pub custom_metadata: bool,
    pub system_metadata: bool,
    pub etag: bool,
}

pub struct ObjectsIterator<'a> {
    db: &'a Metabase,
    project_id: ProjectId,
    bucket_name: BucketName,
    order: VersionOrder,
    recursive: bool,
    delimiter: Vec<u8>,
    prefix: ObjectKey,
    prefix_limit: Option<ObjectKey>,
    pending: bool,
    latest_only: bool,
    batch_size: usize,
    projection: Projection,

    bound: BatchBound,
    batch: VecDeque<Object>,
    last_fetch_full: bool,
    need_fetch: bool,
    done: bool,
    /// Key whose versions are being skipped (descending latest-only).
    seen_key: Option<ObjectKey>,
    /// Latest candidate of the current key (ascending latest-only).
    held: Option<Object>,
}

impl<'a> ObjectsIterator<'a> {
    pub(crate) fn new(
        db: &'a Metabase,
        opts: &IterateObjects,
        order: VersionOrder,
    ) -> Result<Self> {
        if opts.project_id.is_zero() {
            return Err(MetabaseError::invalid("project id missing"));
        }
        if opts.bucket_name.is_empty() {
            return Err(MetabaseError::invalid("bucket name missing"));
        }
        let delimiter = opts
            .delimiter
            .clone()
            .unwrap_or_else(|| db.config().delimiter.clone());
        if delimiter.is_empty() {
            return Err(MetabaseError::invalid("delimiter missing"));
        }
        let batch_size = if opts.batch_size == 0 {
            db.config().list_batch_size
        } else {
            opts.batch_size
        };

        let prefix = opts.prefix.clone();
        let prefix_limit = if prefix.is_empty() {
            None
        } else {
            prefix.after_prefix()
        };

        let mut done = false;
        let mut bound = BatchBound::KeyInclusive(prefix.clone());
        if let Some(cursor) = &opts.cursor {
            if cursor.key >= prefix {
                bound = BatchBound::AfterKeyVersion(cursor.key.clone(), cursor.version);
                if !opts.recursive && cursor.key.starts_with(&prefix) {
                    if let Some(sub) = subprefix(&prefix, &delimiter, &cursor.key) {
                        // The cursor lies under an already-emitted prefix
                        // entry; resume past the whole group.
                        match sub.after_prefix() {
                            Some(next) => bound = BatchBound::KeyInclusive(next),
                            None => done = true,
                        }
                    }
                }
            }
        }

        Ok(ObjectsIterator {
            db,
            project_id: opts.project_id,
            bucket_name: opts.bucket_name.clone(),
            order,
            recursive: opts.recursive,
            delimiter,
            prefix,
            prefix_limit,
            pending: opts.pending,
            latest_only: !opts.all_versions && !opts.pending,
            batch_size,
            projection: Projection {
                custom_metadata: opts.include_custom_metadata,
                system_metadata: opts.include_system_metadata,
                etag: opts.include_etag,
            },
            bound,
            batch: VecDeque::new(),
            last_fetch_full: false,
            need_fetch: true,
            done,
            seen_key: None,
            held: None,
        })
    }

    /// The next listing entry, or `None` once the keyspace is exhausted.
    pub fn next_entry(&mut self) -> Result<Option<ObjectEntry>> {
        loop {
            if self.done {
                return Ok(self.take_held());
            }
            if self.batch.is_empty() {
                if self.need_fetch || self.last_fetch_full {
                    self.fill_batch()?;
                    if self.batch.is_empty() {
                        self.done = true;
                    }
                } else {
                    self.done = true;
                }
                continue;
            }

            let front_key = match self.batch.front() {
                Some(row) => row.location().object_key.clone(),
                None => continue,
            };
            if !self.recursive {
                if let Some(sub) = subprefix(&self.prefix, &self.delimiter, &front_key) {
                    if let Some(entry) = self.take_held() {
                        return Ok(Some(entry));
                    }
                    self.batch.clear();
                    match sub.after_prefix() {
                        Some(next) => {
                            self.bound = BatchBound::KeyInclusive(next);
                            self.need_fetch = true;
                        }
                        None => self.done = true,
                    }
                    return Ok(Some(ObjectEntry::prefix(sub)));
                }
            }

            let Some(row) = self.batch.pop_front() else {
                continue;
            };
            if !self.latest_only {
                return Ok(Some(self.entry_from(row)));
            }
            match self.order {
                VersionOrder::Descending => {
                    if self.seen_key.as_ref() == Some(&front_key) {
                        continue;
                    }
                    self.seen_key = Some(front_key);
                    if row.status.is_delete_marker() {
                        continue;
                    }
                    return Ok(Some(self.entry_from(row)));
                }
                VersionOrder::Ascending => match &self.held {
                    Some(held) if held.location().object_key == front_key => {
                        self.held = Some(row);
                    }
                    Some(_) => {
                        self.batch.push_front(row);
                        if let Some(entry) = self.take_held() {
                            return Ok(Some(entry));
                        }
                    }
                    None => self.held = Some(row),
                },
            }
        }
    }

    fn fill_batch(&mut self) -> Result<()> {
        let rows = self.db.adapter().list_objects_batch(&BatchQuery {
            project_id: self.project_id,
            bucket_name: self.bucket_name.clone(),
            start: self.bound.clone(),
            end_before: self.prefix_limit.clone(),
            order: self.order,
            pending_only: self.pending,
            limit: self.batch_size,
        })?;
        self.last_fetch_full = rows.len() == self.batch_size;
        if let Some(last) = rows.last() {
            self.bound = BatchBound::AfterKeyVersion(
                last.location().object_key.clone(),
                last.version(),
            );
        }
        self.batch = rows.into();
        self.need_fetch = false;
        Ok(())
    }

    fn take_held(&mut self) -> Option<ObjectEntry> {
        let held = self.held.take()?;
        if held.status.is_delete_marker() {
            return None;
        }
        Some(self.entry_from(held))
    }

    fn entry_from(&self, object: Object) -> ObjectEntry {
        entry_with_projection(object, self.projection)
    }
}

/// Synthesizes the common-prefix key covering `key`, when the substring
/// between the search prefix and the next delimiter exists.
pub(crate) fn subprefix(
    prefix: &ObjectKey,
    delimiter: &[u8],
    key: &ObjectKey,
) -> Option<ObjectKey> {
    let rest = key.as_bytes().strip_prefix(prefix.as_bytes())?;
    let at = rest
        .windows(delimiter.len())
        .position(|window| window == delimiter)?;
    Some(prefix.joined(&rest[..at + delimiter.len()]))
}

pub(crate) fn entry_with_projection(object: Object, projection: Projection) -> ObjectEntry {
    let mut entry = ObjectEntry {
        is_prefix: false,
        object_key: object.stream.location.object_key,
        version: object.stream.version,
        stream_id: object.stream.stream_id,
        status: object.status,
        created_at: None,
        expires_at: None,
        segment_count: 0,
        total_plain_size: 0,
        total_encrypted_size: 0,
        fixed_segment_size: 0,
        encryption: Default::default(),
        user_data: Default::default(),
    };
    if projection.system_metadata {
        entry.created_at = Some(object.created_at);
        entry.expires_at = object.expires_at;
        entry.segment_count = object.segment_count;
        entry.total_plain_size = object.total_plain_size;
        entry.total_encrypted_size = object.total_encrypted_size;
        entry.fixed_segment_size = object.fixed_segment_size;
        entry.encryption = object.encryption;
    }
    if projection.custom_metadata {
        entry.user_data.encrypted_metadata = object.user_data.encrypted_metadata;
        entry.user_data.encrypted_metadata_nonce = object.user_data.encrypted_metadata_nonce;
        entry.user_data.encrypted_metadata_encrypted_key =
            object.user_data.encrypted_metadata_encrypted_key;
    }
    if projection.etag {
        entry.user_data.encrypted_etag = object.user_data.encrypted_etag;
    }
    entry
}
