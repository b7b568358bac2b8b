//! The listing engine: versioned-aware descending iteration, the legacy
//! ascending iteration, delimiter grouping, and the paginated `list_objects`
//! front end.

mod iterator;
mod pending;

pub use iterator::ObjectsIterator;
pub use pending::{IteratePendingObjectsByKey, PendingObjectsIterator};

use crate::adapter::VersionOrder;
use crate::db::Metabase;
use crate::error::{MetabaseError, Result};
use crate::model::{BucketName, ObjectEntry, ObjectKey, ProjectId, Version};

/// Exclusive listing cursor: iteration resumes at the first row strictly
/// greater, in the iterator's ordering, than `(key, version)`. `Version(-1)`
/// and `Version::MAX` act as the before/after-everything sentinels for one
/// key, interpreted in the iterator's version order.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ListCursor {
    pub key: ObjectKey,
    pub version: Version,
}

/// Callback-free iteration request over one bucket.
#[derive(Clone, Debug)]
pub struct IterateObjects {
    pub project_id: ProjectId,
    pub bucket_name: BucketName,
    pub recursive: bool,
    pub prefix: ObjectKey,
    /// Defaults to the configured delimiter.
    pub delimiter: Option<Vec<u8>>,
    pub cursor: Option<ListCursor>,
    /// Rows per fetch; zero takes the configured default.
    pub batch_size: usize,
    /// Only pending rows; every pending stream of a key is emitted.
    pub pending: bool,
    /// All committed-or-marker rows instead of the newest non-marker per key.
    pub all_versions: bool,
    pub include_custom_metadata: bool,
    pub include_system_metadata: bool,
    pub include_etag: bool,
}

impl IterateObjects {
    pub fn new(project_id: ProjectId, bucket_name: BucketName) -> Self {
        IterateObjects {
            project_id,
            bucket_name,
            recursive: true,
            prefix: ObjectKey::default(),
            delimiter: None,
            cursor: None,
            batch_size: 0,
            pending: false,
            all_versions: false,
            include_custom_metadata: false,
            include_system_metadata: true,
            include_etag: false,
        }
    }
}

/// Paginated listing request.
#[derive(Clone, Debug)]
pub struct ListObjects {
    pub project_id: ProjectId,
    pub bucket_name: BucketName,
    pub recursive: bool,
    pub prefix: ObjectKey,
    pub delimiter: Option<Vec<u8>>,
    pub cursor: Option<ListCursor>,
    pub limit: usize,
    pub pending: bool,
    pub all_versions: bool,
    pub include_custom_metadata: bool,
    pub include_system_metadata: bool,
    pub include_etag: bool,
}

#[derive(Clone, Debug)]
pub struct ListObjectsResult {
    pub entries: Vec<ObjectEntry>,
    pub more: bool,
    /// Where the next page resumes; set only when `more`.
    pub next_cursor: Option<ListCursor>,
}

impl Metabase {
    /// The default, S3-compatible iterator: keys ascend, versions within a
    /// key descend so the newest lands first.
    pub fn iterate_objects_all_versions_with_status(
        &self,
        opts: &IterateObjects,
    ) -> Result<ObjectsIterator<'_>> {
        ObjectsIterator::new(self, opts, VersionOrder::Descending)
    }

    /// Legacy ordering kept behind its own entry point: versions within a
    /// key ascend.
    pub fn iterate_objects_all_versions_ascending(
        &self,
        opts: &IterateObjects,
    ) -> Result<ObjectsIterator<'_>> {
        ObjectsIterator::new(self, opts, VersionOrder::Ascending)
    }

    /// One page of listing entries plus the cursor of the next page.
    pub fn list_objects(&self, opts: &ListObjects) -> Result<ListObjectsResult> {
        if opts.limit == 0 {
            return Err(MetabaseError::invalid("limit must be positive"));
        }
        let iterate = IterateObjects {
            project_id: opts.project_id,
            bucket_name: opts.bucket_name.clone(),
            recursive: opts.recursive,
            prefix: opts.prefix.clone(),
            delimiter: opts.delimiter.clone(),
            cursor: opts.cursor.clone(),
            batch_size: (opts.limit + 1).min(self.config.list_batch_size),
            pending: opts.pending,
            all_versions: opts.all_versions,
            include_custom_metadata: opts.include_custom_metadata,
            include_system_metadata: opts.include_system_metadata,
            include_etag: opts.include_etag,
        };
        let mut iterator = self.iterate_objects_all_versions_with_status(&iterate)?;

        let mut entries = Vec::with_capacity(opts.limit.min(1024));
        while entries.len() < opts.limit {
            match iterator.next_entry()? {
                Some(entry) => entries.push(entry),
                None => {
                    return Ok(ListObjectsResult {
                        entries,
                        more: false,
                        next_cursor: None,
                    })
                }
            }
        }
        let more = iterator.next_entry()?.is_some();
        let next_cursor = if more {
            entries.last().map(|entry| page_cursor(entry, opts.all_versions))
        } else {
            None
        };
        Ok(ListObjectsResult {
            entries,
            more,
            next_cursor,
        })
    }

    /// Every pending stream of one key, ordered by stream id.
    pub fn iterate_pending_objects_by_key(
        &self,
        opts: &IteratePendingObjectsByKey,
    ) -> Result<PendingObjectsIterator<'_>> {
        PendingObjectsIterator::new(self, opts)
    }
}

/// The resume point after a page ending at `entry`. Prefix entries resume
/// past the whole group; latest-only pages resume past every version of the
/// key; all-versions pages resume at the next older version.
fn page_cursor(entry: &ObjectEntry, all_versions: bool) -> ListCursor {
    if entry.is_prefix {
        ListCursor {
            key: entry.object_key.clone(),
            version: Version::MAX,
        }
    } else if all_versions {
        ListCursor {
            key: entry.object_key.clone(),
            version: entry.version,
        }
    } else {
        ListCursor {
            key: entry.object_key.clone(),
            version: Version::NONE,
        }
    }
}
