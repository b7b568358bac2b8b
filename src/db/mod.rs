mod commit;
mod config;
mod delete;
mod list;
mod objects;
mod precommit;
mod reaper;
mod segments;
mod verify;

pub use commit::{CommitInlineObject, CommitObject, IfNoneMatch, InlineSegmentSpec};
pub use config::Config;
pub use delete::{
    DeleteObjectExactVersion, DeleteObjectLastCommitted, DeleteObjectResult, DeleteObjectsAllVersions,
    DeletePendingObject,
};
pub use list::{
    IterateObjects, IteratePendingObjectsByKey, ListCursor, ListObjects, ListObjectsResult,
    ObjectsIterator, PendingObjectsIterator,
};
pub use objects::{
    BeginObjectExactVersion, BeginObjectNextVersion, SetObjectExactVersionLegalHold,
    SetObjectExactVersionRetention, UpdateObjectMetadata,
};
pub use reaper::{DeleteExpiredObjects, DeleteZombieObjects, ReapResult};
pub use segments::{
    BeginSegment, CheckSegmentPiecesAlteration, CommitInlineSegment, CommitSegment, ListSegments,
    ListSegmentsResult, SegmentDetail,
};
pub use verify::{GetTableStats, ListVerifySegments, ListVerifySegmentsResult, VerifySegment};

use std::path::Path;
use std::sync::Arc;

use crate::adapter::{Adapter, AdapterTx, MemoryAdapter, SqliteAdapter, TransactionOptions};
use crate::alias::AliasCache;
use crate::error::{MetabaseError, Result};

/// The object metadata store: the authoritative index mapping user-visible
/// object names to erasure-coded pieces and inline bytes. All state lives in
/// the backing store; this handle owns only the configuration and the node
/// alias cache, so it is cheap to share.
pub struct Metabase {
    adapter: Arc<dyn Adapter>,
    aliases: AliasCache,
    config: Config,
}

impl Metabase {
    pub fn new(adapter: Arc<dyn Adapter>, config: Config) -> Self {
        let aliases = AliasCache::new(Arc::clone(&adapter), config.alias_cache_size);
        Metabase {
            adapter,
            aliases,
            config,
        }
    }

    /// Row-store backend at the given path.
    pub fn open_sqlite(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        Ok(Metabase::new(Arc::new(SqliteAdapter::open(path)?), config))
    }

    /// Row-store backend in memory; state lives for the handle's lifetime.
    pub fn open_sqlite_in_memory(config: Config) -> Result<Self> {
        Ok(Metabase::new(
            Arc::new(SqliteAdapter::open_in_memory()?),
            config,
        ))
    }

    /// Wide-column backend in memory.
    pub fn open_memory(config: Config) -> Self {
        Metabase::new(Arc::new(MemoryAdapter::new()), config)
    }

    pub fn backend_name(&self) -> &'static str {
        self.adapter.name()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn alias_cache(&self) -> &AliasCache {
        &self.aliases
    }

    pub(crate) fn adapter(&self) -> &dyn Adapter {
        self.adapter.as_ref()
    }

    /// Runs `f` inside a backend transaction and threads its return value
    /// out. The closure may run more than once on transient aborts.
    pub(crate) fn run_tx<T>(
        &self,
        opts: &TransactionOptions,
        mut f: impl FnMut(&mut dyn AdapterTx) -> Result<T>,
    ) -> Result<T> {
        let mut out = None;
        self.adapter.with_tx(opts, &mut |tx| {
            out = Some(f(tx)?);
            Ok(())
        })?;
        out.ok_or(MetabaseError::Internal("transaction closure did not run"))
    }
}
