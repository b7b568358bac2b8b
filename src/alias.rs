#![forbid(unsafe_code)]

//! Process-wide bijection between storage node ids and the compact integer
//! aliases stored inside segment rows. Aliases are minted write-through into
//! the backing table and are permanent; the forward map is bounded, reverse
//! resolution falls back to a table read and never forgets an assignment.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::adapter::Adapter;
use crate::error::{MetabaseError, Result};
use crate::model::{AliasPiece, AliasPieces, NodeAlias, NodeId, Piece, Pieces};

#[derive(Default)]
pub struct AliasCacheMetrics {
    ensure_calls: AtomicU64,
    forward_hits: AtomicU64,
    forward_misses: AtomicU64,
    reverse_hits: AtomicU64,
    reverse_misses: AtomicU64,
    reloads: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AliasCacheMetricsSnapshot {
    pub ensure_calls: u64,
    pub forward_hits: u64,
    pub forward_misses: u64,
    pub reverse_hits: u64,
    pub reverse_misses: u64,
    pub reloads: u64,
}

impl AliasCacheMetrics {
    pub fn snapshot(&self) -> AliasCacheMetricsSnapshot {
        AliasCacheMetricsSnapshot {
            ensure_calls: self.ensure_calls.load(Ordering::Relaxed),
            forward_hits: self.forward_hits.load(Ordering::Relaxed),
            forward_misses: self.forward_misses.load(Ordering::Relaxed),
            reverse_hits: self.reverse_hits.load(Ordering::Relaxed),
            reverse_misses: self.reverse_misses.load(Ordering::Relaxed),
            reloads: self.reloads.load(Ordering::Relaxed),
        }
    }

    fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Inner {
    forward: LruCache<NodeId, NodeAlias>,
    reverse: HashMap<NodeAlias, NodeId>,
}

pub struct AliasCache {
    adapter: Arc<dyn Adapter>,
    inner: Mutex<Inner>,
    metrics: Arc<AliasCacheMetrics>,
}

impl AliasCache {
    pub fn new(adapter: Arc<dyn Adapter>, forward_capacity: usize) -> Self {
        let capacity =
            NonZeroUsize::new(forward_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        AliasCache {
            adapter,
            inner: Mutex::new(Inner {
                forward: LruCache::new(capacity),
                reverse: HashMap::new(),
            }),
            metrics: Arc::new(AliasCacheMetrics::default()),
        }
    }

    pub fn metrics_snapshot(&self) -> AliasCacheMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Resolves `(piece number, node id)` pairs to `(piece number, alias)`
    /// pairs, minting aliases for unknown nodes.
    pub fn ensure_pieces_to_aliases(&self, pieces: &Pieces) -> Result<AliasPieces> {
        self.metrics.inc(&self.metrics.ensure_calls);

        let mut resolved: Vec<Option<NodeAlias>> = Vec::with_capacity(pieces.len());
        let mut missing: Vec<NodeId> = Vec::new();
        {
            let mut inner = self.inner.lock();
            for piece in pieces.iter() {
                match inner.forward.get(&piece.storage_node).copied() {
                    Some(alias) => {
                        self.metrics.inc(&self.metrics.forward_hits);
                        resolved.push(Some(alias));
                    }
                    None => {
                        self.metrics.inc(&self.metrics.forward_misses);
                        missing.push(piece.storage_node);
                        resolved.push(None);
                    }
                }
            }
        }

        if !missing.is_empty() {
            missing.sort_unstable();
            missing.dedup();
            debug!(missing = missing.len(), "alias.mint");
            let minted = self.adapter.ensure_node_aliases(&missing)?;

            let mut inner = self.inner.lock();
            for (node, alias) in minted {
                inner.forward.put(node, alias);
                inner.reverse.insert(alias, node);
            }
            for (slot, piece) in resolved.iter_mut().zip(pieces.iter()) {
                if slot.is_none() {
                    *slot = inner.forward.get(&piece.storage_node).copied();
                }
            }
        }

        pieces
            .iter()
            .zip(resolved)
            .map(|(piece, alias)| {
                let alias =
                    alias.ok_or(MetabaseError::Internal("alias missing after mint"))?;
                Ok(AliasPiece {
                    number: piece.number,
                    alias,
                })
            })
            .collect::<Result<AliasPieces>>()
    }

    /// Resolves stored alias pieces back to node ids for the read path.
    pub fn pieces_from_aliases(&self, alias_pieces: &AliasPieces) -> Result<Pieces> {
        let mut out = Vec::with_capacity(alias_pieces.len());
        let mut reloaded = false;
        for piece in alias_pieces.iter() {
            let node = {
                let inner = self.inner.lock();
                inner.reverse.get(&piece.alias).copied()
            };
            let node = match node {
                Some(node) => {
                    self.metrics.inc(&self.metrics.reverse_hits);
                    node
                }
                None => {
                    self.metrics.inc(&self.metrics.reverse_misses);
                    if !reloaded {
                        self.reload()?;
                        reloaded = true;
                    }
                    let inner = self.inner.lock();
                    inner.reverse.get(&piece.alias).copied().ok_or_else(|| {
                        MetabaseError::Encoding(format!("unknown node alias {}", piece.alias.0))
                    })?
                }
            };
            out.push(Piece {
                number: piece.number,
                storage_node: node,
            });
        }
        Ok(Pieces(out))
    }

    fn reload(&self) -> Result<()> {
        self.metrics.inc(&self.metrics.reloads);
        let entries = self.adapter.load_node_aliases()?;
        trace!(entries = entries.len(), "alias.reload");
        let mut inner = self.inner.lock();
        for (node, alias) in entries {
            inner.forward.put(node, alias);
            inner.reverse.insert(alias, node);
        }
        Ok(())
    }
}
