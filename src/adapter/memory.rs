//! Transactional wide-column dialect: ordered column families behind a single
//! writer lock, with a mutation API applied to a copy-on-write working set
//! that is swapped in atomically at commit. Serializable by construction.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;
use time::OffsetDateTime;

use crate::adapter::{
    Adapter, AdapterTx, BatchBound, BatchQuery, PrecommitConstraint, PrecommitInfo, SegmentOffsetUpdate,
    TableStats, TransactionOptions, VerifyCursor, VersionOrder,
};
use crate::error::{MetabaseError, Result};
use crate::model::{
    BucketName, EncryptedUserData, NodeAlias, NodeId, Object, ObjectKey, ObjectLocation,
    ObjectStream, ProjectId, Retention, Segment, SegmentPosition, StreamId, Version,
};

type ObjectRowKey = (ProjectId, BucketName, ObjectKey, Version);
type SegmentRowKey = (StreamId, SegmentPosition);

fn row_key(location: &ObjectLocation, version: Version) -> ObjectRowKey {
    (
        location.project_id,
        location.bucket_name.clone(),
        location.object_key.clone(),
        version,
    )
}

fn key_range(location: &ObjectLocation) -> (Bound<ObjectRowKey>, Bound<ObjectRowKey>) {
    (
        Bound::Included(row_key(location, Version(i64::MIN))),
        Bound::Included(row_key(location, Version(i64::MAX))),
    )
}

#[derive(Default, Clone)]
struct State {
    objects: BTreeMap<ObjectRowKey, Object>,
    segments: BTreeMap<SegmentRowKey, Segment>,
    streams: HashMap<StreamId, ObjectRowKey>,
    aliases: HashMap<NodeId, NodeAlias>,
    next_alias: u32,
}

/// Write operations buffered by the transaction layer. Constraint checks run
/// at application time against the working set, mirroring the commit-time
/// semantics of a mutation-based store.
enum Mutation {
    InsertObject(Object),
    UpdateObject(Object),
    DeleteObject(ObjectRowKey),
    UpsertSegment(Segment),
    InsertSegment(Segment),
    DeleteSegments(StreamId),
    DeleteSegmentsAt(StreamId, Vec<SegmentPosition>),
}

fn apply(state: &mut State, mutation: Mutation) -> Result<()> {
    match mutation {
        Mutation::InsertObject(object) => {
            let key = row_key(object.location(), object.version());
            if state.objects.contains_key(&key) {
                return Err(MetabaseError::ObjectAlreadyExists);
            }
            if state.streams.contains_key(&object.stream_id()) {
                return Err(MetabaseError::ObjectAlreadyExists);
            }
            state.streams.insert(object.stream_id(), key.clone());
            state.objects.insert(key, object);
        }
        Mutation::UpdateObject(object) => {
            let key = row_key(object.location(), object.version());
            let previous = state
                .objects
                .get(&key)
                .ok_or(MetabaseError::Internal("update of missing object row"))?;
            state.streams.remove(&previous.stream_id());
            state.streams.insert(object.stream_id(), key.clone());
            state.objects.insert(key, object);
        }
        Mutation::DeleteObject(key) => {
            if let Some(previous) = state.objects.remove(&key) {
                state.streams.remove(&previous.stream_id());
            }
        }
        Mutation::UpsertSegment(segment) => {
            state
                .segments
                .insert((segment.stream_id, segment.position), segment);
        }
        Mutation::InsertSegment(segment) => {
            let key = (segment.stream_id, segment.position);
            if state.segments.contains_key(&key) {
                return Err(MetabaseError::Conflict("segment already exists".into()));
            }
            state.segments.insert(key, segment);
        }
        Mutation::DeleteSegments(stream_id) => {
            let keys: Vec<SegmentRowKey> = state
                .segments
                .range(stream_range(stream_id))
                .map(|(k, _)| k.clone())
                .collect();
            for key in keys {
                state.segments.remove(&key);
            }
        }
        Mutation::DeleteSegmentsAt(stream_id, positions) => {
            for position in positions {
                state.segments.remove(&(stream_id, position));
            }
        }
    }
    Ok(())
}

fn stream_range(stream_id: StreamId) -> (Bound<SegmentRowKey>, Bound<SegmentRowKey>) {
    (
        Bound::Included((stream_id, SegmentPosition::new(0, 0))),
        Bound::Included((stream_id, SegmentPosition::new(u32::MAX, u32::MAX))),
    )
}

fn get_object_exact_version(
    state: &State,
    location: &ObjectLocation,
    version: Version,
) -> Option<Object> {
    state.objects.get(&row_key(location, version)).cloned()
}

fn key_rows<'a>(state: &'a State, location: &ObjectLocation) -> impl Iterator<Item = &'a Object> {
    state.objects.range(key_range(location)).map(|(_, v)| v)
}

fn highest_visible(state: &State, location: &ObjectLocation) -> Option<Object> {
    key_rows(state, location)
        .filter(|o| o.status.is_visible())
        .max_by_key(|o| o.version())
        .cloned()
}

fn unversioned_row(state: &State, location: &ObjectLocation) -> Option<Object> {
    key_rows(state, location)
        .filter(|o| o.status.is_unversioned())
        .max_by_key(|o| o.version())
        .cloned()
}

fn highest_version(state: &State, location: &ObjectLocation) -> Version {
    key_rows(state, location)
        .map(|o| o.version())
        .max()
        .unwrap_or(Version(0))
}

fn list_stream_segments(state: &State, stream_id: StreamId) -> Vec<Segment> {
    state
        .segments
        .range(stream_range(stream_id))
        .map(|(_, v)| v.clone())
        .collect()
}

fn list_objects_batch(state: &State, query: &BatchQuery) -> Vec<Object> {
    let start_key = match &query.start {
        BatchBound::KeyInclusive(key) | BatchBound::AfterKeyVersion(key, _) => key.clone(),
    };
    let lower = Bound::Included((
        query.project_id,
        query.bucket_name.clone(),
        start_key,
        Version(i64::MIN),
    ));
    let upper = match &query.end_before {
        Some(end) => Bound::Excluded((
            query.project_id,
            query.bucket_name.clone(),
            end.clone(),
            Version(i64::MIN),
        )),
        None => Bound::Excluded((
            query.project_id,
            BucketName(format!("{}\u{0}", query.bucket_name.0)),
            ObjectKey::default(),
            Version(i64::MIN),
        )),
    };

    let mut out = Vec::new();
    let mut group: Vec<Object> = Vec::new();
    let mut group_key: Option<ObjectKey> = None;

    let mut flush = |group: &mut Vec<Object>, out: &mut Vec<Object>| {
        if query.order == VersionOrder::Descending {
            group.sort_by_key(|o| std::cmp::Reverse(o.version()));
        }
        for row in group.drain(..) {
            if out.len() == query.limit {
                return;
            }
            let pass = match &query.start {
                BatchBound::KeyInclusive(_) => true,
                BatchBound::AfterKeyVersion(key, version) => {
                    if row.location().object_key != *key {
                        true
                    } else {
                        match query.order {
                            VersionOrder::Descending => row.version() < *version,
                            VersionOrder::Ascending => row.version() > *version,
                        }
                    }
                }
            };
            if pass {
                out.push(row);
            }
        }
    };

    for (_, row) in state.objects.range((lower, upper)) {
        if out.len() == query.limit {
            break;
        }
        let wanted = if query.pending_only {
            row.status.is_pending()
        } else {
            row.status.is_visible()
        };
        if !wanted {
            continue;
        }
        if group_key.as_ref() != Some(&row.location().object_key) {
            flush(&mut group, &mut out);
            group_key = Some(row.location().object_key.clone());
        }
        group.push(row.clone());
    }
    flush(&mut group, &mut out);
    out
}

/// The wide-column reference backend.
#[derive(Default)]
pub struct MemoryAdapter {
    state: Arc<RwLock<State>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        MemoryAdapter::default()
    }
}

struct MemoryTx {
    work: State,
}

impl AdapterTx for MemoryTx {
    fn precommit_query(&mut self, constraint: &PrecommitConstraint<'_>) -> Result<PrecommitInfo> {
        let mut info = PrecommitInfo::default();
        if let Some(pending) = constraint.pending {
            let row = get_object_exact_version(&self.work, constraint.location, pending.version);
            info.pending = row.filter(|o| {
                o.status.is_pending() && o.stream_id() == pending.stream_id
            });
            if constraint.include_pending_segments {
                if let Some(object) = &info.pending {
                    info.pending_segments = list_stream_segments(&self.work, object.stream_id());
                }
            }
        }
        if constraint.include_unversioned {
            info.unversioned = unversioned_row(&self.work, constraint.location);
        }
        if constraint.include_highest {
            info.highest_version = highest_version(&self.work, constraint.location);
        }
        if constraint.include_highest_visible {
            info.highest_visible = highest_visible(&self.work, constraint.location)
                .map(|o| (o.version(), o.status));
        }
        Ok(info)
    }

    fn next_version(&mut self, location: &ObjectLocation) -> Result<Version> {
        Ok(highest_version(&self.work, location).next())
    }

    fn get_object_exact_version(
        &mut self,
        location: &ObjectLocation,
        version: Version,
    ) -> Result<Option<Object>> {
        Ok(get_object_exact_version(&self.work, location, version))
    }

    fn get_pending_object(&mut self, stream: &ObjectStream) -> Result<Option<Object>> {
        Ok(
            get_object_exact_version(&self.work, &stream.location, stream.version).filter(|o| {
                o.status.is_pending() && o.stream_id() == stream.stream_id
            }),
        )
    }

    fn get_committed_by_stream(
        &mut self,
        location: &ObjectLocation,
        stream_id: StreamId,
    ) -> Result<Option<Object>> {
        Ok(key_rows(&self.work, location)
            .find(|o| o.status.is_committed() && o.stream_id() == stream_id)
            .cloned())
    }

    fn list_object_versions(&mut self, location: &ObjectLocation) -> Result<Vec<Object>> {
        Ok(key_rows(&self.work, location).cloned().collect())
    }

    fn insert_object(&mut self, object: &Object) -> Result<()> {
        apply(&mut self.work, Mutation::InsertObject(object.clone()))
    }

    fn update_object(&mut self, object: &Object) -> Result<()> {
        apply(&mut self.work, Mutation::UpdateObject(object.clone()))
    }

    fn delete_object(
        &mut self,
        location: &ObjectLocation,
        version: Version,
    ) -> Result<Option<Object>> {
        let removed = get_object_exact_version(&self.work, location, version);
        apply(&mut self.work, Mutation::DeleteObject(row_key(location, version)))?;
        Ok(removed)
    }

    fn update_object_user_data(
        &mut self,
        location: &ObjectLocation,
        stream_id: StreamId,
        user_data: &EncryptedUserData,
    ) -> Result<bool> {
        let target = key_rows(&self.work, location)
            .find(|o| o.status.is_committed() && o.stream_id() == stream_id)
            .cloned();
        match target {
            Some(mut object) => {
                object.user_data = user_data.clone();
                apply(&mut self.work, Mutation::UpdateObject(object))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn update_object_lock(
        &mut self,
        location: &ObjectLocation,
        version: Version,
        retention: Retention,
        legal_hold: bool,
    ) -> Result<bool> {
        match get_object_exact_version(&self.work, location, version) {
            Some(mut object) => {
                object.retention = retention;
                object.legal_hold = legal_hold;
                apply(&mut self.work, Mutation::UpdateObject(object))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn upsert_segment(&mut self, segment: &Segment) -> Result<()> {
        apply(&mut self.work, Mutation::UpsertSegment(segment.clone()))
    }

    fn insert_segments(&mut self, segments: &[Segment]) -> Result<()> {
        for segment in segments {
            apply(&mut self.work, Mutation::InsertSegment(segment.clone()))?;
        }
        Ok(())
    }

    fn update_segment_offsets(
        &mut self,
        stream_id: StreamId,
        updates: &[SegmentOffsetUpdate],
    ) -> Result<()> {
        for update in updates {
            let segment = self
                .work
                .segments
                .get_mut(&(stream_id, update.position))
                .ok_or(MetabaseError::SegmentNotFound)?;
            segment.plain_offset = update.plain_offset;
            segment.plain_size = update.plain_size;
            segment.encrypted_size = update.encrypted_size;
        }
        Ok(())
    }

    fn list_stream_segments(&mut self, stream_id: StreamId) -> Result<Vec<Segment>> {
        Ok(list_stream_segments(&self.work, stream_id))
    }

    fn delete_segments(&mut self, stream_id: StreamId) -> Result<usize> {
        let count = self.work.segments.range(stream_range(stream_id)).count();
        apply(&mut self.work, Mutation::DeleteSegments(stream_id))?;
        Ok(count)
    }

    fn delete_segments_at(
        &mut self,
        stream_id: StreamId,
        positions: &[SegmentPosition],
    ) -> Result<usize> {
        let count = positions
            .iter()
            .filter(|p| self.work.segments.contains_key(&(stream_id, **p)))
            .count();
        apply(
            &mut self.work,
            Mutation::DeleteSegmentsAt(stream_id, positions.to_vec()),
        )?;
        Ok(count)
    }
}

impl Adapter for MemoryAdapter {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn with_tx(
        &self,
        _opts: &TransactionOptions,
        f: &mut dyn FnMut(&mut dyn AdapterTx) -> Result<()>,
    ) -> Result<()> {
        let mut guard = self.state.write();
        let mut tx = MemoryTx {
            work: guard.clone(),
        };
        f(&mut tx)?;
        *guard = tx.work;
        Ok(())
    }

    fn get_object_exact_version(
        &self,
        location: &ObjectLocation,
        version: Version,
    ) -> Result<Option<Object>> {
        Ok(get_object_exact_version(&self.state.read(), location, version))
    }

    fn get_highest_visible(&self, location: &ObjectLocation) -> Result<Option<Object>> {
        Ok(highest_visible(&self.state.read(), location))
    }

    fn get_segment(
        &self,
        stream_id: StreamId,
        position: SegmentPosition,
    ) -> Result<Option<Segment>> {
        Ok(self.state.read().segments.get(&(stream_id, position)).cloned())
    }

    fn list_segments(
        &self,
        stream_id: StreamId,
        after: Option<SegmentPosition>,
        limit: usize,
    ) -> Result<Vec<Segment>> {
        let state = self.state.read();
        let lower = match after {
            Some(position) => Bound::Excluded((stream_id, position)),
            None => Bound::Included((stream_id, SegmentPosition::new(0, 0))),
        };
        let upper = Bound::Included((stream_id, SegmentPosition::new(u32::MAX, u32::MAX)));
        Ok(state
            .segments
            .range((lower, upper))
            .take(limit)
            .map(|(_, v)| v.clone())
            .collect())
    }

    fn pending_object_exists(&self, stream: &ObjectStream) -> Result<bool> {
        let state = self.state.read();
        Ok(
            get_object_exact_version(&state, &stream.location, stream.version)
                .map_or(false, |o| {
                    o.status.is_pending() && o.stream_id() == stream.stream_id
                }),
        )
    }

    fn list_objects_batch(&self, query: &BatchQuery) -> Result<Vec<Object>> {
        Ok(list_objects_batch(&self.state.read(), query))
    }

    fn list_pending_by_key(
        &self,
        location: &ObjectLocation,
        after: Option<StreamId>,
        limit: usize,
    ) -> Result<Vec<Object>> {
        let state = self.state.read();
        let mut rows: Vec<Object> = key_rows(&state, location)
            .filter(|o| o.status.is_pending())
            .cloned()
            .collect();
        rows.sort_by_key(|o| o.stream_id());
        Ok(rows
            .into_iter()
            .filter(|o| after.map_or(true, |cursor| o.stream_id() > cursor))
            .take(limit)
            .collect())
    }

    fn list_verify_segments(&self, cursor: &VerifyCursor, limit: usize) -> Result<Vec<Segment>> {
        let state = self.state.read();
        let lower = match cursor.stream_id {
            Some(stream_id) => Bound::Excluded((stream_id, cursor.position)),
            None => Bound::Unbounded,
        };
        Ok(state
            .segments
            .range((lower, Bound::Unbounded))
            .map(|(_, v)| v)
            .filter(|s| s.is_remote())
            .take(limit)
            .cloned()
            .collect())
    }

    fn table_stats(&self) -> Result<TableStats> {
        Ok(TableStats {
            segment_count: self.state.read().segments.len() as u64,
        })
    }

    fn find_zombie_objects(
        &self,
        deadline_before: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<ObjectStream>> {
        let state = self.state.read();
        Ok(state
            .objects
            .values()
            .filter(|o| {
                o.status.is_pending()
                    && o.zombie_deletion_deadline
                        .map_or(false, |deadline| deadline < deadline_before)
            })
            .take(limit)
            .map(|o| o.stream.clone())
            .collect())
    }

    fn find_expired_objects(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<ObjectStream>> {
        let state = self.state.read();
        Ok(state
            .objects
            .values()
            .filter(|o| o.expires_at.map_or(false, |expires| expires < now))
            .take(limit)
            .map(|o| o.stream.clone())
            .collect())
    }

    fn find_expired_segments(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<(StreamId, SegmentPosition)>> {
        let state = self.state.read();
        Ok(state
            .segments
            .values()
            .filter(|s| s.expires_at.map_or(false, |expires| expires < now))
            .take(limit)
            .map(|s| (s.stream_id, s.position))
            .collect())
    }

    fn ensure_node_aliases(&self, nodes: &[NodeId]) -> Result<Vec<(NodeId, NodeAlias)>> {
        let mut state = self.state.write();
        let mut out = Vec::with_capacity(nodes.len());
        for node in nodes {
            let alias = match state.aliases.get(node) {
                Some(alias) => *alias,
                None => {
                    state.next_alias += 1;
                    let alias = NodeAlias(state.next_alias);
                    state.aliases.insert(*node, alias);
                    alias
                }
            };
            out.push((*node, alias));
        }
        Ok(out)
    }

    fn load_node_aliases(&self) -> Result<Vec<(NodeId, NodeAlias)>> {
        let state = self.state.read();
        Ok(state.aliases.iter().map(|(n, a)| (*n, *a)).collect())
    }
}
