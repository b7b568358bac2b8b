//! Row-store RDBMS dialect over SQLite. One connection behind a writer lock;
//! write paths run in immediate-mode transactions. Constraint failures are
//! translated into the engine taxonomy here and never leak as raw SQL errors.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use time::OffsetDateTime;
use tracing::trace;
use uuid::Uuid;

use crate::adapter::{
    Adapter, AdapterTx, BatchBound, BatchQuery, PrecommitConstraint, PrecommitInfo,
    SegmentOffsetUpdate, TableStats, TransactionOptions, VerifyCursor, VersionOrder,
};
use crate::error::{MetabaseError, Result};
use crate::model::{
    AliasPieces, BucketName, EncryptedUserData, EncryptionParameters, NodeAlias, NodeId, Object,
    ObjectKey, ObjectLocation, ObjectStatus, ObjectStream, PieceId, Placement, ProjectId,
    RedundancyScheme, Retention, RetentionMode, Segment, SegmentPosition, StreamId, Version,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS objects (
    project_id                        BLOB NOT NULL,
    bucket_name                       TEXT NOT NULL,
    object_key                        BLOB NOT NULL,
    version                           INTEGER NOT NULL,
    stream_id                         BLOB NOT NULL,
    status                            INTEGER NOT NULL,
    created_at                        INTEGER NOT NULL,
    expires_at                        INTEGER,
    zombie_deletion_deadline          INTEGER,
    encryption                        INTEGER NOT NULL,
    encrypted_metadata                BLOB,
    encrypted_metadata_nonce          BLOB,
    encrypted_metadata_encrypted_key  BLOB,
    encrypted_etag                    BLOB,
    segment_count                     INTEGER NOT NULL,
    total_plain_size                  INTEGER NOT NULL,
    total_encrypted_size              INTEGER NOT NULL,
    fixed_segment_size                INTEGER NOT NULL,
    retention_mode                    INTEGER NOT NULL,
    retain_until                      INTEGER,
    legal_hold                        INTEGER NOT NULL,
    PRIMARY KEY (project_id, bucket_name, object_key, version)
);
CREATE UNIQUE INDEX IF NOT EXISTS objects_stream_id ON objects (stream_id);
CREATE INDEX IF NOT EXISTS objects_zombie
    ON objects (zombie_deletion_deadline) WHERE status = 1;
CREATE INDEX IF NOT EXISTS objects_expires
    ON objects (expires_at) WHERE expires_at IS NOT NULL;

CREATE TABLE IF NOT EXISTS segments (
    stream_id            BLOB NOT NULL,
    position             INTEGER NOT NULL,
    created_at           INTEGER NOT NULL,
    expires_at           INTEGER,
    root_piece_id        BLOB,
    redundancy           BLOB,
    remote_alias_pieces  BLOB,
    placement            INTEGER NOT NULL,
    encrypted_key_nonce  BLOB,
    encrypted_key        BLOB,
    encrypted_etag       BLOB,
    encrypted_size       INTEGER NOT NULL,
    plain_offset         INTEGER NOT NULL,
    plain_size           INTEGER NOT NULL,
    inline_data          BLOB,
    PRIMARY KEY (stream_id, position)
);
CREATE INDEX IF NOT EXISTS segments_expires
    ON segments (expires_at) WHERE expires_at IS NOT NULL;

CREATE TABLE IF NOT EXISTS node_aliases (
    node_id  BLOB NOT NULL PRIMARY KEY,
    alias    INTEGER NOT NULL UNIQUE
);
";

const OBJECT_COLUMNS: &str = "project_id, bucket_name, object_key, version, stream_id, status, \
    created_at, expires_at, zombie_deletion_deadline, encryption, encrypted_metadata, \
    encrypted_metadata_nonce, encrypted_metadata_encrypted_key, encrypted_etag, segment_count, \
    total_plain_size, total_encrypted_size, fixed_segment_size, retention_mode, retain_until, \
    legal_hold";

const SEGMENT_COLUMNS: &str = "stream_id, position, created_at, expires_at, root_piece_id, \
    redundancy, remote_alias_pieces, placement, encrypted_key_nonce, encrypted_key, \
    encrypted_etag, encrypted_size, plain_offset, plain_size, inline_data";

// Status literals; must agree with ObjectStatus::to_db.
const STATUS_PENDING: &str = "status = 1";
const STATUS_VISIBLE: &str = "status IN (3, 4, 5, 6)";
const STATUS_COMMITTED: &str = "status IN (3, 4)";
const STATUS_UNVERSIONED: &str = "status IN (3, 5)";

const TX_RETRIES: usize = 3;

fn ts_to_db(ts: OffsetDateTime) -> i64 {
    (ts.unix_timestamp_nanos() / 1_000) as i64
}

fn ts_from_db(micros: i64) -> std::result::Result<OffsetDateTime, MetabaseError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000)
        .map_err(|e| MetabaseError::Encoding(format!("timestamp {micros}: {e}")))
}

fn conversion_err(err: MetabaseError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Blob, Box::new(err))
}

fn uuid_from_db(raw: Vec<u8>) -> std::result::Result<Uuid, rusqlite::Error> {
    Uuid::from_slice(&raw)
        .map_err(|e| conversion_err(MetabaseError::Encoding(format!("uuid: {e}"))))
}

fn object_from_row(row: &Row<'_>) -> std::result::Result<Object, rusqlite::Error> {
    let project_id = ProjectId(uuid_from_db(row.get(0)?)?);
    let bucket_name = BucketName(row.get::<_, String>(1)?);
    let object_key = ObjectKey(row.get::<_, Vec<u8>>(2)?);
    let version = Version(row.get(3)?);
    let stream_id = StreamId(uuid_from_db(row.get(4)?)?);
    let status = ObjectStatus::from_db(row.get(5)?).map_err(conversion_err)?;
    let created_at = ts_from_db(row.get(6)?).map_err(conversion_err)?;
    let expires_at = row
        .get::<_, Option<i64>>(7)?
        .map(ts_from_db)
        .transpose()
        .map_err(conversion_err)?;
    let zombie_deletion_deadline = row
        .get::<_, Option<i64>>(8)?
        .map(ts_from_db)
        .transpose()
        .map_err(conversion_err)?;
    let encryption = EncryptionParameters::from_db(row.get(9)?).map_err(conversion_err)?;
    let user_data = EncryptedUserData {
        encrypted_metadata: row.get::<_, Option<Vec<u8>>>(10)?.map(Into::into),
        encrypted_metadata_nonce: row.get::<_, Option<Vec<u8>>>(11)?.map(Into::into),
        encrypted_metadata_encrypted_key: row.get::<_, Option<Vec<u8>>>(12)?.map(Into::into),
        encrypted_etag: row.get::<_, Option<Vec<u8>>>(13)?.map(Into::into),
    };
    let retention = Retention {
        mode: RetentionMode::from_db(row.get(18)?).map_err(conversion_err)?,
        retain_until: row
            .get::<_, Option<i64>>(19)?
            .map(ts_from_db)
            .transpose()
            .map_err(conversion_err)?,
    };
    Ok(Object {
        stream: ObjectStream {
            location: ObjectLocation {
                project_id,
                bucket_name,
                object_key,
            },
            version,
            stream_id,
        },
        status,
        created_at,
        expires_at,
        zombie_deletion_deadline,
        encryption,
        user_data,
        segment_count: row.get(14)?,
        total_plain_size: row.get(15)?,
        total_encrypted_size: row.get(16)?,
        fixed_segment_size: row.get(17)?,
        retention,
        legal_hold: row.get(20)?,
    })
}

fn segment_from_row(row: &Row<'_>) -> std::result::Result<Segment, rusqlite::Error> {
    let stream_id = StreamId(uuid_from_db(row.get(0)?)?);
    let position = SegmentPosition::decode(row.get::<_, i64>(1)? as u64);
    let created_at = ts_from_db(row.get(2)?).map_err(conversion_err)?;
    let expires_at = row
        .get::<_, Option<i64>>(3)?
        .map(ts_from_db)
        .transpose()
        .map_err(conversion_err)?;
    let root_piece_id = row
        .get::<_, Option<Vec<u8>>>(4)?
        .map(|raw| PieceId::from_slice(&raw))
        .transpose()
        .map_err(conversion_err)?;
    let redundancy = match row.get::<_, Option<Vec<u8>>>(5)? {
        Some(raw) => RedundancyScheme::decode(&raw).map_err(conversion_err)?,
        None => RedundancyScheme::default(),
    };
    let remote_alias_pieces = row
        .get::<_, Option<Vec<u8>>>(6)?
        .map(|raw| AliasPieces::decode(&raw))
        .transpose()
        .map_err(conversion_err)?;
    Ok(Segment {
        stream_id,
        position,
        created_at,
        expires_at,
        root_piece_id,
        redundancy,
        remote_alias_pieces,
        placement: Placement(row.get::<_, i64>(7)? as u16),
        encrypted_key_nonce: row.get::<_, Option<Vec<u8>>>(8)?.map(Into::into),
        encrypted_key: row.get::<_, Option<Vec<u8>>>(9)?.map(Into::into),
        encrypted_etag: row.get::<_, Option<Vec<u8>>>(10)?.map(Into::into),
        encrypted_size: row.get(11)?,
        plain_offset: row.get(12)?,
        plain_size: row.get(13)?,
        inline_data: row.get::<_, Option<Vec<u8>>>(14)?.map(Into::into),
    })
}

fn is_busy(err: &MetabaseError) -> bool {
    matches!(
        err,
        MetabaseError::Database(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::DatabaseBusy
    )
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn object_params(object: &Object) -> [Value; 21] {
    [
        Value::Blob(object.location().project_id.0.as_bytes().to_vec()),
        Value::Text(object.location().bucket_name.0.clone()),
        Value::Blob(object.location().object_key.0.clone()),
        Value::Integer(object.version().0),
        Value::Blob(object.stream_id().0.as_bytes().to_vec()),
        Value::Integer(object.status.to_db()),
        Value::Integer(ts_to_db(object.created_at)),
        object.expires_at.map(ts_to_db).map_or(Value::Null, Value::Integer),
        object
            .zombie_deletion_deadline
            .map(ts_to_db)
            .map_or(Value::Null, Value::Integer),
        Value::Integer(object.encryption.to_db()),
        blob_or_null(&object.user_data.encrypted_metadata),
        blob_or_null(&object.user_data.encrypted_metadata_nonce),
        blob_or_null(&object.user_data.encrypted_metadata_encrypted_key),
        blob_or_null(&object.user_data.encrypted_etag),
        Value::Integer(i64::from(object.segment_count)),
        Value::Integer(object.total_plain_size),
        Value::Integer(object.total_encrypted_size),
        Value::Integer(object.fixed_segment_size),
        Value::Integer(object.retention.mode.to_db()),
        object
            .retention
            .retain_until
            .map(ts_to_db)
            .map_or(Value::Null, Value::Integer),
        Value::Integer(i64::from(object.legal_hold)),
    ]
}

fn segment_params(segment: &Segment) -> [Value; 15] {
    [
        Value::Blob(segment.stream_id.0.as_bytes().to_vec()),
        Value::Integer(segment.position.encode() as i64),
        Value::Integer(ts_to_db(segment.created_at)),
        segment.expires_at.map(ts_to_db).map_or(Value::Null, Value::Integer),
        segment
            .root_piece_id
            .map(|id| Value::Blob(id.0.to_vec()))
            .unwrap_or(Value::Null),
        if segment.redundancy.is_zero() {
            Value::Null
        } else {
            Value::Blob(segment.redundancy.encode())
        },
        segment
            .remote_alias_pieces
            .as_ref()
            .map(|pieces| Value::Blob(pieces.encode()))
            .unwrap_or(Value::Null),
        Value::Integer(i64::from(segment.placement.0)),
        blob_or_null(&segment.encrypted_key_nonce),
        blob_or_null(&segment.encrypted_key),
        blob_or_null(&segment.encrypted_etag),
        Value::Integer(i64::from(segment.encrypted_size)),
        Value::Integer(segment.plain_offset),
        Value::Integer(i64::from(segment.plain_size)),
        blob_or_null(&segment.inline_data),
    ]
}

fn blob_or_null(data: &Option<bytes::Bytes>) -> Value {
    data.as_ref()
        .map(|b| Value::Blob(b.to_vec()))
        .unwrap_or(Value::Null)
}

/// The row-store backend.
pub struct SqliteAdapter {
    conn: Mutex<Connection>,
}

impl SqliteAdapter {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::initialize(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteAdapter {
            conn: Mutex::new(conn),
        })
    }
}

struct SqliteTx<'a> {
    tx: &'a rusqlite::Transaction<'a>,
}

impl SqliteTx<'_> {
    fn query_object(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Result<Option<Object>> {
        let mut stmt = self.tx.prepare_cached(sql)?;
        Ok(stmt
            .query_row(params_from_iter(params.iter().cloned()), object_from_row)
            .optional()?)
    }
}

impl AdapterTx for SqliteTx<'_> {
    fn precommit_query(&mut self, constraint: &PrecommitConstraint<'_>) -> Result<PrecommitInfo> {
        let location = constraint.location;
        let project = Value::Blob(location.project_id.0.as_bytes().to_vec());
        let bucket = Value::Text(location.bucket_name.0.clone());
        let key = Value::Blob(location.object_key.0.clone());

        let mut info = PrecommitInfo::default();
        if let Some(pending) = constraint.pending {
            let sql = format!(
                "SELECT {OBJECT_COLUMNS} FROM objects \
                 WHERE project_id = ?1 AND bucket_name = ?2 AND object_key = ?3 \
                   AND version = ?4 AND stream_id = ?5 AND {STATUS_PENDING}"
            );
            info.pending = self.query_object(
                &sql,
                &[
                    project.clone(),
                    bucket.clone(),
                    key.clone(),
                    Value::Integer(pending.version.0),
                    Value::Blob(pending.stream_id.0.as_bytes().to_vec()),
                ],
            )?;
            if constraint.include_pending_segments {
                if let Some(object) = &info.pending {
                    info.pending_segments = self.list_stream_segments(object.stream_id())?;
                }
            }
        }
        if constraint.include_unversioned {
            let sql = format!(
                "SELECT {OBJECT_COLUMNS} FROM objects \
                 WHERE project_id = ?1 AND bucket_name = ?2 AND object_key = ?3 \
                   AND {STATUS_UNVERSIONED} ORDER BY version DESC LIMIT 1"
            );
            info.unversioned =
                self.query_object(&sql, &[project.clone(), bucket.clone(), key.clone()])?;
        }
        if constraint.include_highest {
            let mut stmt = self.tx.prepare_cached(
                "SELECT COALESCE(MAX(version), 0) FROM objects \
                 WHERE project_id = ?1 AND bucket_name = ?2 AND object_key = ?3",
            )?;
            info.highest_version = Version(stmt.query_row(
                params_from_iter([project.clone(), bucket.clone(), key.clone()]),
                |row| row.get(0),
            )?);
        }
        if constraint.include_highest_visible {
            let sql = format!(
                "SELECT version, status FROM objects \
                 WHERE project_id = ?1 AND bucket_name = ?2 AND object_key = ?3 \
                   AND {STATUS_VISIBLE} ORDER BY version DESC LIMIT 1"
            );
            let mut stmt = self.tx.prepare_cached(&sql)?;
            info.highest_visible = stmt
                .query_row(params_from_iter([project, bucket, key]), |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
                })
                .optional()?
                .map(|(version, status)| {
                    Ok::<_, MetabaseError>((Version(version), ObjectStatus::from_db(status)?))
                })
                .transpose()?;
        }
        Ok(info)
    }

    fn next_version(&mut self, location: &ObjectLocation) -> Result<Version> {
        let mut stmt = self.tx.prepare_cached(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM objects \
             WHERE project_id = ?1 AND bucket_name = ?2 AND object_key = ?3",
        )?;
        let raw: i64 = stmt.query_row(
            params![
                location.project_id.0.as_bytes(),
                location.bucket_name.0,
                location.object_key.0,
            ],
            |row| row.get(0),
        )?;
        Ok(Version(raw))
    }

    fn get_object_exact_version(
        &mut self,
        location: &ObjectLocation,
        version: Version,
    ) -> Result<Option<Object>> {
        let sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM objects \
             WHERE project_id = ?1 AND bucket_name = ?2 AND object_key = ?3 AND version = ?4"
        );
        self.query_object(
            &sql,
            &[
                Value::Blob(location.project_id.0.as_bytes().to_vec()),
                Value::Text(location.bucket_name.0.clone()),
                Value::Blob(location.object_key.0.clone()),
                Value::Integer(version.0),
            ],
        )
    }

    fn get_pending_object(&mut self, stream: &ObjectStream) -> Result<Option<Object>> {
        let sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM objects \
             WHERE project_id = ?1 AND bucket_name = ?2 AND object_key = ?3 \
               AND version = ?4 AND stream_id = ?5 AND {STATUS_PENDING}"
        );
        self.query_object(
            &sql,
            &[
                Value::Blob(stream.location.project_id.0.as_bytes().to_vec()),
                Value::Text(stream.location.bucket_name.0.clone()),
                Value::Blob(stream.location.object_key.0.clone()),
                Value::Integer(stream.version.0),
                Value::Blob(stream.stream_id.0.as_bytes().to_vec()),
            ],
        )
    }

    fn get_committed_by_stream(
        &mut self,
        location: &ObjectLocation,
        stream_id: StreamId,
    ) -> Result<Option<Object>> {
        let sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM objects \
             WHERE project_id = ?1 AND bucket_name = ?2 AND object_key = ?3 \
               AND stream_id = ?4 AND {STATUS_COMMITTED}"
        );
        self.query_object(
            &sql,
            &[
                Value::Blob(location.project_id.0.as_bytes().to_vec()),
                Value::Text(location.bucket_name.0.clone()),
                Value::Blob(location.object_key.0.clone()),
                Value::Blob(stream_id.0.as_bytes().to_vec()),
            ],
        )
    }

    fn list_object_versions(&mut self, location: &ObjectLocation) -> Result<Vec<Object>> {
        let sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM objects \
             WHERE project_id = ?1 AND bucket_name = ?2 AND object_key = ?3 \
             ORDER BY version ASC"
        );
        let mut stmt = self.tx.prepare_cached(&sql)?;
        let rows = stmt.query_map(
            params![
                location.project_id.0.as_bytes(),
                location.bucket_name.0,
                location.object_key.0,
            ],
            object_from_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn insert_object(&mut self, object: &Object) -> Result<()> {
        let sql = format!(
            "INSERT INTO objects ({OBJECT_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                     ?17, ?18, ?19, ?20, ?21)"
        );
        let mut stmt = self.tx.prepare_cached(&sql)?;
        match stmt.execute(params_from_iter(object_params(object))) {
            Ok(_) => Ok(()),
            Err(err) if is_constraint_violation(&err) => Err(MetabaseError::ObjectAlreadyExists),
            Err(err) => Err(err.into()),
        }
    }

    fn update_object(&mut self, object: &Object) -> Result<()> {
        let mut stmt = self.tx.prepare_cached(
            "UPDATE objects SET stream_id = ?5, status = ?6, created_at = ?7, expires_at = ?8, \
                 zombie_deletion_deadline = ?9, encryption = ?10, encrypted_metadata = ?11, \
                 encrypted_metadata_nonce = ?12, encrypted_metadata_encrypted_key = ?13, \
                 encrypted_etag = ?14, segment_count = ?15, total_plain_size = ?16, \
                 total_encrypted_size = ?17, fixed_segment_size = ?18, retention_mode = ?19, \
                 retain_until = ?20, legal_hold = ?21 \
             WHERE project_id = ?1 AND bucket_name = ?2 AND object_key = ?3 AND version = ?4",
        )?;
        let changed = stmt.execute(params_from_iter(object_params(object)))?;
        if changed == 0 {
            return Err(MetabaseError::Internal("update of missing object row"));
        }
        Ok(())
    }

    fn delete_object(
        &mut self,
        location: &ObjectLocation,
        version: Version,
    ) -> Result<Option<Object>> {
        let removed = self.get_object_exact_version(location, version)?;
        if removed.is_some() {
            let mut stmt = self.tx.prepare_cached(
                "DELETE FROM objects \
                 WHERE project_id = ?1 AND bucket_name = ?2 AND object_key = ?3 AND version = ?4",
            )?;
            stmt.execute(params![
                location.project_id.0.as_bytes(),
                location.bucket_name.0,
                location.object_key.0,
                version.0,
            ])?;
        }
        Ok(removed)
    }

    fn update_object_user_data(
        &mut self,
        location: &ObjectLocation,
        stream_id: StreamId,
        user_data: &EncryptedUserData,
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE objects SET encrypted_metadata = ?5, encrypted_metadata_nonce = ?6, \
                 encrypted_metadata_encrypted_key = ?7, encrypted_etag = ?8 \
             WHERE project_id = ?1 AND bucket_name = ?2 AND object_key = ?3 \
               AND stream_id = ?4 AND {STATUS_COMMITTED}"
        );
        let mut stmt = self.tx.prepare_cached(&sql)?;
        let changed = stmt.execute(params_from_iter([
            Value::Blob(location.project_id.0.as_bytes().to_vec()),
            Value::Text(location.bucket_name.0.clone()),
            Value::Blob(location.object_key.0.clone()),
            Value::Blob(stream_id.0.as_bytes().to_vec()),
            blob_or_null(&user_data.encrypted_metadata),
            blob_or_null(&user_data.encrypted_metadata_nonce),
            blob_or_null(&user_data.encrypted_metadata_encrypted_key),
            blob_or_null(&user_data.encrypted_etag),
        ]))?;
        Ok(changed > 0)
    }

    fn update_object_lock(
        &mut self,
        location: &ObjectLocation,
        version: Version,
        retention: Retention,
        legal_hold: bool,
    ) -> Result<bool> {
        let mut stmt = self.tx.prepare_cached(
            "UPDATE objects SET retention_mode = ?5, retain_until = ?6, legal_hold = ?7 \
             WHERE project_id = ?1 AND bucket_name = ?2 AND object_key = ?3 AND version = ?4",
        )?;
        let changed = stmt.execute(params_from_iter([
            Value::Blob(location.project_id.0.as_bytes().to_vec()),
            Value::Text(location.bucket_name.0.clone()),
            Value::Blob(location.object_key.0.clone()),
            Value::Integer(version.0),
            Value::Integer(retention.mode.to_db()),
            retention
                .retain_until
                .map(ts_to_db)
                .map_or(Value::Null, Value::Integer),
            Value::Integer(i64::from(legal_hold)),
        ]))?;
        Ok(changed > 0)
    }

    fn upsert_segment(&mut self, segment: &Segment) -> Result<()> {
        let sql = format!(
            "INSERT OR REPLACE INTO segments ({SEGMENT_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
        );
        let mut stmt = self.tx.prepare_cached(&sql)?;
        stmt.execute(params_from_iter(segment_params(segment)))?;
        Ok(())
    }

    fn insert_segments(&mut self, segments: &[Segment]) -> Result<()> {
        let sql = format!(
            "INSERT INTO segments ({SEGMENT_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
        );
        let mut stmt = self.tx.prepare_cached(&sql)?;
        for segment in segments {
            match stmt.execute(params_from_iter(segment_params(segment))) {
                Ok(_) => {}
                Err(err) if is_constraint_violation(&err) => {
                    return Err(MetabaseError::Conflict("segment already exists".into()))
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn update_segment_offsets(
        &mut self,
        stream_id: StreamId,
        updates: &[SegmentOffsetUpdate],
    ) -> Result<()> {
        let mut stmt = self.tx.prepare_cached(
            "UPDATE segments SET plain_offset = ?3, plain_size = ?4, encrypted_size = ?5 \
             WHERE stream_id = ?1 AND position = ?2",
        )?;
        for update in updates {
            let changed = stmt.execute(params![
                stream_id.0.as_bytes(),
                update.position.encode() as i64,
                update.plain_offset,
                update.plain_size,
                update.encrypted_size,
            ])?;
            if changed == 0 {
                return Err(MetabaseError::SegmentNotFound);
            }
        }
        Ok(())
    }

    fn list_stream_segments(&mut self, stream_id: StreamId) -> Result<Vec<Segment>> {
        let sql = format!(
            "SELECT {SEGMENT_COLUMNS} FROM segments WHERE stream_id = ?1 ORDER BY position ASC"
        );
        let mut stmt = self.tx.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![stream_id.0.as_bytes()], segment_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn delete_segments(&mut self, stream_id: StreamId) -> Result<usize> {
        let mut stmt = self
            .tx
            .prepare_cached("DELETE FROM segments WHERE stream_id = ?1")?;
        Ok(stmt.execute(params![stream_id.0.as_bytes()])?)
    }

    fn delete_segments_at(
        &mut self,
        stream_id: StreamId,
        positions: &[SegmentPosition],
    ) -> Result<usize> {
        let mut stmt = self
            .tx
            .prepare_cached("DELETE FROM segments WHERE stream_id = ?1 AND position = ?2")?;
        let mut removed = 0;
        for position in positions {
            removed += stmt.execute(params![stream_id.0.as_bytes(), position.encode() as i64])?;
        }
        Ok(removed)
    }
}

impl SqliteAdapter {
    fn query_objects(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Object>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params_from_iter(params), object_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn query_segments(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Segment>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params_from_iter(params), segment_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

impl Adapter for SqliteAdapter {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn with_tx(
        &self,
        _opts: &TransactionOptions,
        f: &mut dyn FnMut(&mut dyn AdapterTx) -> Result<()>,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result: Result<()> = (|| {
                let mut conn = self.conn.lock();
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let mut adapter_tx = SqliteTx { tx: &tx };
                f(&mut adapter_tx)?;
                tx.commit()?;
                Ok(())
            })();
            match result {
                Err(err) if is_busy(&err) && attempt < TX_RETRIES => {
                    trace!(attempt, "sqlite.tx.retry");
                    continue;
                }
                other => return other,
            }
        }
    }

    fn get_object_exact_version(
        &self,
        location: &ObjectLocation,
        version: Version,
    ) -> Result<Option<Object>> {
        let sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM objects \
             WHERE project_id = ?1 AND bucket_name = ?2 AND object_key = ?3 AND version = ?4"
        );
        Ok(self
            .query_objects(
                &sql,
                vec![
                    Value::Blob(location.project_id.0.as_bytes().to_vec()),
                    Value::Text(location.bucket_name.0.clone()),
                    Value::Blob(location.object_key.0.clone()),
                    Value::Integer(version.0),
                ],
            )?
            .pop())
    }

    fn get_highest_visible(&self, location: &ObjectLocation) -> Result<Option<Object>> {
        let sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM objects \
             WHERE project_id = ?1 AND bucket_name = ?2 AND object_key = ?3 \
               AND {STATUS_VISIBLE} ORDER BY version DESC LIMIT 1"
        );
        Ok(self
            .query_objects(
                &sql,
                vec![
                    Value::Blob(location.project_id.0.as_bytes().to_vec()),
                    Value::Text(location.bucket_name.0.clone()),
                    Value::Blob(location.object_key.0.clone()),
                ],
            )?
            .pop())
    }

    fn get_segment(
        &self,
        stream_id: StreamId,
        position: SegmentPosition,
    ) -> Result<Option<Segment>> {
        let sql = format!(
            "SELECT {SEGMENT_COLUMNS} FROM segments WHERE stream_id = ?1 AND position = ?2"
        );
        Ok(self
            .query_segments(
                &sql,
                vec![
                    Value::Blob(stream_id.0.as_bytes().to_vec()),
                    Value::Integer(position.encode() as i64),
                ],
            )?
            .pop())
    }

    fn list_segments(
        &self,
        stream_id: StreamId,
        after: Option<SegmentPosition>,
        limit: usize,
    ) -> Result<Vec<Segment>> {
        let sql = format!(
            "SELECT {SEGMENT_COLUMNS} FROM segments \
             WHERE stream_id = ?1 AND position > ?2 ORDER BY position ASC LIMIT ?3"
        );
        let after = after.map_or(-1, |position| position.encode() as i64);
        self.query_segments(
            &sql,
            vec![
                Value::Blob(stream_id.0.as_bytes().to_vec()),
                Value::Integer(after),
                Value::Integer(limit as i64),
            ],
        )
    }

    fn pending_object_exists(&self, stream: &ObjectStream) -> Result<bool> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT 1 FROM objects \
             WHERE project_id = ?1 AND bucket_name = ?2 AND object_key = ?3 \
               AND version = ?4 AND stream_id = ?5 AND {STATUS_PENDING}"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        Ok(stmt
            .query_row(
                params![
                    stream.location.project_id.0.as_bytes(),
                    stream.location.bucket_name.0,
                    stream.location.object_key.0,
                    stream.version.0,
                    stream.stream_id.0.as_bytes(),
                ],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }

    fn list_objects_batch(&self, query: &BatchQuery) -> Result<Vec<Object>> {
        let mut sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM objects \
             WHERE project_id = ?1 AND bucket_name = ?2"
        );
        let mut params = vec![
            Value::Blob(query.project_id.0.as_bytes().to_vec()),
            Value::Text(query.bucket_name.0.clone()),
        ];
        match &query.start {
            BatchBound::KeyInclusive(key) => {
                params.push(Value::Blob(key.0.clone()));
                sql.push_str(&format!(" AND object_key >= ?{}", params.len()));
            }
            BatchBound::AfterKeyVersion(key, version) => {
                params.push(Value::Blob(key.0.clone()));
                let key_idx = params.len();
                params.push(Value::Integer(version.0));
                let version_idx = params.len();
                let comparison = match query.order {
                    VersionOrder::Descending => "<",
                    VersionOrder::Ascending => ">",
                };
                sql.push_str(&format!(
                    " AND (object_key > ?{key_idx} OR \
                       (object_key = ?{key_idx} AND version {comparison} ?{version_idx}))"
                ));
            }
        }
        if let Some(end) = &query.end_before {
            params.push(Value::Blob(end.0.clone()));
            sql.push_str(&format!(" AND object_key < ?{}", params.len()));
        }
        sql.push_str(" AND ");
        sql.push_str(if query.pending_only {
            STATUS_PENDING
        } else {
            STATUS_VISIBLE
        });
        let order = match query.order {
            VersionOrder::Descending => "DESC",
            VersionOrder::Ascending => "ASC",
        };
        params.push(Value::Integer(query.limit as i64));
        sql.push_str(&format!(
            " ORDER BY object_key ASC, version {order} LIMIT ?{}",
            params.len()
        ));
        self.query_objects(&sql, params)
    }

    fn list_pending_by_key(
        &self,
        location: &ObjectLocation,
        after: Option<StreamId>,
        limit: usize,
    ) -> Result<Vec<Object>> {
        let mut sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM objects \
             WHERE project_id = ?1 AND bucket_name = ?2 AND object_key = ?3 AND {STATUS_PENDING}"
        );
        let mut params = vec![
            Value::Blob(location.project_id.0.as_bytes().to_vec()),
            Value::Text(location.bucket_name.0.clone()),
            Value::Blob(location.object_key.0.clone()),
        ];
        if let Some(cursor) = after {
            params.push(Value::Blob(cursor.0.as_bytes().to_vec()));
            sql.push_str(&format!(" AND stream_id > ?{}", params.len()));
        }
        params.push(Value::Integer(limit as i64));
        sql.push_str(&format!(" ORDER BY stream_id ASC LIMIT ?{}", params.len()));
        self.query_objects(&sql, params)
    }

    fn list_verify_segments(&self, cursor: &VerifyCursor, limit: usize) -> Result<Vec<Segment>> {
        let mut sql = format!(
            "SELECT {SEGMENT_COLUMNS} FROM segments WHERE remote_alias_pieces IS NOT NULL"
        );
        let mut params = Vec::new();
        if let Some(stream_id) = cursor.stream_id {
            params.push(Value::Blob(stream_id.0.as_bytes().to_vec()));
            let stream_idx = params.len();
            params.push(Value::Integer(cursor.position.encode() as i64));
            let position_idx = params.len();
            sql.push_str(&format!(
                " AND (stream_id > ?{stream_idx} OR \
                   (stream_id = ?{stream_idx} AND position > ?{position_idx}))"
            ));
        }
        params.push(Value::Integer(limit as i64));
        sql.push_str(&format!(
            " ORDER BY stream_id ASC, position ASC LIMIT ?{}",
            params.len()
        ));
        self.query_segments(&sql, params)
    }

    fn table_stats(&self) -> Result<TableStats> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT COUNT(*) FROM segments")?;
        let count: i64 = stmt.query_row([], |row| row.get(0))?;
        Ok(TableStats {
            segment_count: count as u64,
        })
    }

    fn find_zombie_objects(
        &self,
        deadline_before: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<ObjectStream>> {
        let sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM objects \
             WHERE {STATUS_PENDING} AND zombie_deletion_deadline IS NOT NULL \
               AND zombie_deletion_deadline < ?1 \
             ORDER BY zombie_deletion_deadline ASC LIMIT ?2"
        );
        Ok(self
            .query_objects(
                &sql,
                vec![
                    Value::Integer(ts_to_db(deadline_before)),
                    Value::Integer(limit as i64),
                ],
            )?
            .into_iter()
            .map(|object| object.stream)
            .collect())
    }

    fn find_expired_objects(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<ObjectStream>> {
        let sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM objects \
             WHERE expires_at IS NOT NULL AND expires_at < ?1 \
             ORDER BY expires_at ASC LIMIT ?2"
        );
        Ok(self
            .query_objects(
                &sql,
                vec![Value::Integer(ts_to_db(now)), Value::Integer(limit as i64)],
            )?
            .into_iter()
            .map(|object| object.stream)
            .collect())
    }

    fn find_expired_segments(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<(StreamId, SegmentPosition)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT stream_id, position FROM segments \
             WHERE expires_at IS NOT NULL AND expires_at < ?1 \
             ORDER BY expires_at ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![ts_to_db(now), limit as i64], |row| {
            let stream_id = StreamId(uuid_from_db(row.get(0)?)?);
            let position = SegmentPosition::decode(row.get::<_, i64>(1)? as u64);
            Ok((stream_id, position))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn ensure_node_aliases(&self, nodes: &[NodeId]) -> Result<Vec<(NodeId, NodeAlias)>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut out = Vec::with_capacity(nodes.len());
        {
            let mut insert = tx.prepare_cached(
                "INSERT OR IGNORE INTO node_aliases (node_id, alias) \
                 VALUES (?1, (SELECT COALESCE(MAX(alias), 0) + 1 FROM node_aliases))",
            )?;
            let mut select = tx
                .prepare_cached("SELECT alias FROM node_aliases WHERE node_id = ?1")?;
            for node in nodes {
                insert.execute(params![node.0.as_slice()])?;
                let alias: i64 =
                    select.query_row(params![node.0.as_slice()], |row| row.get(0))?;
                out.push((*node, NodeAlias(alias as u32)));
            }
        }
        tx.commit()?;
        Ok(out)
    }

    fn load_node_aliases(&self) -> Result<Vec<(NodeId, NodeAlias)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT node_id, alias FROM node_aliases")?;
        let rows = stmt.query_map([], |row| {
            let node = row.get::<_, Vec<u8>>(0)?;
            let alias = row.get::<_, i64>(1)?;
            Ok((node, alias))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (node, alias) = row?;
            out.push((NodeId::from_slice(&node)?, NodeAlias(alias as u32)));
        }
        Ok(out)
    }
}
