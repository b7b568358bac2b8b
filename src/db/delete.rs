//! Point deletes, last-committed deletes with delete-marker insertion, and
//! bulk all-versions removal. Every path checks object lock before touching
//! a committed row.

use time::OffsetDateTime;
use tracing::debug;

use crate::adapter::{PrecommitConstraint, TransactionOptions};
use crate::db::Metabase;
use crate::error::{MetabaseError, Result};
use crate::model::{
    check_removal, EncryptedUserData, EncryptionParameters, LockCheck, Object, ObjectLocation,
    ObjectStatus, ObjectStream, Retention, StreamId, Version,
};

/// Remove one specific version.
#[derive(Clone, Debug)]
pub struct DeleteObjectExactVersion {
    pub location: ObjectLocation,
    pub version: Version,
    pub bypass_governance: bool,
}

/// Remove (or mask) the newest committed object of a key. Exactly one of the
/// bucket modes applies: versioned inserts a versioned delete marker,
/// suspended replaces the unversioned row with an unversioned marker, plain
/// removes the row.
#[derive(Clone, Debug)]
pub struct DeleteObjectLastCommitted {
    pub location: ObjectLocation,
    pub versioned: bool,
    pub suspended: bool,
    pub bypass_governance: bool,
}

/// Abort an upload, removing its pending row and segments.
#[derive(Clone, Debug)]
pub struct DeletePendingObject {
    pub stream: ObjectStream,
}

/// Remove every version of each listed key. Used by bucket deletion; each
/// key is cleared in its own transaction.
#[derive(Clone, Debug)]
pub struct DeleteObjectsAllVersions {
    pub locations: Vec<ObjectLocation>,
    pub bypass_governance: bool,
}

/// What a delete did: rows removed and markers inserted, for downstream
/// billing.
#[derive(Clone, Debug, Default)]
pub struct DeleteObjectResult {
    pub removed: Vec<Object>,
    pub markers: Vec<Object>,
}

impl Metabase {
    pub fn delete_object_exact_version(
        &self,
        opts: DeleteObjectExactVersion,
    ) -> Result<DeleteObjectResult> {
        opts.location.verify()?;
        if !opts.version.is_valid() {
            return Err(MetabaseError::invalid("version invalid"));
        }

        let now = OffsetDateTime::now_utc();
        let removed = self.run_tx(&TransactionOptions::default(), |tx| {
            let object = tx
                .get_object_exact_version(&opts.location, opts.version)?
                .ok_or(MetabaseError::ObjectNotFound)?;
            check_removal(
                LockCheck {
                    retention: object.retention,
                    legal_hold: object.legal_hold,
                    bypass_governance: opts.bypass_governance,
                },
                now,
            )?;
            tx.delete_object(&opts.location, opts.version)?;
            tx.delete_segments(object.stream_id())?;
            Ok(object)
        })?;
        debug!(version = removed.version().0, "delete.exact_version");
        Ok(DeleteObjectResult {
            removed: vec![removed],
            markers: Vec::new(),
        })
    }

    pub fn delete_object_last_committed(
        &self,
        opts: DeleteObjectLastCommitted,
    ) -> Result<DeleteObjectResult> {
        opts.location.verify()?;
        if opts.versioned && opts.suspended {
            return Err(MetabaseError::invalid(
                "versioned and suspended are mutually exclusive",
            ));
        }

        if opts.versioned {
            self.delete_last_committed_versioned(&opts)
        } else if opts.suspended {
            self.delete_last_committed_suspended(&opts)
        } else {
            self.delete_last_committed_plain(&opts)
        }
    }

    pub fn delete_pending_object(&self, opts: DeletePendingObject) -> Result<DeleteObjectResult> {
        opts.stream.verify()?;
        let removed = self.run_tx(&TransactionOptions::default(), |tx| {
            let object = tx
                .get_pending_object(&opts.stream)?
                .ok_or(MetabaseError::ObjectNotFound)?;
            tx.delete_object(&opts.stream.location, opts.stream.version)?;
            tx.delete_segments(object.stream_id())?;
            Ok(object)
        })?;
        debug!(version = removed.version().0, "delete.pending");
        Ok(DeleteObjectResult {
            removed: vec![removed],
            markers: Vec::new(),
        })
    }

    /// Clears whole keys. A locked row aborts that key's transaction; keys
    /// already cleared stay cleared.
    pub fn delete_objects_all_versions(
        &self,
        opts: DeleteObjectsAllVersions,
    ) -> Result<DeleteObjectResult> {
        for location in &opts.locations {
            location.verify()?;
        }

        let now = OffsetDateTime::now_utc();
        let mut result = DeleteObjectResult::default();
        for location in &opts.locations {
            let removed = self.run_tx(&TransactionOptions::default(), |tx| {
                let rows = tx.list_object_versions(location)?;
                for object in &rows {
                    check_removal(
                        LockCheck {
                            retention: object.retention,
                            legal_hold: object.legal_hold,
                            bypass_governance: opts.bypass_governance,
                        },
                        now,
                    )?;
                }
                for object in &rows {
                    tx.delete_object(location, object.version())?;
                    tx.delete_segments(object.stream_id())?;
                }
                Ok(rows)
            })?;
            result.removed.extend(removed);
        }
        debug!(removed = result.removed.len(), "delete.all_versions");
        Ok(result)
    }

    fn delete_last_committed_plain(
        &self,
        opts: &DeleteObjectLastCommitted,
    ) -> Result<DeleteObjectResult> {
        let now = OffsetDateTime::now_utc();
        let removed = self.run_tx(&TransactionOptions::default(), |tx| {
            let mut constraint = PrecommitConstraint::new(&opts.location);
            constraint.include_unversioned = true;
            let info = tx.precommit_query(&constraint)?;
            let incumbent = info
                .unversioned
                .filter(|object| object.status.is_committed())
                .ok_or(MetabaseError::ObjectNotFound)?;
            check_removal(
                LockCheck {
                    retention: incumbent.retention,
                    legal_hold: incumbent.legal_hold,
                    bypass_governance: opts.bypass_governance,
                },
                now,
            )?;
            tx.delete_object(&opts.location, incumbent.version())?;
            tx.delete_segments(incumbent.stream_id())?;
            Ok(incumbent)
        })?;
        debug!(version = removed.version().0, "delete.last_committed");
        Ok(DeleteObjectResult {
            removed: vec![removed],
            markers: Vec::new(),
        })
    }

    fn delete_last_committed_versioned(
        &self,
        opts: &DeleteObjectLastCommitted,
    ) -> Result<DeleteObjectResult> {
        let now = OffsetDateTime::now_utc();
        let marker = self.run_tx(&TransactionOptions::default(), |tx| {
            let mut constraint = PrecommitConstraint::new(&opts.location);
            constraint.include_highest = true;
            constraint.include_highest_visible = true;
            let info = tx.precommit_query(&constraint)?;
            if info.highest_visible.is_none() {
                return Err(MetabaseError::ObjectNotFound);
            }
            let marker = delete_marker(
                &opts.location,
                info.highest_version.next(),
                ObjectStatus::DeleteMarkerVersioned,
                now,
            );
            tx.insert_object(&marker)?;
            Ok(marker)
        })?;
        debug!(version = marker.version().0, "delete.marker_versioned");
        Ok(DeleteObjectResult {
            removed: Vec::new(),
            markers: vec![marker],
        })
    }

    fn delete_last_committed_suspended(
        &self,
        opts: &DeleteObjectLastCommitted,
    ) -> Result<DeleteObjectResult> {
        let now = OffsetDateTime::now_utc();
        let (removed, marker) = self.run_tx(&TransactionOptions::default(), |tx| {
            let mut constraint = PrecommitConstraint::new(&opts.location);
            constraint.include_unversioned = true;
            constraint.include_highest = true;
            constraint.include_highest_visible = true;
            let info = tx.precommit_query(&constraint)?;
            if info.highest_visible.is_none() {
                return Err(MetabaseError::ObjectNotFound);
            }

            let mut removed = None;
            if let Some(incumbent) = info.unversioned {
                if incumbent.status.is_committed() {
                    check_removal(
                        LockCheck {
                            retention: incumbent.retention,
                            legal_hold: incumbent.legal_hold,
                            bypass_governance: opts.bypass_governance,
                        },
                        now,
                    )?;
                }
                tx.delete_object(&opts.location, incumbent.version())?;
                tx.delete_segments(incumbent.stream_id())?;
                if incumbent.status.is_committed() {
                    removed = Some(incumbent);
                }
            }

            let marker = delete_marker(
                &opts.location,
                info.highest_version.next(),
                ObjectStatus::DeleteMarkerUnversioned,
                now,
            );
            tx.insert_object(&marker)?;
            Ok((removed, marker))
        })?;
        debug!(version = marker.version().0, "delete.marker_suspended");
        Ok(DeleteObjectResult {
            removed: removed.into_iter().collect(),
            markers: vec![marker],
        })
    }
}

/// A delete marker is a tombstone: zero segments and no payload beyond
/// placeholders.
fn delete_marker(
    location: &ObjectLocation,
    version: Version,
    status: ObjectStatus,
    now: OffsetDateTime,
) -> Object {
    Object {
        stream: ObjectStream {
            location: location.clone(),
            version,
            stream_id: StreamId::random(),
        },
        status,
        created_at: now,
        expires_at: None,
        zombie_deletion_deadline: None,
        encryption: EncryptionParameters::default(),
        user_data: EncryptedUserData::default(),
        segment_count: 0,
        total_plain_size: 0,
        total_encrypted_size: 0,
        fixed_segment_size: 0,
        retention: Retention::default(),
        legal_hold: false,
    }
}
