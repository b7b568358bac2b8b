//! Object row lifecycle entry points: multi-stage upload begin, committed
//! point reads, metadata updates, and the object-lock setters.

use time::OffsetDateTime;
use tracing::debug;

use crate::adapter::{PendingRef, PrecommitConstraint, TransactionOptions};
use crate::db::Metabase;
use crate::error::{MetabaseError, Result};
use crate::model::verify_lock_and_expiry;
use crate::model::{
    EncryptedUserData, EncryptionParameters, Object, ObjectLocation, ObjectStatus, ObjectStream,
    Retention, RetentionMode, StreamId, Version,
};

/// Begin an upload, letting the store assign the next monotonic version.
#[derive(Clone, Debug)]
pub struct BeginObjectNextVersion {
    pub location: ObjectLocation,
    pub stream_id: StreamId,
    pub encryption: EncryptionParameters,
    pub user_data: EncryptedUserData,
    pub expires_at: Option<OffsetDateTime>,
    /// Defaults to now plus the configured zombie deletion period.
    pub zombie_deletion_deadline: Option<OffsetDateTime>,
    pub retention: Retention,
    pub legal_hold: bool,
}

/// Begin an upload at a caller-chosen version.
#[derive(Clone, Debug)]
pub struct BeginObjectExactVersion {
    pub location: ObjectLocation,
    pub version: Version,
    pub stream_id: StreamId,
    pub encryption: EncryptionParameters,
    pub user_data: EncryptedUserData,
    pub expires_at: Option<OffsetDateTime>,
    pub zombie_deletion_deadline: Option<OffsetDateTime>,
    pub retention: Retention,
    pub legal_hold: bool,
}

/// Replace the opaque metadata of a committed object.
#[derive(Clone, Debug)]
pub struct UpdateObjectMetadata {
    pub location: ObjectLocation,
    pub stream_id: StreamId,
    pub user_data: EncryptedUserData,
}

/// Change the retention period of one committed version.
#[derive(Clone, Debug)]
pub struct SetObjectExactVersionRetention {
    pub location: ObjectLocation,
    pub version: Version,
    pub retention: Retention,
    pub bypass_governance: bool,
}

/// Toggle the legal hold flag of one committed version.
#[derive(Clone, Debug)]
pub struct SetObjectExactVersionLegalHold {
    pub location: ObjectLocation,
    pub version: Version,
    pub enabled: bool,
}

impl Metabase {
    pub fn begin_object_next_version(&self, opts: BeginObjectNextVersion) -> Result<Object> {
        opts.location.verify()?;
        if opts.stream_id.is_zero() {
            return Err(MetabaseError::invalid("stream id missing"));
        }
        opts.encryption.verify()?;
        opts.user_data.verify()?;
        verify_lock_and_expiry(opts.expires_at, &opts.retention, opts.legal_hold)?;

        let now = OffsetDateTime::now_utc();
        let zombie_deadline = opts
            .zombie_deletion_deadline
            .unwrap_or(now + self.config.zombie_deletion_period);

        let object = self.run_tx(&TransactionOptions::default(), |tx| {
            let version = tx.next_version(&opts.location)?;
            let object = pending_object(&opts.location, version, &opts, now, zombie_deadline);
            tx.insert_object(&object)?;
            Ok(object)
        })?;
        debug!(version = object.version().0, "object.begin");
        Ok(object)
    }

    pub fn begin_object_exact_version(&self, opts: BeginObjectExactVersion) -> Result<Object> {
        opts.location.verify()?;
        if !opts.version.is_valid() {
            return Err(MetabaseError::invalid("version invalid"));
        }
        if opts.stream_id.is_zero() {
            return Err(MetabaseError::invalid("stream id missing"));
        }
        opts.encryption.verify()?;
        opts.user_data.verify()?;
        verify_lock_and_expiry(opts.expires_at, &opts.retention, opts.legal_hold)?;

        let now = OffsetDateTime::now_utc();
        let zombie_deadline = opts
            .zombie_deletion_deadline
            .unwrap_or(now + self.config.zombie_deletion_period);
        let begin = BeginObjectNextVersion {
            location: opts.location.clone(),
            stream_id: opts.stream_id,
            encryption: opts.encryption,
            user_data: opts.user_data.clone(),
            expires_at: opts.expires_at,
            zombie_deletion_deadline: opts.zombie_deletion_deadline,
            retention: opts.retention,
            legal_hold: opts.legal_hold,
        };

        let object = self.run_tx(&TransactionOptions::default(), |tx| {
            let object = pending_object(&opts.location, opts.version, &begin, now, zombie_deadline);
            tx.insert_object(&object)?;
            Ok(object)
        })?;
        debug!(version = object.version().0, "object.begin_exact");
        Ok(object)
    }

    /// Committed-or-marker point read. Pending and expired rows report as
    /// missing.
    pub fn get_object_exact_version(
        &self,
        location: &ObjectLocation,
        version: Version,
    ) -> Result<Object> {
        location.verify()?;
        if !version.is_valid() {
            return Err(MetabaseError::invalid("version invalid"));
        }
        let now = OffsetDateTime::now_utc();
        self.adapter()
            .get_object_exact_version(location, version)?
            .filter(|object| object.status.is_visible())
            .filter(|object| object.expires_at.map_or(true, |expires| expires > now))
            .ok_or(MetabaseError::ObjectNotFound)
    }

    /// The newest committed row of the key. A delete marker as the newest
    /// row masks everything beneath it.
    pub fn get_object_last_committed(&self, location: &ObjectLocation) -> Result<Object> {
        location.verify()?;
        let now = OffsetDateTime::now_utc();
        let object = self
            .adapter()
            .get_highest_visible(location)?
            .filter(|object| object.expires_at.map_or(true, |expires| expires > now))
            .ok_or(MetabaseError::ObjectNotFound)?;
        if object.status.is_delete_marker() {
            return Err(MetabaseError::ObjectNotFound);
        }
        Ok(object)
    }

    pub fn update_object_metadata(&self, opts: UpdateObjectMetadata) -> Result<()> {
        opts.location.verify()?;
        if opts.stream_id.is_zero() {
            return Err(MetabaseError::invalid("stream id missing"));
        }
        opts.user_data.verify()?;

        let updated = self.run_tx(&TransactionOptions::default(), |tx| {
            tx.update_object_user_data(&opts.location, opts.stream_id, &opts.user_data)
        })?;
        if !updated {
            return Err(MetabaseError::ObjectNotFound);
        }
        Ok(())
    }

    /// Retention can always be extended; shortening or clearing an active
    /// compliance period is refused, and an active governance period bends
    /// only to the bypass privilege.
    pub fn set_object_exact_version_retention(
        &self,
        opts: SetObjectExactVersionRetention,
    ) -> Result<()> {
        opts.location.verify()?;
        if !opts.version.is_valid() {
            return Err(MetabaseError::invalid("version invalid"));
        }
        opts.retention.verify()?;

        let now = OffsetDateTime::now_utc();
        self.run_tx(&TransactionOptions::default(), |tx| {
            let object = tx
                .get_object_exact_version(&opts.location, opts.version)?
                .filter(|object| !object.status.is_pending())
                .ok_or(MetabaseError::ObjectNotFound)?;
            if object.status.is_delete_marker() {
                return Err(MetabaseError::Conflict(
                    "cannot set retention on a delete marker".into(),
                ));
            }
            if object.expires_at.is_some() {
                return Err(MetabaseError::invalid(
                    "object expiration and retention cannot both be set",
                ));
            }
            verify_retention_transition(&object.retention, &opts.retention, opts.bypass_governance, now)?;
            if !tx.update_object_lock(
                &opts.location,
                opts.version,
                opts.retention,
                object.legal_hold,
            )? {
                return Err(MetabaseError::ObjectNotFound);
            }
            Ok(())
        })
    }

    pub fn set_object_exact_version_legal_hold(
        &self,
        opts: SetObjectExactVersionLegalHold,
    ) -> Result<()> {
        opts.location.verify()?;
        if !opts.version.is_valid() {
            return Err(MetabaseError::invalid("version invalid"));
        }

        self.run_tx(&TransactionOptions::default(), |tx| {
            let object = tx
                .get_object_exact_version(&opts.location, opts.version)?
                .filter(|object| !object.status.is_pending())
                .ok_or(MetabaseError::ObjectNotFound)?;
            if object.status.is_delete_marker() {
                return Err(MetabaseError::Conflict(
                    "cannot set legal hold on a delete marker".into(),
                ));
            }
            if object.expires_at.is_some() {
                return Err(MetabaseError::invalid(
                    "object expiration and legal hold cannot both be set",
                ));
            }
            if !tx.update_object_lock(
                &opts.location,
                opts.version,
                object.retention,
                opts.enabled,
            )? {
                return Err(MetabaseError::ObjectNotFound);
            }
            Ok(())
        })
    }

    /// Best-effort probe used by segment uploads; commit performs the
    /// authoritative check.
    pub(crate) fn pending_object_exists(&self, stream: &ObjectStream) -> Result<bool> {
        self.adapter().pending_object_exists(stream)
    }

    /// The pending row's state as seen by a precommit snapshot; exposed for
    /// the commit path.
    pub(crate) fn pending_ref(stream: &ObjectStream) -> PrecommitConstraint<'_> {
        let mut constraint = PrecommitConstraint::new(&stream.location);
        constraint.pending = Some(PendingRef {
            version: stream.version,
            stream_id: stream.stream_id,
        });
        constraint
    }
}

fn pending_object(
    location: &ObjectLocation,
    version: Version,
    opts: &BeginObjectNextVersion,
    now: OffsetDateTime,
    zombie_deadline: OffsetDateTime,
) -> Object {
    Object {
        stream: ObjectStream {
            location: location.clone(),
            version,
            stream_id: opts.stream_id,
        },
        status: ObjectStatus::Pending,
        created_at: now,
        expires_at: opts.expires_at,
        zombie_deletion_deadline: Some(zombie_deadline),
        encryption: opts.encryption,
        user_data: opts.user_data.clone(),
        segment_count: 0,
        total_plain_size: 0,
        total_encrypted_size: 0,
        fixed_segment_size: 0,
        retention: opts.retention,
        legal_hold: opts.legal_hold,
    }
}

fn verify_retention_transition(
    current: &Retention,
    requested: &Retention,
    bypass_governance: bool,
    now: OffsetDateTime,
) -> Result<()> {
    if !current.active(now) {
        return Ok(());
    }
    let extends = requested.mode == current.mode
        && requested.retain_until >= current.retain_until;
    match current.mode {
        RetentionMode::Compliance if !extends => {
            Err(MetabaseError::ObjectLock("locked by compliance retention"))
        }
        RetentionMode::Governance if !extends && !bypass_governance => {
            Err(MetabaseError::ObjectLock("locked by governance retention"))
        }
        _ => Ok(()),
    }
}
