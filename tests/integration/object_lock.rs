mod common;

use common::*;
use metabase::{
    DeleteObjectExactVersion, MetabaseError, Retention, RetentionMode,
    SetObjectExactVersionLegalHold, SetObjectExactVersionRetention, Version,
};

fn upload_with_retention(
    db: &metabase::Metabase,
    location: metabase::ObjectLocation,
    retention: Retention,
    legal_hold: bool,
) -> metabase::Object {
    let mut opts = begin_opts(location);
    opts.retention = retention;
    opts.legal_hold = legal_hold;
    let pending = db.begin_object_next_version(opts).expect("begin");
    commit_remote_segment(db, &pending.stream, 0, 0, 64);
    db.commit_object(commit_opts(pending.stream, true))
        .expect("commit")
}

fn delete_exact(
    db: &metabase::Metabase,
    object: &metabase::Object,
    bypass_governance: bool,
) -> Result<metabase::DeleteObjectResult, MetabaseError> {
    db.delete_object_exact_version(DeleteObjectExactVersion {
        location: object.location().clone(),
        version: object.version(),
        bypass_governance,
    })
}

#[test]
fn retention_carries_from_begin_to_commit() {
    for_each_backend(|db| {
        let retention = Retention::compliance(future(1));
        let committed =
            upload_with_retention(db, test_location("k"), retention, false);
        assert_eq!(committed.retention, retention);
        assert!(!committed.legal_hold);
    });
}

#[test]
fn compliance_retention_blocks_delete_until_expiry() {
    for_each_backend(|db| {
        let active = upload_with_retention(
            db,
            test_location("active"),
            Retention::compliance(future(1)),
            false,
        );
        let err = delete_exact(db, &active, true).unwrap_err();
        assert!(
            matches!(err, MetabaseError::ObjectLock(_)),
            "bypass does not help compliance: {err}"
        );

        let expired = upload_with_retention(
            db,
            test_location("expired"),
            Retention::compliance(past(1)),
            false,
        );
        delete_exact(db, &expired, false).expect("expired retention allows delete");
    });
}

#[test]
fn governance_retention_bends_to_bypass() {
    for_each_backend(|db| {
        let object = upload_with_retention(
            db,
            test_location("gov"),
            Retention::governance(future(1)),
            false,
        );
        let err = delete_exact(db, &object, false).unwrap_err();
        assert!(matches!(err, MetabaseError::ObjectLock(_)), "got: {err}");
        delete_exact(db, &object, true).expect("bypass governance");
    });
}

#[test]
fn legal_hold_blocks_unconditionally() {
    for_each_backend(|db| {
        let object =
            upload_with_retention(db, test_location("hold"), Retention::default(), true);
        let err = delete_exact(db, &object, true).unwrap_err();
        assert!(matches!(err, MetabaseError::ObjectLock(_)), "got: {err}");

        // Clearing the hold unblocks the delete.
        db.set_object_exact_version_legal_hold(SetObjectExactVersionLegalHold {
            location: object.location().clone(),
            version: object.version(),
            enabled: false,
        })
        .expect("clear hold");
        delete_exact(db, &object, false).expect("delete after clearing hold");
    });
}

#[test]
fn locked_incumbent_blocks_unversioned_overwrite() {
    for_each_backend(|db| {
        let location = test_location("k");
        let mut opts = begin_opts(location.clone());
        opts.legal_hold = true;
        let pending = db.begin_object_next_version(opts).expect("begin");
        commit_remote_segment(db, &pending.stream, 0, 0, 64);
        db.commit_object(commit_opts(pending.stream, false))
            .expect("commit held object");

        let pending = begin_object(db, location.clone());
        commit_remote_segment(db, &pending.stream, 0, 0, 64);
        let err = db
            .commit_object(commit_opts(pending.stream, false))
            .unwrap_err();
        assert!(
            matches!(err, MetabaseError::ObjectLock(_)),
            "overwrite is a destructive action: {err}"
        );
    });
}

#[test]
fn disallow_delete_turns_overwrite_into_permission_denied() {
    for_each_backend(|db| {
        let location = test_location("k");
        upload_object(db, location.clone(), false);

        let pending = begin_object(db, location.clone());
        commit_remote_segment(db, &pending.stream, 0, 0, 64);
        let mut opts = commit_opts(pending.stream, false);
        opts.disallow_delete = true;
        let err = db.commit_object(opts).unwrap_err();
        assert!(
            matches!(err, MetabaseError::PermissionDenied(_)),
            "got: {err}"
        );
    });
}

#[test]
fn retention_can_extend_but_not_shorten_without_privilege() {
    for_each_backend(|db| {
        let object = upload_with_retention(
            db,
            test_location("gov"),
            Retention::governance(future(1)),
            false,
        );
        let location = object.location().clone();

        // Extending is always allowed.
        db.set_object_exact_version_retention(SetObjectExactVersionRetention {
            location: location.clone(),
            version: object.version(),
            retention: Retention::governance(future(48)),
            bypass_governance: false,
        })
        .expect("extend");

        // Shortening governance needs the bypass privilege.
        let err = db
            .set_object_exact_version_retention(SetObjectExactVersionRetention {
                location: location.clone(),
                version: object.version(),
                retention: Retention::governance(future(2)),
                bypass_governance: false,
            })
            .unwrap_err();
        assert!(matches!(err, MetabaseError::ObjectLock(_)), "got: {err}");
        db.set_object_exact_version_retention(SetObjectExactVersionRetention {
            location: location.clone(),
            version: object.version(),
            retention: Retention::governance(future(2)),
            bypass_governance: true,
        })
        .expect("shorten with bypass");

        // Compliance cannot be shortened at all.
        let compliance = upload_with_retention(
            db,
            test_location("comp"),
            Retention::compliance(future(10)),
            false,
        );
        let err = db
            .set_object_exact_version_retention(SetObjectExactVersionRetention {
                location: compliance.location().clone(),
                version: compliance.version(),
                retention: Retention::compliance(future(1)),
                bypass_governance: true,
            })
            .unwrap_err();
        assert!(matches!(err, MetabaseError::ObjectLock(_)), "got: {err}");
        db.set_object_exact_version_retention(SetObjectExactVersionRetention {
            location: compliance.location().clone(),
            version: compliance.version(),
            retention: Retention {
                mode: RetentionMode::Compliance,
                retain_until: Some(future(20)),
            },
            bypass_governance: false,
        })
        .expect("extend compliance");
    });
}

#[test]
fn lock_setters_reject_markers_pending_and_ttl_rows() {
    for_each_backend(|db| {
        let location = test_location("k");
        let pending = begin_object(db, location.clone());
        let err = db
            .set_object_exact_version_retention(SetObjectExactVersionRetention {
                location: location.clone(),
                version: pending.version(),
                retention: Retention::compliance(future(1)),
                bypass_governance: false,
            })
            .unwrap_err();
        assert!(
            matches!(err, MetabaseError::ObjectNotFound),
            "pending rows are invisible to lock setters: {err}"
        );

        // A TTL'd object cannot gain lock state.
        let ttl_location = test_location("ttl");
        let mut opts = begin_opts(ttl_location.clone());
        opts.expires_at = Some(future(24));
        let ttl_pending = db.begin_object_next_version(opts).expect("begin");
        commit_remote_segment(db, &ttl_pending.stream, 0, 0, 64);
        let committed = db
            .commit_object(commit_opts(ttl_pending.stream, false))
            .expect("commit");
        let err = db
            .set_object_exact_version_legal_hold(SetObjectExactVersionLegalHold {
                location: ttl_location,
                version: committed.version(),
                enabled: true,
            })
            .unwrap_err();
        assert!(matches!(err, MetabaseError::InvalidRequest(_)), "got: {err}");

        // Delete markers carry no lock state.
        upload_object(db, location.clone(), true);
        let marker = db
            .delete_object_last_committed(metabase::DeleteObjectLastCommitted {
                location: location.clone(),
                versioned: true,
                suspended: false,
                bypass_governance: false,
            })
            .expect("marker")
            .markers
            .remove(0);
        let err = db
            .set_object_exact_version_retention(SetObjectExactVersionRetention {
                location,
                version: marker.version(),
                retention: Retention::compliance(future(1)),
                bypass_governance: false,
            })
            .unwrap_err();
        assert!(matches!(err, MetabaseError::Conflict(_)), "got: {err}");
    });
}

#[test]
fn retention_validation_rejects_inconsistent_values() {
    for_each_backend(|db| {
        let object = upload_object(db, test_location("k"), true);
        let err = db
            .set_object_exact_version_retention(SetObjectExactVersionRetention {
                location: object.location().clone(),
                version: object.version(),
                retention: Retention {
                    mode: RetentionMode::Compliance,
                    retain_until: None,
                },
                bypass_governance: false,
            })
            .unwrap_err();
        assert!(matches!(err, MetabaseError::InvalidRequest(_)), "got: {err}");

        let err = db
            .set_object_exact_version_retention(SetObjectExactVersionRetention {
                location: object.location().clone(),
                version: Version(0),
                retention: Retention::default(),
                bypass_governance: false,
            })
            .unwrap_err();
        assert!(matches!(err, MetabaseError::InvalidRequest(_)), "got: {err}");
    });
}
