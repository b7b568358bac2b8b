mod common;

use common::*;
use metabase::{
    DeleteObjectLastCommitted, IfNoneMatch, IterateObjects, ListSegments, MetabaseError,
    ObjectStatus, Version,
};

#[test]
fn unversioned_overwrite_reuses_version() {
    for_each_backend(|db| {
        let location = test_location("k");
        let first = upload_object(db, location.clone(), false);
        assert_eq!(first.version(), Version(1));

        let second = upload_object(db, location.clone(), false);
        assert_eq!(
            second.version(),
            first.version(),
            "overwrite keeps the incumbent's version"
        );
        assert_ne!(second.stream_id(), first.stream_id());

        let current = db.get_object_last_committed(&location).expect("get");
        assert_eq!(current.stream_id(), second.stream_id());

        // The replaced stream's segments are gone.
        let leftovers = db
            .list_segments(ListSegments {
                stream_id: first.stream_id(),
                cursor: None,
                limit: 10,
            })
            .expect("list old stream");
        assert!(leftovers.segments.is_empty(), "old segments deleted");
    });
}

#[test]
fn versioned_commits_keep_history() {
    for_each_backend(|db| {
        let location = test_location("k");
        let v1 = upload_object(db, location.clone(), true);
        let v2 = upload_object(db, location.clone(), true);
        assert_eq!(v1.version(), Version(1));
        assert_eq!(v2.version(), Version(2));
        assert_eq!(v1.status, ObjectStatus::CommittedVersioned);

        let mut opts = IterateObjects::new(
            location.project_id,
            location.bucket_name.clone(),
        );
        opts.all_versions = true;
        let mut iterator = db
            .iterate_objects_all_versions_with_status(&opts)
            .expect("iterate");
        let versions: Vec<i64> = collect_entries(&mut iterator)
            .iter()
            .map(|entry| entry.version.0)
            .collect();
        assert_eq!(versions, vec![2, 1], "descending iterator: newest first");

        let mut iterator = db
            .iterate_objects_all_versions_ascending(&opts)
            .expect("iterate ascending");
        let versions: Vec<i64> = collect_entries(&mut iterator)
            .iter()
            .map(|entry| entry.version.0)
            .collect();
        assert_eq!(versions, vec![1, 2], "legacy iterator: oldest first");

        let mut latest = IterateObjects::new(
            location.project_id,
            location.bucket_name.clone(),
        );
        latest.all_versions = false;
        let mut iterator = db
            .iterate_objects_all_versions_with_status(&latest)
            .expect("iterate latest");
        let entries = collect_entries(&mut iterator);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].version, Version(2));
    });
}

#[test]
fn versions_stay_monotonic_across_deletes() {
    for_each_backend(|db| {
        let location = test_location("k");
        upload_object(db, location.clone(), true);
        upload_object(db, location.clone(), true);
        let result = db
            .delete_object_last_committed(DeleteObjectLastCommitted {
                location: location.clone(),
                versioned: true,
                suspended: false,
                bypass_governance: false,
            })
            .expect("delete marker");
        assert_eq!(result.markers[0].version(), Version(3));

        let after = upload_object(db, location, true);
        assert_eq!(
            after.version(),
            Version(4),
            "new version exceeds the delete marker"
        );
    });
}

#[test]
fn commit_bumps_version_past_concurrent_assignments() {
    for_each_backend(|db| {
        let location = test_location("k");
        let first = begin_object(db, location.clone());
        let second = begin_object(db, location.clone());
        assert_eq!(second.version(), Version(2));

        commit_remote_segment(db, &second.stream, 0, 0, 64);
        let committed_second = db
            .commit_object(commit_opts(second.stream, true))
            .expect("commit second");
        assert_eq!(committed_second.version(), Version(2));

        // The older pending row's version 1 has been overtaken; its commit
        // lands above the current highest assignment.
        commit_remote_segment(db, &first.stream, 0, 0, 64);
        let committed_first = db
            .commit_object(commit_opts(first.stream, true))
            .expect("commit first");
        assert_eq!(committed_first.version(), Version(3));
    });
}

#[test]
fn if_none_match_blocks_existing_committed_objects() {
    for_each_backend(|db| {
        let location = test_location("k");
        let pending = begin_object(db, location.clone());
        commit_remote_segment(db, &pending.stream, 0, 0, 64);
        let mut opts = commit_opts(pending.stream, true);
        opts.if_none_match = Some(IfNoneMatch::All);
        db.commit_object(opts).expect("first conditional write");

        let pending = begin_object(db, location.clone());
        commit_remote_segment(db, &pending.stream, 0, 0, 64);
        let mut opts = commit_opts(pending.stream, true);
        opts.if_none_match = Some(IfNoneMatch::All);
        let err = db.commit_object(opts).unwrap_err();
        assert!(
            matches!(err, MetabaseError::FailedPrecondition(_)),
            "got: {err}"
        );

        // A delete marker as the newest row counts as absent.
        db.delete_object_last_committed(DeleteObjectLastCommitted {
            location: location.clone(),
            versioned: true,
            suspended: false,
            bypass_governance: false,
        })
        .expect("insert marker");
        let pending = begin_object(db, location);
        commit_remote_segment(db, &pending.stream, 0, 0, 64);
        let mut opts = commit_opts(pending.stream, true);
        opts.if_none_match = Some(IfNoneMatch::All);
        db.commit_object(opts)
            .expect("marker does not block the conditional write");
    });
}

#[test]
fn unversioned_row_is_unique_per_key() {
    for_each_backend(|db| {
        let location = test_location("k");
        upload_object(db, location.clone(), false);
        upload_object(db, location.clone(), false);
        upload_object(db, location.clone(), false);

        let mut opts = IterateObjects::new(
            location.project_id,
            location.bucket_name.clone(),
        );
        opts.all_versions = true;
        let mut iterator = db
            .iterate_objects_all_versions_with_status(&opts)
            .expect("iterate");
        let entries = collect_entries(&mut iterator);
        let unversioned = entries
            .iter()
            .filter(|entry| entry.status == ObjectStatus::CommittedUnversioned)
            .count();
        assert_eq!(unversioned, 1, "at most one unversioned row per key");
        assert_eq!(entries.len(), 1);
    });
}

#[test]
fn suspended_history_keeps_versioned_rows_alongside_unversioned() {
    for_each_backend(|db| {
        let location = test_location("k");
        // History from a versioned epoch.
        upload_object(db, location.clone(), true);
        upload_object(db, location.clone(), true);
        // Suspended epoch writes unversioned.
        let current = upload_object(db, location.clone(), false);
        assert_eq!(current.version(), Version(3));

        let mut opts = IterateObjects::new(
            location.project_id,
            location.bucket_name.clone(),
        );
        opts.all_versions = true;
        let mut iterator = db
            .iterate_objects_all_versions_with_status(&opts)
            .expect("iterate");
        let entries = collect_entries(&mut iterator);
        assert_eq!(entries.len(), 3, "versioned history survives");

        // Another unversioned overwrite replaces only the unversioned row.
        let replaced = upload_object(db, location.clone(), false);
        assert_eq!(
            replaced.version(),
            Version(3),
            "unversioned incumbent is the newest visible row, so its version is reused"
        );
        let mut iterator = db
            .iterate_objects_all_versions_with_status(&opts)
            .expect("iterate");
        assert_eq!(collect_entries(&mut iterator).len(), 3);
    });
}
