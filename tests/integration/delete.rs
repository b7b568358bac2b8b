mod common;

use common::*;
use metabase::{
    DeleteObjectExactVersion, DeleteObjectLastCommitted, DeleteObjectsAllVersions,
    DeletePendingObject, IterateObjects, ListSegments, MetabaseError, ObjectStatus, ObjectStream,
    StreamId, Version,
};

fn all_versions_of(db: &metabase::Metabase, location: &metabase::ObjectLocation) -> Vec<metabase::ObjectEntry> {
    let mut opts = IterateObjects::new(location.project_id, location.bucket_name.clone());
    opts.all_versions = true;
    let mut iterator = db
        .iterate_objects_all_versions_with_status(&opts)
        .expect("iterate");
    collect_entries(&mut iterator)
}

#[test]
fn exact_version_delete_cascades_to_segments() {
    for_each_backend(|db| {
        let location = test_location("k");
        let committed = upload_object(db, location.clone(), false);

        let result = db
            .delete_object_exact_version(DeleteObjectExactVersion {
                location: location.clone(),
                version: committed.version(),
                bypass_governance: false,
            })
            .expect("delete");
        assert_eq!(result.removed.len(), 1);
        assert!(result.markers.is_empty());
        assert_eq!(result.removed[0].stream_id(), committed.stream_id());

        assert!(matches!(
            db.get_object_last_committed(&location).unwrap_err(),
            MetabaseError::ObjectNotFound
        ));
        let leftovers = db
            .list_segments(ListSegments {
                stream_id: committed.stream_id(),
                cursor: None,
                limit: 10,
            })
            .expect("list");
        assert!(leftovers.segments.is_empty());

        let err = db
            .delete_object_exact_version(DeleteObjectExactVersion {
                location,
                version: Version(99),
                bypass_governance: false,
            })
            .unwrap_err();
        assert!(matches!(err, MetabaseError::ObjectNotFound), "got: {err}");
    });
}

#[test]
fn delete_pending_object_rejects_committed_streams() {
    for_each_backend(|db| {
        let location = test_location("k");
        let pending = begin_object(db, location.clone());
        commit_remote_segment(db, &pending.stream, 0, 0, 64);
        db.delete_pending_object(DeletePendingObject {
            stream: pending.stream.clone(),
        })
        .expect("abort upload");
        assert!(all_versions_of(db, &location).is_empty());
        let leftovers = db
            .list_segments(ListSegments {
                stream_id: pending.stream_id(),
                cursor: None,
                limit: 10,
            })
            .expect("list");
        assert!(leftovers.segments.is_empty(), "aborted segments removed");

        let committed = upload_object(db, location, false);
        let err = db
            .delete_pending_object(DeletePendingObject {
                stream: committed.stream.clone(),
            })
            .unwrap_err();
        assert!(matches!(err, MetabaseError::ObjectNotFound), "got: {err}");
    });
}

#[test]
fn last_committed_plain_delete_removes_the_row() {
    for_each_backend(|db| {
        let location = test_location("k");
        upload_object(db, location.clone(), false);
        let result = db
            .delete_object_last_committed(DeleteObjectLastCommitted {
                location: location.clone(),
                versioned: false,
                suspended: false,
                bypass_governance: false,
            })
            .expect("delete");
        assert_eq!(result.removed.len(), 1);
        assert!(result.markers.is_empty());
        assert!(all_versions_of(db, &location).is_empty());

        let err = db
            .delete_object_last_committed(DeleteObjectLastCommitted {
                location,
                versioned: false,
                suspended: false,
                bypass_governance: false,
            })
            .unwrap_err();
        assert!(matches!(err, MetabaseError::ObjectNotFound), "got: {err}");
    });
}

#[test]
fn versioned_delete_inserts_a_marker_and_keeps_history() {
    for_each_backend(|db| {
        let location = test_location("k");
        let committed = upload_object(db, location.clone(), true);
        let result = db
            .delete_object_last_committed(DeleteObjectLastCommitted {
                location: location.clone(),
                versioned: true,
                suspended: false,
                bypass_governance: false,
            })
            .expect("delete");
        assert!(result.removed.is_empty(), "nothing is destroyed");
        assert_eq!(result.markers.len(), 1);
        let marker = &result.markers[0];
        assert_eq!(marker.status, ObjectStatus::DeleteMarkerVersioned);
        assert_eq!(marker.version(), Version(2));
        assert_eq!(marker.segment_count, 0);

        let rows = all_versions_of(db, &location);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].stream_id, committed.stream_id(), "history survives");

        // Deleting a marker-topped key inserts another marker, like S3.
        let again = db
            .delete_object_last_committed(DeleteObjectLastCommitted {
                location: location.clone(),
                versioned: true,
                suspended: false,
                bypass_governance: false,
            })
            .expect("second delete");
        assert_eq!(again.markers[0].version(), Version(3));
    });
}

#[test]
fn versioned_delete_of_unknown_key_reports_not_found() {
    for_each_backend(|db| {
        let err = db
            .delete_object_last_committed(DeleteObjectLastCommitted {
                location: test_location("missing"),
                versioned: true,
                suspended: false,
                bypass_governance: false,
            })
            .unwrap_err();
        assert!(matches!(err, MetabaseError::ObjectNotFound), "got: {err}");
    });
}

#[test]
fn suspended_delete_replaces_the_unversioned_row_with_a_marker() {
    for_each_backend(|db| {
        let location = test_location("k");
        upload_object(db, location.clone(), true);
        let unversioned = upload_object(db, location.clone(), false);

        let result = db
            .delete_object_last_committed(DeleteObjectLastCommitted {
                location: location.clone(),
                versioned: false,
                suspended: true,
                bypass_governance: false,
            })
            .expect("suspended delete");
        assert_eq!(result.removed.len(), 1);
        assert_eq!(result.removed[0].stream_id(), unversioned.stream_id());
        assert_eq!(result.markers.len(), 1);
        assert_eq!(
            result.markers[0].status,
            ObjectStatus::DeleteMarkerUnversioned
        );

        let rows = all_versions_of(db, &location);
        let unversioned_rows = rows
            .iter()
            .filter(|entry| {
                entry.status == ObjectStatus::CommittedUnversioned
                    || entry.status == ObjectStatus::DeleteMarkerUnversioned
            })
            .count();
        assert_eq!(unversioned_rows, 1, "one unversioned row at most");

        // A second suspended delete replaces the previous unversioned marker.
        let again = db
            .delete_object_last_committed(DeleteObjectLastCommitted {
                location: location.clone(),
                versioned: false,
                suspended: true,
                bypass_governance: false,
            })
            .expect("second suspended delete");
        assert!(again.removed.is_empty(), "a marker is not billed as removed");
        let rows = all_versions_of(db, &location);
        let unversioned_rows = rows
            .iter()
            .filter(|entry| entry.status == ObjectStatus::DeleteMarkerUnversioned)
            .count();
        assert_eq!(unversioned_rows, 1);
    });
}

#[test]
fn delete_all_versions_clears_whole_keys() {
    for_each_backend(|db| {
        let location = test_location("k");
        upload_object(db, location.clone(), true);
        upload_object(db, location.clone(), true);
        let pending = begin_object(db, location.clone());
        commit_remote_segment(db, &pending.stream, 0, 0, 64);
        let other = location_in(location.project_id, "other");
        upload_object(db, other.clone(), false);

        let result = db
            .delete_objects_all_versions(DeleteObjectsAllVersions {
                locations: vec![location.clone(), other.clone()],
                bypass_governance: false,
            })
            .expect("bulk delete");
        assert_eq!(result.removed.len(), 4, "two versions, one pending, one other");
        assert!(all_versions_of(db, &location).is_empty());
        assert!(all_versions_of(db, &other).is_empty());
        let leftovers = db
            .list_segments(ListSegments {
                stream_id: pending.stream_id(),
                cursor: None,
                limit: 10,
            })
            .expect("list");
        assert!(leftovers.segments.is_empty());
    });
}

#[test]
fn delete_validates_arguments() {
    for_each_backend(|db| {
        let err = db
            .delete_object_last_committed(DeleteObjectLastCommitted {
                location: test_location("k"),
                versioned: true,
                suspended: true,
                bypass_governance: false,
            })
            .unwrap_err();
        assert!(matches!(err, MetabaseError::InvalidRequest(_)), "got: {err}");

        let err = db
            .delete_pending_object(DeletePendingObject {
                stream: ObjectStream {
                    location: test_location("k"),
                    version: Version(1),
                    stream_id: StreamId(uuid::Uuid::nil()),
                },
            })
            .unwrap_err();
        assert!(matches!(err, MetabaseError::InvalidRequest(_)), "got: {err}");
    });
}
