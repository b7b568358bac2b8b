mod common;

use bytes::Bytes;
use common::*;
use metabase::{
    BeginSegment, CheckSegmentPiecesAlteration, CommitInlineObject, CommitInlineSegment,
    Config, EncryptedUserData, InlineSegmentSpec, ListSegments, MetabaseError, ObjectStatus,
    ObjectStream, PieceId, Pieces, Retention, SegmentPosition, StreamId, UpdateObjectMetadata,
    Version,
};
use uuid::Uuid;

#[test]
fn begin_assigns_monotonic_versions() {
    for_each_backend(|db| {
        let location = test_location("obj");
        let first = begin_object(db, location.clone());
        let second = begin_object(db, location.clone());
        assert_eq!(first.version(), Version(1));
        assert_eq!(second.version(), Version(2));
        assert!(first.status.is_pending());
        assert!(
            first.zombie_deletion_deadline.is_some(),
            "pending rows carry a zombie deadline"
        );
    });
}

#[test]
fn begin_exact_version_rejects_duplicates() {
    for_each_backend(|db| {
        let location = test_location("obj");
        let mut opts = metabase::BeginObjectExactVersion {
            location: location.clone(),
            version: Version(5),
            stream_id: StreamId::random(),
            encryption: sample_encryption(),
            user_data: EncryptedUserData::default(),
            expires_at: None,
            zombie_deletion_deadline: None,
            retention: Retention::default(),
            legal_hold: false,
        };
        db.begin_object_exact_version(opts.clone()).expect("begin at 5");

        opts.stream_id = StreamId::random();
        let err = db.begin_object_exact_version(opts).unwrap_err();
        assert!(
            matches!(err, MetabaseError::ObjectAlreadyExists),
            "got: {err}"
        );
    });
}

#[test]
fn begin_validates_arguments() {
    for_each_backend(|db| {
        let mut opts = begin_opts(test_location("obj"));
        opts.stream_id = StreamId(Uuid::nil());
        assert!(matches!(
            db.begin_object_next_version(opts).unwrap_err(),
            MetabaseError::InvalidRequest(_)
        ));

        let mut opts = begin_opts(test_location("obj"));
        opts.location.bucket_name = metabase::BucketName::new("");
        assert!(matches!(
            db.begin_object_next_version(opts).unwrap_err(),
            MetabaseError::InvalidRequest(_)
        ));

        // TTL and lock state are mutually exclusive.
        let mut opts = begin_opts(test_location("obj"));
        opts.expires_at = Some(future(1));
        opts.retention = Retention::compliance(future(2));
        assert!(matches!(
            db.begin_object_next_version(opts).unwrap_err(),
            MetabaseError::InvalidRequest(_)
        ));

        let mut opts = begin_opts(test_location("obj"));
        opts.expires_at = Some(future(1));
        opts.legal_hold = true;
        assert!(matches!(
            db.begin_object_next_version(opts).unwrap_err(),
            MetabaseError::InvalidRequest(_)
        ));
    });
}

#[test]
fn begin_segment_checks_pending_object() {
    for_each_backend(|db| {
        let pending = begin_object(db, test_location("obj"));
        db.begin_segment(BeginSegment {
            stream: pending.stream.clone(),
            position: SegmentPosition::new(0, 0),
            root_piece_id: PieceId([9; 32]),
            pieces: pieces_on(&[node(1), node(2)]),
        })
        .expect("begin segment");

        let missing = ObjectStream {
            location: test_location("other"),
            version: Version(1),
            stream_id: StreamId::random(),
        };
        let err = db
            .begin_segment(BeginSegment {
                stream: missing,
                position: SegmentPosition::new(0, 0),
                root_piece_id: PieceId([9; 32]),
                pieces: pieces_on(&[node(1)]),
            })
            .unwrap_err();
        assert!(matches!(err, MetabaseError::PendingObjectMissing), "got: {err}");
    });
}

#[test]
fn commit_segment_requires_pending_object() {
    for_each_backend(|db| {
        let missing = ObjectStream {
            location: test_location("obj"),
            version: Version(1),
            stream_id: StreamId::random(),
        };
        let err = db
            .commit_segment(remote_segment_opts(&missing, 0, 0, 256))
            .unwrap_err();
        assert!(matches!(err, MetabaseError::PendingObjectMissing), "got: {err}");
    });
}

#[test]
fn commit_segment_validates_pieces_and_sizes() {
    for_each_backend(|db| {
        let pending = begin_object(db, test_location("obj"));

        let mut opts = remote_segment_opts(&pending.stream, 0, 0, 256);
        opts.pieces = pieces_on(&[node(1)]);
        let err = db.commit_segment(opts).unwrap_err();
        assert!(
            err.to_string().contains("optimal shares"),
            "piece count below optimal shares: {err}"
        );

        let mut opts = remote_segment_opts(&pending.stream, 0, 0, 256);
        opts.encrypted_size = 0;
        assert!(matches!(
            db.commit_segment(opts).unwrap_err(),
            MetabaseError::InvalidRequest(_)
        ));

        let mut opts = remote_segment_opts(&pending.stream, 0, 0, 256);
        opts.encrypted_key = None;
        assert!(matches!(
            db.commit_segment(opts).unwrap_err(),
            MetabaseError::InvalidRequest(_)
        ));

        let mut opts = remote_segment_opts(&pending.stream, 0, 0, 256);
        opts.plain_offset = -1;
        assert!(matches!(
            db.commit_segment(opts).unwrap_err(),
            MetabaseError::InvalidRequest(_)
        ));
    });
}

#[test]
fn full_upload_flow_finalizes_offsets_and_aggregates() {
    for_each_backend(|db| {
        let location = test_location("obj");
        let pending = begin_object(db, location.clone());
        // Committed out of order; offsets follow (part, index) order.
        commit_remote_segment(db, &pending.stream, 0, 1, 512);
        commit_remote_segment(db, &pending.stream, 0, 0, 512);
        commit_remote_segment(db, &pending.stream, 0, 2, 100);

        let committed = db
            .commit_object(commit_opts(pending.stream.clone(), false))
            .expect("commit object");
        assert_eq!(committed.status, ObjectStatus::CommittedUnversioned);
        assert_eq!(committed.segment_count, 3);
        assert_eq!(committed.total_plain_size, 1124);
        assert_eq!(committed.total_encrypted_size, 1124 + 3 * 16);
        assert_eq!(committed.fixed_segment_size, 512);
        assert!(committed.zombie_deletion_deadline.is_none());

        let listed = db
            .list_segments(ListSegments {
                stream_id: pending.stream.stream_id,
                cursor: None,
                limit: 10,
            })
            .expect("list segments");
        assert!(!listed.more);
        let offsets: Vec<i64> = listed.segments.iter().map(|s| s.plain_offset).collect();
        assert_eq!(offsets, vec![0, 512, 1024]);

        let found = db
            .get_object_last_committed(&location)
            .expect("get last committed");
        assert_eq!(found.stream_id(), committed.stream_id());
    });
}

#[test]
fn commit_object_specific_segments_drops_the_rest() {
    for_each_backend(|db| {
        let pending = begin_object(db, test_location("obj"));
        commit_remote_segment(db, &pending.stream, 0, 0, 256);
        commit_remote_segment(db, &pending.stream, 0, 1, 256);
        commit_remote_segment(db, &pending.stream, 0, 2, 256);

        let mut opts = commit_opts(pending.stream.clone(), false);
        opts.only_segments = Some(vec![
            SegmentPosition::new(0, 0),
            SegmentPosition::new(0, 2),
        ]);
        let committed = db.commit_object(opts).expect("commit subset");
        assert_eq!(committed.segment_count, 2);
        assert_eq!(committed.total_plain_size, 512);

        let listed = db
            .list_segments(ListSegments {
                stream_id: pending.stream.stream_id,
                cursor: None,
                limit: 10,
            })
            .expect("list segments");
        let positions: Vec<SegmentPosition> =
            listed.segments.iter().map(|s| s.position).collect();
        assert_eq!(
            positions,
            vec![SegmentPosition::new(0, 0), SegmentPosition::new(0, 2)]
        );
        let offsets: Vec<i64> = listed.segments.iter().map(|s| s.plain_offset).collect();
        assert_eq!(offsets, vec![0, 256], "offsets cover the final set only");
    });
}

#[test]
fn commit_object_specific_segments_rejects_bad_lists() {
    for_each_backend(|db| {
        let pending = begin_object(db, test_location("obj"));
        commit_remote_segment(db, &pending.stream, 0, 0, 256);

        let mut opts = commit_opts(pending.stream.clone(), false);
        opts.only_segments = Some(vec![
            SegmentPosition::new(0, 1),
            SegmentPosition::new(0, 0),
        ]);
        assert!(matches!(
            db.commit_object(opts).unwrap_err(),
            MetabaseError::FailedPrecondition(_)
        ));

        let mut opts = commit_opts(pending.stream.clone(), false);
        opts.only_segments = Some(vec![SegmentPosition::new(0, 5)]);
        assert!(matches!(
            db.commit_object(opts).unwrap_err(),
            MetabaseError::FailedPrecondition(_)
        ));
    });
}

#[test]
fn multipart_minimum_part_size_spares_the_last_part() {
    // min_part_size 1024, max parts 10 under the testing profile.
    for_each_backend(|db| {
        let pending = begin_object(db, test_location("multipart"));
        commit_remote_segment(db, &pending.stream, 1, 0, 2048);
        commit_remote_segment(db, &pending.stream, 2, 0, 100);
        commit_remote_segment(db, &pending.stream, 3, 0, 4096);
        let err = db
            .commit_object(commit_opts(pending.stream, false))
            .unwrap_err();
        assert!(
            err.to_string().contains("part number 2"),
            "short middle part rejected: {err}"
        );

        let pending = begin_object(db, test_location("multipart-ok"));
        commit_remote_segment(db, &pending.stream, 1, 0, 2048);
        commit_remote_segment(db, &pending.stream, 3, 0, 100);
        db.commit_object(commit_opts(pending.stream, false))
            .expect("small final part is allowed");
    });
}

#[test]
fn multipart_part_count_is_bounded() {
    for_each_backend(|db| {
        let pending = begin_object(db, test_location("many-parts"));
        for part in 1..=11u32 {
            commit_remote_segment(db, &pending.stream, part, 0, 2048);
        }
        let err = db
            .commit_object(commit_opts(pending.stream, false))
            .unwrap_err();
        assert!(
            err.to_string().contains("maximum number of parts"),
            "got: {err}"
        );
    });
}

#[test]
fn inline_segment_conversion_clears_remote_fields() {
    for_each_backend(|db| {
        let pending = begin_object(db, test_location("obj"));
        commit_remote_segment(db, &pending.stream, 0, 0, 256);
        db.commit_inline_segment(CommitInlineSegment {
            stream: pending.stream.clone(),
            position: SegmentPosition::new(0, 0),
            encrypted_key_nonce: Some(Bytes::from_static(b"nonce")),
            encrypted_key: Some(Bytes::from_static(b"key")),
            encrypted_etag: None,
            plain_size: 11,
            plain_offset: 0,
            inline_data: Bytes::from_static(b"hello world"),
        })
        .expect("convert to inline");

        let detail = db
            .get_segment_by_position(pending.stream.stream_id, SegmentPosition::new(0, 0))
            .expect("get segment");
        assert!(detail.segment.is_inline());
        assert!(!detail.segment.is_remote());
        assert!(detail.pieces.is_empty());
        assert_eq!(detail.segment.encrypted_size, 11);
    });
}

#[test]
fn commit_inline_object_single_call() {
    for_each_backend(|db| {
        let location = test_location("inline");
        let committed = db
            .commit_inline_object(CommitInlineObject {
                location: location.clone(),
                stream_id: StreamId::random(),
                encryption: sample_encryption(),
                user_data: EncryptedUserData::default(),
                expires_at: None,
                retention: Retention::default(),
                legal_hold: false,
                versioned: false,
                if_none_match: None,
                disallow_delete: false,
                segment: InlineSegmentSpec {
                    encrypted_key_nonce: Some(Bytes::from_static(b"nonce")),
                    encrypted_key: Some(Bytes::from_static(b"key")),
                    encrypted_etag: None,
                    plain_size: 5,
                    inline_data: Bytes::from_static(b"bytes"),
                },
            })
            .expect("commit inline object");
        assert_eq!(committed.version(), Version(1));
        assert_eq!(committed.segment_count, 1);
        assert_eq!(committed.total_encrypted_size, 5);
        assert_eq!(committed.fixed_segment_size, 5);

        let found = db.get_object_last_committed(&location).expect("readable");
        assert_eq!(found.stream_id(), committed.stream_id());
    });
}

#[test]
fn skip_pending_object_guards_against_completed_streams() {
    for_each_backend(|db| {
        // Direct upload: segments land before any object row exists.
        let stream = ObjectStream {
            location: test_location("direct"),
            version: Version(1),
            stream_id: StreamId::random(),
        };
        let mut opts = remote_segment_opts(&stream, 0, 0, 256);
        opts.skip_pending_object = true;
        db.commit_segment(opts).expect("segment without pending row");

        // A retried segment write against an already committed object of the
        // same stream must not attach.
        let committed = upload_object(db, test_location("done"), false);
        let mut opts = remote_segment_opts(&committed.stream, 0, 5, 256);
        opts.skip_pending_object = true;
        let err = db.commit_segment(opts).unwrap_err();
        assert!(matches!(err, MetabaseError::ObjectAlreadyExists), "got: {err}");
    });
}

#[test]
fn update_object_metadata_targets_committed_rows() {
    for_each_backend(|db| {
        let location = test_location("obj");
        let committed = upload_object(db, location.clone(), false);

        let user_data = EncryptedUserData {
            encrypted_metadata: Some(Bytes::from_static(b"meta")),
            encrypted_metadata_nonce: Some(Bytes::from_static(b"nonce")),
            encrypted_metadata_encrypted_key: Some(Bytes::from_static(b"key")),
            encrypted_etag: Some(Bytes::from_static(b"etag")),
        };
        db.update_object_metadata(UpdateObjectMetadata {
            location: location.clone(),
            stream_id: committed.stream_id(),
            user_data: user_data.clone(),
        })
        .expect("update metadata");
        let found = db.get_object_last_committed(&location).expect("get");
        assert_eq!(found.user_data, user_data);

        let err = db
            .update_object_metadata(UpdateObjectMetadata {
                location,
                stream_id: StreamId::random(),
                user_data,
            })
            .unwrap_err();
        assert!(matches!(err, MetabaseError::ObjectNotFound), "got: {err}");
    });
}

#[test]
fn point_reads_hide_pending_and_expired_rows() {
    for_each_backend(|db| {
        let location = test_location("obj");
        let pending = begin_object(db, location.clone());
        assert!(matches!(
            db.get_object_exact_version(&location, pending.version())
                .unwrap_err(),
            MetabaseError::ObjectNotFound
        ));
        assert!(matches!(
            db.get_object_last_committed(&location).unwrap_err(),
            MetabaseError::ObjectNotFound
        ));

        let expired_location = test_location("expired");
        let mut opts = begin_opts(expired_location.clone());
        opts.expires_at = Some(past(1));
        let expired_pending = db.begin_object_next_version(opts).expect("begin");
        commit_remote_segment(db, &expired_pending.stream, 0, 0, 64);
        db.commit_object(commit_opts(expired_pending.stream, false))
            .expect("commit");
        assert!(matches!(
            db.get_object_last_committed(&expired_location).unwrap_err(),
            MetabaseError::ObjectNotFound
        ));
    });
}

// The CheckSegmentPiecesAlteration end-to-end contract.
#[test]
fn check_segment_pieces_alteration_matrix() {
    for_each_backend(|db| {
        let pending = begin_object(db, test_location("obj"));
        let mut opts = remote_segment_opts(&pending.stream, 0, 0, 256);
        opts.pieces = pieces_on(&[node(1), node(2)]);
        db.commit_segment(opts).expect("remote segment");
        db.commit_inline_segment(CommitInlineSegment {
            stream: pending.stream.clone(),
            position: SegmentPosition::new(0, 1),
            encrypted_key_nonce: Some(Bytes::from_static(b"nonce")),
            encrypted_key: Some(Bytes::from_static(b"key")),
            encrypted_etag: None,
            plain_size: 3,
            plain_offset: 256,
            inline_data: Bytes::from_static(b"abc"),
        })
        .expect("inline segment");
        let stream_id = pending.stream.stream_id;

        let unaltered = db
            .check_segment_pieces_alteration(CheckSegmentPiecesAlteration {
                stream_id,
                position: SegmentPosition::new(0, 0),
                pieces: pieces_on(&[node(1), node(2)]),
            })
            .expect("check identical");
        assert!(!unaltered);

        let altered = db
            .check_segment_pieces_alteration(CheckSegmentPiecesAlteration {
                stream_id,
                position: SegmentPosition::new(0, 0),
                pieces: pieces_on(&[node(3), node(4)]),
            })
            .expect("check different");
        assert!(altered);

        let err = db
            .check_segment_pieces_alteration(CheckSegmentPiecesAlteration {
                stream_id: StreamId::random(),
                position: SegmentPosition::new(0, 0),
                pieces: pieces_on(&[node(1)]),
            })
            .unwrap_err();
        assert!(matches!(err, MetabaseError::SegmentNotFound), "got: {err}");

        let err = db
            .check_segment_pieces_alteration(CheckSegmentPiecesAlteration {
                stream_id: StreamId(Uuid::nil()),
                position: SegmentPosition::new(0, 0),
                pieces: pieces_on(&[node(1)]),
            })
            .unwrap_err();
        assert!(matches!(err, MetabaseError::InvalidRequest(_)), "got: {err}");

        let err = db
            .check_segment_pieces_alteration(CheckSegmentPiecesAlteration {
                stream_id,
                position: SegmentPosition::new(0, 0),
                pieces: Pieces::default(),
            })
            .unwrap_err();
        assert!(matches!(err, MetabaseError::InvalidRequest(_)), "got: {err}");

        let err = db
            .check_segment_pieces_alteration(CheckSegmentPiecesAlteration {
                stream_id,
                position: SegmentPosition::new(0, 1),
                pieces: pieces_on(&[node(1)]),
            })
            .unwrap_err();
        assert!(
            matches!(err, MetabaseError::InvalidRequest(_)),
            "inline segment rejected: {err}"
        );
    });
}

#[test]
fn plain_size_validation_is_configurable() {
    let mut config = Config::testing();
    config.validate_plain_size = true;
    for_each_backend_with(config, |db| {
        let pending = begin_object(db, test_location("obj"));
        let mut opts = remote_segment_opts(&pending.stream, 0, 0, 0);
        opts.encrypted_size = 16;
        assert!(matches!(
            db.commit_segment(opts).unwrap_err(),
            MetabaseError::InvalidRequest(_)
        ));
    });
}
