use common::{
    AccessType, ContentHash, FileState, Folder, FolderId, FolderState, FolderStats, ItemState,
    MessageId, ProgressState, QueueKind, SegmentOwner, SegmentProgress, ShareRecord, ShareState,
    UploadState, User, UserId,
};
use store::{NewFile, NewPack, NewQueueItem, NewSegment, SqliteStore, Store, StoreError};

fn test_user() -> User {
    User {
        user_id: UserId([1u8; 32]),
        name: "alice".to_string(),
        public_key: [2u8; 32],
        api_key: "k".to_string(),
        created_at: 1_700_000_000,
    }
}

fn test_folder(owner: &User) -> Folder {
    Folder {
        folder_id: FolderId([9u8; 16]),
        path: "/data/photos".to_string(),
        display_name: "photos".to_string(),
        owner: owner.user_id,
        folder_key: [3u8; 32],
        public_key: [4u8; 32],
        private_key_sealed: vec![5u8; 48],
        state: FolderState::Created,
        stats: FolderStats::default(),
        created_at: 1_700_000_001,
    }
}

async fn seeded() -> (SqliteStore, Folder) {
    let store = SqliteStore::open_in_memory().unwrap();
    let user = test_user();
    store.insert_user(&user).await.unwrap();
    let folder = test_folder(&user);
    store.insert_folder(&folder).await.unwrap();
    (store, folder)
}

#[tokio::test]
async fn migrations_are_idempotent_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("meta.db");
    {
        let store = SqliteStore::open(&path).unwrap();
        store.insert_user(&test_user()).await.unwrap();
    }
    // Re-opening walks the ladder again without re-applying anything.
    let store = SqliteStore::open(&path).unwrap();
    let found = store.user_by_name("alice").await.unwrap();
    assert_eq!(found.unwrap().user_id, UserId([1u8; 32]));
}

#[tokio::test]
async fn folder_state_and_stats_roundtrip() {
    let (store, folder) = seeded().await;
    store
        .update_folder_state(&folder.folder_id, FolderState::Indexed)
        .await
        .unwrap();
    let stats = FolderStats {
        file_count: 3,
        segment_count: 12,
        total_size: 9_000_000,
        version: 2,
    };
    store.update_folder_stats(&folder.folder_id, &stats).await.unwrap();

    let loaded = store.folder(&folder.folder_id).await.unwrap().unwrap();
    assert_eq!(loaded.state, FolderState::Indexed);
    assert_eq!(loaded.stats.segment_count, 12);
    assert_eq!(loaded.folder_key, folder.folder_key);
}

#[tokio::test]
async fn files_for_folder_returns_latest_versions() {
    let (store, folder) = seeded().await;
    let mk = |path: &str, version: u32, hash: u8| NewFile {
        folder_id: folder.folder_id,
        relative_path: path.to_string(),
        size: 100,
        content_hash: ContentHash([hash; 32]),
        mtime: 1_700_000_100,
        version,
        state: FileState::Indexed,
    };
    store
        .insert_files(&[mk("a.bin", 1, 1), mk("a.bin", 2, 2), mk("b.bin", 1, 3)])
        .await
        .unwrap();

    let files = store.files_for_folder(&folder.folder_id).await.unwrap();
    assert_eq!(files.len(), 2);
    let a = files.iter().find(|f| f.relative_path == "a.bin").unwrap();
    assert_eq!(a.version, 2);
    assert_eq!(a.content_hash, ContentHash([2u8; 32]));

    let latest = store
        .latest_file_version(&folder.folder_id, "a.bin")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.version, 2);
}

#[tokio::test]
async fn segment_upload_is_single_assignment() {
    let (store, folder) = seeded().await;
    let ids = store
        .insert_files(&[NewFile {
            folder_id: folder.folder_id,
            relative_path: "doc.txt".to_string(),
            size: 768_000,
            content_hash: ContentHash([7u8; 32]),
            mtime: 0,
            version: 1,
            state: FileState::Indexed,
        }])
        .await
        .unwrap();
    let seg_ids = store
        .insert_segments(&[NewSegment {
            owner: SegmentOwner::File(ids[0]),
            index: 0,
            size: 768_000,
            plaintext_hash: ContentHash([8u8; 32]),
            ciphertext_hash: ContentHash([9u8; 32]),
            redundancy_index: 0,
        }])
        .await
        .unwrap();

    let mid = MessageId::parse("<abc@news.example.com>").unwrap();
    store
        .mark_segment_uploaded(seg_ids[0], &mid, "deadbeef")
        .await
        .unwrap();

    let seg = store.segment(seg_ids[0]).await.unwrap().unwrap();
    assert_eq!(seg.upload_state, UploadState::Uploaded);
    assert_eq!(seg.message_id, Some(mid.clone()));

    // Same Message-ID again is idempotent; a different one is refused.
    store
        .mark_segment_uploaded(seg_ids[0], &mid, "deadbeef")
        .await
        .unwrap();
    let other = MessageId::parse("<other@news.example.com>").unwrap();
    let err = store
        .mark_segment_uploaded(seg_ids[0], &other, "deadbeef")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Constraint(_)));
}

#[tokio::test]
async fn delete_file_cascades_and_invalidates_shares() {
    let (store, folder) = seeded().await;
    let ids = store
        .insert_files(&[NewFile {
            folder_id: folder.folder_id,
            relative_path: "gone.bin".to_string(),
            size: 10,
            content_hash: ContentHash([1u8; 32]),
            mtime: 0,
            version: 1,
            state: FileState::Indexed,
        }])
        .await
        .unwrap();
    let seg_ids = store
        .insert_segments(&[NewSegment {
            owner: SegmentOwner::File(ids[0]),
            index: 0,
            size: 10,
            plaintext_hash: ContentHash([2u8; 32]),
            ciphertext_hash: ContentHash([3u8; 32]),
            redundancy_index: 0,
        }])
        .await
        .unwrap();
    store
        .insert_share(&ShareRecord {
            share_id: "token123".to_string(),
            folder_id: folder.folder_id,
            access_type: AccessType::Public,
            wrapped_key_material: vec![1, 2, 3],
            index_refs: vec![],
            expires_at: None,
            password_verifier: None,
            state: ShareState::Active,
            created_at: 0,
        })
        .await
        .unwrap();

    store.delete_file(ids[0]).await.unwrap();

    assert!(store.segment(seg_ids[0]).await.unwrap().is_none());
    let share = store.share("token123").await.unwrap().unwrap();
    assert_eq!(share.state, ShareState::Invalid);
}

#[tokio::test]
async fn queue_bytes_follow_progress_rows() {
    let (store, folder) = seeded().await;
    let item = store
        .enqueue(
            QueueKind::Upload,
            &NewQueueItem {
                entity_ref: folder.folder_id.to_hex(),
                priority: 0,
                bytes_total: 2_000,
            },
        )
        .await
        .unwrap();

    for (index, done) in [(0u32, 750u64), (1, 250)] {
        store
            .upsert_progress(
                QueueKind::Upload,
                &SegmentProgress {
                    item_id: item,
                    segment_index: index,
                    state: ProgressState::Completed,
                    bytes_done: done,
                    server_message_id: None,
                    attempts: 1,
                    last_error: None,
                },
            )
            .await
            .unwrap();
    }
    store.recompute_item_bytes(QueueKind::Upload, item).await.unwrap();

    let loaded = store.queue_item(QueueKind::Upload, item).await.unwrap().unwrap();
    assert_eq!(loaded.bytes_done, 1_000);
    assert_eq!(loaded.bytes_total, 2_000);

    let rows = store.progress_rows(QueueKind::Upload, item).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].segment_index, 0);
}

#[tokio::test]
async fn resumable_items_exclude_completed() {
    let (store, folder) = seeded().await;
    let running = store
        .enqueue(
            QueueKind::Download,
            &NewQueueItem {
                entity_ref: folder.folder_id.to_hex(),
                priority: 1,
                bytes_total: 0,
            },
        )
        .await
        .unwrap();
    let done = store
        .enqueue(
            QueueKind::Download,
            &NewQueueItem {
                entity_ref: folder.folder_id.to_hex(),
                priority: 0,
                bytes_total: 0,
            },
        )
        .await
        .unwrap();
    store
        .update_item_state(QueueKind::Download, running, ItemState::Running, None)
        .await
        .unwrap();
    store
        .update_item_state(QueueKind::Download, done, ItemState::Completed, None)
        .await
        .unwrap();

    let resumable = store.resumable_items(QueueKind::Download).await.unwrap();
    assert_eq!(resumable.len(), 1);
    assert_eq!(resumable[0].item_id, running);
    assert_eq!(resumable[0].state, ItemState::Running);
    assert!(resumable[0].started_at.is_some());
}

#[tokio::test]
async fn pack_members_roundtrip() {
    let (store, folder) = seeded().await;
    let ids = store
        .insert_files(&[NewFile {
            folder_id: folder.folder_id,
            relative_path: "small/one.txt".to_string(),
            size: 1024,
            content_hash: ContentHash([4u8; 32]),
            mtime: 0,
            version: 1,
            state: FileState::Indexed,
        }])
        .await
        .unwrap();
    let pack = store
        .insert_pack(&store::NewPack {
            folder_id: folder.folder_id,
            segment_index: 0,
            members: vec![common::PackMember {
                file_id: ids[0],
                relative_path: "small/one.txt".to_string(),
                size: 1024,
            }],
        })
        .await
        .unwrap();

    let packs = store.packs_for_folder(&folder.folder_id).await.unwrap();
    assert_eq!(packs.len(), 1);
    assert_eq!(packs[0].pack_id, pack);
    assert_eq!(packs[0].members[0].relative_path, "small/one.txt");
}
