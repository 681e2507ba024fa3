//! End-to-end scenarios against the in-process news server and the
//! in-memory store: publish/retrieve round trips, packing, resume,
//! access control, redundancy, selective download, cancellation.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{EngineConfig, FolderState, ItemState, SegmentPolicy, UserId};
use crypto::UserKeyPair;
use engine::{AccessSpec, Credentials, Handle, Recipient, UsenetSync};
use store::{MemoryStore, Store};
use transport::testing::FakeNntpServer;

/// Deterministic pseudo-random fill so failures reproduce.
fn fill_random(buf: &mut [u8], mut seed: u64) {
    for byte in buf.iter_mut() {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        *byte = seed as u8;
    }
}

fn write_random_file(path: &Path, len: usize, seed: u64) {
    let mut data = vec![0u8; len];
    fill_random(&mut data, seed);
    std::fs::write(path, data).unwrap();
}

fn test_config(workers: usize) -> EngineConfig {
    EngineConfig {
        upload_workers: workers,
        download_workers: workers,
        max_retries: 2,
        retry_base_ms: 5,
        cache_capacity: 1 << 30,
    }
}

fn system(server: &FakeNntpServer, policy: SegmentPolicy, workers: usize) -> UsenetSync {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    UsenetSync::new(store, server.profile(), policy, test_config(workers))
}

async fn wait_terminal(sync: &UsenetSync, handle: &Handle) -> ItemState {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let progress = sync.progress(handle).await.unwrap();
        if matches!(progress.state, ItemState::Completed | ItemState::Failed) {
            return progress.state;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "transfer stuck: {progress:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn publish_ready_folder(
    sync: &UsenetSync,
    src: &Path,
) -> (common::FolderId, Handle) {
    let user = sync.create_user("publisher").await.unwrap();
    let folder_id = sync
        .add_folder(src.to_str().unwrap(), &user.user.user_id)
        .await
        .unwrap();
    sync.index_folder(&folder_id).await.unwrap();
    let handle = sync.upload_folder(&folder_id).await.unwrap();
    (folder_id, handle)
}

fn assert_tree_matches(src: &Path, dest: &Path, paths: &[&str]) {
    for rel in paths {
        let original = std::fs::read(src.join(rel)).unwrap();
        let restored = std::fs::read(dest.join(rel)).unwrap();
        assert_eq!(
            crypto::sha256(&restored),
            crypto::sha256(&original),
            "content mismatch for {rel}"
        );
        let src_mtime = std::fs::metadata(src.join(rel))
            .unwrap()
            .modified()
            .unwrap()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let dest_mtime = std::fs::metadata(dest.join(rel))
            .unwrap()
            .modified()
            .unwrap()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert_eq!(src_mtime, dest_mtime, "mtime mismatch for {rel}");
    }
}

// S1: one 2,595,088-byte file at the default segment size: exactly four
// data posts (768000 x 3 + 291088), then a published share that round
// trips byte for byte.
#[tokio::test]
async fn single_file_round_trip() {
    let server = FakeNntpServer::start().await;
    let sync = system(&server, SegmentPolicy::default(), 4);

    let src = tempfile::tempdir().unwrap();
    write_random_file(&src.path().join("doc.txt"), 2_595_088, 0xD0C);

    let (folder_id, handle) = publish_ready_folder(&sync, src.path()).await;
    assert_eq!(wait_terminal(&sync, &handle).await, ItemState::Completed);
    assert_eq!(server.post_count(), 4, "one post per data segment");

    let progress = sync.progress(&handle).await.unwrap();
    assert_eq!(progress.bytes_done, progress.bytes_total);
    assert_eq!(progress.segments_done, 4);

    let (_, token) = sync
        .publish_folder(&folder_id, &AccessSpec::Public, None)
        .await
        .unwrap();
    assert_eq!(server.post_count(), 5, "compressed index fits one post");

    let folder = sync.store().folder(&folder_id).await.unwrap().unwrap();
    assert_eq!(folder.state, FolderState::Published);

    let dest = tempfile::tempdir().unwrap();
    let dl = sync
        .download_share(&token, &Credentials::Anonymous, dest.path().into(), None)
        .await
        .unwrap();
    assert_eq!(wait_terminal(&sync, &dl).await, ItemState::Completed);
    assert_tree_matches(src.path(), dest.path(), &["doc.txt"]);
}

// S2: one hundred 1 KiB files pack into a single segment: one data post,
// and the receiver's cache serves every member after one fetch.
#[tokio::test]
async fn small_files_pack_into_one_post() {
    let server = FakeNntpServer::start().await;
    let sync = system(&server, SegmentPolicy::default(), 4);

    let src = tempfile::tempdir().unwrap();
    let names: Vec<String> = (0..100).map(|i| format!("small/file{i:03}.dat")).collect();
    std::fs::create_dir_all(src.path().join("small")).unwrap();
    for (i, name) in names.iter().enumerate() {
        write_random_file(&src.path().join(name), 1024, 0x5EED + i as u64);
    }

    let (folder_id, handle) = publish_ready_folder(&sync, src.path()).await;
    assert_eq!(wait_terminal(&sync, &handle).await, ItemState::Completed);
    assert_eq!(server.post_count(), 1, "one pack, one post");

    let (_, token) = sync
        .publish_folder(&folder_id, &AccessSpec::Public, None)
        .await
        .unwrap();

    let fetches_before = server.fetch_count();
    let dest = tempfile::tempdir().unwrap();
    let dl = sync
        .download_share(&token, &Credentials::Anonymous, dest.path().into(), None)
        .await
        .unwrap();
    assert_eq!(wait_terminal(&sync, &dl).await, ItemState::Completed);

    // One index fetch plus one pack fetch; members come from the cache.
    assert_eq!(server.fetch_count() - fetches_before, 2);
    assert!(sync.download_cache_stats().hits >= 100);

    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    assert_tree_matches(src.path(), dest.path(), &name_refs);
}

// S3: kill after five of ten segments are posted, restart, and exactly
// five more posts happen; no segment ever holds two Message-IDs.
#[tokio::test]
async fn upload_resume_is_idempotent() {
    let server = FakeNntpServer::start().await;
    // One worker serializes posts so the kill point is exact.
    let sync = system(&server, SegmentPolicy::default(), 1);

    let src = tempfile::tempdir().unwrap();
    write_random_file(&src.path().join("big.bin"), 7_680_000, 0xB16);

    server.limit_posts(5);
    let (folder_id, handle) = publish_ready_folder(&sync, src.path()).await;
    assert_eq!(wait_terminal(&sync, &handle).await, ItemState::Failed);
    assert_eq!(server.post_count(), 5);

    server.clear_post_limit();
    let retry_handle = sync.upload_folder(&folder_id).await.unwrap();
    assert_eq!(wait_terminal(&sync, &retry_handle).await, ItemState::Completed);
    assert_eq!(server.post_count(), 10, "exactly five more posts");

    let segments = sync
        .store()
        .segments_for_folder(&folder_id)
        .await
        .unwrap();
    assert_eq!(segments.len(), 10);
    let ids: HashSet<String> = segments
        .iter()
        .map(|s| s.message_id.as_ref().unwrap().as_str().to_string())
        .collect();
    assert_eq!(ids.len(), 10, "no duplicated posts, no shared ids");

    sync.publish_folder(&folder_id, &AccessSpec::Public, None)
        .await
        .unwrap();
    let folder = sync.store().folder(&folder_id).await.unwrap().unwrap();
    assert_eq!(folder.state, FolderState::Published);
}

// S4: protected share; the wrong passphrase is denied before a single
// article is requested.
#[tokio::test]
async fn protected_share_fails_fast_without_network() {
    let server = FakeNntpServer::start().await;
    let sync = system(&server, SegmentPolicy::default(), 4);

    let src = tempfile::tempdir().unwrap();
    write_random_file(&src.path().join("secret.bin"), 100_000, 0x5EC);

    let (folder_id, handle) = publish_ready_folder(&sync, src.path()).await;
    assert_eq!(wait_terminal(&sync, &handle).await, ItemState::Completed);

    let spec = AccessSpec::Protected {
        passphrase: "correct horse battery staple".to_string(),
        kdf: crypto::kdf::KdfParams {
            m_cost_kib: 8 * 1024,
            t_cost: 1,
            p_cost: 1,
        },
    };
    let (_, token) = sync
        .publish_folder(&folder_id, &spec, None)
        .await
        .unwrap();

    let fetches_before = server.fetch_count();
    let dest = tempfile::tempdir().unwrap();
    let denied = sync
        .download_share(
            &token,
            &Credentials::Passphrase("correct horse battery stapl3".to_string()),
            dest.path().into(),
            None,
        )
        .await;
    assert!(denied.is_err());
    assert_eq!(
        server.fetch_count(),
        fetches_before,
        "denial issued no NNTP fetch"
    );

    let dl = sync
        .download_share(
            &token,
            &Credentials::Passphrase("correct horse battery staple".to_string()),
            dest.path().into(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(wait_terminal(&sync, &dl).await, ItemState::Completed);
    assert_tree_matches(src.path(), dest.path(), &["secret.bin"]);
}

// S5: private share admits exactly the allowed set; revocation republishes
// under a rotated key.
#[tokio::test]
async fn private_share_membership_and_revocation() {
    let server = FakeNntpServer::start().await;
    let sync = system(&server, SegmentPolicy::default(), 4);

    let src = tempfile::tempdir().unwrap();
    write_random_file(&src.path().join("members.bin"), 60_000, 0xAC1);

    let (folder_id, handle) = publish_ready_folder(&sync, src.path()).await;
    assert_eq!(wait_terminal(&sync, &handle).await, ItemState::Completed);

    let u1 = (UserId([1u8; 32]), UserKeyPair::generate());
    let u2 = (UserId([2u8; 32]), UserKeyPair::generate());
    let u3 = (UserId([3u8; 32]), UserKeyPair::generate());
    let spec = AccessSpec::Private {
        recipients: vec![
            Recipient {
                user_id: u1.0,
                public_key: u1.1.public_bytes(),
            },
            Recipient {
                user_id: u2.0,
                public_key: u2.1.public_bytes(),
            },
        ],
    };
    let (_, token) = sync.publish_folder(&folder_id, &spec, None).await.unwrap();

    let dest = tempfile::tempdir().unwrap();
    let dl = sync
        .download_share(
            &token,
            &Credentials::User {
                user_id: u1.0,
                keypair: UserKeyPair::from_secret_bytes(u1.1.secret_bytes()),
            },
            dest.path().into(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(wait_terminal(&sync, &dl).await, ItemState::Completed);
    assert_tree_matches(src.path(), dest.path(), &["members.bin"]);

    let outsider = sync
        .download_share(
            &token,
            &Credentials::User {
                user_id: u3.0,
                keypair: u3.1,
            },
            dest.path().into(),
            None,
        )
        .await;
    assert!(outsider.is_err());

    // Revocation: rotate, re-upload, republish. The new token wraps a
    // different key than the old one.
    let old_key = access::verify_access(
        &access::parse_token(&token).unwrap(),
        &Credentials::User {
            user_id: u2.0,
            keypair: UserKeyPair::from_secret_bytes(u2.1.secret_bytes()),
        },
    )
    .unwrap();

    sync.rotate_folder_key(&folder_id).await.unwrap();
    let reupload = sync.upload_folder(&folder_id).await.unwrap();
    assert_eq!(wait_terminal(&sync, &reupload).await, ItemState::Completed);
    let (_, new_token) = sync
        .publish_folder(&folder_id, &AccessSpec::Public, None)
        .await
        .unwrap();
    let new_key = access::verify_access(
        &access::parse_token(&new_token).unwrap(),
        &Credentials::Anonymous,
    )
    .unwrap();
    assert_ne!(old_key.as_bytes(), new_key.as_bytes());

    // And the rotated content still round trips.
    let dest2 = tempfile::tempdir().unwrap();
    let dl2 = sync
        .download_share(&new_token, &Credentials::Anonymous, dest2.path().into(), None)
        .await
        .unwrap();
    assert_eq!(wait_terminal(&sync, &dl2).await, ItemState::Completed);
    assert_tree_matches(src.path(), dest2.path(), &["members.bin"]);
}

// S6: selective download fetches exactly the selected file's segments
// plus the index, nothing else.
#[tokio::test]
async fn selective_download_fetches_only_selected_segments() {
    let server = FakeNntpServer::start().await;
    let sync = system(&server, SegmentPolicy::default(), 4);

    let src = tempfile::tempdir().unwrap();
    for (name, seed) in [("a.bin", 0xA), ("b.bin", 0xB), ("c.bin", 0xC)] {
        write_random_file(&src.path().join(name), 2 * 1024 * 1024, seed);
    }

    let (folder_id, handle) = publish_ready_folder(&sync, src.path()).await;
    assert_eq!(wait_terminal(&sync, &handle).await, ItemState::Completed);
    // 2 MiB at 768000 = 3 segments per file.
    assert_eq!(server.post_count(), 9);

    let (_, token) = sync
        .publish_folder(&folder_id, &AccessSpec::Public, None)
        .await
        .unwrap();

    let fetches_before = server.fetch_count();
    let dest = tempfile::tempdir().unwrap();
    let selector: HashSet<String> = ["b.bin".to_string()].into();
    let dl = sync
        .download_share(
            &token,
            &Credentials::Anonymous,
            dest.path().into(),
            Some(selector),
        )
        .await
        .unwrap();
    assert_eq!(wait_terminal(&sync, &dl).await, ItemState::Completed);

    // One index segment + b.bin's three data segments.
    assert_eq!(server.fetch_count() - fetches_before, 4);
    assert_tree_matches(src.path(), dest.path(), &["b.bin"]);
    assert!(!dest.path().join("a.bin").exists());
    assert!(!dest.path().join("c.bin").exists());
}

// Property 6: with redundancy 2, losing one copy of a segment does not
// break retrieval.
#[tokio::test]
async fn redundancy_survives_copy_loss() {
    let server = FakeNntpServer::start().await;
    let policy = SegmentPolicy {
        redundancy: 2,
        ..SegmentPolicy::default()
    };
    let sync = system(&server, policy, 4);

    let src = tempfile::tempdir().unwrap();
    write_random_file(&src.path().join("copy.bin"), 200_000, 0xC0);

    let (folder_id, handle) = publish_ready_folder(&sync, src.path()).await;
    assert_eq!(wait_terminal(&sync, &handle).await, ItemState::Completed);
    assert_eq!(server.post_count(), 2, "two copies of the one segment");

    let (_, token) = sync
        .publish_folder(&folder_id, &AccessSpec::Public, None)
        .await
        .unwrap();

    // Expire the primary copy from the provider.
    let segments = sync.store().segments_for_folder(&folder_id).await.unwrap();
    let primary = segments
        .iter()
        .find(|s| s.redundancy_index == 0)
        .unwrap()
        .message_id
        .as_ref()
        .unwrap();
    assert!(server.delete_article(primary.as_str()));

    let dest = tempfile::tempdir().unwrap();
    let dl = sync
        .download_share(&token, &Credentials::Anonymous, dest.path().into(), None)
        .await
        .unwrap();
    assert_eq!(wait_terminal(&sync, &dl).await, ItemState::Completed);
    assert_tree_matches(src.path(), dest.path(), &["copy.bin"]);
}

// Property 8: pause dispatches no new posts; resume finishes the job.
#[tokio::test]
async fn pause_stops_dispatch_and_resume_completes() {
    let server = FakeNntpServer::start().await;
    server.set_latency_ms(50);
    let sync = system(&server, SegmentPolicy::default(), 2);

    let src = tempfile::tempdir().unwrap();
    write_random_file(&src.path().join("long.bin"), 7_680_000, 0x10);

    let (_, handle) = publish_ready_folder(&sync, src.path()).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let state = sync.pause(&handle).await.unwrap();
    assert_eq!(state, ItemState::Paused);

    let posts_at_pause = server.post_count();
    assert!(posts_at_pause < 10, "pause landed mid-upload");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.post_count(), posts_at_pause, "no new dispatch after pause");

    server.set_latency_ms(0);
    sync.resume(&handle).await.unwrap();
    assert_eq!(wait_terminal(&sync, &handle).await, ItemState::Completed);
    assert_eq!(server.post_count(), 10);
}

// A server that acks with the `<posted>` placeholder still yields
// retrievable articles: the suggested id is used throughout.
#[tokio::test]
async fn placeholder_acks_round_trip() {
    let server = FakeNntpServer::start().await;
    server.echo_placeholder(true);
    let sync = system(&server, SegmentPolicy::default(), 4);

    let src = tempfile::tempdir().unwrap();
    write_random_file(&src.path().join("ph.bin"), 900_000, 0x9E);

    let (folder_id, handle) = publish_ready_folder(&sync, src.path()).await;
    assert_eq!(wait_terminal(&sync, &handle).await, ItemState::Completed);

    let (_, token) = sync
        .publish_folder(&folder_id, &AccessSpec::Public, None)
        .await
        .unwrap();
    let dest = tempfile::tempdir().unwrap();
    let dl = sync
        .download_share(&token, &Credentials::Anonymous, dest.path().into(), None)
        .await
        .unwrap();
    assert_eq!(wait_terminal(&sync, &dl).await, ItemState::Completed);
    assert_tree_matches(src.path(), dest.path(), &["ph.bin"]);
}

// Mixed tree: a large file, packable files, and an empty file all survive
// the round trip with paths preserved.
#[tokio::test]
async fn mixed_tree_round_trip() {
    let server = FakeNntpServer::start().await;
    let sync = system(&server, SegmentPolicy::default(), 4);

    let src = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(src.path().join("nested/deep")).unwrap();
    write_random_file(&src.path().join("large.bin"), 1_600_000, 0x1A);
    write_random_file(&src.path().join("nested/mid.dat"), 20_000, 0x1B);
    write_random_file(&src.path().join("nested/deep/tiny.txt"), 100, 0x1C);
    std::fs::write(src.path().join("empty.txt"), b"").unwrap();

    let (folder_id, handle) = publish_ready_folder(&sync, src.path()).await;
    assert_eq!(wait_terminal(&sync, &handle).await, ItemState::Completed);

    let (_, token) = sync
        .publish_folder(&folder_id, &AccessSpec::Public, None)
        .await
        .unwrap();
    let dest = tempfile::tempdir().unwrap();
    let dl = sync
        .download_share(&token, &Credentials::Anonymous, dest.path().into(), None)
        .await
        .unwrap();
    assert_eq!(wait_terminal(&sync, &dl).await, ItemState::Completed);
    assert_tree_matches(
        src.path(),
        dest.path(),
        &[
            "large.bin",
            "nested/mid.dat",
            "nested/deep/tiny.txt",
            "empty.txt",
        ],
    );
}

// Property 7: the posting pipeline is bounded end-to-end. With a slow
// server, segment rows (created just before a payload enters the channel)
// stay near the channel depth instead of racing ahead to the whole file.
#[tokio::test]
async fn segmenter_is_backpressured_by_slow_posting() {
    let server = FakeNntpServer::start().await;
    server.set_latency_ms(200);
    let sync = system(&server, SegmentPolicy::default(), 1);

    let src = tempfile::tempdir().unwrap();
    write_random_file(&src.path().join("slow.bin"), 7_680_000, 0x51);

    let (folder_id, handle) = publish_ready_folder(&sync, src.path()).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    // Depth is 2 x 1 worker; with one in flight and one blocked in the
    // producer's hand, far fewer than ten rows may exist yet.
    let rows_mid_flight = sync
        .store()
        .segments_for_folder(&folder_id)
        .await
        .unwrap()
        .len();
    assert!(
        rows_mid_flight < 10,
        "segmenter ran ahead of the bounded queue: {rows_mid_flight} rows"
    );

    server.set_latency_ms(0);
    assert_eq!(wait_terminal(&sync, &handle).await, ItemState::Completed);
    assert_eq!(server.post_count(), 10);
}

// A core index bigger than one segment is chunked, posted under several
// Message-IDs, and reassembled transparently on the receiver.
#[tokio::test]
async fn oversized_index_spans_multiple_segments() {
    let server = FakeNntpServer::start().await;
    // Small segments and a tiny pack threshold force one segment per file
    // and an index too big for a single article.
    let policy = SegmentPolicy {
        segment_size: 16 * 1024,
        pack_threshold: 512,
        ..SegmentPolicy::default()
    };
    let sync = system(&server, policy, 4);

    let src = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(src.path().join("corpus")).unwrap();
    for i in 0..400 {
        write_random_file(
            &src.path().join(format!("corpus/document-{i:04}.bin")),
            1024,
            0xF00 + i as u64,
        );
    }

    let (folder_id, handle) = publish_ready_folder(&sync, src.path()).await;
    assert_eq!(wait_terminal(&sync, &handle).await, ItemState::Completed);
    assert_eq!(server.post_count(), 400);

    let (record, token) = sync
        .publish_folder(&folder_id, &AccessSpec::Public, None)
        .await
        .unwrap();
    assert!(
        record.index_refs.len() > 1,
        "index should span segments, got {}",
        record.index_refs.len()
    );

    let dest = tempfile::tempdir().unwrap();
    let dl = sync
        .download_share(&token, &Credentials::Anonymous, dest.path().into(), None)
        .await
        .unwrap();
    assert_eq!(wait_terminal(&sync, &dl).await, ItemState::Completed);

    let names: Vec<String> = (0..400).map(|i| format!("corpus/document-{i:04}.bin")).collect();
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    assert_tree_matches(src.path(), dest.path(), &name_refs);
}

// Startup recovery respawns uploads that were interrupted mid-run.
#[tokio::test]
async fn recover_respawns_interrupted_uploads() {
    let server = FakeNntpServer::start().await;
    let sync = system(&server, SegmentPolicy::default(), 2);

    let src = tempfile::tempdir().unwrap();
    write_random_file(&src.path().join("orphan.bin"), 1_000_000, 0x0F);

    let user = sync.create_user("publisher").await.unwrap();
    let folder_id = sync
        .add_folder(src.path().to_str().unwrap(), &user.user.user_id)
        .await
        .unwrap();
    sync.index_folder(&folder_id).await.unwrap();

    // Simulate a queue item left behind by a killed process.
    let orphan = sync
        .store()
        .enqueue(
            common::QueueKind::Upload,
            &store::NewQueueItem {
                entity_ref: folder_id.to_hex(),
                priority: 0,
                bytes_total: 0,
            },
        )
        .await
        .unwrap();
    sync.store()
        .update_item_state(common::QueueKind::Upload, orphan, ItemState::Running, None)
        .await
        .unwrap();

    let resumed = sync.recover().await.unwrap();
    assert_eq!(resumed.len(), 1);
    assert_eq!(wait_terminal(&sync, &resumed[0]).await, ItemState::Completed);
    assert_eq!(server.post_count(), 2, "one segment per 768000-byte chunk");

    let folder = sync.store().folder(&folder_id).await.unwrap().unwrap();
    assert_eq!(folder.state, FolderState::Uploaded);
}
