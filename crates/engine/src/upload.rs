//! Upload engine.
//!
//! Per folder: `queued → segmenting → posting → indexing → published`
//! (the indexing/publishing step lives in `publish.rs`). One segmenter
//! producer streams prepared payloads into a bounded channel sized
//! `2 × UPLOAD_WORKERS`; when it fills, the segmenter blocks, which in
//! turn throttles everything upstream. Posting workers drain the channel,
//! each checking out an exclusive transport session per article.
//!
//! Resume is row-driven: a segment with a Message-ID is skipped, one
//! without is re-prepared (fresh nonce, refreshed payload hash) and
//! rescheduled. A failed segment fails the queue item, never the
//! pipeline.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::{
    EngineConfig, FileRecord, FileState, Folder, FolderState, ItemId, ItemState, ProgressState,
    QueueKind, SegmentId, SegmentOwner, SegmentPolicy, SegmentProgress, SegmentRecord,
};
use crypto::{inner_subject, FolderKey, KeyPurpose, SubKey};
use codec::CopyPlan;
use segmenter::{build_pack_payload, plan_packs, prepare_chunk, ChunkReader};
use store::{NewPack, NewSegment, Store};
use transport::{with_retries, NntpPool, RetryPolicy};

use crate::article::{encode_article, ArticlePlan};
use crate::error::Result;

struct WorkItem {
    segment_id: SegmentId,
    ordinal: u32,
    plan: ArticlePlan,
    plaintext_len: u32,
    payload: Arc<Vec<u8>>,
}

pub struct UploadEngine {
    store: Arc<dyn Store>,
    pool: NntpPool,
    policy: SegmentPolicy,
    config: EngineConfig,
}

impl UploadEngine {
    pub fn new(
        store: Arc<dyn Store>,
        pool: NntpPool,
        policy: SegmentPolicy,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            pool,
            policy,
            config,
        }
    }

    /// Drive one queue item to completion (or pause/failure). Safe to call
    /// again for the same item after a crash or pause: completed posts are
    /// recognized by their Message-IDs and skipped.
    pub async fn run(&self, item_id: ItemId, folder: &Folder, cancel: CancellationToken) -> Result<ItemState> {
        self.store
            .update_item_state(QueueKind::Upload, item_id, ItemState::Running, None)
            .await?;

        let folder_key = FolderKey::from_bytes(folder.folder_key);
        let segment_key = Arc::new(folder_key.derive(KeyPurpose::SegmentEncryption));
        let subject_key = folder_key.derive(KeyPurpose::SubjectObfuscation);

        let (tx, rx) = mpsc::channel::<WorkItem>(self.config.upload_queue_depth());
        let rx = Arc::new(AsyncMutex::new(rx));
        let failures = Arc::new(AtomicU32::new(0));
        let first_error: Arc<AsyncMutex<Option<String>>> = Arc::new(AsyncMutex::new(None));

        let mut workers = Vec::with_capacity(self.config.upload_workers);
        for worker_id in 0..self.config.upload_workers {
            workers.push(tokio::spawn(posting_worker(
                worker_id,
                Arc::clone(&self.store),
                self.pool.clone(),
                Arc::clone(&rx),
                item_id,
                cancel.clone(),
                Arc::clone(&failures),
                Arc::clone(&first_error),
                crate::retry_policy(&self.config),
            )));
        }

        let produced = self
            .segment_folder(folder, &segment_key, &subject_key, item_id, tx, &cancel)
            .await;
        for worker in workers {
            let _ = worker.await;
        }
        self.store
            .recompute_item_bytes(QueueKind::Upload, item_id)
            .await?;

        if let Err(err) = produced {
            let message = err.to_string();
            self.store
                .update_item_state(QueueKind::Upload, item_id, ItemState::Failed, Some(&message))
                .await?;
            return Err(err);
        }

        if cancel.is_cancelled() {
            self.store
                .update_item_state(QueueKind::Upload, item_id, ItemState::Paused, None)
                .await?;
            info!(item = %item_id, "upload paused");
            return Ok(ItemState::Paused);
        }

        if failures.load(Ordering::SeqCst) > 0 {
            let message = first_error
                .lock()
                .await
                .clone()
                .unwrap_or_else(|| "segment posting failed".to_string());
            self.store
                .update_item_state(QueueKind::Upload, item_id, ItemState::Failed, Some(&message))
                .await?;
            self.store.bump_item_attempts(QueueKind::Upload, item_id).await?;
            warn!(item = %item_id, %message, "upload item failed");
            return Ok(ItemState::Failed);
        }

        for file in self.store.files_for_folder(&folder.folder_id).await? {
            self.store
                .update_file_state(file.file_id, FileState::Uploaded)
                .await?;
        }
        self.store
            .update_folder_state(&folder.folder_id, FolderState::Uploaded)
            .await?;
        self.store
            .update_item_state(QueueKind::Upload, item_id, ItemState::Completed, None)
            .await?;
        info!(item = %item_id, folder = %folder.folder_id, "upload complete");
        Ok(ItemState::Completed)
    }

    /// Producer side: walk the folder's files, create or refresh segment
    /// rows, and push payloads into the bounded posting channel.
    async fn segment_folder(
        &self,
        folder: &Folder,
        segment_key: &SubKey,
        subject_key: &SubKey,
        item_id: ItemId,
        tx: mpsc::Sender<WorkItem>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let files = self.store.files_for_folder(&folder.folder_id).await?;
        let mut bytes_total = 0u64;
        let mut ordinal = 0u32;
        let version = folder.stats.version.max(1);

        let (large, small): (Vec<FileRecord>, Vec<FileRecord>) = files
            .into_iter()
            .partition(|f| !f.is_packable(self.policy.pack_threshold));

        for file in &large {
            bytes_total += file.size * self.policy.redundancy as u64;
        }
        for file in &small {
            bytes_total += file.size * self.policy.redundancy as u64;
        }
        self.store
            .set_item_bytes_total(QueueKind::Upload, item_id, bytes_total)
            .await?;

        for file in large {
            if cancel.is_cancelled() {
                return Ok(());
            }
            self.segment_large_file(folder, &file, segment_key, subject_key, version, item_id, &tx, &mut ordinal, cancel)
                .await?;
        }
        self.segment_packs(folder, &small, segment_key, subject_key, version, item_id, &tx, &mut ordinal, cancel)
            .await?;

        if !cancel.is_cancelled() {
            self.store
                .update_folder_state(&folder.folder_id, FolderState::Segmented)
                .await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn segment_large_file(
        &self,
        folder: &Folder,
        file: &FileRecord,
        segment_key: &SubKey,
        subject_key: &SubKey,
        version: u32,
        item_id: ItemId,
        tx: &mpsc::Sender<WorkItem>,
        ordinal: &mut u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let existing: HashMap<(u32, u8), SegmentRecord> = self
            .store
            .segments_for_file(file.file_id)
            .await?
            .into_iter()
            .map(|s| ((s.index, s.redundancy_index), s))
            .collect();

        let total = (file.size.div_ceil(self.policy.segment_size as u64)).max(1) as u32;
        let path = Path::new(&folder.path).join(&file.relative_path);
        let mut reader = ChunkReader::open(&path, self.policy.segment_size)?;

        while let Some((index, chunk)) = reader.next_chunk()? {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let mut prepared: Option<segmenter::PreparedSegment> = None;
            for copy in CopyPlan::new(self.policy.redundancy).indices() {
                let seat = *ordinal;
                *ordinal += 1;
                let row = existing.get(&(index, copy));
                if let Some(row) = row {
                    if row.message_id.is_some() {
                        self.mark_seat_done(item_id, seat, row).await?;
                        continue;
                    }
                }
                let segment = match &prepared {
                    Some(p) => p.clone(),
                    None => {
                        let p = prepare_chunk(&chunk, index, segment_key, &self.policy)?;
                        prepared = Some(p.clone());
                        p
                    }
                };
                let segment_id = match row {
                    Some(row) => {
                        self.store
                            .update_segment_payload_hash(row.segment_id, &segment.ciphertext_hash)
                            .await?;
                        row.segment_id
                    }
                    None => {
                        self.store
                            .insert_segments(&[NewSegment {
                                owner: SegmentOwner::File(file.file_id),
                                index,
                                size: segment.plaintext_len,
                                plaintext_hash: segment.plaintext_hash,
                                ciphertext_hash: segment.ciphertext_hash,
                                redundancy_index: copy,
                            }])
                            .await?[0]
                    }
                };
                let begin = index as u64 * self.policy.segment_size as u64 + 1;
                let item = WorkItem {
                    segment_id,
                    ordinal: seat,
                    plan: ArticlePlan {
                        part: index + 1,
                        total,
                        object_size: file.size,
                        begin,
                        end: begin + segment.plaintext_len as u64 - 1,
                        inner: inner_subject(subject_key, &folder.folder_id, version, index),
                    },
                    plaintext_len: segment.plaintext_len,
                    payload: Arc::new(segment.payload),
                };
                if send_or_cancelled(tx, item, cancel).await {
                    return Ok(());
                }
            }
        }

        self.store
            .update_file_segment_count(file.file_id, total)
            .await?;
        self.store
            .update_file_state(file.file_id, FileState::Segmented)
            .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn segment_packs(
        &self,
        folder: &Folder,
        small: &[FileRecord],
        segment_key: &SubKey,
        subject_key: &SubKey,
        version: u32,
        item_id: ItemId,
        tx: &mpsc::Sender<WorkItem>,
        ordinal: &mut u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if small.is_empty() {
            return Ok(());
        }
        let root = Path::new(&folder.path);

        // Reuse the existing pack layout on resume; plan fresh otherwise.
        let mut packs = self.store.packs_for_folder(&folder.folder_id).await?;
        if packs.is_empty() {
            for (seq, members) in plan_packs(small, self.policy.pack_budget()).iter().enumerate() {
                let rows = members
                    .iter()
                    .map(|f| common::PackMember {
                        file_id: f.file_id,
                        relative_path: f.relative_path.clone(),
                        size: f.size,
                    })
                    .collect();
                self.store
                    .insert_pack(&NewPack {
                        folder_id: folder.folder_id,
                        segment_index: seq as u32,
                        members: rows,
                    })
                    .await?;
            }
            packs = self.store.packs_for_folder(&folder.folder_id).await?;
        }

        let by_id: HashMap<_, _> = small.iter().map(|f| (f.file_id, f)).collect();
        for pack in packs {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let existing: HashMap<u8, SegmentRecord> = self
                .store
                .segments_for_pack(pack.pack_id)
                .await?
                .into_iter()
                .map(|s| (s.redundancy_index, s))
                .collect();

            let members: Vec<FileRecord> = pack
                .members
                .iter()
                .filter_map(|m| by_id.get(&m.file_id).map(|f| (*f).clone()))
                .collect();
            let mut prepared: Option<segmenter::PreparedSegment> = None;

            for copy in CopyPlan::new(self.policy.redundancy).indices() {
                let seat = *ordinal;
                *ordinal += 1;
                let row = existing.get(&copy);
                if let Some(row) = row {
                    if row.message_id.is_some() {
                        self.mark_seat_done(item_id, seat, row).await?;
                        continue;
                    }
                }
                let segment = match &prepared {
                    Some(p) => p.clone(),
                    None => {
                        let (payload, _) = build_pack_payload(root, &members)?;
                        let p = prepare_chunk(&payload, pack.segment_index, segment_key, &self.policy)?;
                        prepared = Some(p.clone());
                        p
                    }
                };
                let segment_id = match row {
                    Some(row) => {
                        self.store
                            .update_segment_payload_hash(row.segment_id, &segment.ciphertext_hash)
                            .await?;
                        row.segment_id
                    }
                    None => {
                        self.store
                            .insert_segments(&[NewSegment {
                                owner: SegmentOwner::Pack(pack.pack_id),
                                index: 0,
                                size: segment.plaintext_len,
                                plaintext_hash: segment.plaintext_hash,
                                ciphertext_hash: segment.ciphertext_hash,
                                redundancy_index: copy,
                            }])
                            .await?[0]
                    }
                };
                let item = WorkItem {
                    segment_id,
                    ordinal: seat,
                    plan: ArticlePlan {
                        part: 1,
                        total: 1,
                        object_size: segment.plaintext_len as u64,
                        begin: 1,
                        end: segment.plaintext_len as u64,
                        inner: inner_subject(
                            subject_key,
                            &folder.folder_id,
                            version,
                            // Packs occupy the top of the index space;
                            // file segments count up from zero.
                            u32::MAX - pack.segment_index,
                        ),
                    },
                    plaintext_len: segment.plaintext_len,
                    payload: Arc::new(segment.payload),
                };
                if send_or_cancelled(tx, item, cancel).await {
                    return Ok(());
                }
            }
        }

        for file in small {
            self.store
                .update_file_segment_count(file.file_id, 1)
                .await?;
            self.store
                .update_file_state(file.file_id, FileState::Segmented)
                .await?;
        }
        Ok(())
    }

    /// Progress row for a segment that was already posted in an earlier
    /// run of this folder.
    async fn mark_seat_done(&self, item_id: ItemId, seat: u32, row: &SegmentRecord) -> Result<()> {
        self.store
            .upsert_progress(
                QueueKind::Upload,
                &SegmentProgress {
                    item_id,
                    segment_index: seat,
                    state: ProgressState::Completed,
                    bytes_done: row.size as u64,
                    server_message_id: row.message_id.clone(),
                    attempts: 0,
                    last_error: None,
                },
            )
            .await?;
        Ok(())
    }
}

/// Send into the bounded channel, bailing out if the upload is cancelled
/// while blocked on backpressure. Returns true when cancelled.
async fn send_or_cancelled(
    tx: &mpsc::Sender<WorkItem>,
    item: WorkItem,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        sent = tx.send(item) => sent.is_err(),
    }
}

#[allow(clippy::too_many_arguments)]
async fn posting_worker(
    worker_id: usize,
    store: Arc<dyn Store>,
    pool: NntpPool,
    rx: Arc<AsyncMutex<mpsc::Receiver<WorkItem>>>,
    item_id: ItemId,
    cancel: CancellationToken,
    failures: Arc<AtomicU32>,
    first_error: Arc<AsyncMutex<Option<String>>>,
    retry: RetryPolicy,
) {
    loop {
        let work = {
            let mut guard = rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                received = guard.recv() => received,
            }
        };
        let Some(work) = work else {
            return;
        };
        // A cancel that raced the channel read still wins: queued work is
        // not dispatched, only in-flight articles run to completion.
        if cancel.is_cancelled() {
            return;
        }

        let group = pool.profile().group.clone();
        let outcome = with_retries(&retry, |attempt| {
            let pool = pool.clone();
            let group = group.clone();
            let payload = Arc::clone(&work.payload);
            let plan = &work.plan;
            async move {
                let article = encode_article(plan, &payload);
                let mut session = pool.checkout().await?;
                session.select_group(&group).await?;
                let message_id = session.post(&article.subject, &[], &article.body).await?;
                Ok::<_, transport::TransportError>((message_id, article.outer, attempt))
            }
        })
        .await;

        match outcome {
            Ok((message_id, outer, attempts)) => {
                let recorded = record_success(
                    store.as_ref(),
                    item_id,
                    &work,
                    &message_id,
                    &outer,
                    attempts,
                )
                .await;
                if let Err(err) = recorded {
                    warn!(worker_id, %err, "failed to record posted segment");
                    failures.fetch_add(1, Ordering::SeqCst);
                    first_error.lock().await.get_or_insert(err.to_string());
                }
            }
            Err(err) => {
                debug!(worker_id, %err, segment = work.segment_id.0, "segment failed permanently");
                failures.fetch_add(1, Ordering::SeqCst);
                first_error.lock().await.get_or_insert(err.to_string());
                let _ = store
                    .upsert_progress(
                        QueueKind::Upload,
                        &SegmentProgress {
                            item_id,
                            segment_index: work.ordinal,
                            state: ProgressState::Failed,
                            bytes_done: 0,
                            server_message_id: None,
                            attempts: retry.max_retries + 1,
                            last_error: Some(err.to_string()),
                        },
                    )
                    .await;
            }
        }
    }
}

async fn record_success(
    store: &dyn Store,
    item_id: ItemId,
    work: &WorkItem,
    message_id: &common::MessageId,
    outer: &str,
    attempts: u32,
) -> Result<()> {
    store
        .mark_segment_uploaded(work.segment_id, message_id, outer)
        .await?;
    store.record_message(message_id, work.segment_id, outer).await?;
    store
        .upsert_progress(
            QueueKind::Upload,
            &SegmentProgress {
                item_id,
                segment_index: work.ordinal,
                state: ProgressState::Completed,
                bytes_done: work.plaintext_len as u64,
                server_message_id: Some(message_id.clone()),
                attempts: attempts + 1,
                last_error: None,
            },
        )
        .await?;
    store.recompute_item_bytes(QueueKind::Upload, item_id).await?;
    Ok(())
}

impl std::fmt::Debug for UploadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadEngine")
            .field("workers", &self.config.upload_workers)
            .finish()
    }
}
