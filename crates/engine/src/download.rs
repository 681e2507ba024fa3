//! Download engine.
//!
//! Index segments come down first (in parallel), the manifest is parsed,
//! and a fetch plan is built: one *position* per distinct segment payload,
//! with every file that consumes it attached. Pack segments therefore
//! appear once no matter how many member files share them; the first
//! member pays the fetch, the rest are cache hits.
//!
//! Fetch workers walk redundancy copies in order and stop at the first
//! authenticated one; an integrity failure on one Message-ID is never
//! retried against the same id. A single reassembly worker writes files
//! as their last position lands, verifying content hashes and restoring
//! mtimes.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::{
    ContentHash, EngineConfig, ItemId, ItemState, MessageId, ProgressState, QueueKind,
    SegmentProgress,
};
use crypto::{FolderKey, KeyPurpose, SubKey};
use manifest::CoreIndex;
use segmenter::{open_segment, unpack_payload, FileWriter};
use store::Store;
use transport::{with_retries, NntpPool, PooledSession, RetryPolicy};

use crate::cache::SegmentCache;
use crate::error::{EngineError, Result};

/// One distinct payload to fetch, with every consumer attached.
#[derive(Debug, Clone)]
struct Position {
    ordinal: u32,
    size: u32,
    hash: ContentHash,
    copies: Vec<(ContentHash, MessageId)>,
    /// `(plan_index, segment_index)` pairs of files consuming this payload.
    consumers: Vec<(usize, u32)>,
}

/// Per-file reassembly plan.
#[derive(Debug, Clone)]
struct FilePlan {
    relative_path: String,
    size: u64,
    content_hash: ContentHash,
    mtime: u64,
    /// Position hash per segment index.
    hashes: Vec<ContentHash>,
    /// Single segment larger than the file itself means a pack payload.
    packed: bool,
}

pub struct DownloadRequest {
    pub index_refs: Vec<MessageId>,
    pub folder_key: FolderKey,
    pub dest: PathBuf,
    /// Exact relative paths to fetch; `None` means everything.
    pub selectors: Option<HashSet<String>>,
}

pub struct DownloadEngine {
    store: Arc<dyn Store>,
    pool: NntpPool,
    config: EngineConfig,
    cache: Arc<SegmentCache>,
}

impl DownloadEngine {
    pub fn new(
        store: Arc<dyn Store>,
        pool: NntpPool,
        config: EngineConfig,
        cache: Arc<SegmentCache>,
    ) -> Self {
        Self {
            store,
            pool,
            config,
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<SegmentCache> {
        &self.cache
    }

    pub async fn run(
        &self,
        item_id: ItemId,
        request: &DownloadRequest,
        cancel: CancellationToken,
    ) -> Result<ItemState> {
        self.store
            .update_item_state(QueueKind::Download, item_id, ItemState::Running, None)
            .await?;

        let segment_key = Arc::new(request.folder_key.derive(KeyPurpose::SegmentEncryption));

        let outcome = self
            .run_inner(item_id, request, &segment_key, &cancel)
            .await;
        self.store
            .recompute_item_bytes(QueueKind::Download, item_id)
            .await?;

        match outcome {
            Ok(failures) if cancel.is_cancelled() => {
                let _ = failures;
                self.store
                    .update_item_state(QueueKind::Download, item_id, ItemState::Paused, None)
                    .await?;
                info!(item = %item_id, "download paused");
                Ok(ItemState::Paused)
            }
            Ok(0) => {
                self.store
                    .update_item_state(QueueKind::Download, item_id, ItemState::Completed, None)
                    .await?;
                info!(item = %item_id, "download complete");
                Ok(ItemState::Completed)
            }
            Ok(failures) => {
                let message = format!("{failures} segment(s) failed");
                self.store
                    .update_item_state(QueueKind::Download, item_id, ItemState::Failed, Some(&message))
                    .await?;
                self.store
                    .bump_item_attempts(QueueKind::Download, item_id)
                    .await?;
                Ok(ItemState::Failed)
            }
            Err(err) => {
                let message = err.to_string();
                self.store
                    .update_item_state(QueueKind::Download, item_id, ItemState::Failed, Some(&message))
                    .await?;
                Err(err)
            }
        }
    }

    async fn run_inner(
        &self,
        item_id: ItemId,
        request: &DownloadRequest,
        segment_key: &Arc<SubKey>,
        cancel: &CancellationToken,
    ) -> Result<u32> {
        let retry = crate::retry_policy(&self.config);

        let index = self
            .fetch_index(&request.index_refs, segment_key, &retry)
            .await?;
        let (positions, plans) = build_plan(&index, request.selectors.as_ref());

        let bytes_total: u64 = positions.iter().map(|p| p.size as u64).sum();
        self.store
            .set_item_bytes_total(QueueKind::Download, item_id, bytes_total)
            .await?;

        // Files already present and intact at the destination are skipped
        // outright; that is what makes a killed download restartable.
        let mut done = vec![false; plans.len()];
        for (i, plan) in plans.iter().enumerate() {
            if destination_matches(&request.dest, plan) {
                debug!(path = %plan.relative_path, "destination already intact");
                done[i] = true;
            }
        }

        let needed: Vec<Position> = positions
            .iter()
            .filter(|p| p.consumers.iter().any(|(file, _)| !done[*file]))
            .cloned()
            .collect();
        for position in positions.iter().filter(|p| !needed.iter().any(|n| n.ordinal == p.ordinal)) {
            self.store
                .upsert_progress(
                    QueueKind::Download,
                    &SegmentProgress {
                        item_id,
                        segment_index: position.ordinal,
                        state: ProgressState::Completed,
                        bytes_done: position.size as u64,
                        server_message_id: position.copies.first().map(|(_, m)| m.clone()),
                        attempts: 0,
                        last_error: None,
                    },
                )
                .await?;
        }

        // Reassembly worker: one per download.
        let (done_tx, done_rx) = mpsc::channel::<u32>(needed.len().max(1) * 2);
        let reassembler = tokio::spawn(reassemble_worker(
            Arc::new(needed.clone()),
            plans.clone(),
            done.clone(),
            Arc::clone(&self.cache),
            request.dest.clone(),
            done_rx,
        ));

        // Fetch workers.
        let (work_tx, work_rx) = mpsc::channel::<Position>(2 * self.config.download_workers);
        let work_rx = Arc::new(AsyncMutex::new(work_rx));
        let failures = Arc::new(AtomicU32::new(0));
        let mut workers = Vec::with_capacity(self.config.download_workers);
        for _ in 0..self.config.download_workers {
            workers.push(tokio::spawn(fetch_worker(
                Arc::clone(&self.store),
                self.pool.clone(),
                Arc::clone(&work_rx),
                Arc::clone(&self.cache),
                Arc::clone(segment_key),
                item_id,
                done_tx.clone(),
                cancel.clone(),
                Arc::clone(&failures),
                retry,
            )));
        }
        let producer_done_tx = done_tx;

        let existing: HashMap<u32, SegmentProgress> = self
            .store
            .progress_rows(QueueKind::Download, item_id)
            .await?
            .into_iter()
            .map(|r| (r.segment_index, r))
            .collect();

        for position in needed {
            if cancel.is_cancelled() {
                break;
            }
            // A completed row only counts when the payload is actually
            // resident; after a process restart the cache starts cold.
            if let Some(row) = existing.get(&position.ordinal) {
                if row.state == ProgressState::Completed && self.cache.contains(&position.hash) {
                    // Reassembly spends one pin per consumer. The earlier
                    // run already released the pins of consumers whose
                    // files reached disk, so the entry holds one pin per
                    // live consumer; topping the written ones back up
                    // restores pins == consumers.len() before this run's
                    // reassembler unpins them all again.
                    let written = position
                        .consumers
                        .iter()
                        .filter(|(file, _)| done[*file])
                        .count() as u32;
                    self.cache.pin(&position.hash, written);
                    let _ = producer_done_tx.send(position.ordinal).await;
                    continue;
                }
            }
            if send_position(&work_tx, position, cancel).await {
                break;
            }
        }
        drop(work_tx);
        drop(producer_done_tx);

        for worker in workers {
            let _ = worker.await;
        }
        let reassembly_failures = reassembler.await.unwrap_or(1);
        Ok(failures.load(Ordering::SeqCst) + reassembly_failures)
    }

    async fn fetch_index(
        &self,
        refs: &[MessageId],
        segment_key: &Arc<SubKey>,
        retry: &RetryPolicy,
    ) -> Result<CoreIndex> {
        let mut sealed = Vec::new();
        let chunks = futures::future::join_all(refs.iter().map(|message_id| {
            let pool = self.pool.clone();
            let key = Arc::clone(segment_key);
            let retry = *retry;
            async move {
                let payload = fetch_payload(&pool, &retry, message_id).await?;
                open_segment(&payload, &key).map_err(EngineError::from)
            }
        }))
        .await;
        for chunk in chunks {
            sealed.extend_from_slice(&chunk?);
        }
        Ok(manifest::open(&sealed)?)
    }
}

/// Retry-wrapped article fetch returning the yEnc-decoded payload.
async fn fetch_payload(
    pool: &NntpPool,
    retry: &RetryPolicy,
    message_id: &MessageId,
) -> Result<Vec<u8>> {
    let body = with_retries(retry, |_| {
        let pool = pool.clone();
        async move {
            let mut session: PooledSession = pool.checkout().await?;
            session.fetch(message_id).await
        }
    })
    .await?;
    let decoded = codec::yenc_decode(&body)?;
    Ok(decoded.data)
}

fn destination_matches(dest: &Path, plan: &FilePlan) -> bool {
    let path = dest.join(&plan.relative_path);
    let Ok(metadata) = std::fs::metadata(&path) else {
        return false;
    };
    if metadata.len() != plan.size {
        return false;
    }
    match std::fs::read(&path) {
        Ok(bytes) => crypto::sha256(&bytes) == plan.content_hash,
        Err(_) => false,
    }
}

/// Collapse the manifest into distinct positions and per-file plans,
/// honoring the selector set.
fn build_plan(
    index: &CoreIndex,
    selectors: Option<&HashSet<String>>,
) -> (Vec<Position>, Vec<FilePlan>) {
    let selected: Vec<(usize, &manifest::ManifestFile)> = index
        .files
        .iter()
        .enumerate()
        .filter(|(_, f)| selectors.map_or(true, |s| s.contains(&f.relative_path)))
        .collect();

    let mut positions: Vec<Position> = Vec::new();
    let mut by_hash: HashMap<ContentHash, usize> = HashMap::new();
    let mut plans = Vec::with_capacity(selected.len());

    for (plan_index, (file_ref, file)) in selected.iter().enumerate() {
        let mut hashes = Vec::with_capacity(file.segment_count as usize);
        let mut packed = false;
        for seg_index in 0..file.segment_count {
            let copies = index.copies_for(*file_ref as u64, seg_index);
            let Some(primary) = copies.first() else {
                continue;
            };
            if file.segment_count == 1 && primary.size as u64 != file.size {
                packed = true;
            }
            let key = primary.ciphertext_hash;
            let slot = *by_hash.entry(key).or_insert_with(|| {
                positions.push(Position {
                    ordinal: positions.len() as u32,
                    size: primary.size,
                    hash: key,
                    copies: copies
                        .iter()
                        .map(|c| (c.ciphertext_hash, c.message_id.clone()))
                        .collect(),
                    consumers: Vec::new(),
                });
                positions.len() - 1
            });
            positions[slot].consumers.push((plan_index, seg_index));
            hashes.push(key);
        }
        plans.push(FilePlan {
            relative_path: file.relative_path.clone(),
            size: file.size,
            content_hash: file.content_hash,
            mtime: file.mtime,
            hashes,
            packed,
        });
    }
    (positions, plans)
}

async fn send_position(
    tx: &mpsc::Sender<Position>,
    position: Position,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        sent = tx.send(position) => sent.is_err(),
    }
}

#[allow(clippy::too_many_arguments)]
async fn fetch_worker(
    store: Arc<dyn Store>,
    pool: NntpPool,
    rx: Arc<AsyncMutex<mpsc::Receiver<Position>>>,
    cache: Arc<SegmentCache>,
    segment_key: Arc<SubKey>,
    item_id: ItemId,
    done_tx: mpsc::Sender<u32>,
    cancel: CancellationToken,
    failures: Arc<AtomicU32>,
    retry: RetryPolicy,
) {
    loop {
        let position = {
            let mut guard = rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                received = guard.recv() => received,
            }
        };
        let Some(position) = position else {
            return;
        };
        if cancel.is_cancelled() {
            return;
        }

        let mut fetched: Option<Vec<u8>> = None;
        let mut last_error = String::from("no copies available");
        let mut attempts = 0u32;
        for (copy_hash, message_id) in &position.copies {
            attempts += 1;
            let payload = match fetch_payload(&pool, &retry, message_id).await {
                Ok(p) => p,
                Err(err) => {
                    debug!(%message_id, %err, "copy fetch failed, trying next");
                    last_error = err.to_string();
                    continue;
                }
            };
            // Integrity failures move to the next redundancy copy; the
            // same Message-ID is never refetched for a hash mismatch.
            if crypto::sha256(&payload) != *copy_hash {
                last_error = format!("payload hash mismatch for {message_id}");
                warn!(%message_id, "ciphertext hash mismatch");
                continue;
            }
            match open_segment(&payload, &segment_key) {
                Ok(plain) => {
                    fetched = Some(plain);
                    break;
                }
                Err(err) => {
                    last_error = format!("authentication failed for {message_id}: {err}");
                    warn!(%message_id, %err, "segment failed authentication");
                }
            }
        }

        match fetched {
            Some(plain) => {
                cache.insert(position.hash, plain, position.consumers.len() as u32);
                let _ = store
                    .upsert_progress(
                        QueueKind::Download,
                        &SegmentProgress {
                            item_id,
                            segment_index: position.ordinal,
                            state: ProgressState::Completed,
                            bytes_done: position.size as u64,
                            server_message_id: position.copies.first().map(|(_, m)| m.clone()),
                            attempts,
                            last_error: None,
                        },
                    )
                    .await;
                let _ = store.recompute_item_bytes(QueueKind::Download, item_id).await;
                let _ = done_tx.send(position.ordinal).await;
            }
            None => {
                failures.fetch_add(1, Ordering::SeqCst);
                let _ = store
                    .upsert_progress(
                        QueueKind::Download,
                        &SegmentProgress {
                            item_id,
                            segment_index: position.ordinal,
                            state: ProgressState::Failed,
                            bytes_done: 0,
                            server_message_id: None,
                            attempts,
                            last_error: Some(last_error),
                        },
                    )
                    .await;
            }
        }
    }
}

/// The single reassembly worker: waits for positions, tracks per-file
/// remaining counts, writes completed files. Returns its failure count.
async fn reassemble_worker(
    positions: Arc<Vec<Position>>,
    plans: Vec<FilePlan>,
    done: Vec<bool>,
    cache: Arc<SegmentCache>,
    dest: PathBuf,
    mut done_rx: mpsc::Receiver<u32>,
) -> u32 {
    let by_ordinal: HashMap<u32, &Position> =
        positions.iter().map(|p| (p.ordinal, p)).collect();
    let mut remaining: Vec<usize> = plans.iter().map(|p| p.hashes.len()).collect();
    let mut written = done;
    let mut failures = 0u32;

    // Zero-segment (empty) files need no payloads at all.
    for (i, plan) in plans.iter().enumerate() {
        if !written[i] && plan.hashes.is_empty() {
            match write_file(&dest, plan, &cache) {
                Ok(()) => written[i] = true,
                Err(err) => {
                    warn!(path = %plan.relative_path, %err, "reassembly failed");
                    failures += 1;
                    written[i] = true;
                }
            }
        }
    }

    while let Some(ordinal) = done_rx.recv().await {
        let Some(position) = by_ordinal.get(&ordinal) else {
            continue;
        };
        for (file_idx, _) in &position.consumers {
            if written[*file_idx] {
                cache.unpin(&position.hash);
                continue;
            }
            remaining[*file_idx] = remaining[*file_idx].saturating_sub(1);
            if remaining[*file_idx] == 0 {
                let plan = &plans[*file_idx];
                match write_file(&dest, plan, &cache) {
                    Ok(()) => debug!(path = %plan.relative_path, "file written"),
                    Err(err) => {
                        warn!(path = %plan.relative_path, %err, "reassembly failed");
                        failures += 1;
                    }
                }
                written[*file_idx] = true;
                for hash in &plan.hashes {
                    cache.unpin(hash);
                }
            }
        }
    }
    failures
}

fn write_file(dest: &Path, plan: &FilePlan, cache: &SegmentCache) -> Result<()> {
    let path = dest.join(&plan.relative_path);
    let mut writer = FileWriter::create(&path, plan.content_hash, plan.mtime)?;
    if plan.packed {
        let hash = plan
            .hashes
            .first()
            .ok_or_else(|| EngineError::Integrity("packed file without payload".to_string()))?;
        let payload = cache
            .get(hash)
            .ok_or_else(|| EngineError::Integrity("pack payload missing from cache".to_string()))?;
        let entries = unpack_payload(&payload)?;
        let member = entries
            .into_iter()
            .find(|(entry, _)| entry.relative_path == plan.relative_path)
            .ok_or_else(|| {
                EngineError::Integrity(format!(
                    "pack directory missing {}",
                    plan.relative_path
                ))
            })?;
        writer.append(&member.1)?;
    } else {
        for hash in &plan.hashes {
            let data = cache.get(hash).ok_or_else(|| {
                EngineError::Integrity("segment evicted before reassembly".to_string())
            })?;
            writer.append(&data)?;
        }
    }
    writer.finish()?;
    Ok(())
}
