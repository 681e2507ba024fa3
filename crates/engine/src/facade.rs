//! The operations surface external collaborators consume.
//!
//! Every operation from the external-interface table lives here; the CLI
//! and any RPC layer are thin wrappers over this type. Async operations
//! hand back a [`Handle`]; pause, resume, cancel, and progress all key off
//! it. Collaborators (store, pool, config) are passed in explicitly.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use common::{
    unix_now, EngineConfig, Folder, FolderId, FolderState, IndexStats, ItemId, ItemState,
    ProgressState, QueueKind, SegmentPolicy, ServerProfile, ShareRecord, TransferProgress, User,
    UserId,
};
use crypto::{FolderKey, KeyPurpose, UserKeyPair};
use segmenter::{derive_folder_id, Indexer};
use store::{NewQueueItem, Store};
use transport::NntpPool;

use crate::cache::SegmentCache;
use crate::download::{DownloadEngine, DownloadRequest};
use crate::error::{EngineError, Result};
use crate::publish::Publisher;
use crate::upload::UploadEngine;

pub use access::{AccessSpec, Credentials, Recipient};

/// Opaque handle for a queued transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    pub kind: QueueKind,
    pub item: ItemId,
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            QueueKind::Upload => write!(f, "up-{}", self.item.0),
            QueueKind::Download => write!(f, "dl-{}", self.item.0),
        }
    }
}

impl std::str::FromStr for Handle {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, raw) = s
            .strip_prefix("up-")
            .map(|r| (QueueKind::Upload, r))
            .or_else(|| s.strip_prefix("dl-").map(|r| (QueueKind::Download, r)))
            .ok_or_else(|| EngineError::UnknownHandle(s.to_string()))?;
        let id: i64 = raw
            .parse()
            .map_err(|_| EngineError::UnknownHandle(s.to_string()))?;
        Ok(Handle {
            kind,
            item: ItemId(id),
        })
    }
}

/// What `create_user` hands back: the durable record plus the secret the
/// user must keep (it is never stored).
pub struct UserDescriptor {
    pub user: User,
    pub secret_key: [u8; 32],
}

enum ParkedJob {
    Upload { folder_id: FolderId },
    Download { request: Arc<DownloadRequest> },
}

struct ActiveTransfer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    job: ParkedJob,
}

pub struct UsenetSync {
    store: Arc<dyn Store>,
    pool: NntpPool,
    policy: SegmentPolicy,
    config: EngineConfig,
    upload: Arc<UploadEngine>,
    download: Arc<DownloadEngine>,
    active: AsyncMutex<HashMap<Handle, ActiveTransfer>>,
}

impl UsenetSync {
    pub fn new(
        store: Arc<dyn Store>,
        profile: ServerProfile,
        policy: SegmentPolicy,
        config: EngineConfig,
    ) -> Self {
        let pool = NntpPool::new(profile);
        let cache = Arc::new(SegmentCache::new(config.cache_capacity));
        let upload = Arc::new(UploadEngine::new(
            Arc::clone(&store),
            pool.clone(),
            policy.clone(),
            config.clone(),
        ));
        let download = Arc::new(DownloadEngine::new(
            Arc::clone(&store),
            pool.clone(),
            config.clone(),
            cache,
        ));
        Self {
            store,
            pool,
            policy,
            config,
            upload,
            download,
            active: AsyncMutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn download_cache_stats(&self) -> common::CacheStats {
        self.download.cache().stats()
    }

    // -- identity ---------------------------------------------------------

    pub async fn create_user(&self, name: &str) -> Result<UserDescriptor> {
        if self.store.user_by_name(name).await?.is_some() {
            return Err(EngineError::NameTaken(name.to_string()));
        }
        let mut id = [0u8; 32];
        OsRng.fill_bytes(&mut id);
        let keypair = UserKeyPair::generate();
        let user = User {
            user_id: UserId(id),
            name: name.to_string(),
            public_key: keypair.public_bytes(),
            api_key: crypto::generate_api_key(),
            created_at: unix_now(),
        };
        self.store.insert_user(&user).await?;
        info!(user = %user.user_id, name, "user created");
        Ok(UserDescriptor {
            user,
            secret_key: keypair.secret_bytes(),
        })
    }

    // -- folders ----------------------------------------------------------

    pub async fn add_folder(&self, path: &str, owner: &UserId) -> Result<FolderId> {
        let canonical = std::fs::canonicalize(path)
            .map_err(|_| EngineError::PathMissing(path.to_string()))?;
        if !canonical.is_dir() {
            return Err(EngineError::PathMissing(path.to_string()));
        }
        let canonical_str = canonical.display().to_string();
        let created_at = unix_now();
        let folder_id = derive_folder_id(&canonical_str, created_at);

        let folder_key = FolderKey::generate();
        let keypair = UserKeyPair::generate();
        let sealed = crypto::encrypt(
            &folder_key.derive(KeyPurpose::KeySealing),
            &keypair.secret_bytes(),
        )?;
        let display_name = canonical
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| canonical_str.clone());

        let folder = Folder {
            folder_id,
            path: canonical_str,
            display_name,
            owner: *owner,
            folder_key: *folder_key.as_bytes(),
            public_key: keypair.public_bytes(),
            private_key_sealed: sealed,
            state: FolderState::Created,
            stats: Default::default(),
            created_at,
        };
        self.store.insert_folder(&folder).await?;
        info!(folder = %folder_id, path = %folder.path, "folder added");
        Ok(folder_id)
    }

    async fn load_folder(&self, folder_id: &FolderId) -> Result<Folder> {
        self.store
            .folder(folder_id)
            .await?
            .ok_or_else(|| EngineError::FolderMissing(folder_id.to_hex()))
    }

    pub async fn index_folder(&self, folder_id: &FolderId) -> Result<IndexStats> {
        let folder = self.load_folder(folder_id).await?;
        Indexer::new(Arc::clone(&self.store))
            .index_folder(&folder)
            .await
            .map_err(EngineError::from)
    }

    // -- upload -----------------------------------------------------------

    pub async fn upload_folder(&self, folder_id: &FolderId) -> Result<Handle> {
        let folder = self.load_folder(folder_id).await?;
        if matches!(folder.state, FolderState::Created) {
            return Err(EngineError::NotIndexed(folder_id.to_hex()));
        }
        let item = self
            .store
            .enqueue(
                QueueKind::Upload,
                &NewQueueItem {
                    entity_ref: folder_id.to_hex(),
                    priority: 0,
                    bytes_total: 0,
                },
            )
            .await?;
        let handle = Handle {
            kind: QueueKind::Upload,
            item,
        };
        self.spawn_upload(handle, folder).await;
        Ok(handle)
    }

    async fn spawn_upload(&self, handle: Handle, folder: Folder) {
        let cancel = CancellationToken::new();
        let engine = Arc::clone(&self.upload);
        let folder_id = folder.folder_id;
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = engine.run(handle.item, &folder, task_cancel).await {
                warn!(%handle, %err, "upload task ended with error");
            }
        });
        self.active.lock().await.insert(
            handle,
            ActiveTransfer {
                cancel,
                task,
                job: ParkedJob::Upload { folder_id },
            },
        );
    }

    pub async fn publish_folder(
        &self,
        folder_id: &FolderId,
        spec: &AccessSpec,
        expires_at: Option<u64>,
    ) -> Result<(ShareRecord, String)> {
        let folder = self.load_folder(folder_id).await?;
        let publisher = Publisher::new(
            Arc::clone(&self.store),
            self.pool.clone(),
            self.policy.clone(),
            crate::retry_policy(&self.config),
        );
        publisher.publish(&folder, spec, expires_at).await
    }

    /// Revocation support: rotate the folder key and force the next
    /// upload/publish cycle to repost everything under it. Existing
    /// shares are invalidated; old tokens keep decrypting only the
    /// historical manifest.
    pub async fn rotate_folder_key(&self, folder_id: &FolderId) -> Result<()> {
        let folder = self.load_folder(folder_id).await?;
        let fresh = FolderKey::generate();
        self.store
            .update_folder_key(folder_id, fresh.as_bytes())
            .await?;
        self.store.reset_folder_segments(folder_id).await?;
        self.store.invalidate_shares_for_folder(folder_id).await?;
        for file in self.store.files_for_folder(folder_id).await? {
            self.store
                .update_file_state(file.file_id, common::FileState::Indexed)
                .await?;
        }
        self.store
            .update_folder_state(folder_id, FolderState::Indexed)
            .await?;
        info!(folder = %folder.folder_id, "folder key rotated");
        Ok(())
    }

    // -- download ---------------------------------------------------------

    pub async fn download_share(
        &self,
        token: &str,
        credentials: &Credentials,
        dest: PathBuf,
        selectors: Option<HashSet<String>>,
    ) -> Result<Handle> {
        // Verification happens before anything touches the queue or the
        // network; a bad credential costs zero NNTP traffic.
        let parsed = access::parse_token(token)?;
        let folder_key = access::verify_access(&parsed, credentials)?;

        let item = self
            .store
            .enqueue(
                QueueKind::Download,
                &NewQueueItem {
                    entity_ref: parsed.share_id(),
                    priority: 0,
                    bytes_total: 0,
                },
            )
            .await?;
        let handle = Handle {
            kind: QueueKind::Download,
            item,
        };
        let request = Arc::new(DownloadRequest {
            index_refs: parsed.index_refs.clone(),
            folder_key,
            dest,
            selectors,
        });
        self.spawn_download(handle, Arc::clone(&request)).await;
        Ok(handle)
    }

    async fn spawn_download(&self, handle: Handle, request: Arc<DownloadRequest>) {
        let cancel = CancellationToken::new();
        let engine = Arc::clone(&self.download);
        let task_cancel = cancel.clone();
        let task_request = Arc::clone(&request);
        let task = tokio::spawn(async move {
            if let Err(err) = engine.run(handle.item, &task_request, task_cancel).await {
                warn!(%handle, %err, "download task ended with error");
            }
        });
        self.active.lock().await.insert(
            handle,
            ActiveTransfer {
                cancel,
                task,
                job: ParkedJob::Download { request },
            },
        );
    }

    // -- lifecycle --------------------------------------------------------

    async fn item_state(&self, handle: &Handle) -> Result<ItemState> {
        self.store
            .queue_item(handle.kind, handle.item)
            .await?
            .map(|i| i.state)
            .ok_or_else(|| EngineError::UnknownHandle(handle.to_string()))
    }

    /// Stop dispatching new work; in-flight articles complete. The item
    /// lands in `paused` and stays resumable.
    pub async fn pause(&self, handle: &Handle) -> Result<ItemState> {
        let mut active = self.active.lock().await;
        let Some(transfer) = active.get_mut(handle) else {
            return self.item_state(handle).await;
        };
        transfer.cancel.cancel();
        let task = &mut transfer.task;
        let _ = task.await;
        drop(active);
        self.item_state(handle).await
    }

    /// Pick a paused or failed transfer back up. Completed segments are
    /// recognized from their rows and never reposted or refetched.
    pub async fn resume(&self, handle: &Handle) -> Result<ItemState> {
        let mut active = self.active.lock().await;
        if let Some(transfer) = active.get(handle) {
            if !transfer.task.is_finished() {
                drop(active);
                return self.item_state(handle).await;
            }
        }
        let Some(previous) = active.remove(handle) else {
            // Across a restart the in-memory registry is empty; re-issuing
            // upload_folder / download_share resumes from the rows.
            return Err(EngineError::UnknownHandle(handle.to_string()));
        };
        drop(active);

        let state = self.item_state(handle).await?;
        if !state.is_resumable() {
            self.active.lock().await.insert(*handle, previous);
            return Ok(state);
        }
        match previous.job {
            ParkedJob::Upload { folder_id } => {
                let folder = self.load_folder(&folder_id).await?;
                self.spawn_upload(*handle, folder).await;
            }
            ParkedJob::Download { request } => {
                self.spawn_download(*handle, request).await;
            }
        }
        self.item_state(handle).await
    }

    /// Cancel unwinds immediately (in-flight articles still complete, the
    /// pool session would otherwise be poisoned); partial work remains
    /// resumable.
    pub async fn cancel(&self, handle: &Handle) -> Result<ItemState> {
        let mut active = self.active.lock().await;
        if let Some(transfer) = active.get_mut(handle) {
            transfer.cancel.cancel();
            let task = &mut transfer.task;
            let _ = task.await;
        }
        drop(active);
        self.store
            .update_item_state(handle.kind, handle.item, ItemState::Failed, Some("cancelled"))
            .await?;
        self.item_state(handle).await
    }

    pub async fn progress(&self, handle: &Handle) -> Result<TransferProgress> {
        let item = self
            .store
            .queue_item(handle.kind, handle.item)
            .await?
            .ok_or_else(|| EngineError::UnknownHandle(handle.to_string()))?;
        let rows = self.store.progress_rows(handle.kind, handle.item).await?;
        let segments_done = rows
            .iter()
            .filter(|r| r.state == ProgressState::Completed)
            .count() as u32;
        Ok(TransferProgress {
            item_id: item.item_id,
            state: item.state,
            bytes_done: item.bytes_done,
            bytes_total: item.bytes_total,
            segments_done,
            segments_total: rows.len() as u32,
            last_error: item.last_error,
        })
    }

    /// Startup recovery: uploads interrupted mid-run are respawned from
    /// their rows; interrupted downloads are parked `paused` because their
    /// credentials are never persisted.
    pub async fn recover(&self) -> Result<Vec<Handle>> {
        let mut resumed = Vec::new();
        for item in self.store.resumable_items(QueueKind::Upload).await? {
            if item.state != ItemState::Running {
                continue;
            }
            let Some(folder_id) = FolderId::from_hex(&item.entity_ref) else {
                continue;
            };
            let folder = self.load_folder(&folder_id).await?;
            let handle = Handle {
                kind: QueueKind::Upload,
                item: item.item_id,
            };
            self.spawn_upload(handle, folder).await;
            resumed.push(handle);
        }
        for item in self.store.resumable_items(QueueKind::Download).await? {
            if item.state == ItemState::Running {
                self.store
                    .update_item_state(
                        QueueKind::Download,
                        item.item_id,
                        ItemState::Paused,
                        Some("interrupted by restart"),
                    )
                    .await?;
            }
        }
        Ok(resumed)
    }
}
