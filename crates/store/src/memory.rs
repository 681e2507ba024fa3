//! In-memory backend used by tests and scaffolding.
//!
//! Mirrors the SQL backends' semantics over hash maps. Writes apply
//! immediately; `begin`/`commit`/`rollback` are accepted and ignored, which
//! is sufficient for the single-writer call patterns the engines use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use common::{
    unix_now, FileId, FileRecord, FileState, Folder, FolderId, FolderState, FolderStats, ItemId,
    ItemState, MessageId, PackId, PackRecord, QueueItem, QueueKind, SegmentId, SegmentOwner,
    SegmentProgress, SegmentRecord, ShareRecord, ShareState, UploadState, User, UserId,
};

use crate::error::{Result, StoreError};
use crate::{NewFile, NewPack, NewQueueItem, NewSegment, Store};

#[derive(Default)]
struct Inner {
    users: HashMap<String, User>,
    folders: HashMap<String, Folder>,
    files: HashMap<i64, FileRecord>,
    segments: HashMap<i64, SegmentRecord>,
    packs: HashMap<i64, PackRecord>,
    shares: HashMap<String, ShareRecord>,
    upload_items: HashMap<i64, QueueItem>,
    download_items: HashMap<i64, QueueItem>,
    progress: HashMap<(&'static str, i64, u32), SegmentProgress>,
    messages: HashMap<String, i64>,
    next_file: i64,
    next_segment: i64,
    next_pack: i64,
    next_upload: i64,
    next_download: i64,
}

impl Inner {
    fn items(&mut self, kind: QueueKind) -> &mut HashMap<i64, QueueItem> {
        match kind {
            QueueKind::Upload => &mut self.upload_items,
            QueueKind::Download => &mut self.download_items,
        }
    }

    fn items_ref(&self, kind: QueueKind) -> &HashMap<i64, QueueItem> {
        match kind {
            QueueKind::Upload => &self.upload_items,
            QueueKind::Download => &self.download_items,
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store mutex poisoned")
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<()> {
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        Ok(())
    }

    async fn insert_user(&self, user: &User) -> Result<()> {
        let mut inner = self.lock();
        if inner.users.values().any(|u| u.name == user.name) {
            return Err(StoreError::Constraint(format!(
                "user name taken: {}",
                user.name
            )));
        }
        inner.users.insert(user.user_id.to_hex(), user.clone());
        Ok(())
    }

    async fn user_by_name(&self, name: &str) -> Result<Option<User>> {
        Ok(self.lock().users.values().find(|u| u.name == name).cloned())
    }

    async fn user_by_id(&self, id: &UserId) -> Result<Option<User>> {
        Ok(self.lock().users.get(&id.to_hex()).cloned())
    }

    async fn insert_folder(&self, folder: &Folder) -> Result<()> {
        let mut inner = self.lock();
        let key = folder.folder_id.to_hex();
        if inner.folders.contains_key(&key) {
            return Err(StoreError::Constraint(format!("folder exists: {key}")));
        }
        inner.folders.insert(key, folder.clone());
        Ok(())
    }

    async fn folder(&self, id: &FolderId) -> Result<Option<Folder>> {
        Ok(self.lock().folders.get(&id.to_hex()).cloned())
    }

    async fn folder_by_path(&self, path: &str) -> Result<Option<Folder>> {
        Ok(self.lock().folders.values().find(|f| f.path == path).cloned())
    }

    async fn list_folders(&self) -> Result<Vec<Folder>> {
        let mut folders: Vec<Folder> = self.lock().folders.values().cloned().collect();
        folders.sort_by_key(|f| f.created_at);
        Ok(folders)
    }

    async fn update_folder_state(&self, id: &FolderId, state: FolderState) -> Result<()> {
        let mut inner = self.lock();
        let folder = inner
            .folders
            .get_mut(&id.to_hex())
            .ok_or_else(|| StoreError::NotFound {
                entity: "folder",
                key: id.to_hex(),
            })?;
        folder.state = state;
        Ok(())
    }

    async fn update_folder_stats(&self, id: &FolderId, stats: &FolderStats) -> Result<()> {
        let mut inner = self.lock();
        let folder = inner
            .folders
            .get_mut(&id.to_hex())
            .ok_or_else(|| StoreError::NotFound {
                entity: "folder",
                key: id.to_hex(),
            })?;
        folder.stats = *stats;
        Ok(())
    }

    async fn update_folder_key(&self, id: &FolderId, folder_key: &[u8; 32]) -> Result<()> {
        let mut inner = self.lock();
        let folder = inner
            .folders
            .get_mut(&id.to_hex())
            .ok_or_else(|| StoreError::NotFound {
                entity: "folder",
                key: id.to_hex(),
            })?;
        folder.folder_key = *folder_key;
        Ok(())
    }

    async fn insert_files(&self, files: &[NewFile]) -> Result<Vec<FileId>> {
        let mut inner = self.lock();
        let mut ids = Vec::with_capacity(files.len());
        for file in files {
            let duplicate = inner.files.values().any(|f| {
                f.folder_id == file.folder_id
                    && f.relative_path == file.relative_path
                    && f.version == file.version
            });
            if duplicate {
                return Err(StoreError::Constraint(format!(
                    "duplicate file version: {} v{}",
                    file.relative_path, file.version
                )));
            }
            inner.next_file += 1;
            let id = FileId(inner.next_file);
            inner.files.insert(
                id.0,
                FileRecord {
                    file_id: id,
                    folder_id: file.folder_id,
                    relative_path: file.relative_path.clone(),
                    size: file.size,
                    content_hash: file.content_hash,
                    mtime: file.mtime,
                    version: file.version,
                    segment_count: 0,
                    state: file.state,
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    async fn file(&self, id: FileId) -> Result<Option<FileRecord>> {
        Ok(self.lock().files.get(&id.0).cloned())
    }

    async fn files_for_folder(&self, folder: &FolderId) -> Result<Vec<FileRecord>> {
        let inner = self.lock();
        let mut latest: HashMap<&str, &FileRecord> = HashMap::new();
        for file in inner.files.values().filter(|f| f.folder_id == *folder) {
            match latest.get(file.relative_path.as_str()) {
                Some(existing) if existing.version >= file.version => {}
                _ => {
                    latest.insert(file.relative_path.as_str(), file);
                }
            }
        }
        let mut files: Vec<FileRecord> = latest.into_values().cloned().collect();
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(files)
    }

    async fn latest_file_version(
        &self,
        folder: &FolderId,
        relative_path: &str,
    ) -> Result<Option<FileRecord>> {
        let inner = self.lock();
        Ok(inner
            .files
            .values()
            .filter(|f| f.folder_id == *folder && f.relative_path == relative_path)
            .max_by_key(|f| f.version)
            .cloned())
    }

    async fn update_file_state(&self, id: FileId, state: FileState) -> Result<()> {
        let mut inner = self.lock();
        if let Some(file) = inner.files.get_mut(&id.0) {
            file.state = state;
        }
        Ok(())
    }

    async fn update_file_segment_count(&self, id: FileId, segment_count: u32) -> Result<()> {
        let mut inner = self.lock();
        if let Some(file) = inner.files.get_mut(&id.0) {
            file.segment_count = segment_count;
        }
        Ok(())
    }

    async fn delete_file(&self, id: FileId) -> Result<()> {
        let mut inner = self.lock();
        let file = inner.files.remove(&id.0).ok_or_else(|| StoreError::NotFound {
            entity: "file",
            key: id.0.to_string(),
        })?;
        inner
            .segments
            .retain(|_, s| s.owner != SegmentOwner::File(id));
        for share in inner
            .shares
            .values_mut()
            .filter(|s| s.folder_id == file.folder_id)
        {
            share.state = ShareState::Invalid;
        }
        Ok(())
    }

    async fn insert_segments(&self, segments: &[NewSegment]) -> Result<Vec<SegmentId>> {
        let mut inner = self.lock();
        let mut ids = Vec::with_capacity(segments.len());
        for seg in segments {
            inner.next_segment += 1;
            let id = SegmentId(inner.next_segment);
            inner.segments.insert(
                id.0,
                SegmentRecord {
                    segment_id: id,
                    owner: seg.owner,
                    index: seg.index,
                    size: seg.size,
                    plaintext_hash: seg.plaintext_hash,
                    ciphertext_hash: seg.ciphertext_hash,
                    redundancy_index: seg.redundancy_index,
                    message_id: None,
                    obfuscated_subject: None,
                    upload_state: UploadState::Pending,
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    async fn segment(&self, id: SegmentId) -> Result<Option<SegmentRecord>> {
        Ok(self.lock().segments.get(&id.0).cloned())
    }

    async fn segments_for_file(&self, file: FileId) -> Result<Vec<SegmentRecord>> {
        let inner = self.lock();
        let mut segments: Vec<SegmentRecord> = inner
            .segments
            .values()
            .filter(|s| s.owner == SegmentOwner::File(file))
            .cloned()
            .collect();
        segments.sort_by_key(|s| (s.index, s.redundancy_index));
        Ok(segments)
    }

    async fn segments_for_pack(&self, pack: PackId) -> Result<Vec<SegmentRecord>> {
        let inner = self.lock();
        let mut segments: Vec<SegmentRecord> = inner
            .segments
            .values()
            .filter(|s| s.owner == SegmentOwner::Pack(pack))
            .cloned()
            .collect();
        segments.sort_by_key(|s| (s.index, s.redundancy_index));
        Ok(segments)
    }

    async fn segments_for_folder(&self, folder: &FolderId) -> Result<Vec<SegmentRecord>> {
        let inner = self.lock();
        let file_ids: Vec<FileId> = inner
            .files
            .values()
            .filter(|f| f.folder_id == *folder)
            .map(|f| f.file_id)
            .collect();
        let pack_ids: Vec<PackId> = inner
            .packs
            .values()
            .filter(|p| p.folder_id == *folder)
            .map(|p| p.pack_id)
            .collect();
        let mut segments: Vec<SegmentRecord> = inner
            .segments
            .values()
            .filter(|s| match s.owner {
                SegmentOwner::File(f) => file_ids.contains(&f),
                SegmentOwner::Pack(p) => pack_ids.contains(&p),
            })
            .cloned()
            .collect();
        let owner_key = |owner: SegmentOwner| match owner {
            SegmentOwner::File(f) => (0u8, f.0),
            SegmentOwner::Pack(p) => (1u8, p.0),
        };
        segments.sort_by_key(|s| (owner_key(s.owner), s.index, s.redundancy_index));
        Ok(segments)
    }

    async fn update_segment_payload_hash(
        &self,
        id: SegmentId,
        ciphertext_hash: &common::ContentHash,
    ) -> Result<()> {
        let mut inner = self.lock();
        let segment = inner
            .segments
            .get_mut(&id.0)
            .ok_or_else(|| StoreError::NotFound {
                entity: "segment",
                key: id.0.to_string(),
            })?;
        if segment.upload_state != UploadState::Pending {
            return Err(StoreError::Constraint(format!(
                "segment {} is not pending",
                id.0
            )));
        }
        segment.ciphertext_hash = *ciphertext_hash;
        Ok(())
    }

    async fn mark_segment_uploaded(
        &self,
        id: SegmentId,
        message_id: &MessageId,
        subject: &str,
    ) -> Result<()> {
        let mut inner = self.lock();
        let segment = inner
            .segments
            .get_mut(&id.0)
            .ok_or_else(|| StoreError::NotFound {
                entity: "segment",
                key: id.0.to_string(),
            })?;
        match &segment.message_id {
            None => {
                segment.message_id = Some(message_id.clone());
                segment.obfuscated_subject = Some(subject.to_string());
                segment.upload_state = UploadState::Uploaded;
                Ok(())
            }
            Some(existing) if existing == message_id => Ok(()),
            Some(_) => Err(StoreError::Constraint(format!(
                "segment {} already uploaded under a different message id",
                id.0
            ))),
        }
    }

    async fn reset_folder_segments(&self, folder: &FolderId) -> Result<()> {
        let mut inner = self.lock();
        let file_ids: Vec<FileId> = inner
            .files
            .values()
            .filter(|f| f.folder_id == *folder)
            .map(|f| f.file_id)
            .collect();
        let pack_ids: Vec<PackId> = inner
            .packs
            .values()
            .filter(|p| p.folder_id == *folder)
            .map(|p| p.pack_id)
            .collect();
        inner.segments.retain(|_, s| match s.owner {
            SegmentOwner::File(f) => !file_ids.contains(&f),
            SegmentOwner::Pack(p) => !pack_ids.contains(&p),
        });
        inner.packs.retain(|_, p| p.folder_id != *folder);
        Ok(())
    }

    async fn insert_pack(&self, pack: &NewPack) -> Result<PackId> {
        let mut inner = self.lock();
        inner.next_pack += 1;
        let id = PackId(inner.next_pack);
        inner.packs.insert(
            id.0,
            PackRecord {
                pack_id: id,
                folder_id: pack.folder_id,
                segment_index: pack.segment_index,
                members: pack.members.clone(),
            },
        );
        Ok(id)
    }

    async fn packs_for_folder(&self, folder: &FolderId) -> Result<Vec<PackRecord>> {
        let inner = self.lock();
        let mut packs: Vec<PackRecord> = inner
            .packs
            .values()
            .filter(|p| p.folder_id == *folder)
            .cloned()
            .collect();
        packs.sort_by_key(|p| p.segment_index);
        Ok(packs)
    }

    async fn insert_share(&self, share: &ShareRecord) -> Result<()> {
        let mut inner = self.lock();
        if inner.shares.contains_key(&share.share_id) {
            return Err(StoreError::Constraint("share id collision".to_string()));
        }
        inner.shares.insert(share.share_id.clone(), share.clone());
        Ok(())
    }

    async fn share(&self, share_id: &str) -> Result<Option<ShareRecord>> {
        Ok(self.lock().shares.get(share_id).cloned())
    }

    async fn shares_for_folder(&self, folder: &FolderId) -> Result<Vec<ShareRecord>> {
        let inner = self.lock();
        let mut shares: Vec<ShareRecord> = inner
            .shares
            .values()
            .filter(|s| s.folder_id == *folder)
            .cloned()
            .collect();
        shares.sort_by_key(|s| s.created_at);
        Ok(shares)
    }

    async fn update_share_index_refs(&self, share_id: &str, refs: &[MessageId]) -> Result<()> {
        let mut inner = self.lock();
        let share = inner
            .shares
            .get_mut(share_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "share",
                key: share_id.to_string(),
            })?;
        share.index_refs = refs.to_vec();
        Ok(())
    }

    async fn invalidate_shares_for_folder(&self, folder: &FolderId) -> Result<()> {
        let mut inner = self.lock();
        for share in inner.shares.values_mut().filter(|s| s.folder_id == *folder) {
            share.state = ShareState::Invalid;
        }
        Ok(())
    }

    async fn enqueue(&self, kind: QueueKind, item: &NewQueueItem) -> Result<ItemId> {
        let mut inner = self.lock();
        let next = match kind {
            QueueKind::Upload => {
                inner.next_upload += 1;
                inner.next_upload
            }
            QueueKind::Download => {
                inner.next_download += 1;
                inner.next_download
            }
        };
        let id = ItemId(next);
        inner.items(kind).insert(
            next,
            QueueItem {
                item_id: id,
                kind,
                entity_ref: item.entity_ref.clone(),
                priority: item.priority,
                state: ItemState::Queued,
                attempts: 0,
                last_error: None,
                bytes_done: 0,
                bytes_total: item.bytes_total,
                started_at: None,
                updated_at: unix_now(),
            },
        );
        Ok(id)
    }

    async fn queue_item(&self, kind: QueueKind, id: ItemId) -> Result<Option<QueueItem>> {
        Ok(self.lock().items_ref(kind).get(&id.0).cloned())
    }

    async fn update_item_state(
        &self,
        kind: QueueKind,
        id: ItemId,
        state: ItemState,
        last_error: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.lock();
        let item = inner
            .items(kind)
            .get_mut(&id.0)
            .ok_or_else(|| StoreError::NotFound {
                entity: "queue item",
                key: id.0.to_string(),
            })?;
        item.state = state;
        if let Some(err) = last_error {
            item.last_error = Some(err.to_string());
        }
        if matches!(state, ItemState::Running) && item.started_at.is_none() {
            item.started_at = Some(unix_now());
        }
        item.updated_at = unix_now();
        Ok(())
    }

    async fn bump_item_attempts(&self, kind: QueueKind, id: ItemId) -> Result<()> {
        let mut inner = self.lock();
        if let Some(item) = inner.items(kind).get_mut(&id.0) {
            item.attempts += 1;
            item.updated_at = unix_now();
        }
        Ok(())
    }

    async fn recompute_item_bytes(&self, kind: QueueKind, id: ItemId) -> Result<()> {
        let mut inner = self.lock();
        let total: u64 = inner
            .progress
            .iter()
            .filter(|((queue, item, _), _)| *queue == kind.as_str() && *item == id.0)
            .map(|(_, row)| row.bytes_done)
            .sum();
        if let Some(item) = inner.items(kind).get_mut(&id.0) {
            item.bytes_done = total;
            item.updated_at = unix_now();
        }
        Ok(())
    }

    async fn set_item_bytes_total(&self, kind: QueueKind, id: ItemId, total: u64) -> Result<()> {
        let mut inner = self.lock();
        if let Some(item) = inner.items(kind).get_mut(&id.0) {
            item.bytes_total = total;
            item.updated_at = unix_now();
        }
        Ok(())
    }

    async fn resumable_items(&self, kind: QueueKind) -> Result<Vec<QueueItem>> {
        let inner = self.lock();
        let mut items: Vec<QueueItem> = inner
            .items_ref(kind)
            .values()
            .filter(|i| {
                matches!(
                    i.state,
                    ItemState::Queued | ItemState::Running | ItemState::Paused | ItemState::Failed
                )
            })
            .cloned()
            .collect();
        items.sort_by_key(|i| (std::cmp::Reverse(i.priority), i.item_id));
        Ok(items)
    }

    async fn upsert_progress(&self, kind: QueueKind, row: &SegmentProgress) -> Result<()> {
        let mut inner = self.lock();
        inner.progress.insert(
            (kind.as_str(), row.item_id.0, row.segment_index),
            row.clone(),
        );
        Ok(())
    }

    async fn progress_rows(&self, kind: QueueKind, item: ItemId) -> Result<Vec<SegmentProgress>> {
        let inner = self.lock();
        let mut rows: Vec<SegmentProgress> = inner
            .progress
            .iter()
            .filter(|((queue, id, _), _)| *queue == kind.as_str() && *id == item.0)
            .map(|(_, row)| row.clone())
            .collect();
        rows.sort_by_key(|r| r.segment_index);
        Ok(rows)
    }

    async fn record_message(
        &self,
        message_id: &MessageId,
        segment: SegmentId,
        _subject: &str,
    ) -> Result<()> {
        self.lock()
            .messages
            .entry(message_id.as_str().to_string())
            .or_insert(segment.0);
        Ok(())
    }

    async fn segment_for_message(&self, message_id: &MessageId) -> Result<Option<SegmentId>> {
        Ok(self
            .lock()
            .messages
            .get(message_id.as_str())
            .copied()
            .map(SegmentId))
    }
}
