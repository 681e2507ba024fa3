//! Durable metadata for the publish/retrieve pipeline.
//!
//! Every persistent entity lives behind the [`Store`] capability: typed
//! row-mapping methods, explicit transaction control, and batch insertion
//! paths for the indexer and segmenter. Callers never see SQL; the two
//! production backends (embedded SQLite, networked PostgreSQL) and the
//! in-memory test backend are interchangeable.

use async_trait::async_trait;

use common::{
    ContentHash, FileId, FileRecord, FileState, Folder, FolderId, FolderState, FolderStats,
    ItemId, ItemState, MessageId, PackId, PackMember, PackRecord, QueueItem, QueueKind,
    SegmentId, SegmentOwner, SegmentProgress, SegmentRecord, ShareRecord, User, UserId,
};

pub mod error;
pub mod memory;
pub mod migrations;
pub(crate) mod row;
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

/// Insert shape for a file row; the id is assigned by the backend.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub folder_id: FolderId,
    pub relative_path: String,
    pub size: u64,
    pub content_hash: ContentHash,
    pub mtime: u64,
    pub version: u32,
    pub state: FileState,
}

/// Insert shape for a segment row.
#[derive(Debug, Clone)]
pub struct NewSegment {
    pub owner: SegmentOwner,
    pub index: u32,
    pub size: u32,
    pub plaintext_hash: ContentHash,
    pub ciphertext_hash: ContentHash,
    pub redundancy_index: u8,
}

/// Insert shape for a pack row.
#[derive(Debug, Clone)]
pub struct NewPack {
    pub folder_id: FolderId,
    pub segment_index: u32,
    pub members: Vec<PackMember>,
}

/// Insert shape for a queue item.
#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub entity_ref: String,
    pub priority: i32,
    pub bytes_total: u64,
}

/// Transactional row store for all persistent entities.
///
/// Guarantees: single-writer serializability per entity; readers observe a
/// committed snapshot. Bulk paths (`insert_files`, `insert_segments`) run
/// as one transaction per call. Write failures surface immediately; reads
/// after connect retry once each at 50 ms and 200 ms before surfacing.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;

    // -- users ------------------------------------------------------------
    async fn insert_user(&self, user: &User) -> Result<()>;
    async fn user_by_name(&self, name: &str) -> Result<Option<User>>;
    async fn user_by_id(&self, id: &UserId) -> Result<Option<User>>;

    // -- folders ----------------------------------------------------------
    async fn insert_folder(&self, folder: &Folder) -> Result<()>;
    async fn folder(&self, id: &FolderId) -> Result<Option<Folder>>;
    async fn folder_by_path(&self, path: &str) -> Result<Option<Folder>>;
    async fn list_folders(&self) -> Result<Vec<Folder>>;
    async fn update_folder_state(&self, id: &FolderId, state: FolderState) -> Result<()>;
    async fn update_folder_stats(&self, id: &FolderId, stats: &FolderStats) -> Result<()>;
    /// Key rotation for revocation-by-republish: installs a fresh folder
    /// key so the next upload/publish cycle is unreachable by old tokens.
    async fn update_folder_key(&self, id: &FolderId, folder_key: &[u8; 32]) -> Result<()>;

    // -- files ------------------------------------------------------------
    async fn insert_files(&self, files: &[NewFile]) -> Result<Vec<FileId>>;
    async fn file(&self, id: FileId) -> Result<Option<FileRecord>>;
    /// Latest version of every path in the folder.
    async fn files_for_folder(&self, folder: &FolderId) -> Result<Vec<FileRecord>>;
    async fn latest_file_version(
        &self,
        folder: &FolderId,
        relative_path: &str,
    ) -> Result<Option<FileRecord>>;
    async fn update_file_state(&self, id: FileId, state: FileState) -> Result<()>;
    async fn update_file_segment_count(&self, id: FileId, segment_count: u32) -> Result<()>;
    /// Cascades to the file's segments and invalidates shares of the folder.
    async fn delete_file(&self, id: FileId) -> Result<()>;

    // -- segments ---------------------------------------------------------
    async fn insert_segments(&self, segments: &[NewSegment]) -> Result<Vec<SegmentId>>;
    async fn segment(&self, id: SegmentId) -> Result<Option<SegmentRecord>>;
    async fn segments_for_file(&self, file: FileId) -> Result<Vec<SegmentRecord>>;
    async fn segments_for_pack(&self, pack: PackId) -> Result<Vec<SegmentRecord>>;
    async fn segments_for_folder(&self, folder: &FolderId) -> Result<Vec<SegmentRecord>>;
    /// Refreshes the posted-payload hash of a still-pending segment. Resume
    /// re-encrypts under a fresh nonce, so the payload hash moves; uploaded
    /// segments are immutable.
    async fn update_segment_payload_hash(
        &self,
        id: SegmentId,
        ciphertext_hash: &ContentHash,
    ) -> Result<()>;
    /// Sets the Message-ID and flips `upload_state` in one step; refuses a
    /// segment that already carries a Message-ID.
    async fn mark_segment_uploaded(
        &self,
        id: SegmentId,
        message_id: &MessageId,
        subject: &str,
    ) -> Result<()>;

    /// Drops every segment and pack row of a folder. Used by key rotation:
    /// rows encrypted under the retired key must not be reused.
    async fn reset_folder_segments(&self, folder: &FolderId) -> Result<()>;

    // -- packs ------------------------------------------------------------
    async fn insert_pack(&self, pack: &NewPack) -> Result<PackId>;
    async fn packs_for_folder(&self, folder: &FolderId) -> Result<Vec<PackRecord>>;

    // -- shares -----------------------------------------------------------
    async fn insert_share(&self, share: &ShareRecord) -> Result<()>;
    async fn share(&self, share_id: &str) -> Result<Option<ShareRecord>>;
    async fn shares_for_folder(&self, folder: &FolderId) -> Result<Vec<ShareRecord>>;
    async fn update_share_index_refs(&self, share_id: &str, refs: &[MessageId]) -> Result<()>;
    async fn invalidate_shares_for_folder(&self, folder: &FolderId) -> Result<()>;

    // -- queues -----------------------------------------------------------
    async fn enqueue(&self, kind: QueueKind, item: &NewQueueItem) -> Result<ItemId>;
    async fn queue_item(&self, kind: QueueKind, id: ItemId) -> Result<Option<QueueItem>>;
    async fn update_item_state(
        &self,
        kind: QueueKind,
        id: ItemId,
        state: ItemState,
        last_error: Option<&str>,
    ) -> Result<()>;
    async fn bump_item_attempts(&self, kind: QueueKind, id: ItemId) -> Result<()>;
    /// Recomputes the aggregate byte tally from the progress rows, keeping
    /// `item.bytes_done == Σ progress.bytes_done` by construction.
    async fn recompute_item_bytes(&self, kind: QueueKind, id: ItemId) -> Result<()>;
    async fn set_item_bytes_total(&self, kind: QueueKind, id: ItemId, total: u64) -> Result<()>;
    async fn resumable_items(&self, kind: QueueKind) -> Result<Vec<QueueItem>>;

    // -- segment progress -------------------------------------------------
    async fn upsert_progress(&self, kind: QueueKind, row: &SegmentProgress) -> Result<()>;
    async fn progress_rows(&self, kind: QueueKind, item: ItemId) -> Result<Vec<SegmentProgress>>;

    // -- message log ------------------------------------------------------
    async fn record_message(
        &self,
        message_id: &MessageId,
        segment: SegmentId,
        subject: &str,
    ) -> Result<()>;
    async fn segment_for_message(&self, message_id: &MessageId) -> Result<Option<SegmentId>>;
}
