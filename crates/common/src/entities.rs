use serde::{Deserialize, Serialize};

use crate::{ContentHash, FileId, FolderId, ItemId, MessageId, PackId, SegmentId, UserId};

/// Identity record created once by the bootstrap and immutable afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: UserId,
    pub name: String,
    /// X25519 public key used for private-share key wrapping.
    pub public_key: [u8; 32],
    pub api_key: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderState {
    Created,
    Indexed,
    Segmented,
    Uploaded,
    Published,
    Failed,
}

impl FolderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FolderState::Created => "created",
            FolderState::Indexed => "indexed",
            FolderState::Segmented => "segmented",
            FolderState::Uploaded => "uploaded",
            FolderState::Published => "published",
            FolderState::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "created" => FolderState::Created,
            "indexed" => FolderState::Indexed,
            "segmented" => FolderState::Segmented,
            "uploaded" => FolderState::Uploaded,
            "published" => FolderState::Published,
            "failed" => FolderState::Failed,
            _ => return None,
        })
    }
}

/// Aggregate counters refreshed on every index pass.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FolderStats {
    pub file_count: u64,
    pub segment_count: u64,
    pub total_size: u64,
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub folder_id: FolderId,
    pub path: String,
    pub display_name: String,
    pub owner: UserId,
    /// Symmetric root key. Never leaves the owner except wrapped inside
    /// share descriptors.
    pub folder_key: [u8; 32],
    pub public_key: [u8; 32],
    pub private_key_sealed: Vec<u8>,
    pub state: FolderState,
    pub stats: FolderStats,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Indexed,
    Segmented,
    Uploaded,
}

impl FileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::Indexed => "indexed",
            FileState::Segmented => "segmented",
            FileState::Uploaded => "uploaded",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "indexed" => FileState::Indexed,
            "segmented" => FileState::Segmented,
            "uploaded" => FileState::Uploaded,
            _ => return None,
        })
    }
}

/// One version of one file within a folder. `relative_path` uses forward
/// slashes and is unique within `(folder_id, version)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: FileId,
    pub folder_id: FolderId,
    pub relative_path: String,
    pub size: u64,
    pub content_hash: ContentHash,
    pub mtime: u64,
    pub version: u32,
    pub segment_count: u32,
    pub state: FileState,
}

impl FileRecord {
    /// Packable files bypass the chunker and share a pack segment.
    pub fn is_packable(&self, threshold: u64) -> bool {
        self.size < threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentOwner {
    File(FileId),
    Pack(PackId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Pending,
    Uploaded,
    Failed,
}

impl UploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadState::Pending => "pending",
            UploadState::Uploaded => "uploaded",
            UploadState::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => UploadState::Pending,
            "uploaded" => UploadState::Uploaded,
            "failed" => UploadState::Failed,
            _ => return None,
        })
    }
}

/// One posted unit. Redundancy copies are separate rows sharing `index`
/// but carrying distinct `redundancy_index` values and Message-IDs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub segment_id: SegmentId,
    pub owner: SegmentOwner,
    pub index: u32,
    /// Plaintext size of this segment before compression and encryption.
    pub size: u32,
    pub plaintext_hash: ContentHash,
    /// Hash of the posted payload (nonce || ciphertext || tag). This is
    /// the segment-cache key on the receiver.
    pub ciphertext_hash: ContentHash,
    pub redundancy_index: u8,
    pub message_id: Option<MessageId>,
    pub obfuscated_subject: Option<String>,
    pub upload_state: UploadState,
}

/// Member entry of a pack's inner directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackMember {
    pub file_id: FileId,
    pub relative_path: String,
    pub size: u64,
}

/// A logical segment holding several small files behind a self-describing
/// inner directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackRecord {
    pub pack_id: PackId,
    pub folder_id: FolderId,
    pub segment_index: u32,
    pub members: Vec<PackMember>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    Public,
    Protected,
    Private,
}

impl AccessType {
    pub fn as_byte(&self) -> u8 {
        match self {
            AccessType::Public => 0,
            AccessType::Protected => 1,
            AccessType::Private => 2,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => AccessType::Public,
            1 => AccessType::Protected,
            2 => AccessType::Private,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareState {
    Active,
    /// Set when the underlying folder content was deleted or republished.
    Invalid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareRecord {
    /// High-entropy token with no parseable access-type prefix.
    pub share_id: String,
    pub folder_id: FolderId,
    pub access_type: AccessType,
    /// Serialized wrapping envelope; layout depends on `access_type`.
    pub wrapped_key_material: Vec<u8>,
    /// Message-IDs of the posted core-index segments.
    pub index_refs: Vec<MessageId>,
    pub expires_at: Option<u64>,
    pub password_verifier: Option<String>,
    pub state: ShareState,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Upload,
    Download,
}

impl QueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Upload => "upload",
            QueueKind::Download => "download",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
}

impl ItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::Queued => "queued",
            ItemState::Running => "running",
            ItemState::Paused => "paused",
            ItemState::Completed => "completed",
            ItemState::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => ItemState::Queued,
            "running" => ItemState::Running,
            "paused" => ItemState::Paused,
            "completed" => ItemState::Completed,
            "failed" => ItemState::Failed,
            _ => return None,
        })
    }

    /// An item can be picked up again iff it is not in a terminal-running
    /// shape and per-segment progress rows exist for it.
    pub fn is_resumable(&self) -> bool {
        matches!(self, ItemState::Queued | ItemState::Paused | ItemState::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub item_id: ItemId,
    pub kind: QueueKind,
    /// Folder id (uploads) or share token (downloads).
    pub entity_ref: String,
    pub priority: i32,
    pub state: ItemState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub started_at: Option<u64>,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressState {
    Pending,
    Completed,
    Failed,
}

impl ProgressState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressState::Pending => "pending",
            ProgressState::Completed => "completed",
            ProgressState::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => ProgressState::Pending,
            "completed" => ProgressState::Completed,
            "failed" => ProgressState::Failed,
            _ => return None,
        })
    }
}

/// Per-segment progress attached to a queue item. The unit of resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentProgress {
    pub item_id: ItemId,
    pub segment_index: u32,
    pub state: ProgressState,
    pub bytes_done: u64,
    pub server_message_id: Option<MessageId>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Snapshot returned by `progress(handle)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferProgress {
    pub item_id: ItemId,
    pub state: ItemState,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub segments_done: u32,
    pub segments_total: u32,
    pub last_error: Option<String>,
}

/// Counters reported by an index pass.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IndexStats {
    pub files_indexed: u64,
    pub files_unchanged: u64,
    pub files_packable: u64,
    pub total_size: u64,
    pub errors: u64,
}

/// Running totals kept by the download segment cache.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub bytes_served: u64,
    pub items: u64,
    pub bytes: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}
