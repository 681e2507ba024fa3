//! Intermediate row shapes shared by the SQL backends.
//!
//! Both engines hand back the same primitive column types; the conversions
//! into entity structs live here so the backends stay pure plumbing.

use common::{
    ContentHash, FileId, FileRecord, FileState, Folder, FolderId, FolderState, FolderStats,
    ItemId, ItemState, MessageId, PackId, PackMember, PackRecord, ProgressState, QueueItem,
    QueueKind, SegmentId, SegmentOwner, SegmentProgress, SegmentRecord, ShareRecord, ShareState,
    UploadState, User, UserId, AccessType,
};

use crate::error::{Result, StoreError};

fn decode<T>(what: &'static str, value: Option<T>) -> Result<T> {
    value.ok_or_else(|| StoreError::Decode(format!("bad {what} column")))
}

fn key32(what: &'static str, blob: Vec<u8>) -> Result<[u8; 32]> {
    blob.try_into()
        .map_err(|_| StoreError::Decode(format!("{what} is not 32 bytes")))
}

pub(crate) struct RawUser {
    pub user_id: String,
    pub name: String,
    pub public_key: Vec<u8>,
    pub api_key: String,
    pub created_at: i64,
}

impl RawUser {
    pub fn into_user(self) -> Result<User> {
        Ok(User {
            user_id: decode("user_id", UserId::from_hex(&self.user_id))?,
            name: self.name,
            public_key: key32("public_key", self.public_key)?,
            api_key: self.api_key,
            created_at: self.created_at as u64,
        })
    }
}

pub(crate) struct RawFolder {
    pub folder_id: String,
    pub path: String,
    pub display_name: String,
    pub owner: String,
    pub folder_key: Vec<u8>,
    pub public_key: Vec<u8>,
    pub private_key_sealed: Vec<u8>,
    pub state: String,
    pub file_count: i64,
    pub segment_count: i64,
    pub total_size: i64,
    pub version: i64,
    pub created_at: i64,
}

impl RawFolder {
    pub fn into_folder(self) -> Result<Folder> {
        Ok(Folder {
            folder_id: decode("folder_id", FolderId::from_hex(&self.folder_id))?,
            path: self.path,
            display_name: self.display_name,
            owner: decode("owner", UserId::from_hex(&self.owner))?,
            folder_key: key32("folder_key", self.folder_key)?,
            public_key: key32("public_key", self.public_key)?,
            private_key_sealed: self.private_key_sealed,
            state: decode("state", FolderState::from_str(&self.state))?,
            stats: FolderStats {
                file_count: self.file_count as u64,
                segment_count: self.segment_count as u64,
                total_size: self.total_size as u64,
                version: self.version as u32,
            },
            created_at: self.created_at as u64,
        })
    }
}

pub(crate) struct RawFile {
    pub file_id: i64,
    pub folder_id: String,
    pub relative_path: String,
    pub size: i64,
    pub content_hash: String,
    pub mtime: i64,
    pub version: i64,
    pub segment_count: i64,
    pub state: String,
}

impl RawFile {
    pub fn into_file(self) -> Result<FileRecord> {
        Ok(FileRecord {
            file_id: FileId(self.file_id),
            folder_id: decode("folder_id", FolderId::from_hex(&self.folder_id))?,
            relative_path: self.relative_path,
            size: self.size as u64,
            content_hash: decode("content_hash", ContentHash::from_hex(&self.content_hash))?,
            mtime: self.mtime as u64,
            version: self.version as u32,
            segment_count: self.segment_count as u32,
            state: decode("state", FileState::from_str(&self.state))?,
        })
    }
}

pub(crate) struct RawSegment {
    pub segment_id: i64,
    pub file_id: Option<i64>,
    pub pack_id: Option<i64>,
    pub idx: i64,
    pub size: i64,
    pub plaintext_hash: String,
    pub ciphertext_hash: String,
    pub redundancy_index: i64,
    pub message_id: Option<String>,
    pub obfuscated_subject: Option<String>,
    pub upload_state: String,
}

impl RawSegment {
    pub fn into_segment(self) -> Result<SegmentRecord> {
        let owner = match (self.file_id, self.pack_id) {
            (Some(file), None) => SegmentOwner::File(FileId(file)),
            (None, Some(pack)) => SegmentOwner::Pack(PackId(pack)),
            _ => {
                return Err(StoreError::Decode(
                    "segment owner must be exactly one of file/pack".to_string(),
                ))
            }
        };
        let message_id = match self.message_id {
            Some(raw) => Some(decode("message_id", MessageId::parse(&raw))?),
            None => None,
        };
        Ok(SegmentRecord {
            segment_id: SegmentId(self.segment_id),
            owner,
            index: self.idx as u32,
            size: self.size as u32,
            plaintext_hash: decode("plaintext_hash", ContentHash::from_hex(&self.plaintext_hash))?,
            ciphertext_hash: decode(
                "ciphertext_hash",
                ContentHash::from_hex(&self.ciphertext_hash),
            )?,
            redundancy_index: self.redundancy_index as u8,
            message_id,
            obfuscated_subject: self.obfuscated_subject,
            upload_state: decode("upload_state", UploadState::from_str(&self.upload_state))?,
        })
    }
}

pub(crate) struct RawPack {
    pub pack_id: i64,
    pub folder_id: String,
    pub segment_index: i64,
    pub members: String,
}

impl RawPack {
    pub fn into_pack(self) -> Result<PackRecord> {
        let members: Vec<PackMember> = serde_json::from_str(&self.members)?;
        Ok(PackRecord {
            pack_id: PackId(self.pack_id),
            folder_id: decode("folder_id", FolderId::from_hex(&self.folder_id))?,
            segment_index: self.segment_index as u32,
            members,
        })
    }
}

pub(crate) struct RawShare {
    pub share_id: String,
    pub folder_id: String,
    pub access_type: String,
    pub wrapped_key_material: Vec<u8>,
    pub index_refs: String,
    pub expires_at: Option<i64>,
    pub password_verifier: Option<String>,
    pub state: String,
    pub created_at: i64,
}

impl RawShare {
    pub fn into_share(self) -> Result<ShareRecord> {
        let refs: Vec<String> = serde_json::from_str(&self.index_refs)?;
        let index_refs = refs
            .iter()
            .map(|raw| decode("index_ref", MessageId::parse(raw)))
            .collect::<Result<Vec<_>>>()?;
        let access_type = match self.access_type.as_str() {
            "public" => AccessType::Public,
            "protected" => AccessType::Protected,
            "private" => AccessType::Private,
            other => return Err(StoreError::Decode(format!("bad access_type {other}"))),
        };
        let state = match self.state.as_str() {
            "active" => ShareState::Active,
            "invalid" => ShareState::Invalid,
            other => return Err(StoreError::Decode(format!("bad share state {other}"))),
        };
        Ok(ShareRecord {
            share_id: self.share_id,
            folder_id: decode("folder_id", FolderId::from_hex(&self.folder_id))?,
            access_type,
            wrapped_key_material: self.wrapped_key_material,
            index_refs,
            expires_at: self.expires_at.map(|v| v as u64),
            password_verifier: self.password_verifier,
            state,
            created_at: self.created_at as u64,
        })
    }
}

pub(crate) fn access_type_str(t: AccessType) -> &'static str {
    match t {
        AccessType::Public => "public",
        AccessType::Protected => "protected",
        AccessType::Private => "private",
    }
}

pub(crate) fn share_state_str(s: ShareState) -> &'static str {
    match s {
        ShareState::Active => "active",
        ShareState::Invalid => "invalid",
    }
}

pub(crate) struct RawQueueItem {
    pub item_id: i64,
    pub entity_ref: String,
    pub priority: i64,
    pub state: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub bytes_done: i64,
    pub bytes_total: i64,
    pub started_at: Option<i64>,
    pub updated_at: i64,
}

impl RawQueueItem {
    pub fn into_item(self, kind: QueueKind) -> Result<QueueItem> {
        Ok(QueueItem {
            item_id: ItemId(self.item_id),
            kind,
            entity_ref: self.entity_ref,
            priority: self.priority as i32,
            state: decode("state", ItemState::from_str(&self.state))?,
            attempts: self.attempts as u32,
            last_error: self.last_error,
            bytes_done: self.bytes_done as u64,
            bytes_total: self.bytes_total as u64,
            started_at: self.started_at.map(|v| v as u64),
            updated_at: self.updated_at as u64,
        })
    }
}

pub(crate) struct RawProgress {
    pub item_id: i64,
    pub segment_index: i64,
    pub state: String,
    pub bytes_done: i64,
    pub server_message_id: Option<String>,
    pub attempts: i64,
    pub last_error: Option<String>,
}

impl RawProgress {
    pub fn into_progress(self) -> Result<SegmentProgress> {
        let server_message_id = match self.server_message_id {
            Some(raw) => Some(decode("server_message_id", MessageId::parse(&raw))?),
            None => None,
        };
        Ok(SegmentProgress {
            item_id: ItemId(self.item_id),
            segment_index: self.segment_index as u32,
            state: decode("state", ProgressState::from_str(&self.state))?,
            bytes_done: self.bytes_done as u64,
            server_message_id,
            attempts: self.attempts as u32,
            last_error: self.last_error,
        })
    }
}
