//! Publishing: build the core index from the store, post it, mint the
//! share.
//!
//! The index references every uploaded copy of every segment. A packed
//! file appears once per member with the shared pack segment repeated
//! under its own `file_ref`, which is what lets the receiver's cache
//! serve later members without re-fetching.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use common::{
    CompressionPolicy, Folder, FolderState, MessageId, PackRecord, SegmentPolicy, ShareRecord,
    UploadState,
};
use crypto::{inner_subject, FolderKey, KeyPurpose};
use manifest::{CoreIndex, ManifestFile, ManifestSegment};
use segmenter::prepare_chunk;
use store::Store;
use transport::{with_retries, NntpPool, RetryPolicy};

use crate::article::{encode_article, ArticlePlan};
use crate::error::{EngineError, Result};

fn uploaded_id(row: &common::SegmentRecord) -> Result<MessageId> {
    row.message_id.clone().ok_or_else(|| {
        EngineError::Integrity(format!(
            "segment {} marked uploaded without a message id",
            row.segment_id.0
        ))
    })
}

pub struct Publisher {
    store: Arc<dyn Store>,
    pool: NntpPool,
    policy: SegmentPolicy,
    retry: RetryPolicy,
}

impl Publisher {
    pub fn new(
        store: Arc<dyn Store>,
        pool: NntpPool,
        policy: SegmentPolicy,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            pool,
            policy,
            retry,
        }
    }

    /// Assemble the manifest for a fully uploaded folder.
    pub async fn build_index(&self, folder: &Folder) -> Result<CoreIndex> {
        let files = self.store.files_for_folder(&folder.folder_id).await?;
        let packs = self.store.packs_for_folder(&folder.folder_id).await?;

        let member_pack: HashMap<common::FileId, &PackRecord> = packs
            .iter()
            .flat_map(|p| p.members.iter().map(move |m| (m.file_id, p)))
            .collect();
        let mut pack_segments = HashMap::new();
        for pack in &packs {
            let rows = self.store.segments_for_pack(pack.pack_id).await?;
            pack_segments.insert(pack.pack_id, rows);
        }

        let mut manifest_files = Vec::with_capacity(files.len());
        let mut manifest_segments = Vec::new();
        for (file_ref, file) in files.iter().enumerate() {
            let file_ref = file_ref as u64;
            if let Some(pack) = member_pack.get(&file.file_id) {
                let rows = &pack_segments[&pack.pack_id];
                for row in rows.iter().filter(|r| r.upload_state == UploadState::Uploaded) {
                    manifest_segments.push(ManifestSegment {
                        file_ref,
                        index: 0,
                        size: row.size,
                        ciphertext_hash: row.ciphertext_hash,
                        message_id: uploaded_id(row)?,
                    });
                }
                manifest_files.push(ManifestFile {
                    relative_path: file.relative_path.clone(),
                    size: file.size,
                    content_hash: file.content_hash,
                    mtime: file.mtime,
                    version: file.version,
                    segment_count: 1,
                });
            } else {
                let rows = self.store.segments_for_file(file.file_id).await?;
                let mut max_index = 0u32;
                for row in rows.iter().filter(|r| r.upload_state == UploadState::Uploaded) {
                    max_index = max_index.max(row.index);
                    manifest_segments.push(ManifestSegment {
                        file_ref,
                        index: row.index,
                        size: row.size,
                        ciphertext_hash: row.ciphertext_hash,
                        message_id: uploaded_id(row)?,
                    });
                }
                manifest_files.push(ManifestFile {
                    relative_path: file.relative_path.clone(),
                    size: file.size,
                    content_hash: file.content_hash,
                    mtime: file.mtime,
                    version: file.version,
                    segment_count: if file.size == 0 { 0 } else { max_index + 1 },
                });
            }
        }

        Ok(CoreIndex {
            folder_name: folder.display_name.clone(),
            files: manifest_files,
            segments: manifest_segments,
        })
    }

    /// Seal, chunk, and post the core index; returns the index segment
    /// Message-IDs in chunk order.
    pub async fn post_index(&self, folder: &Folder, index: &CoreIndex) -> Result<Vec<MessageId>> {
        let sealed = manifest::seal(index)?;
        let folder_key = FolderKey::from_bytes(folder.folder_key);
        let segment_key = folder_key.derive(KeyPurpose::SegmentEncryption);
        let subject_key = folder_key.derive(KeyPurpose::SubjectObfuscation);

        // The blob is already xz-compressed; chunks skip re-compression.
        let chunk_policy = SegmentPolicy {
            compression: CompressionPolicy::None,
            ..self.policy.clone()
        };
        let version = folder.stats.version.max(1);
        let chunks: Vec<&[u8]> = sealed.chunks(self.policy.segment_size).collect();
        let total = chunks.len() as u32;

        let mut refs = Vec::with_capacity(chunks.len());
        let group = self.pool.profile().group.clone();
        for (i, chunk) in chunks.iter().enumerate() {
            let prepared = prepare_chunk(chunk, i as u32, &segment_key, &chunk_policy)?;
            let begin = i as u64 * self.policy.segment_size as u64 + 1;
            let plan = ArticlePlan {
                part: i as u32 + 1,
                total,
                object_size: sealed.len() as u64,
                begin,
                end: begin + chunk.len() as u64 - 1,
                inner: inner_subject(&subject_key, &folder.folder_id, version, i as u32),
            };
            let message_id = with_retries(&self.retry, |_| {
                let pool = self.pool.clone();
                let group = group.clone();
                let plan = &plan;
                let payload = &prepared.payload;
                async move {
                    let article = encode_article(plan, payload);
                    let mut session = pool.checkout().await?;
                    session.select_group(&group).await?;
                    session.post(&article.subject, &[], &article.body).await
                }
            })
            .await?;
            debug!(part = i + 1, total, %message_id, "index segment posted");
            refs.push(message_id);
        }
        Ok(refs)
    }

    /// The full publishing step: index, post, share, state transition.
    pub async fn publish(
        &self,
        folder: &Folder,
        spec: &access::AccessSpec,
        expires_at: Option<u64>,
    ) -> Result<(ShareRecord, String)> {
        if !matches!(folder.state, FolderState::Uploaded | FolderState::Published) {
            return Err(EngineError::NotUploaded(folder.folder_id.to_hex()));
        }

        let index = self.build_index(folder).await?;
        let refs = self.post_index(folder, &index).await?;

        let folder_key = FolderKey::from_bytes(folder.folder_key);
        let (record, token) =
            access::build_share(&folder.folder_id, &folder_key, spec, &refs, expires_at)?;
        self.store.insert_share(&record).await?;
        self.store
            .update_folder_state(&folder.folder_id, FolderState::Published)
            .await?;
        info!(
            folder = %folder.folder_id,
            share = %record.share_id,
            index_segments = refs.len(),
            "folder published"
        );
        Ok((record, token))
    }
}
