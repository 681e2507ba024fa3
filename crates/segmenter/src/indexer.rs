//! Folder indexer.
//!
//! Walks a folder deterministically, writes file rows through the store in
//! batches, and bumps per-path versions when content changes. A `(size,
//! mtime)` fast path avoids rehashing unchanged files on re-scan.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use common::{ContentHash, FileState, Folder, FolderId, FolderStats, IndexStats};
use crypto::Sha256Stream;
use store::{NewFile, Store};

use crate::error::Result;

const HASH_BUF: usize = 1024 * 1024;

/// Rows inserted per store transaction on the bulk path.
const BATCH_SIZE: usize = 1000;

/// Stable 128-bit folder identity from `(path, creation_time)`.
pub fn derive_folder_id(path: &str, creation_unix: u64) -> FolderId {
    let mut input = Vec::with_capacity(path.len() + 8);
    input.extend_from_slice(path.as_bytes());
    input.extend_from_slice(&creation_unix.to_le_bytes());
    let digest = crypto::sha256(&input);
    let mut id = [0u8; 16];
    id.copy_from_slice(&digest.as_bytes()[..16]);
    FolderId(id)
}

fn hash_file(path: &Path) -> Result<ContentHash> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256Stream::new();
    let mut buf = vec![0u8; HASH_BUF];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let joined = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    (!joined.is_empty()).then_some(joined)
}

pub struct Indexer {
    store: Arc<dyn Store>,
}

impl Indexer {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Scan the folder's tree and reconcile file rows. New and changed
    /// files get a fresh version row; unchanged files are left alone.
    pub async fn index_folder(&self, folder: &Folder) -> Result<IndexStats> {
        let root = Path::new(&folder.path).to_path_buf();
        let mut stats = IndexStats::default();
        let mut pending: Vec<NewFile> = Vec::new();
        let mut changed = false;

        for entry in WalkDir::new(&root).sort_by_file_name() {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    warn!(%err, "skipping unreadable entry");
                    stats.errors += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(rel) = relative_path(&root, entry.path()) else {
                continue;
            };
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(err) => {
                    warn!(path = %rel, %err, "stat failed");
                    stats.errors += 1;
                    continue;
                }
            };
            let size = metadata.len();
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);

            stats.total_size += size;

            let previous = self
                .store
                .latest_file_version(&folder.folder_id, &rel)
                .await?;

            if let Some(prev) = &previous {
                if prev.size == size && prev.mtime == mtime {
                    stats.files_unchanged += 1;
                    continue;
                }
            }

            let content_hash = match hash_file(entry.path()) {
                Ok(h) => h,
                Err(err) => {
                    warn!(path = %rel, ?err, "hash failed");
                    stats.errors += 1;
                    continue;
                }
            };
            if let Some(prev) = &previous {
                if prev.content_hash == content_hash {
                    debug!(path = %rel, "mtime moved, content identical");
                    stats.files_unchanged += 1;
                    continue;
                }
            }

            let version = previous.map(|p| p.version + 1).unwrap_or(1);
            pending.push(NewFile {
                folder_id: folder.folder_id,
                relative_path: rel,
                size,
                content_hash,
                mtime,
                version,
                state: FileState::Indexed,
            });
            stats.files_indexed += 1;
            changed = true;

            if pending.len() >= BATCH_SIZE {
                self.store.insert_files(&pending).await?;
                pending.clear();
            }
        }
        if !pending.is_empty() {
            self.store.insert_files(&pending).await?;
        }

        let current = self.store.files_for_folder(&folder.folder_id).await?;
        let packable = current
            .iter()
            .filter(|f| f.size < common::PACK_THRESHOLD)
            .count() as u64;
        stats.files_packable = packable;

        let folder_stats = FolderStats {
            file_count: current.len() as u64,
            segment_count: folder.stats.segment_count,
            total_size: current.iter().map(|f| f.size).sum(),
            version: if changed {
                folder.stats.version + 1
            } else {
                folder.stats.version.max(1)
            },
        };
        self.store
            .update_folder_stats(&folder.folder_id, &folder_stats)
            .await?;
        self.store
            .update_folder_state(&folder.folder_id, common::FolderState::Indexed)
            .await?;

        info!(
            folder = %folder.folder_id,
            indexed = stats.files_indexed,
            unchanged = stats.files_unchanged,
            errors = stats.errors,
            "index pass complete"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{unix_now, FolderState, UserId};
    use store::MemoryStore;

    fn folder_for(path: &str) -> Folder {
        let created = unix_now();
        Folder {
            folder_id: derive_folder_id(path, created),
            path: path.to_string(),
            display_name: "t".to_string(),
            owner: UserId([1u8; 32]),
            folder_key: [0u8; 32],
            public_key: [0u8; 32],
            private_key_sealed: vec![],
            state: FolderState::Created,
            stats: FolderStats::default(),
            created_at: created,
        }
    }

    #[test]
    fn folder_id_is_stable_and_distinct() {
        assert_eq!(derive_folder_id("/a", 10), derive_folder_id("/a", 10));
        assert_ne!(derive_folder_id("/a", 10), derive_folder_id("/a", 11));
        assert_ne!(derive_folder_id("/a", 10), derive_folder_id("/b", 10));
    }

    #[tokio::test]
    async fn rescan_without_changes_indexes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"bravo").unwrap();

        let store = Arc::new(MemoryStore::new());
        let folder = folder_for(dir.path().to_str().unwrap());
        store.insert_user(&common::User {
            user_id: folder.owner,
            name: "u".to_string(),
            public_key: [0u8; 32],
            api_key: String::new(),
            created_at: 0,
        })
        .await
        .unwrap();
        store.insert_folder(&folder).await.unwrap();

        let indexer = Indexer::new(store.clone());
        let first = indexer.index_folder(&folder).await.unwrap();
        assert_eq!(first.files_indexed, 2);
        assert_eq!(first.files_unchanged, 0);

        let folder = store.folder(&folder.folder_id).await.unwrap().unwrap();
        assert_eq!(folder.state, FolderState::Indexed);

        let second = indexer.index_folder(&folder).await.unwrap();
        assert_eq!(second.files_indexed, 0);
        assert_eq!(second.files_unchanged, 2);
    }

    #[tokio::test]
    async fn changed_content_bumps_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"first contents").unwrap();

        let store = Arc::new(MemoryStore::new());
        let folder = folder_for(dir.path().to_str().unwrap());
        store.insert_user(&common::User {
            user_id: folder.owner,
            name: "u".to_string(),
            public_key: [0u8; 32],
            api_key: String::new(),
            created_at: 0,
        })
        .await
        .unwrap();
        store.insert_folder(&folder).await.unwrap();

        let indexer = Indexer::new(store.clone());
        indexer.index_folder(&folder).await.unwrap();

        // Different length changes the (size, mtime) fast path too.
        std::fs::write(&path, b"second, longer contents").unwrap();
        let folder = store.folder(&folder.folder_id).await.unwrap().unwrap();
        let stats = indexer.index_folder(&folder).await.unwrap();
        assert_eq!(stats.files_indexed, 1);

        let latest = store
            .latest_file_version(&folder.folder_id, "data.bin")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.version, 2);
    }
}
