//! Embedded single-file backend over SQLite.
//!
//! One connection behind a mutex: the mutex is the single-writer
//! serialization point, WAL mode gives readers a committed snapshot. Bulk
//! insertion paths run inside savepoints so they compose with an explicit
//! `begin`/`commit` issued by a caller.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use common::{
    unix_now, FileId, FileRecord, FileState, Folder, FolderId, FolderState, FolderStats, ItemId,
    ItemState, MessageId, PackId, PackRecord, QueueItem, QueueKind, SegmentId, SegmentOwner,
    SegmentProgress, SegmentRecord, ShareRecord, User, UserId,
};

use crate::error::{Result, StoreError};
use crate::migrations::{MIGRATIONS, MIGRATIONS_TABLE_SQLITE};
use crate::row::{
    access_type_str, share_state_str, RawFile, RawFolder, RawPack, RawProgress, RawQueueItem,
    RawSegment, RawShare, RawUser,
};
use crate::{NewFile, NewPack, NewQueueItem, NewSegment, Store};

/// Backoff schedule for reads that fail after a successful connect.
const READ_BACKOFF: [Duration; 2] = [Duration::from_millis(50), Duration::from_millis(200)];

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::prepare(conn)
    }

    /// Private in-memory database; handy for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::prepare(conn)
    }

    fn prepare(conn: Connection) -> Result<Self> {
        // journal_mode and busy_timeout echo their new value as a row.
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        let _timeout: i64 = conn.query_row("PRAGMA busy_timeout = 5000", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = NORMAL;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
        conn.execute_batch(MIGRATIONS_TABLE_SQLITE)?;
        let current: u32 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM migrations", [], |r| {
                r.get(0)
            })
            .unwrap_or(0);
        for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
            conn.execute_batch("BEGIN IMMEDIATE")?;
            let applied = conn
                .execute_batch(migration.sqlite)
                .and_then(|_| {
                    conn.execute(
                        "INSERT INTO migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
                        params![migration.version, migration.name, unix_now() as i64],
                    )
                    .map(|_| ())
                });
            match applied {
                Ok(()) => {
                    conn.execute_batch("COMMIT")?;
                    info!(version = migration.version, name = migration.name, "applied migration");
                }
                Err(err) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(StoreError::Migration {
                        version: migration.version,
                        message: err.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn read<T, F>(&self, op: F) -> Result<T>
    where
        F: Fn(&Connection) -> Result<T> + Send,
        T: Send,
    {
        let mut backoff = READ_BACKOFF.iter();
        loop {
            let outcome = {
                let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
                op(&conn)
            };
            match outcome {
                Err(StoreError::Backend(message)) => match backoff.next() {
                    Some(delay) => {
                        warn!(%message, ?delay, "read failed, backing off");
                        tokio::time::sleep(*delay).await;
                    }
                    None => return Err(StoreError::Backend(message)),
                },
                other => return other,
            }
        }
    }

    async fn write<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send,
        T: Send,
    {
        let mut conn = self.conn.lock().expect("sqlite connection mutex poisoned");
        op(&mut conn)
    }
}

fn queue_table(kind: QueueKind) -> &'static str {
    match kind {
        QueueKind::Upload => "upload_queue",
        QueueKind::Download => "download_queue",
    }
}

fn user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawUser> {
    Ok(RawUser {
        user_id: row.get(0)?,
        name: row.get(1)?,
        public_key: row.get(2)?,
        api_key: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn folder_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawFolder> {
    Ok(RawFolder {
        folder_id: row.get(0)?,
        path: row.get(1)?,
        display_name: row.get(2)?,
        owner: row.get(3)?,
        folder_key: row.get(4)?,
        public_key: row.get(5)?,
        private_key_sealed: row.get(6)?,
        state: row.get(7)?,
        file_count: row.get(8)?,
        segment_count: row.get(9)?,
        total_size: row.get(10)?,
        version: row.get(11)?,
        created_at: row.get(12)?,
    })
}

const FOLDER_COLS: &str = "folder_id, path, display_name, owner, folder_key, public_key, \
                           private_key_sealed, state, file_count, segment_count, total_size, \
                           version, created_at";

fn file_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawFile> {
    Ok(RawFile {
        file_id: row.get(0)?,
        folder_id: row.get(1)?,
        relative_path: row.get(2)?,
        size: row.get(3)?,
        content_hash: row.get(4)?,
        mtime: row.get(5)?,
        version: row.get(6)?,
        segment_count: row.get(7)?,
        state: row.get(8)?,
    })
}

const FILE_COLS: &str =
    "file_id, folder_id, relative_path, size, content_hash, mtime, version, segment_count, state";

fn segment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSegment> {
    Ok(RawSegment {
        segment_id: row.get(0)?,
        file_id: row.get(1)?,
        pack_id: row.get(2)?,
        idx: row.get(3)?,
        size: row.get(4)?,
        plaintext_hash: row.get(5)?,
        ciphertext_hash: row.get(6)?,
        redundancy_index: row.get(7)?,
        message_id: row.get(8)?,
        obfuscated_subject: row.get(9)?,
        upload_state: row.get(10)?,
    })
}

const SEGMENT_COLS: &str = "segment_id, file_id, pack_id, idx, size, plaintext_hash, \
                            ciphertext_hash, redundancy_index, message_id, obfuscated_subject, \
                            upload_state";

fn share_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawShare> {
    Ok(RawShare {
        share_id: row.get(0)?,
        folder_id: row.get(1)?,
        access_type: row.get(2)?,
        wrapped_key_material: row.get(3)?,
        index_refs: row.get(4)?,
        expires_at: row.get(5)?,
        password_verifier: row.get(6)?,
        state: row.get(7)?,
        created_at: row.get(8)?,
    })
}

const SHARE_COLS: &str = "share_id, folder_id, access_type, wrapped_key_material, index_refs, \
                          expires_at, password_verifier, state, created_at";

fn item_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawQueueItem> {
    Ok(RawQueueItem {
        item_id: row.get(0)?,
        entity_ref: row.get(1)?,
        priority: row.get(2)?,
        state: row.get(3)?,
        attempts: row.get(4)?,
        last_error: row.get(5)?,
        bytes_done: row.get(6)?,
        bytes_total: row.get(7)?,
        started_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

const ITEM_COLS: &str = "item_id, entity_ref, priority, state, attempts, last_error, bytes_done, \
                         bytes_total, started_at, updated_at";

fn progress_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawProgress> {
    Ok(RawProgress {
        item_id: row.get(0)?,
        segment_index: row.get(1)?,
        state: row.get(2)?,
        bytes_done: row.get(3)?,
        server_message_id: row.get(4)?,
        attempts: row.get(5)?,
        last_error: row.get(6)?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn begin(&self) -> Result<()> {
        self.write(|conn| Ok(conn.execute_batch("BEGIN IMMEDIATE")?)).await
    }

    async fn commit(&self) -> Result<()> {
        self.write(|conn| Ok(conn.execute_batch("COMMIT")?)).await
    }

    async fn rollback(&self) -> Result<()> {
        self.write(|conn| Ok(conn.execute_batch("ROLLBACK")?)).await
    }

    async fn insert_user(&self, user: &User) -> Result<()> {
        let user = user.clone();
        self.write(move |conn| {
            conn.execute(
                "INSERT INTO users (user_id, name, public_key, api_key, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    user.user_id.to_hex(),
                    user.name,
                    user.public_key.as_slice(),
                    user.api_key,
                    user.created_at as i64
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn user_by_name(&self, name: &str) -> Result<Option<User>> {
        self.read(|conn| {
            conn.query_row(
                "SELECT user_id, name, public_key, api_key, created_at FROM users WHERE name = ?1",
                params![name],
                user_row,
            )
            .optional()?
            .map(RawUser::into_user)
            .transpose()
        })
        .await
    }

    async fn user_by_id(&self, id: &UserId) -> Result<Option<User>> {
        let key = id.to_hex();
        self.read(move |conn| {
            conn.query_row(
                "SELECT user_id, name, public_key, api_key, created_at FROM users \
                 WHERE user_id = ?1",
                params![key],
                user_row,
            )
            .optional()?
            .map(RawUser::into_user)
            .transpose()
        })
        .await
    }

    async fn insert_folder(&self, folder: &Folder) -> Result<()> {
        let f = folder.clone();
        self.write(move |conn| {
            conn.execute(
                &format!("INSERT INTO folders ({FOLDER_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"),
                params![
                    f.folder_id.to_hex(),
                    f.path,
                    f.display_name,
                    f.owner.to_hex(),
                    f.folder_key.as_slice(),
                    f.public_key.as_slice(),
                    f.private_key_sealed,
                    f.state.as_str(),
                    f.stats.file_count as i64,
                    f.stats.segment_count as i64,
                    f.stats.total_size as i64,
                    f.stats.version as i64,
                    f.created_at as i64
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn folder(&self, id: &FolderId) -> Result<Option<Folder>> {
        let key = id.to_hex();
        self.read(move |conn| {
            conn.query_row(
                &format!("SELECT {FOLDER_COLS} FROM folders WHERE folder_id = ?1"),
                params![key],
                folder_row,
            )
            .optional()?
            .map(RawFolder::into_folder)
            .transpose()
        })
        .await
    }

    async fn folder_by_path(&self, path: &str) -> Result<Option<Folder>> {
        let path = path.to_string();
        self.read(move |conn| {
            conn.query_row(
                &format!("SELECT {FOLDER_COLS} FROM folders WHERE path = ?1"),
                params![path],
                folder_row,
            )
            .optional()?
            .map(RawFolder::into_folder)
            .transpose()
        })
        .await
    }

    async fn list_folders(&self) -> Result<Vec<Folder>> {
        self.read(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {FOLDER_COLS} FROM folders ORDER BY created_at"))?;
            let rows = stmt.query_map([], folder_row)?;
            rows.map(|raw| raw.map_err(StoreError::from).and_then(RawFolder::into_folder))
                .collect()
        })
        .await
    }

    async fn update_folder_state(&self, id: &FolderId, state: FolderState) -> Result<()> {
        let key = id.to_hex();
        self.write(move |conn| {
            let n = conn.execute(
                "UPDATE folders SET state = ?1 WHERE folder_id = ?2",
                params![state.as_str(), key],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound {
                    entity: "folder",
                    key,
                });
            }
            debug!(folder = %key, state = state.as_str(), "folder state updated");
            Ok(())
        })
        .await
    }

    async fn update_folder_stats(&self, id: &FolderId, stats: &FolderStats) -> Result<()> {
        let key = id.to_hex();
        let stats = *stats;
        self.write(move |conn| {
            conn.execute(
                "UPDATE folders SET file_count = ?1, segment_count = ?2, total_size = ?3, \
                 version = ?4 WHERE folder_id = ?5",
                params![
                    stats.file_count as i64,
                    stats.segment_count as i64,
                    stats.total_size as i64,
                    stats.version as i64,
                    key
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_folder_key(&self, id: &FolderId, folder_key: &[u8; 32]) -> Result<()> {
        let key = id.to_hex();
        let folder_key = folder_key.to_vec();
        self.write(move |conn| {
            let n = conn.execute(
                "UPDATE folders SET folder_key = ?1 WHERE folder_id = ?2",
                params![folder_key, key],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound {
                    entity: "folder",
                    key,
                });
            }
            Ok(())
        })
        .await
    }

    async fn insert_files(&self, files: &[NewFile]) -> Result<Vec<FileId>> {
        let files = files.to_vec();
        self.write(move |conn| {
            let sp = conn.savepoint()?;
            let mut ids = Vec::with_capacity(files.len());
            {
                let mut stmt = sp.prepare(
                    "INSERT INTO files (folder_id, relative_path, size, content_hash, mtime, \
                     version, segment_count, state) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
                )?;
                for file in &files {
                    stmt.execute(params![
                        file.folder_id.to_hex(),
                        file.relative_path,
                        file.size as i64,
                        file.content_hash.to_hex(),
                        file.mtime as i64,
                        file.version as i64,
                        file.state.as_str()
                    ])?;
                    ids.push(FileId(sp.last_insert_rowid()));
                }
            }
            sp.commit()?;
            Ok(ids)
        })
        .await
    }

    async fn file(&self, id: FileId) -> Result<Option<FileRecord>> {
        self.read(move |conn| {
            conn.query_row(
                &format!("SELECT {FILE_COLS} FROM files WHERE file_id = ?1"),
                params![id.0],
                file_row,
            )
            .optional()?
            .map(RawFile::into_file)
            .transpose()
        })
        .await
    }

    async fn files_for_folder(&self, folder: &FolderId) -> Result<Vec<FileRecord>> {
        let key = folder.to_hex();
        self.read(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT f.{} FROM files f JOIN (SELECT relative_path, MAX(version) AS v \
                 FROM files WHERE folder_id = ?1 GROUP BY relative_path) latest \
                 ON f.relative_path = latest.relative_path AND f.version = latest.v \
                 WHERE f.folder_id = ?1 ORDER BY f.relative_path",
                FILE_COLS.replace(", ", ", f.")
            ))?;
            let rows = stmt.query_map(params![key], file_row)?;
            rows.map(|raw| raw.map_err(StoreError::from).and_then(RawFile::into_file))
                .collect()
        })
        .await
    }

    async fn latest_file_version(
        &self,
        folder: &FolderId,
        relative_path: &str,
    ) -> Result<Option<FileRecord>> {
        let key = folder.to_hex();
        let rel = relative_path.to_string();
        self.read(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {FILE_COLS} FROM files WHERE folder_id = ?1 AND relative_path = ?2 \
                     ORDER BY version DESC LIMIT 1"
                ),
                params![key, rel],
                file_row,
            )
            .optional()?
            .map(RawFile::into_file)
            .transpose()
        })
        .await
    }

    async fn update_file_state(&self, id: FileId, state: FileState) -> Result<()> {
        self.write(move |conn| {
            conn.execute(
                "UPDATE files SET state = ?1 WHERE file_id = ?2",
                params![state.as_str(), id.0],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_file_segment_count(&self, id: FileId, segment_count: u32) -> Result<()> {
        self.write(move |conn| {
            conn.execute(
                "UPDATE files SET segment_count = ?1 WHERE file_id = ?2",
                params![segment_count as i64, id.0],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_file(&self, id: FileId) -> Result<()> {
        self.write(move |conn| {
            let sp = conn.savepoint()?;
            let folder: Option<String> = sp
                .query_row(
                    "SELECT folder_id FROM files WHERE file_id = ?1",
                    params![id.0],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(folder) = folder else {
                return Err(StoreError::NotFound {
                    entity: "file",
                    key: id.0.to_string(),
                });
            };
            sp.execute("DELETE FROM files WHERE file_id = ?1", params![id.0])?;
            sp.execute(
                "UPDATE shares SET state = 'invalid' WHERE folder_id = ?1",
                params![folder],
            )?;
            sp.commit()?;
            Ok(())
        })
        .await
    }

    async fn insert_segments(&self, segments: &[NewSegment]) -> Result<Vec<SegmentId>> {
        let segments = segments.to_vec();
        self.write(move |conn| {
            let sp = conn.savepoint()?;
            let mut ids = Vec::with_capacity(segments.len());
            {
                let mut stmt = sp.prepare(
                    "INSERT INTO segments (file_id, pack_id, idx, size, plaintext_hash, \
                     ciphertext_hash, redundancy_index, upload_state) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending')",
                )?;
                for seg in &segments {
                    let (file_id, pack_id) = match seg.owner {
                        SegmentOwner::File(f) => (Some(f.0), None),
                        SegmentOwner::Pack(p) => (None, Some(p.0)),
                    };
                    stmt.execute(params![
                        file_id,
                        pack_id,
                        seg.index as i64,
                        seg.size as i64,
                        seg.plaintext_hash.to_hex(),
                        seg.ciphertext_hash.to_hex(),
                        seg.redundancy_index as i64
                    ])?;
                    ids.push(SegmentId(sp.last_insert_rowid()));
                }
            }
            sp.commit()?;
            Ok(ids)
        })
        .await
    }

    async fn segment(&self, id: SegmentId) -> Result<Option<SegmentRecord>> {
        self.read(move |conn| {
            conn.query_row(
                &format!("SELECT {SEGMENT_COLS} FROM segments WHERE segment_id = ?1"),
                params![id.0],
                segment_row,
            )
            .optional()?
            .map(RawSegment::into_segment)
            .transpose()
        })
        .await
    }

    async fn segments_for_file(&self, file: FileId) -> Result<Vec<SegmentRecord>> {
        self.read(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SEGMENT_COLS} FROM segments WHERE file_id = ?1 \
                 ORDER BY idx, redundancy_index"
            ))?;
            let rows = stmt.query_map(params![file.0], segment_row)?;
            rows.map(|raw| raw.map_err(StoreError::from).and_then(RawSegment::into_segment))
                .collect()
        })
        .await
    }

    async fn segments_for_pack(&self, pack: PackId) -> Result<Vec<SegmentRecord>> {
        self.read(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SEGMENT_COLS} FROM segments WHERE pack_id = ?1 \
                 ORDER BY idx, redundancy_index"
            ))?;
            let rows = stmt.query_map(params![pack.0], segment_row)?;
            rows.map(|raw| raw.map_err(StoreError::from).and_then(RawSegment::into_segment))
                .collect()
        })
        .await
    }

    async fn segments_for_folder(&self, folder: &FolderId) -> Result<Vec<SegmentRecord>> {
        let key = folder.to_hex();
        self.read(move |conn| {
            let cols = SEGMENT_COLS.replace(", ", ", s.");
            let mut stmt = conn.prepare(&format!(
                "SELECT s.{cols} FROM segments s \
                 LEFT JOIN files f ON s.file_id = f.file_id \
                 LEFT JOIN packs p ON s.pack_id = p.pack_id \
                 WHERE f.folder_id = ?1 OR p.folder_id = ?1 \
                 ORDER BY COALESCE(f.relative_path, ''), s.idx, s.redundancy_index"
            ))?;
            let rows = stmt.query_map(params![key], segment_row)?;
            rows.map(|raw| raw.map_err(StoreError::from).and_then(RawSegment::into_segment))
                .collect()
        })
        .await
    }

    async fn update_segment_payload_hash(
        &self,
        id: SegmentId,
        ciphertext_hash: &common::ContentHash,
    ) -> Result<()> {
        let hash = ciphertext_hash.to_hex();
        self.write(move |conn| {
            let n = conn.execute(
                "UPDATE segments SET ciphertext_hash = ?1 \
                 WHERE segment_id = ?2 AND upload_state = 'pending'",
                params![hash, id.0],
            )?;
            if n == 0 {
                return Err(StoreError::Constraint(format!(
                    "segment {} is not pending",
                    id.0
                )));
            }
            Ok(())
        })
        .await
    }

    async fn mark_segment_uploaded(
        &self,
        id: SegmentId,
        message_id: &MessageId,
        subject: &str,
    ) -> Result<()> {
        let mid = message_id.as_str().to_string();
        let subject = subject.to_string();
        self.write(move |conn| {
            let n = conn.execute(
                "UPDATE segments SET message_id = ?1, obfuscated_subject = ?2, \
                 upload_state = 'uploaded' WHERE segment_id = ?3 AND message_id IS NULL",
                params![mid, subject, id.0],
            )?;
            if n == 1 {
                return Ok(());
            }
            // Either the row is missing or it already carries a Message-ID.
            let existing: Option<Option<String>> = conn
                .query_row(
                    "SELECT message_id FROM segments WHERE segment_id = ?1",
                    params![id.0],
                    |r| r.get(0),
                )
                .optional()?;
            match existing {
                None => Err(StoreError::NotFound {
                    entity: "segment",
                    key: id.0.to_string(),
                }),
                Some(Some(current)) if current == mid => Ok(()),
                Some(_) => Err(StoreError::Constraint(format!(
                    "segment {} already uploaded under a different message id",
                    id.0
                ))),
            }
        })
        .await
    }

    async fn reset_folder_segments(&self, folder: &FolderId) -> Result<()> {
        let key = folder.to_hex();
        self.write(move |conn| {
            let sp = conn.savepoint()?;
            sp.execute(
                "DELETE FROM segments WHERE file_id IN \
                 (SELECT file_id FROM files WHERE folder_id = ?1)",
                params![key],
            )?;
            sp.execute(
                "DELETE FROM segments WHERE pack_id IN \
                 (SELECT pack_id FROM packs WHERE folder_id = ?1)",
                params![key],
            )?;
            sp.execute("DELETE FROM packs WHERE folder_id = ?1", params![key])?;
            sp.commit()?;
            Ok(())
        })
        .await
    }

    async fn insert_pack(&self, pack: &NewPack) -> Result<PackId> {
        let members = serde_json::to_string(&pack.members)?;
        let key = pack.folder_id.to_hex();
        let index = pack.segment_index;
        self.write(move |conn| {
            conn.execute(
                "INSERT INTO packs (folder_id, segment_index, members) VALUES (?1, ?2, ?3)",
                params![key, index as i64, members],
            )?;
            Ok(PackId(conn.last_insert_rowid()))
        })
        .await
    }

    async fn packs_for_folder(&self, folder: &FolderId) -> Result<Vec<PackRecord>> {
        let key = folder.to_hex();
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT pack_id, folder_id, segment_index, members FROM packs \
                 WHERE folder_id = ?1 ORDER BY segment_index",
            )?;
            let rows = stmt.query_map(params![key], |row| {
                Ok(RawPack {
                    pack_id: row.get(0)?,
                    folder_id: row.get(1)?,
                    segment_index: row.get(2)?,
                    members: row.get(3)?,
                })
            })?;
            rows.map(|raw| raw.map_err(StoreError::from).and_then(RawPack::into_pack))
                .collect()
        })
        .await
    }

    async fn insert_share(&self, share: &ShareRecord) -> Result<()> {
        let s = share.clone();
        let refs = serde_json::to_string(
            &s.index_refs.iter().map(|m| m.as_str().to_string()).collect::<Vec<_>>(),
        )?;
        self.write(move |conn| {
            conn.execute(
                &format!("INSERT INTO shares ({SHARE_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                params![
                    s.share_id,
                    s.folder_id.to_hex(),
                    access_type_str(s.access_type),
                    s.wrapped_key_material,
                    refs,
                    s.expires_at.map(|v| v as i64),
                    s.password_verifier,
                    share_state_str(s.state),
                    s.created_at as i64
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn share(&self, share_id: &str) -> Result<Option<ShareRecord>> {
        let key = share_id.to_string();
        self.read(move |conn| {
            conn.query_row(
                &format!("SELECT {SHARE_COLS} FROM shares WHERE share_id = ?1"),
                params![key],
                share_row,
            )
            .optional()?
            .map(RawShare::into_share)
            .transpose()
        })
        .await
    }

    async fn shares_for_folder(&self, folder: &FolderId) -> Result<Vec<ShareRecord>> {
        let key = folder.to_hex();
        self.read(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SHARE_COLS} FROM shares WHERE folder_id = ?1 ORDER BY created_at"
            ))?;
            let rows = stmt.query_map(params![key], share_row)?;
            rows.map(|raw| raw.map_err(StoreError::from).and_then(RawShare::into_share))
                .collect()
        })
        .await
    }

    async fn update_share_index_refs(&self, share_id: &str, refs: &[MessageId]) -> Result<()> {
        let key = share_id.to_string();
        let encoded = serde_json::to_string(
            &refs.iter().map(|m| m.as_str().to_string()).collect::<Vec<_>>(),
        )?;
        self.write(move |conn| {
            let n = conn.execute(
                "UPDATE shares SET index_refs = ?1 WHERE share_id = ?2",
                params![encoded, key],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound {
                    entity: "share",
                    key,
                });
            }
            Ok(())
        })
        .await
    }

    async fn invalidate_shares_for_folder(&self, folder: &FolderId) -> Result<()> {
        let key = folder.to_hex();
        self.write(move |conn| {
            conn.execute(
                "UPDATE shares SET state = 'invalid' WHERE folder_id = ?1",
                params![key],
            )?;
            Ok(())
        })
        .await
    }

    async fn enqueue(&self, kind: QueueKind, item: &NewQueueItem) -> Result<ItemId> {
        let item = item.clone();
        self.write(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {} (entity_ref, priority, state, bytes_total, updated_at) \
                     VALUES (?1, ?2, 'queued', ?3, ?4)",
                    queue_table(kind)
                ),
                params![
                    item.entity_ref,
                    item.priority,
                    item.bytes_total as i64,
                    unix_now() as i64
                ],
            )?;
            Ok(ItemId(conn.last_insert_rowid()))
        })
        .await
    }

    async fn queue_item(&self, kind: QueueKind, id: ItemId) -> Result<Option<QueueItem>> {
        self.read(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {ITEM_COLS} FROM {} WHERE item_id = ?1",
                    queue_table(kind)
                ),
                params![id.0],
                item_row,
            )
            .optional()?
            .map(|raw| raw.into_item(kind))
            .transpose()
        })
        .await
    }

    async fn update_item_state(
        &self,
        kind: QueueKind,
        id: ItemId,
        state: ItemState,
        last_error: Option<&str>,
    ) -> Result<()> {
        let last_error = last_error.map(str::to_string);
        self.write(move |conn| {
            let started = matches!(state, ItemState::Running);
            let n = conn.execute(
                &format!(
                    "UPDATE {} SET state = ?1, last_error = COALESCE(?2, last_error), \
                     updated_at = ?3, \
                     started_at = CASE WHEN ?4 AND started_at IS NULL THEN ?3 ELSE started_at END \
                     WHERE item_id = ?5",
                    queue_table(kind)
                ),
                params![state.as_str(), last_error, unix_now() as i64, started, id.0],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound {
                    entity: "queue item",
                    key: id.0.to_string(),
                });
            }
            Ok(())
        })
        .await
    }

    async fn bump_item_attempts(&self, kind: QueueKind, id: ItemId) -> Result<()> {
        self.write(move |conn| {
            conn.execute(
                &format!(
                    "UPDATE {} SET attempts = attempts + 1, updated_at = ?1 WHERE item_id = ?2",
                    queue_table(kind)
                ),
                params![unix_now() as i64, id.0],
            )?;
            Ok(())
        })
        .await
    }

    async fn recompute_item_bytes(&self, kind: QueueKind, id: ItemId) -> Result<()> {
        self.write(move |conn| {
            conn.execute(
                &format!(
                    "UPDATE {} SET bytes_done = (SELECT COALESCE(SUM(bytes_done), 0) \
                     FROM segment_progress WHERE queue = ?1 AND item_id = ?2), \
                     updated_at = ?3 WHERE item_id = ?2",
                    queue_table(kind)
                ),
                params![kind.as_str(), id.0, unix_now() as i64],
            )?;
            Ok(())
        })
        .await
    }

    async fn set_item_bytes_total(&self, kind: QueueKind, id: ItemId, total: u64) -> Result<()> {
        self.write(move |conn| {
            conn.execute(
                &format!(
                    "UPDATE {} SET bytes_total = ?1, updated_at = ?2 WHERE item_id = ?3",
                    queue_table(kind)
                ),
                params![total as i64, unix_now() as i64, id.0],
            )?;
            Ok(())
        })
        .await
    }

    async fn resumable_items(&self, kind: QueueKind) -> Result<Vec<QueueItem>> {
        self.read(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ITEM_COLS} FROM {} WHERE state IN \
                 ('queued', 'running', 'paused', 'failed') \
                 ORDER BY priority DESC, item_id",
                queue_table(kind)
            ))?;
            let rows = stmt.query_map([], item_row)?;
            rows.map(|raw| raw.map_err(StoreError::from).and_then(|r| r.into_item(kind)))
                .collect()
        })
        .await
    }

    async fn upsert_progress(&self, kind: QueueKind, row: &SegmentProgress) -> Result<()> {
        let row = row.clone();
        self.write(move |conn| {
            conn.execute(
                "INSERT INTO segment_progress (queue, item_id, segment_index, state, bytes_done, \
                 server_message_id, attempts, last_error) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                 ON CONFLICT (queue, item_id, segment_index) DO UPDATE SET \
                 state = excluded.state, bytes_done = excluded.bytes_done, \
                 server_message_id = excluded.server_message_id, \
                 attempts = excluded.attempts, last_error = excluded.last_error",
                params![
                    kind.as_str(),
                    row.item_id.0,
                    row.segment_index as i64,
                    row.state.as_str(),
                    row.bytes_done as i64,
                    row.server_message_id.as_ref().map(|m| m.as_str().to_string()),
                    row.attempts as i64,
                    row.last_error
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn progress_rows(&self, kind: QueueKind, item: ItemId) -> Result<Vec<SegmentProgress>> {
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT item_id, segment_index, state, bytes_done, server_message_id, attempts, \
                 last_error FROM segment_progress WHERE queue = ?1 AND item_id = ?2 \
                 ORDER BY segment_index",
            )?;
            let rows = stmt.query_map(params![kind.as_str(), item.0], progress_row)?;
            rows.map(|raw| raw.map_err(StoreError::from).and_then(RawProgress::into_progress))
                .collect()
        })
        .await
    }

    async fn record_message(
        &self,
        message_id: &MessageId,
        segment: SegmentId,
        subject: &str,
    ) -> Result<()> {
        let mid = message_id.as_str().to_string();
        let subject = subject.to_string();
        self.write(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO messages (message_id, segment_id, subject, posted_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![mid, segment.0, subject, unix_now() as i64],
            )?;
            Ok(())
        })
        .await
    }

    async fn segment_for_message(&self, message_id: &MessageId) -> Result<Option<SegmentId>> {
        let mid = message_id.as_str().to_string();
        self.read(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT segment_id FROM messages WHERE message_id = ?1",
                    params![mid],
                    |r| r.get::<_, i64>(0),
                )
                .optional()?
                .map(SegmentId))
        })
        .await
    }
}
