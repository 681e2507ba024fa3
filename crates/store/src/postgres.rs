//! Networked SQL backend over PostgreSQL.
//!
//! One `tokio-postgres` client with its connection driven by a background
//! task. Statement text mirrors the SQLite backend; the row conversions are
//! shared, so the two engines stay behaviorally interchangeable.

use std::time::Duration;

use async_trait::async_trait;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{info, warn};

use common::{
    unix_now, FileId, FileRecord, FileState, Folder, FolderId, FolderState, FolderStats, ItemId,
    ItemState, MessageId, PackId, PackRecord, QueueItem, QueueKind, SegmentId, SegmentOwner,
    SegmentProgress, SegmentRecord, ShareRecord, User, UserId,
};

use crate::error::{Result, StoreError};
use crate::migrations::{MIGRATIONS, MIGRATIONS_TABLE_POSTGRES};
use crate::row::{
    access_type_str, share_state_str, RawFile, RawFolder, RawPack, RawProgress, RawQueueItem,
    RawSegment, RawShare, RawUser,
};
use crate::{NewFile, NewPack, NewQueueItem, NewSegment, Store};

const READ_BACKOFF: [Duration; 2] = [Duration::from_millis(50), Duration::from_millis(200)];

pub struct PostgresStore {
    client: Client,
}

impl PostgresStore {
    /// Connect with a standard connection string
    /// (`host=... user=... dbname=...`) and walk the migration ladder.
    pub async fn connect(conn_str: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(conn_str, NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!(%err, "postgres connection task ended");
            }
        });
        let store = Self { client };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        self.client.batch_execute(MIGRATIONS_TABLE_POSTGRES).await?;
        let row = self
            .client
            .query_one("SELECT COALESCE(MAX(version), 0) FROM migrations", &[])
            .await?;
        let current: i64 = row.get(0);
        for migration in MIGRATIONS.iter().filter(|m| m.version as i64 > current) {
            let applied = async {
                self.client.batch_execute("BEGIN").await?;
                self.client.batch_execute(migration.postgres).await?;
                self.client
                    .execute(
                        "INSERT INTO migrations (version, name, applied_at) VALUES ($1, $2, $3)",
                        &[
                            &(migration.version as i64),
                            &migration.name,
                            &(unix_now() as i64),
                        ],
                    )
                    .await?;
                self.client.batch_execute("COMMIT").await?;
                Ok::<_, tokio_postgres::Error>(())
            }
            .await;
            match applied {
                Ok(()) => {
                    info!(version = migration.version, name = migration.name, "applied migration")
                }
                Err(err) => {
                    let _ = self.client.batch_execute("ROLLBACK").await;
                    return Err(StoreError::Migration {
                        version: migration.version,
                        message: err.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn query(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
        let mut backoff = READ_BACKOFF.iter();
        loop {
            match self.client.query(sql, params).await {
                Ok(rows) => return Ok(rows),
                Err(err) => match backoff.next() {
                    Some(delay) => {
                        warn!(%err, ?delay, "read failed, backing off");
                        tokio::time::sleep(*delay).await;
                    }
                    None => return Err(err.into()),
                },
            }
        }
    }

    async fn query_opt(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Option<Row>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }
}

fn queue_table(kind: QueueKind) -> &'static str {
    match kind {
        QueueKind::Upload => "upload_queue",
        QueueKind::Download => "download_queue",
    }
}

const FOLDER_COLS: &str = "folder_id, path, display_name, owner, folder_key, public_key, \
                           private_key_sealed, state, file_count, segment_count, total_size, \
                           version, created_at";
const FILE_COLS: &str =
    "file_id, folder_id, relative_path, size, content_hash, mtime, version, segment_count, state";
const SEGMENT_COLS: &str = "segment_id, file_id, pack_id, idx, size, plaintext_hash, \
                            ciphertext_hash, redundancy_index, message_id, obfuscated_subject, \
                            upload_state";
const SHARE_COLS: &str = "share_id, folder_id, access_type, wrapped_key_material, index_refs, \
                          expires_at, password_verifier, state, created_at";
const ITEM_COLS: &str = "item_id, entity_ref, priority, state, attempts, last_error, bytes_done, \
                         bytes_total, started_at, updated_at";

fn user_from(row: &Row) -> RawUser {
    RawUser {
        user_id: row.get(0),
        name: row.get(1),
        public_key: row.get(2),
        api_key: row.get(3),
        created_at: row.get(4),
    }
}

fn folder_from(row: &Row) -> RawFolder {
    RawFolder {
        folder_id: row.get(0),
        path: row.get(1),
        display_name: row.get(2),
        owner: row.get(3),
        folder_key: row.get(4),
        public_key: row.get(5),
        private_key_sealed: row.get(6),
        state: row.get(7),
        file_count: row.get(8),
        segment_count: row.get(9),
        total_size: row.get(10),
        version: row.get(11),
        created_at: row.get(12),
    }
}

fn file_from(row: &Row) -> RawFile {
    RawFile {
        file_id: row.get(0),
        folder_id: row.get(1),
        relative_path: row.get(2),
        size: row.get(3),
        content_hash: row.get(4),
        mtime: row.get(5),
        version: row.get(6),
        segment_count: row.get(7),
        state: row.get(8),
    }
}

fn segment_from(row: &Row) -> RawSegment {
    RawSegment {
        segment_id: row.get(0),
        file_id: row.get(1),
        pack_id: row.get(2),
        idx: row.get(3),
        size: row.get(4),
        plaintext_hash: row.get(5),
        ciphertext_hash: row.get(6),
        redundancy_index: row.get(7),
        message_id: row.get(8),
        obfuscated_subject: row.get(9),
        upload_state: row.get(10),
    }
}

fn share_from(row: &Row) -> RawShare {
    RawShare {
        share_id: row.get(0),
        folder_id: row.get(1),
        access_type: row.get(2),
        wrapped_key_material: row.get(3),
        index_refs: row.get(4),
        expires_at: row.get(5),
        password_verifier: row.get(6),
        state: row.get(7),
        created_at: row.get(8),
    }
}

fn item_from(row: &Row) -> RawQueueItem {
    RawQueueItem {
        item_id: row.get(0),
        entity_ref: row.get(1),
        priority: row.get(2),
        state: row.get(3),
        attempts: row.get(4),
        last_error: row.get(5),
        bytes_done: row.get(6),
        bytes_total: row.get(7),
        started_at: row.get(8),
        updated_at: row.get(9),
    }
}

fn progress_from(row: &Row) -> RawProgress {
    RawProgress {
        item_id: row.get(0),
        segment_index: row.get(1),
        state: row.get(2),
        bytes_done: row.get(3),
        server_message_id: row.get(4),
        attempts: row.get(5),
        last_error: row.get(6),
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn begin(&self) -> Result<()> {
        Ok(self.client.batch_execute("BEGIN").await?)
    }

    async fn commit(&self) -> Result<()> {
        Ok(self.client.batch_execute("COMMIT").await?)
    }

    async fn rollback(&self) -> Result<()> {
        Ok(self.client.batch_execute("ROLLBACK").await?)
    }

    async fn insert_user(&self, user: &User) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO users (user_id, name, public_key, api_key, created_at) \
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    &user.user_id.to_hex(),
                    &user.name,
                    &user.public_key.as_slice(),
                    &user.api_key,
                    &(user.created_at as i64),
                ],
            )
            .await?;
        Ok(())
    }

    async fn user_by_name(&self, name: &str) -> Result<Option<User>> {
        self.query_opt(
            "SELECT user_id, name, public_key, api_key, created_at FROM users WHERE name = $1",
            &[&name],
        )
        .await?
        .map(|row| user_from(&row).into_user())
        .transpose()
    }

    async fn user_by_id(&self, id: &UserId) -> Result<Option<User>> {
        self.query_opt(
            "SELECT user_id, name, public_key, api_key, created_at FROM users WHERE user_id = $1",
            &[&id.to_hex()],
        )
        .await?
        .map(|row| user_from(&row).into_user())
        .transpose()
    }

    async fn insert_folder(&self, folder: &Folder) -> Result<()> {
        self.client
            .execute(
                &format!(
                    "INSERT INTO folders ({FOLDER_COLS}) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
                ),
                &[
                    &folder.folder_id.to_hex(),
                    &folder.path,
                    &folder.display_name,
                    &folder.owner.to_hex(),
                    &folder.folder_key.as_slice(),
                    &folder.public_key.as_slice(),
                    &folder.private_key_sealed,
                    &folder.state.as_str(),
                    &(folder.stats.file_count as i64),
                    &(folder.stats.segment_count as i64),
                    &(folder.stats.total_size as i64),
                    &(folder.stats.version as i64),
                    &(folder.created_at as i64),
                ],
            )
            .await?;
        Ok(())
    }

    async fn folder(&self, id: &FolderId) -> Result<Option<Folder>> {
        self.query_opt(
            &format!("SELECT {FOLDER_COLS} FROM folders WHERE folder_id = $1"),
            &[&id.to_hex()],
        )
        .await?
        .map(|row| folder_from(&row).into_folder())
        .transpose()
    }

    async fn folder_by_path(&self, path: &str) -> Result<Option<Folder>> {
        self.query_opt(
            &format!("SELECT {FOLDER_COLS} FROM folders WHERE path = $1"),
            &[&path],
        )
        .await?
        .map(|row| folder_from(&row).into_folder())
        .transpose()
    }

    async fn list_folders(&self) -> Result<Vec<Folder>> {
        self.query(
            &format!("SELECT {FOLDER_COLS} FROM folders ORDER BY created_at"),
            &[],
        )
        .await?
        .iter()
        .map(|row| folder_from(row).into_folder())
        .collect()
    }

    async fn update_folder_state(&self, id: &FolderId, state: FolderState) -> Result<()> {
        let n = self
            .client
            .execute(
                "UPDATE folders SET state = $1 WHERE folder_id = $2",
                &[&state.as_str(), &id.to_hex()],
            )
            .await?;
        if n == 0 {
            return Err(StoreError::NotFound {
                entity: "folder",
                key: id.to_hex(),
            });
        }
        Ok(())
    }

    async fn update_folder_stats(&self, id: &FolderId, stats: &FolderStats) -> Result<()> {
        self.client
            .execute(
                "UPDATE folders SET file_count = $1, segment_count = $2, total_size = $3, \
                 version = $4 WHERE folder_id = $5",
                &[
                    &(stats.file_count as i64),
                    &(stats.segment_count as i64),
                    &(stats.total_size as i64),
                    &(stats.version as i64),
                    &id.to_hex(),
                ],
            )
            .await?;
        Ok(())
    }

    async fn update_folder_key(&self, id: &FolderId, folder_key: &[u8; 32]) -> Result<()> {
        let n = self
            .client
            .execute(
                "UPDATE folders SET folder_key = $1 WHERE folder_id = $2",
                &[&folder_key.as_slice(), &id.to_hex()],
            )
            .await?;
        if n == 0 {
            return Err(StoreError::NotFound {
                entity: "folder",
                key: id.to_hex(),
            });
        }
        Ok(())
    }

    async fn insert_files(&self, files: &[NewFile]) -> Result<Vec<FileId>> {
        self.client.batch_execute("BEGIN").await?;
        let inserted = async {
            let statement = self
                .client
                .prepare(
                    "INSERT INTO files (folder_id, relative_path, size, content_hash, mtime, \
                     version, segment_count, state) VALUES ($1, $2, $3, $4, $5, $6, 0, $7) \
                     RETURNING file_id",
                )
                .await?;
            let mut ids = Vec::with_capacity(files.len());
            for file in files {
                let row = self
                    .client
                    .query_one(
                        &statement,
                        &[
                            &file.folder_id.to_hex(),
                            &file.relative_path,
                            &(file.size as i64),
                            &file.content_hash.to_hex(),
                            &(file.mtime as i64),
                            &(file.version as i64),
                            &file.state.as_str(),
                        ],
                    )
                    .await?;
                ids.push(FileId(row.get(0)));
            }
            self.client.batch_execute("COMMIT").await?;
            Ok::<_, tokio_postgres::Error>(ids)
        }
        .await;
        match inserted {
            Ok(ids) => Ok(ids),
            Err(err) => {
                let _ = self.client.batch_execute("ROLLBACK").await;
                Err(err.into())
            }
        }
    }

    async fn file(&self, id: FileId) -> Result<Option<FileRecord>> {
        self.query_opt(
            &format!("SELECT {FILE_COLS} FROM files WHERE file_id = $1"),
            &[&id.0],
        )
        .await?
        .map(|row| file_from(&row).into_file())
        .transpose()
    }

    async fn files_for_folder(&self, folder: &FolderId) -> Result<Vec<FileRecord>> {
        let cols = FILE_COLS.replace(", ", ", f.");
        self.query(
            &format!(
                "SELECT f.{cols} FROM files f JOIN (SELECT relative_path, MAX(version) AS v \
                 FROM files WHERE folder_id = $1 GROUP BY relative_path) latest \
                 ON f.relative_path = latest.relative_path AND f.version = latest.v \
                 WHERE f.folder_id = $1 ORDER BY f.relative_path"
            ),
            &[&folder.to_hex()],
        )
        .await?
        .iter()
        .map(|row| file_from(row).into_file())
        .collect()
    }

    async fn latest_file_version(
        &self,
        folder: &FolderId,
        relative_path: &str,
    ) -> Result<Option<FileRecord>> {
        self.query_opt(
            &format!(
                "SELECT {FILE_COLS} FROM files WHERE folder_id = $1 AND relative_path = $2 \
                 ORDER BY version DESC LIMIT 1"
            ),
            &[&folder.to_hex(), &relative_path],
        )
        .await?
        .map(|row| file_from(&row).into_file())
        .transpose()
    }

    async fn update_file_state(&self, id: FileId, state: FileState) -> Result<()> {
        self.client
            .execute(
                "UPDATE files SET state = $1 WHERE file_id = $2",
                &[&state.as_str(), &id.0],
            )
            .await?;
        Ok(())
    }

    async fn update_file_segment_count(&self, id: FileId, segment_count: u32) -> Result<()> {
        self.client
            .execute(
                "UPDATE files SET segment_count = $1 WHERE file_id = $2",
                &[&(segment_count as i64), &id.0],
            )
            .await?;
        Ok(())
    }

    async fn delete_file(&self, id: FileId) -> Result<()> {
        self.client.batch_execute("BEGIN").await?;
        let deleted = async {
            let folder: Option<String> = self
                .client
                .query_opt(
                    "SELECT folder_id FROM files WHERE file_id = $1",
                    &[&id.0],
                )
                .await?
                .map(|row| row.get(0));
            if let Some(folder) = &folder {
                self.client
                    .execute("DELETE FROM files WHERE file_id = $1", &[&id.0])
                    .await?;
                self.client
                    .execute(
                        "UPDATE shares SET state = 'invalid' WHERE folder_id = $1",
                        &[folder],
                    )
                    .await?;
            }
            self.client.batch_execute("COMMIT").await?;
            Ok::<_, tokio_postgres::Error>(folder)
        }
        .await;
        match deleted {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(StoreError::NotFound {
                entity: "file",
                key: id.0.to_string(),
            }),
            Err(err) => {
                let _ = self.client.batch_execute("ROLLBACK").await;
                Err(err.into())
            }
        }
    }

    async fn insert_segments(&self, segments: &[NewSegment]) -> Result<Vec<SegmentId>> {
        self.client.batch_execute("BEGIN").await?;
        let inserted = async {
            let statement = self
                .client
                .prepare(
                    "INSERT INTO segments (file_id, pack_id, idx, size, plaintext_hash, \
                     ciphertext_hash, redundancy_index, upload_state) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending') RETURNING segment_id",
                )
                .await?;
            let mut ids = Vec::with_capacity(segments.len());
            for seg in segments {
                let (file_id, pack_id) = match seg.owner {
                    SegmentOwner::File(f) => (Some(f.0), None),
                    SegmentOwner::Pack(p) => (None, Some(p.0)),
                };
                let row = self
                    .client
                    .query_one(
                        &statement,
                        &[
                            &file_id,
                            &pack_id,
                            &(seg.index as i64),
                            &(seg.size as i64),
                            &seg.plaintext_hash.to_hex(),
                            &seg.ciphertext_hash.to_hex(),
                            &(seg.redundancy_index as i64),
                        ],
                    )
                    .await?;
                ids.push(SegmentId(row.get(0)));
            }
            self.client.batch_execute("COMMIT").await?;
            Ok::<_, tokio_postgres::Error>(ids)
        }
        .await;
        match inserted {
            Ok(ids) => Ok(ids),
            Err(err) => {
                let _ = self.client.batch_execute("ROLLBACK").await;
                Err(err.into())
            }
        }
    }

    async fn segment(&self, id: SegmentId) -> Result<Option<SegmentRecord>> {
        self.query_opt(
            &format!("SELECT {SEGMENT_COLS} FROM segments WHERE segment_id = $1"),
            &[&id.0],
        )
        .await?
        .map(|row| segment_from(&row).into_segment())
        .transpose()
    }

    async fn segments_for_file(&self, file: FileId) -> Result<Vec<SegmentRecord>> {
        self.query(
            &format!(
                "SELECT {SEGMENT_COLS} FROM segments WHERE file_id = $1 \
                 ORDER BY idx, redundancy_index"
            ),
            &[&file.0],
        )
        .await?
        .iter()
        .map(|row| segment_from(row).into_segment())
        .collect()
    }

    async fn segments_for_pack(&self, pack: PackId) -> Result<Vec<SegmentRecord>> {
        self.query(
            &format!(
                "SELECT {SEGMENT_COLS} FROM segments WHERE pack_id = $1 \
                 ORDER BY idx, redundancy_index"
            ),
            &[&pack.0],
        )
        .await?
        .iter()
        .map(|row| segment_from(row).into_segment())
        .collect()
    }

    async fn segments_for_folder(&self, folder: &FolderId) -> Result<Vec<SegmentRecord>> {
        let cols = SEGMENT_COLS.replace(", ", ", s.");
        self.query(
            &format!(
                "SELECT s.{cols} FROM segments s \
                 LEFT JOIN files f ON s.file_id = f.file_id \
                 LEFT JOIN packs p ON s.pack_id = p.pack_id \
                 WHERE f.folder_id = $1 OR p.folder_id = $1 \
                 ORDER BY COALESCE(f.relative_path, ''), s.idx, s.redundancy_index"
            ),
            &[&folder.to_hex()],
        )
        .await?
        .iter()
        .map(|row| segment_from(row).into_segment())
        .collect()
    }

    async fn update_segment_payload_hash(
        &self,
        id: SegmentId,
        ciphertext_hash: &common::ContentHash,
    ) -> Result<()> {
        let n = self
            .client
            .execute(
                "UPDATE segments SET ciphertext_hash = $1 \
                 WHERE segment_id = $2 AND upload_state = 'pending'",
                &[&ciphertext_hash.to_hex(), &id.0],
            )
            .await?;
        if n == 0 {
            return Err(StoreError::Constraint(format!(
                "segment {} is not pending",
                id.0
            )));
        }
        Ok(())
    }

    async fn mark_segment_uploaded(
        &self,
        id: SegmentId,
        message_id: &MessageId,
        subject: &str,
    ) -> Result<()> {
        let n = self
            .client
            .execute(
                "UPDATE segments SET message_id = $1, obfuscated_subject = $2, \
                 upload_state = 'uploaded' WHERE segment_id = $3 AND message_id IS NULL",
                &[&message_id.as_str(), &subject, &id.0],
            )
            .await?;
        if n == 1 {
            return Ok(());
        }
        let existing = self
            .query_opt(
                "SELECT message_id FROM segments WHERE segment_id = $1",
                &[&id.0],
            )
            .await?;
        match existing {
            None => Err(StoreError::NotFound {
                entity: "segment",
                key: id.0.to_string(),
            }),
            Some(row) => {
                let current: Option<String> = row.get(0);
                if current.as_deref() == Some(message_id.as_str()) {
                    Ok(())
                } else {
                    Err(StoreError::Constraint(format!(
                        "segment {} already uploaded under a different message id",
                        id.0
                    )))
                }
            }
        }
    }

    async fn reset_folder_segments(&self, folder: &FolderId) -> Result<()> {
        let key = folder.to_hex();
        self.client.batch_execute("BEGIN").await?;
        let cleared = async {
            self.client
                .execute(
                    "DELETE FROM segments WHERE file_id IN \
                     (SELECT file_id FROM files WHERE folder_id = $1)",
                    &[&key],
                )
                .await?;
            self.client
                .execute(
                    "DELETE FROM segments WHERE pack_id IN \
                     (SELECT pack_id FROM packs WHERE folder_id = $1)",
                    &[&key],
                )
                .await?;
            self.client
                .execute("DELETE FROM packs WHERE folder_id = $1", &[&key])
                .await?;
            self.client.batch_execute("COMMIT").await?;
            Ok::<_, tokio_postgres::Error>(())
        }
        .await;
        if let Err(err) = cleared {
            let _ = self.client.batch_execute("ROLLBACK").await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn insert_pack(&self, pack: &NewPack) -> Result<PackId> {
        let members = serde_json::to_string(&pack.members)?;
        let row = self
            .client
            .query_one(
                "INSERT INTO packs (folder_id, segment_index, members) VALUES ($1, $2, $3) \
                 RETURNING pack_id",
                &[
                    &pack.folder_id.to_hex(),
                    &(pack.segment_index as i64),
                    &members,
                ],
            )
            .await?;
        Ok(PackId(row.get(0)))
    }

    async fn packs_for_folder(&self, folder: &FolderId) -> Result<Vec<PackRecord>> {
        self.query(
            "SELECT pack_id, folder_id, segment_index, members FROM packs \
             WHERE folder_id = $1 ORDER BY segment_index",
            &[&folder.to_hex()],
        )
        .await?
        .iter()
        .map(|row| {
            RawPack {
                pack_id: row.get(0),
                folder_id: row.get(1),
                segment_index: row.get(2),
                members: row.get(3),
            }
            .into_pack()
        })
        .collect()
    }

    async fn insert_share(&self, share: &ShareRecord) -> Result<()> {
        let refs = serde_json::to_string(
            &share
                .index_refs
                .iter()
                .map(|m| m.as_str().to_string())
                .collect::<Vec<_>>(),
        )?;
        self.client
            .execute(
                &format!(
                    "INSERT INTO shares ({SHARE_COLS}) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
                ),
                &[
                    &share.share_id,
                    &share.folder_id.to_hex(),
                    &access_type_str(share.access_type),
                    &share.wrapped_key_material,
                    &refs,
                    &share.expires_at.map(|v| v as i64),
                    &share.password_verifier,
                    &share_state_str(share.state),
                    &(share.created_at as i64),
                ],
            )
            .await?;
        Ok(())
    }

    async fn share(&self, share_id: &str) -> Result<Option<ShareRecord>> {
        self.query_opt(
            &format!("SELECT {SHARE_COLS} FROM shares WHERE share_id = $1"),
            &[&share_id],
        )
        .await?
        .map(|row| share_from(&row).into_share())
        .transpose()
    }

    async fn shares_for_folder(&self, folder: &FolderId) -> Result<Vec<ShareRecord>> {
        self.query(
            &format!("SELECT {SHARE_COLS} FROM shares WHERE folder_id = $1 ORDER BY created_at"),
            &[&folder.to_hex()],
        )
        .await?
        .iter()
        .map(|row| share_from(row).into_share())
        .collect()
    }

    async fn update_share_index_refs(&self, share_id: &str, refs: &[MessageId]) -> Result<()> {
        let encoded = serde_json::to_string(
            &refs.iter().map(|m| m.as_str().to_string()).collect::<Vec<_>>(),
        )?;
        let n = self
            .client
            .execute(
                "UPDATE shares SET index_refs = $1 WHERE share_id = $2",
                &[&encoded, &share_id],
            )
            .await?;
        if n == 0 {
            return Err(StoreError::NotFound {
                entity: "share",
                key: share_id.to_string(),
            });
        }
        Ok(())
    }

    async fn invalidate_shares_for_folder(&self, folder: &FolderId) -> Result<()> {
        self.client
            .execute(
                "UPDATE shares SET state = 'invalid' WHERE folder_id = $1",
                &[&folder.to_hex()],
            )
            .await?;
        Ok(())
    }

    async fn enqueue(&self, kind: QueueKind, item: &NewQueueItem) -> Result<ItemId> {
        let row = self
            .client
            .query_one(
                &format!(
                    "INSERT INTO {} (entity_ref, priority, state, bytes_total, updated_at) \
                     VALUES ($1, $2, 'queued', $3, $4) RETURNING item_id",
                    queue_table(kind)
                ),
                &[
                    &item.entity_ref,
                    &(item.priority as i64),
                    &(item.bytes_total as i64),
                    &(unix_now() as i64),
                ],
            )
            .await?;
        Ok(ItemId(row.get(0)))
    }

    async fn queue_item(&self, kind: QueueKind, id: ItemId) -> Result<Option<QueueItem>> {
        self.query_opt(
            &format!(
                "SELECT {ITEM_COLS} FROM {} WHERE item_id = $1",
                queue_table(kind)
            ),
            &[&id.0],
        )
        .await?
        .map(|row| item_from(&row).into_item(kind))
        .transpose()
    }

    async fn update_item_state(
        &self,
        kind: QueueKind,
        id: ItemId,
        state: ItemState,
        last_error: Option<&str>,
    ) -> Result<()> {
        let started = matches!(state, ItemState::Running);
        let n = self
            .client
            .execute(
                &format!(
                    "UPDATE {} SET state = $1, last_error = COALESCE($2, last_error), \
                     updated_at = $3, started_at = CASE WHEN $4 AND started_at IS NULL \
                     THEN $3 ELSE started_at END WHERE item_id = $5",
                    queue_table(kind)
                ),
                &[
                    &state.as_str(),
                    &last_error,
                    &(unix_now() as i64),
                    &started,
                    &id.0,
                ],
            )
            .await?;
        if n == 0 {
            return Err(StoreError::NotFound {
                entity: "queue item",
                key: id.0.to_string(),
            });
        }
        Ok(())
    }

    async fn bump_item_attempts(&self, kind: QueueKind, id: ItemId) -> Result<()> {
        self.client
            .execute(
                &format!(
                    "UPDATE {} SET attempts = attempts + 1, updated_at = $1 WHERE item_id = $2",
                    queue_table(kind)
                ),
                &[&(unix_now() as i64), &id.0],
            )
            .await?;
        Ok(())
    }

    async fn recompute_item_bytes(&self, kind: QueueKind, id: ItemId) -> Result<()> {
        self.client
            .execute(
                &format!(
                    "UPDATE {} SET bytes_done = (SELECT COALESCE(SUM(bytes_done), 0) \
                     FROM segment_progress WHERE queue = $1 AND item_id = $2), \
                     updated_at = $3 WHERE item_id = $2",
                    queue_table(kind)
                ),
                &[&kind.as_str(), &id.0, &(unix_now() as i64)],
            )
            .await?;
        Ok(())
    }

    async fn set_item_bytes_total(&self, kind: QueueKind, id: ItemId, total: u64) -> Result<()> {
        self.client
            .execute(
                &format!(
                    "UPDATE {} SET bytes_total = $1, updated_at = $2 WHERE item_id = $3",
                    queue_table(kind)
                ),
                &[&(total as i64), &(unix_now() as i64), &id.0],
            )
            .await?;
        Ok(())
    }

    async fn resumable_items(&self, kind: QueueKind) -> Result<Vec<QueueItem>> {
        self.query(
            &format!(
                "SELECT {ITEM_COLS} FROM {} WHERE state IN \
                 ('queued', 'running', 'paused', 'failed') ORDER BY priority DESC, item_id",
                queue_table(kind)
            ),
            &[],
        )
        .await?
        .iter()
        .map(|row| item_from(row).into_item(kind))
        .collect()
    }

    async fn upsert_progress(&self, kind: QueueKind, row: &SegmentProgress) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO segment_progress (queue, item_id, segment_index, state, bytes_done, \
                 server_message_id, attempts, last_error) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                 ON CONFLICT (queue, item_id, segment_index) DO UPDATE SET \
                 state = EXCLUDED.state, bytes_done = EXCLUDED.bytes_done, \
                 server_message_id = EXCLUDED.server_message_id, \
                 attempts = EXCLUDED.attempts, last_error = EXCLUDED.last_error",
                &[
                    &kind.as_str(),
                    &row.item_id.0,
                    &(row.segment_index as i64),
                    &row.state.as_str(),
                    &(row.bytes_done as i64),
                    &row.server_message_id.as_ref().map(|m| m.as_str().to_string()),
                    &(row.attempts as i64),
                    &row.last_error,
                ],
            )
            .await?;
        Ok(())
    }

    async fn progress_rows(&self, kind: QueueKind, item: ItemId) -> Result<Vec<SegmentProgress>> {
        self.query(
            "SELECT item_id, segment_index, state, bytes_done, server_message_id, attempts, \
             last_error FROM segment_progress WHERE queue = $1 AND item_id = $2 \
             ORDER BY segment_index",
            &[&kind.as_str(), &item.0],
        )
        .await?
        .iter()
        .map(|row| progress_from(row).into_progress())
        .collect()
    }

    async fn record_message(
        &self,
        message_id: &MessageId,
        segment: SegmentId,
        subject: &str,
    ) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO messages (message_id, segment_id, subject, posted_at) \
                 VALUES ($1, $2, $3, $4) ON CONFLICT (message_id) DO NOTHING",
                &[
                    &message_id.as_str(),
                    &segment.0,
                    &subject,
                    &(unix_now() as i64),
                ],
            )
            .await?;
        Ok(())
    }

    async fn segment_for_message(&self, message_id: &MessageId) -> Result<Option<SegmentId>> {
        Ok(self
            .query_opt(
                "SELECT segment_id FROM messages WHERE message_id = $1",
                &[&message_id.as_str()],
            )
            .await?
            .map(|row| SegmentId(row.get(0))))
    }
}
