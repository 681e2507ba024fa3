//! Schema migration ladder.
//!
//! Each step is idempotent DDL; the current step is persisted in the
//! `migrations` table so a restart re-applies nothing. Backends walk the
//! ladder at startup, inside one transaction per step.

/// One numbered schema step with per-backend DDL.
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub sqlite: &'static str,
    pub postgres: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "base schema",
        sqlite: r#"
CREATE TABLE IF NOT EXISTS users (
    user_id     TEXT PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    public_key  BLOB NOT NULL,
    api_key     TEXT NOT NULL,
    created_at  INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS folders (
    folder_id          TEXT PRIMARY KEY,
    path               TEXT NOT NULL,
    display_name       TEXT NOT NULL,
    owner              TEXT NOT NULL REFERENCES users(user_id),
    folder_key         BLOB NOT NULL,
    public_key         BLOB NOT NULL,
    private_key_sealed BLOB NOT NULL,
    state              TEXT NOT NULL,
    file_count         INTEGER NOT NULL DEFAULT 0,
    segment_count      INTEGER NOT NULL DEFAULT 0,
    total_size         INTEGER NOT NULL DEFAULT 0,
    version            INTEGER NOT NULL DEFAULT 0,
    created_at         INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS files (
    file_id       INTEGER PRIMARY KEY AUTOINCREMENT,
    folder_id     TEXT NOT NULL REFERENCES folders(folder_id) ON DELETE CASCADE,
    relative_path TEXT NOT NULL,
    size          INTEGER NOT NULL,
    content_hash  TEXT NOT NULL,
    mtime         INTEGER NOT NULL,
    version       INTEGER NOT NULL,
    segment_count INTEGER NOT NULL DEFAULT 0,
    state         TEXT NOT NULL,
    UNIQUE (folder_id, relative_path, version)
);
CREATE TABLE IF NOT EXISTS packs (
    pack_id       INTEGER PRIMARY KEY AUTOINCREMENT,
    folder_id     TEXT NOT NULL REFERENCES folders(folder_id) ON DELETE CASCADE,
    segment_index INTEGER NOT NULL,
    members       TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS segments (
    segment_id         INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id            INTEGER REFERENCES files(file_id) ON DELETE CASCADE,
    pack_id            INTEGER REFERENCES packs(pack_id) ON DELETE CASCADE,
    idx                INTEGER NOT NULL,
    size               INTEGER NOT NULL,
    plaintext_hash     TEXT NOT NULL,
    ciphertext_hash    TEXT NOT NULL,
    redundancy_index   INTEGER NOT NULL DEFAULT 0,
    message_id         TEXT,
    obfuscated_subject TEXT,
    upload_state       TEXT NOT NULL DEFAULT 'pending',
    CHECK ((file_id IS NULL) <> (pack_id IS NULL)),
    CHECK ((message_id IS NOT NULL) = (upload_state = 'uploaded'))
);
CREATE INDEX IF NOT EXISTS idx_segments_file ON segments(file_id, idx);
CREATE INDEX IF NOT EXISTS idx_segments_pack ON segments(pack_id, idx);
CREATE INDEX IF NOT EXISTS idx_segments_message ON segments(message_id);
CREATE TABLE IF NOT EXISTS shares (
    share_id             TEXT PRIMARY KEY,
    folder_id            TEXT NOT NULL REFERENCES folders(folder_id) ON DELETE CASCADE,
    access_type          TEXT NOT NULL,
    wrapped_key_material BLOB NOT NULL,
    index_refs           TEXT NOT NULL,
    expires_at           INTEGER,
    password_verifier    TEXT,
    state                TEXT NOT NULL,
    created_at           INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS upload_queue (
    item_id    INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_ref TEXT NOT NULL,
    priority   INTEGER NOT NULL DEFAULT 0,
    state      TEXT NOT NULL,
    attempts   INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    bytes_done INTEGER NOT NULL DEFAULT 0,
    bytes_total INTEGER NOT NULL DEFAULT 0,
    started_at INTEGER,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS download_queue (
    item_id    INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_ref TEXT NOT NULL,
    priority   INTEGER NOT NULL DEFAULT 0,
    state      TEXT NOT NULL,
    attempts   INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    bytes_done INTEGER NOT NULL DEFAULT 0,
    bytes_total INTEGER NOT NULL DEFAULT 0,
    started_at INTEGER,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS segment_progress (
    queue             TEXT NOT NULL,
    item_id           INTEGER NOT NULL,
    segment_index     INTEGER NOT NULL,
    state             TEXT NOT NULL,
    bytes_done        INTEGER NOT NULL DEFAULT 0,
    server_message_id TEXT,
    attempts          INTEGER NOT NULL DEFAULT 0,
    last_error        TEXT,
    PRIMARY KEY (queue, item_id, segment_index)
);
CREATE TABLE IF NOT EXISTS messages (
    message_id TEXT PRIMARY KEY,
    segment_id INTEGER NOT NULL REFERENCES segments(segment_id) ON DELETE CASCADE,
    subject    TEXT,
    posted_at  INTEGER NOT NULL
);
"#,
        postgres: r#"
CREATE TABLE IF NOT EXISTS users (
    user_id     TEXT PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    public_key  BYTEA NOT NULL,
    api_key     TEXT NOT NULL,
    created_at  BIGINT NOT NULL
);
CREATE TABLE IF NOT EXISTS folders (
    folder_id          TEXT PRIMARY KEY,
    path               TEXT NOT NULL,
    display_name       TEXT NOT NULL,
    owner              TEXT NOT NULL REFERENCES users(user_id),
    folder_key         BYTEA NOT NULL,
    public_key         BYTEA NOT NULL,
    private_key_sealed BYTEA NOT NULL,
    state              TEXT NOT NULL,
    file_count         BIGINT NOT NULL DEFAULT 0,
    segment_count      BIGINT NOT NULL DEFAULT 0,
    total_size         BIGINT NOT NULL DEFAULT 0,
    version            BIGINT NOT NULL DEFAULT 0,
    created_at         BIGINT NOT NULL
);
CREATE TABLE IF NOT EXISTS files (
    file_id       BIGSERIAL PRIMARY KEY,
    folder_id     TEXT NOT NULL REFERENCES folders(folder_id) ON DELETE CASCADE,
    relative_path TEXT NOT NULL,
    size          BIGINT NOT NULL,
    content_hash  TEXT NOT NULL,
    mtime         BIGINT NOT NULL,
    version       BIGINT NOT NULL,
    segment_count BIGINT NOT NULL DEFAULT 0,
    state         TEXT NOT NULL,
    UNIQUE (folder_id, relative_path, version)
);
CREATE TABLE IF NOT EXISTS packs (
    pack_id       BIGSERIAL PRIMARY KEY,
    folder_id     TEXT NOT NULL REFERENCES folders(folder_id) ON DELETE CASCADE,
    segment_index BIGINT NOT NULL,
    members       TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS segments (
    segment_id         BIGSERIAL PRIMARY KEY,
    file_id            BIGINT REFERENCES files(file_id) ON DELETE CASCADE,
    pack_id            BIGINT REFERENCES packs(pack_id) ON DELETE CASCADE,
    idx                BIGINT NOT NULL,
    size               BIGINT NOT NULL,
    plaintext_hash     TEXT NOT NULL,
    ciphertext_hash    TEXT NOT NULL,
    redundancy_index   BIGINT NOT NULL DEFAULT 0,
    message_id         TEXT,
    obfuscated_subject TEXT,
    upload_state       TEXT NOT NULL DEFAULT 'pending',
    CHECK ((file_id IS NULL) <> (pack_id IS NULL)),
    CHECK ((message_id IS NOT NULL) = (upload_state = 'uploaded'))
);
CREATE INDEX IF NOT EXISTS idx_segments_file ON segments(file_id, idx);
CREATE INDEX IF NOT EXISTS idx_segments_pack ON segments(pack_id, idx);
CREATE INDEX IF NOT EXISTS idx_segments_message ON segments(message_id);
CREATE TABLE IF NOT EXISTS shares (
    share_id             TEXT PRIMARY KEY,
    folder_id            TEXT NOT NULL REFERENCES folders(folder_id) ON DELETE CASCADE,
    access_type          TEXT NOT NULL,
    wrapped_key_material BYTEA NOT NULL,
    index_refs           TEXT NOT NULL,
    expires_at           BIGINT,
    password_verifier    TEXT,
    state                TEXT NOT NULL,
    created_at           BIGINT NOT NULL
);
CREATE TABLE IF NOT EXISTS upload_queue (
    item_id    BIGSERIAL PRIMARY KEY,
    entity_ref TEXT NOT NULL,
    priority   BIGINT NOT NULL DEFAULT 0,
    state      TEXT NOT NULL,
    attempts   BIGINT NOT NULL DEFAULT 0,
    last_error TEXT,
    bytes_done BIGINT NOT NULL DEFAULT 0,
    bytes_total BIGINT NOT NULL DEFAULT 0,
    started_at BIGINT,
    updated_at BIGINT NOT NULL
);
CREATE TABLE IF NOT EXISTS download_queue (
    item_id    BIGSERIAL PRIMARY KEY,
    entity_ref TEXT NOT NULL,
    priority   BIGINT NOT NULL DEFAULT 0,
    state      TEXT NOT NULL,
    attempts   BIGINT NOT NULL DEFAULT 0,
    last_error TEXT,
    bytes_done BIGINT NOT NULL DEFAULT 0,
    bytes_total BIGINT NOT NULL DEFAULT 0,
    started_at BIGINT,
    updated_at BIGINT NOT NULL
);
CREATE TABLE IF NOT EXISTS segment_progress (
    queue             TEXT NOT NULL,
    item_id           BIGINT NOT NULL,
    segment_index     BIGINT NOT NULL,
    state             TEXT NOT NULL,
    bytes_done        BIGINT NOT NULL DEFAULT 0,
    server_message_id TEXT,
    attempts          BIGINT NOT NULL DEFAULT 0,
    last_error        TEXT,
    PRIMARY KEY (queue, item_id, segment_index)
);
CREATE TABLE IF NOT EXISTS messages (
    message_id TEXT PRIMARY KEY,
    segment_id BIGINT NOT NULL REFERENCES segments(segment_id) ON DELETE CASCADE,
    subject    TEXT,
    posted_at  BIGINT NOT NULL
);
"#,
    },
    Migration {
        version: 2,
        name: "queue state index for resume scans",
        sqlite: r#"
CREATE INDEX IF NOT EXISTS idx_upload_queue_state ON upload_queue(state);
CREATE INDEX IF NOT EXISTS idx_download_queue_state ON download_queue(state);
"#,
        postgres: r#"
CREATE INDEX IF NOT EXISTS idx_upload_queue_state ON upload_queue(state);
CREATE INDEX IF NOT EXISTS idx_download_queue_state ON download_queue(state);
"#,
    },
];

pub const MIGRATIONS_TABLE_SQLITE: &str = r#"
CREATE TABLE IF NOT EXISTS migrations (
    version    INTEGER PRIMARY KEY,
    name       TEXT NOT NULL,
    applied_at INTEGER NOT NULL
);
"#;

pub const MIGRATIONS_TABLE_POSTGRES: &str = r#"
CREATE TABLE IF NOT EXISTS migrations (
    version    BIGINT PRIMARY KEY,
    name       TEXT NOT NULL,
    applied_at BIGINT NOT NULL
);
"#;
