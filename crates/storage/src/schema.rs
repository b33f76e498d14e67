use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA busy_timeout = 5000;
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA cache_size = -32000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS tasks (
    task_id BLOB PRIMARY KEY CHECK (length(task_id) = 16),
    owner_id BLOB NOT NULL CHECK (length(owner_id) = 16),
    title TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS versions (
    version_id BLOB PRIMARY KEY CHECK (length(version_id) = 16),
    task_id BLOB NOT NULL REFERENCES tasks (task_id),
    version_number INTEGER NOT NULL CHECK (version_number >= 0),
    content TEXT,
    blob_key TEXT,
    character_count INTEGER NOT NULL,
    word_count INTEGER NOT NULL,
    content_checksum BLOB NOT NULL CHECK (length(content_checksum) = 32),
    is_latest INTEGER NOT NULL DEFAULT 0 CHECK (is_latest IN (0, 1)),
    edited_by BLOB NOT NULL CHECK (length(edited_by) = 16),
    edit_reason TEXT,
    ip_address TEXT,
    user_agent TEXT,
    session_id TEXT,
    created_at INTEGER NOT NULL,
    CHECK (content IS NOT NULL OR blob_key IS NOT NULL),
    UNIQUE (task_id, version_number)
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_versions_one_latest ON versions (task_id) WHERE is_latest = 1;
CREATE INDEX IF NOT EXISTS idx_versions_session ON versions (session_id, created_at) WHERE session_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS edit_sessions (
    session_id TEXT PRIMARY KEY,
    task_id BLOB NOT NULL REFERENCES tasks (task_id),
    user_id BLOB NOT NULL CHECK (length(user_id) = 16),
    username TEXT NOT NULL,
    access_reason TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    last_activity_at INTEGER,
    ended_at INTEGER,
    outcome TEXT CHECK (outcome IS NULL OR outcome IN ('completed', 'published', 'cancelled', 'timeout')),
    autosave_count INTEGER NOT NULL DEFAULT 0,
    total_characters_changed INTEGER NOT NULL DEFAULT 0,
    total_words_changed INTEGER NOT NULL DEFAULT 0,
    published_version_id BLOB CHECK (published_version_id IS NULL OR length(published_version_id) = 16),
    CHECK ((ended_at IS NULL) = (outcome IS NULL)),
    CHECK (published_version_id IS NULL OR outcome = 'published')
);
CREATE INDEX IF NOT EXISTS idx_sessions_open ON edit_sessions (last_activity_at, started_at) WHERE ended_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_sessions_task ON edit_sessions (task_id, started_at);

CREATE TABLE IF NOT EXISTS drafts (
    draft_id BLOB PRIMARY KEY CHECK (length(draft_id) = 16),
    task_id BLOB NOT NULL REFERENCES tasks (task_id),
    user_id BLOB NOT NULL CHECK (length(user_id) = 16),
    content TEXT NOT NULL,
    blob_key TEXT,
    character_count INTEGER NOT NULL,
    word_count INTEGER NOT NULL,
    content_checksum BLOB NOT NULL CHECK (length(content_checksum) = 32),
    autosave_count INTEGER NOT NULL DEFAULT 1,
    last_autosaved_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE (task_id, user_id)
);
CREATE INDEX IF NOT EXISTS idx_drafts_expiry ON drafts (expires_at);
";
