use std::path::Path;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use folio_core::{
    access::AccessReason,
    clock::Timestamp,
    ids::*,
    metrics::ContentMetrics,
    outcome::SessionOutcome,
};

use crate::error::StorageError;
use crate::traits::*;

const VERSION_COLUMNS: &str = "version_id, task_id, version_number, content, blob_key, character_count, word_count, content_checksum, is_latest, edited_by, edit_reason, ip_address, user_agent, session_id, created_at";

const SESSION_COLUMNS: &str = "session_id, task_id, user_id, username, access_reason, started_at, last_activity_at, ended_at, outcome, autosave_count, total_characters_changed, total_words_changed, published_version_id";

const DRAFT_COLUMNS: &str = "draft_id, task_id, user_id, content, blob_key, character_count, word_count, content_checksum, autosave_count, last_autosaved_at, expires_at, created_at";

pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Raw connection, for diagnostics and invariant checks.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

/// Wrapper error type used to tunnel decoding failures through rusqlite's error
/// system in row-mapping closures that must return rusqlite::Error.
#[derive(Debug)]
struct OpaqueStorageError(String);

impl std::fmt::Display for OpaqueStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for OpaqueStorageError {}

fn decode_err(idx: usize, ty: rusqlite::types::Type, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(OpaqueStorageError(msg)))
}

/// Read a fixed-size BLOB column.
fn fixed<const N: usize>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<[u8; N]> {
    let bytes: Vec<u8> = row.get(idx)?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| {
        decode_err(
            idx,
            rusqlite::types::Type::Blob,
            format!("expected {N} bytes, got {len}"),
        )
    })
}

fn opt_fixed<const N: usize>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<[u8; N]>> {
    let bytes: Option<Vec<u8>> = row.get(idx)?;
    bytes
        .map(|b| {
            let len = b.len();
            b.try_into().map_err(|_| {
                decode_err(
                    idx,
                    rusqlite::types::Type::Blob,
                    format!("expected {N} bytes, got {len}"),
                )
            })
        })
        .transpose()
}

fn count(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<u64> {
    let v: i64 = row.get(idx)?;
    u64::try_from(v).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, v))
}

fn timestamp(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Timestamp> {
    Ok(Timestamp::from_millis(row.get(idx)?))
}

fn opt_timestamp(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<Timestamp>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(Timestamp::from_millis))
}

fn session_id(raw: String, idx: usize) -> rusqlite::Result<SessionId> {
    SessionId::parse(raw).map_err(|e| decode_err(idx, rusqlite::types::Type::Text, e.to_string()))
}

fn read_version(row: &rusqlite::Row) -> rusqlite::Result<VersionRecord> {
    let session: Option<String> = row.get(13)?;
    Ok(VersionRecord {
        version_id: VersionId::from_bytes(fixed::<16>(row, 0)?),
        task_id: TaskId::from_bytes(fixed::<16>(row, 1)?),
        version_number: row.get(2)?,
        content: row.get(3)?,
        blob_key: row.get(4)?,
        metrics: ContentMetrics {
            character_count: count(row, 5)?,
            word_count: count(row, 6)?,
            checksum: ContentChecksum::from_bytes(fixed::<32>(row, 7)?),
        },
        is_latest: row.get(8)?,
        provenance: Provenance {
            edited_by: UserId::from_bytes(fixed::<16>(row, 9)?),
            edit_reason: row.get(10)?,
            ip_address: row.get(11)?,
            user_agent: row.get(12)?,
        },
        session_id: session.map(|s| session_id(s, 13)).transpose()?,
        created_at: timestamp(row, 14)?,
    })
}

fn read_session(row: &rusqlite::Row) -> rusqlite::Result<SessionRecord> {
    let ended_at = opt_timestamp(row, 7)?;
    let outcome: Option<String> = row.get(8)?;
    let published = opt_fixed::<16>(row, 12)?.map(VersionId::from_bytes);

    let state = match (ended_at, outcome) {
        (None, None) => SessionState::Open,
        (Some(ended_at), Some(raw)) => SessionState::Closed {
            ended_at,
            outcome: SessionOutcome::parse(&raw)
                .map_err(|e| decode_err(8, rusqlite::types::Type::Text, e.to_string()))?,
            published_version_id: published,
        },
        _ => {
            return Err(decode_err(
                7,
                rusqlite::types::Type::Integer,
                "ended_at and outcome must be set together".into(),
            ));
        }
    };

    let reason: String = row.get(4)?;
    Ok(SessionRecord {
        session_id: session_id(row.get(0)?, 0)?,
        task_id: TaskId::from_bytes(fixed::<16>(row, 1)?),
        user_id: UserId::from_bytes(fixed::<16>(row, 2)?),
        username: row.get(3)?,
        access_reason: AccessReason::parse(&reason),
        started_at: timestamp(row, 5)?,
        last_activity_at: opt_timestamp(row, 6)?,
        state,
        autosave_count: count(row, 9)?,
        total_characters_changed: count(row, 10)?,
        total_words_changed: count(row, 11)?,
    })
}

fn read_draft(row: &rusqlite::Row) -> rusqlite::Result<DraftRecord> {
    Ok(DraftRecord {
        draft_id: DraftId::from_bytes(fixed::<16>(row, 0)?),
        task_id: TaskId::from_bytes(fixed::<16>(row, 1)?),
        user_id: UserId::from_bytes(fixed::<16>(row, 2)?),
        content: row.get(3)?,
        blob_key: row.get(4)?,
        metrics: ContentMetrics {
            character_count: count(row, 5)?,
            word_count: count(row, 6)?,
            checksum: ContentChecksum::from_bytes(fixed::<32>(row, 7)?),
        },
        autosave_count: count(row, 8)?,
        last_autosaved_at: timestamp(row, 9)?,
        expires_at: timestamp(row, 10)?,
        created_at: timestamp(row, 11)?,
    })
}

fn require_task(conn: &Connection, task_id: TaskId) -> Result<(), StorageError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM tasks WHERE task_id = ?1)",
        params![task_id.as_bytes().as_slice()],
        |row| row.get(0),
    )?;
    if exists {
        Ok(())
    } else {
        Err(StorageError::NotFound(format!("task {task_id}")))
    }
}

fn next_number(conn: &Connection, task_id: TaskId) -> Result<u32, StorageError> {
    let next: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version_number) + 1, 0) FROM versions WHERE task_id = ?1",
        params![task_id.as_bytes().as_slice()],
        |row| row.get(0),
    )?;
    u32::try_from(next)
        .map_err(|_| StorageError::Serialization(format!("version number {next} out of range")))
}

fn select_version(conn: &Connection, version_id: VersionId) -> Result<Option<VersionRecord>, StorageError> {
    let sql = format!("SELECT {VERSION_COLUMNS} FROM versions WHERE version_id = ?1");
    Ok(conn
        .query_row(&sql, params![version_id.as_bytes().as_slice()], read_version)
        .optional()?)
}

fn select_session(conn: &Connection, session_id: &SessionId) -> Result<Option<SessionRecord>, StorageError> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM edit_sessions WHERE session_id = ?1");
    Ok(conn
        .query_row(&sql, params![session_id.as_str()], read_session)
        .optional()?)
}

fn select_draft(conn: &Connection, draft_id: DraftId) -> Result<Option<DraftRecord>, StorageError> {
    let sql = format!("SELECT {DRAFT_COLUMNS} FROM drafts WHERE draft_id = ?1");
    Ok(conn
        .query_row(&sql, params![draft_id.as_bytes().as_slice()], read_draft)
        .optional()?)
}

/// Explain why a guarded session UPDATE touched no rows.
fn session_miss(conn: &Connection, session_id: &SessionId) -> StorageError {
    match select_session(conn, session_id) {
        Ok(None) => StorageError::NotFound(format!("session {session_id}")),
        Ok(Some(s)) if s.is_open() => StorageError::SessionActive {
            session_id: session_id.to_string(),
        },
        Ok(Some(_)) => StorageError::AlreadyClosed {
            session_id: session_id.to_string(),
        },
        Err(e) => e,
    }
}

/// Demote the current latest version of the task and insert `record` as the new latest.
/// Caller must hold a write transaction.
fn insert_latest_version(conn: &Connection, record: &VersionRecord) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE versions SET is_latest = 0 WHERE task_id = ?1 AND is_latest = 1",
        params![record.task_id.as_bytes().as_slice()],
    )?;

    let result = conn.execute(
        &format!(
            "INSERT INTO versions ({VERSION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?10, ?11, ?12, ?13, ?14)"
        ),
        params![
            record.version_id.as_bytes().as_slice(),
            record.task_id.as_bytes().as_slice(),
            record.version_number,
            record.content,
            record.blob_key,
            record.metrics.character_count as i64,
            record.metrics.word_count as i64,
            record.metrics.checksum.as_bytes().as_slice(),
            record.provenance.edited_by.as_bytes().as_slice(),
            record.provenance.edit_reason,
            record.provenance.ip_address,
            record.provenance.user_agent,
            record.session_id.as_ref().map(|s| s.as_str()),
            record.created_at.as_millis(),
        ],
    );
    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, msg))
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            Err(StorageError::ConcurrencyConflict {
                task_id: record.task_id.to_string(),
                detail: msg.unwrap_or_else(|| format!("version {} taken", record.version_number)),
            })
        }
        Err(e) => Err(StorageError::Sqlite(e)),
    }
}

impl Storage for SqliteStorage {
    fn insert_task(&mut self, task: &TaskRecord) -> Result<(), StorageError> {
        let result = self.conn.execute(
            "INSERT INTO tasks (task_id, owner_id, title, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                task.task_id.as_bytes().as_slice(),
                task.owner_id.as_bytes().as_slice(),
                task.title,
                task.created_at.as_millis(),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StorageError::ConstraintViolation(format!(
                    "task {} already exists",
                    task.task_id
                )))
            }
            Err(e) => Err(StorageError::Sqlite(e)),
        }
    }

    fn get_task(&self, task_id: TaskId) -> Result<Option<TaskRecord>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT task_id, owner_id, title, created_at FROM tasks WHERE task_id = ?1",
                params![task_id.as_bytes().as_slice()],
                |row| {
                    Ok(TaskRecord {
                        task_id: TaskId::from_bytes(fixed::<16>(row, 0)?),
                        owner_id: UserId::from_bytes(fixed::<16>(row, 1)?),
                        title: row.get(2)?,
                        created_at: timestamp(row, 3)?,
                    })
                },
            )
            .optional()?)
    }

    fn next_version_number(&self, task_id: TaskId) -> Result<u32, StorageError> {
        next_number(&self.conn, task_id)
    }

    fn create_version(&mut self, new: &NewVersion) -> Result<VersionRecord, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        require_task(&tx, new.task_id)?;

        let record = VersionRecord {
            version_id: VersionId::new(),
            task_id: new.task_id,
            version_number: next_number(&tx, new.task_id)?,
            content: Some(new.content.clone()),
            blob_key: None,
            metrics: new.metrics,
            is_latest: true,
            provenance: new.provenance.clone(),
            session_id: new.session_id.clone(),
            created_at: new.created_at,
        };
        insert_latest_version(&tx, &record)?;

        tx.commit()?;
        tracing::debug!(
            task_id = %record.task_id,
            version_number = record.version_number,
            "version created"
        );
        Ok(record)
    }

    fn update_version_content(
        &mut self,
        version_id: VersionId,
        content: &str,
        metrics: &ContentMetrics,
    ) -> Result<VersionRecord, StorageError> {
        // Any archived copy no longer matches, so the blob reference is dropped.
        let changed = self.conn.execute(
            "UPDATE versions SET content = ?1, blob_key = NULL, character_count = ?2, word_count = ?3, content_checksum = ?4 WHERE version_id = ?5",
            params![
                content,
                metrics.character_count as i64,
                metrics.word_count as i64,
                metrics.checksum.as_bytes().as_slice(),
                version_id.as_bytes().as_slice(),
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("version {version_id}")));
        }
        select_version(&self.conn, version_id)?
            .ok_or_else(|| StorageError::NotFound(format!("version {version_id}")))
    }

    fn get_version(&self, version_id: VersionId) -> Result<Option<VersionRecord>, StorageError> {
        select_version(&self.conn, version_id)
    }

    fn get_latest_version(&self, task_id: TaskId) -> Result<Option<VersionRecord>, StorageError> {
        let sql = format!("SELECT {VERSION_COLUMNS} FROM versions WHERE task_id = ?1 AND is_latest = 1");
        Ok(self
            .conn
            .query_row(&sql, params![task_id.as_bytes().as_slice()], read_version)
            .optional()?)
    }

    fn get_latest_version_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<VersionRecord>, StorageError> {
        let sql = format!(
            "SELECT {VERSION_COLUMNS} FROM versions WHERE session_id = ?1 ORDER BY created_at DESC, version_number DESC LIMIT 1"
        );
        Ok(self
            .conn
            .query_row(&sql, params![session_id.as_str()], read_version)
            .optional()?)
    }

    fn list_versions(
        &self,
        task_id: TaskId,
        before: Option<u32>,
        limit: usize,
    ) -> Result<Vec<VersionRecord>, StorageError> {
        let sql = format!(
            "SELECT {VERSION_COLUMNS} FROM versions WHERE task_id = ?1 AND version_number < ?2 ORDER BY version_number DESC LIMIT ?3"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let versions = stmt
            .query_map(
                params![
                    task_id.as_bytes().as_slice(),
                    before.map(i64::from).unwrap_or(i64::MAX),
                    i64::try_from(limit).unwrap_or(i64::MAX),
                ],
                read_version,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(versions)
    }

    fn attach_blob_key(&mut self, version_id: VersionId, blob_key: &str) -> Result<(), StorageError> {
        let changed = self.conn.execute(
            "UPDATE versions SET blob_key = ?1 WHERE version_id = ?2",
            params![blob_key, version_id.as_bytes().as_slice()],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("version {version_id}")));
        }
        Ok(())
    }

    fn create_or_get_session(
        &mut self,
        new: &NewSession,
    ) -> Result<(SessionRecord, bool), StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        require_task(&tx, new.task_id)?;

        let inserted = tx.execute(
            "INSERT INTO edit_sessions (session_id, task_id, user_id, username, access_reason, started_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(session_id) DO NOTHING",
            params![
                new.session_id.as_str(),
                new.task_id.as_bytes().as_slice(),
                new.user_id.as_bytes().as_slice(),
                new.username,
                new.access_reason.as_str(),
                new.started_at.as_millis(),
            ],
        )?;
        let session = select_session(&tx, &new.session_id)?
            .ok_or_else(|| StorageError::NotFound(format!("session {}", new.session_id)))?;

        tx.commit()?;
        Ok((session, inserted == 1))
    }

    fn get_session(&self, session_id: &SessionId) -> Result<Option<SessionRecord>, StorageError> {
        select_session(&self.conn, session_id)
    }

    fn record_autosave(
        &mut self,
        session_id: &SessionId,
        totals: AutosaveTotals,
        at: Timestamp,
    ) -> Result<SessionRecord, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE edit_sessions SET autosave_count = autosave_count + 1, total_characters_changed = ?1, total_words_changed = ?2,
                 last_activity_at = MAX(COALESCE(last_activity_at, ?3), ?3)
             WHERE session_id = ?4 AND ended_at IS NULL",
            params![
                totals.characters as i64,
                totals.words as i64,
                at.as_millis(),
                session_id.as_str(),
            ],
        )?;
        if changed == 0 {
            return Err(session_miss(&tx, session_id));
        }
        let session = select_session(&tx, session_id)?
            .ok_or_else(|| StorageError::NotFound(format!("session {session_id}")))?;
        tx.commit()?;
        Ok(session)
    }

    fn close_session(
        &mut self,
        session_id: &SessionId,
        outcome: SessionOutcome,
        ended_at: Timestamp,
        published_version_id: Option<VersionId>,
    ) -> Result<SessionRecord, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE edit_sessions SET ended_at = ?1, outcome = ?2, published_version_id = ?3
             WHERE session_id = ?4 AND ended_at IS NULL",
            params![
                ended_at.as_millis(),
                outcome.as_str(),
                published_version_id.as_ref().map(|v| v.as_bytes().as_slice()),
                session_id.as_str(),
            ],
        )?;
        if changed == 0 {
            return Err(session_miss(&tx, session_id));
        }
        let session = select_session(&tx, session_id)?
            .ok_or_else(|| StorageError::NotFound(format!("session {session_id}")))?;
        tx.commit()?;
        Ok(session)
    }

    fn timeout_session(
        &mut self,
        session_id: &SessionId,
        cutoff: Timestamp,
        timeout_ms: i64,
    ) -> Result<SessionRecord, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE edit_sessions SET ended_at = COALESCE(last_activity_at, started_at) + ?1, outcome = 'timeout'
             WHERE session_id = ?2 AND ended_at IS NULL AND COALESCE(last_activity_at, started_at) <= ?3",
            params![timeout_ms, session_id.as_str(), cutoff.as_millis()],
        )?;
        if changed == 0 {
            return Err(session_miss(&tx, session_id));
        }
        let session = select_session(&tx, session_id)?
            .ok_or_else(|| StorageError::NotFound(format!("session {session_id}")))?;
        tx.commit()?;
        Ok(session)
    }

    fn find_orphaned_sessions(&self, cutoff: Timestamp) -> Result<Vec<SessionRecord>, StorageError> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM edit_sessions
             WHERE ended_at IS NULL
               AND ((last_activity_at IS NOT NULL AND last_activity_at <= ?1)
                 OR (last_activity_at IS NULL AND started_at <= ?1))
             ORDER BY started_at"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let sessions = stmt
            .query_map(params![cutoff.as_millis()], read_session)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    fn list_sessions_for_task(&self, task_id: TaskId) -> Result<Vec<SessionRecord>, StorageError> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM edit_sessions WHERE task_id = ?1 ORDER BY started_at, session_id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let sessions = stmt
            .query_map(params![task_id.as_bytes().as_slice()], read_session)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    fn upsert_draft(&mut self, upsert: &DraftUpsert) -> Result<DraftRecord, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        require_task(&tx, upsert.task_id)?;

        // An expired draft that the sweep has not reached yet starts over.
        tx.execute(
            "DELETE FROM drafts WHERE task_id = ?1 AND user_id = ?2 AND expires_at <= ?3",
            params![
                upsert.task_id.as_bytes().as_slice(),
                upsert.user_id.as_bytes().as_slice(),
                upsert.saved_at.as_millis(),
            ],
        )?;
        tx.execute(
            &format!(
                "INSERT INTO drafts ({DRAFT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?10, ?9)
                 ON CONFLICT(task_id, user_id) DO UPDATE SET
                     content = excluded.content,
                     blob_key = excluded.blob_key,
                     character_count = excluded.character_count,
                     word_count = excluded.word_count,
                     content_checksum = excluded.content_checksum,
                     autosave_count = drafts.autosave_count + 1,
                     last_autosaved_at = excluded.last_autosaved_at,
                     expires_at = excluded.expires_at"
            ),
            params![
                DraftId::new().as_bytes().as_slice(),
                upsert.task_id.as_bytes().as_slice(),
                upsert.user_id.as_bytes().as_slice(),
                upsert.content,
                upsert.blob_key,
                upsert.metrics.character_count as i64,
                upsert.metrics.word_count as i64,
                upsert.metrics.checksum.as_bytes().as_slice(),
                upsert.saved_at.as_millis(),
                upsert.expires_at.as_millis(),
            ],
        )?;

        let sql = format!("SELECT {DRAFT_COLUMNS} FROM drafts WHERE task_id = ?1 AND user_id = ?2");
        let draft = tx.query_row(
            &sql,
            params![
                upsert.task_id.as_bytes().as_slice(),
                upsert.user_id.as_bytes().as_slice(),
            ],
            read_draft,
        )?;
        tx.commit()?;
        Ok(draft)
    }

    fn get_draft(&self, task_id: TaskId, user_id: UserId) -> Result<Option<DraftRecord>, StorageError> {
        let sql = format!("SELECT {DRAFT_COLUMNS} FROM drafts WHERE task_id = ?1 AND user_id = ?2");
        Ok(self
            .conn
            .query_row(
                &sql,
                params![task_id.as_bytes().as_slice(), user_id.as_bytes().as_slice()],
                read_draft,
            )
            .optional()?)
    }

    fn publish_draft(
        &mut self,
        draft_id: DraftId,
        publish: &DraftPublish,
    ) -> Result<VersionRecord, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let draft = select_draft(&tx, draft_id)?
            .ok_or_else(|| StorageError::NotFound(format!("draft {draft_id}")))?;
        require_task(&tx, draft.task_id)?;

        let record = VersionRecord {
            version_id: VersionId::new(),
            task_id: draft.task_id,
            version_number: next_number(&tx, draft.task_id)?,
            content: Some(draft.content),
            blob_key: None,
            metrics: draft.metrics,
            is_latest: true,
            provenance: Provenance {
                edited_by: draft.user_id,
                edit_reason: publish.edit_reason.clone(),
                ip_address: None,
                user_agent: None,
            },
            session_id: None,
            created_at: publish.published_at,
        };
        insert_latest_version(&tx, &record)?;
        tx.execute(
            "DELETE FROM drafts WHERE draft_id = ?1",
            params![draft_id.as_bytes().as_slice()],
        )?;

        tx.commit()?;
        Ok(record)
    }

    fn delete_draft(&mut self, draft_id: DraftId) -> Result<DraftRecord, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let draft = select_draft(&tx, draft_id)?
            .ok_or_else(|| StorageError::NotFound(format!("draft {draft_id}")))?;
        tx.execute(
            "DELETE FROM drafts WHERE draft_id = ?1",
            params![draft_id.as_bytes().as_slice()],
        )?;
        tx.commit()?;
        Ok(draft)
    }

    fn delete_expired_drafts(&mut self, now: Timestamp) -> Result<Vec<DraftRecord>, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let expired = {
            let sql = format!("SELECT {DRAFT_COLUMNS} FROM drafts WHERE expires_at <= ?1");
            let mut stmt = tx.prepare(&sql)?;
            stmt.query_map(params![now.as_millis()], read_draft)?
                .collect::<Result<Vec<_>, _>>()?
        };
        tx.execute(
            "DELETE FROM drafts WHERE expires_at <= ?1",
            params![now.as_millis()],
        )?;
        tx.commit()?;
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage_with_task() -> (SqliteStorage, TaskId, UserId) {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let owner = UserId::new();
        let task_id = TaskId::new();
        storage
            .insert_task(&TaskRecord {
                task_id,
                owner_id: owner,
                title: "invoice.pdf".into(),
                created_at: Timestamp::from_secs(1),
            })
            .unwrap();
        (storage, task_id, owner)
    }

    fn new_version(task_id: TaskId, user: UserId, session: Option<&str>, content: &str, at: i64) -> NewVersion {
        NewVersion {
            task_id,
            session_id: session.map(|s| SessionId::parse(s).unwrap()),
            content: content.to_string(),
            metrics: ContentMetrics::compute(content),
            provenance: Provenance::user(user),
            created_at: Timestamp::from_secs(at),
        }
    }

    fn latest_count(storage: &SqliteStorage, task_id: TaskId) -> i64 {
        storage
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM versions WHERE task_id = ?1 AND is_latest = 1",
                params![task_id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .unwrap()
    }

    #[test]
    fn numbering_starts_at_zero_and_moves_latest() {
        let (mut storage, task_id, user) = storage_with_task();
        assert_eq!(storage.next_version_number(task_id).unwrap(), 0);
        assert!(storage.get_latest_version(task_id).unwrap().is_none());

        let v0 = storage.create_version(&new_version(task_id, user, Some("s1"), "a", 0)).unwrap();
        let v1 = storage.create_version(&new_version(task_id, user, Some("s1"), "b", 10)).unwrap();
        assert_eq!(v0.version_number, 0);
        assert_eq!(v1.version_number, 1);
        assert_eq!(latest_count(&storage, task_id), 1);

        let latest = storage.get_latest_version(task_id).unwrap().unwrap();
        assert_eq!(latest.version_id, v1.version_id);
        assert!(!storage.get_version(v0.version_id).unwrap().unwrap().is_latest);
    }

    #[test]
    fn create_version_requires_task() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let err = storage
            .create_version(&new_version(TaskId::new(), UserId::new(), None, "x", 0))
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)), "got {err:?}");
    }

    #[test]
    fn update_in_place_keeps_number_and_drops_blob_key() {
        let (mut storage, task_id, user) = storage_with_task();
        let v0 = storage.create_version(&new_version(task_id, user, Some("s1"), "Hello", 0)).unwrap();
        storage.attach_blob_key(v0.version_id, "versions/x").unwrap();

        let metrics = ContentMetrics::compute("Hello world");
        let updated = storage
            .update_version_content(v0.version_id, "Hello world", &metrics)
            .unwrap();
        assert_eq!(updated.version_number, 0);
        assert!(updated.is_latest);
        assert_eq!(updated.content.as_deref(), Some("Hello world"));
        assert_eq!(updated.metrics, metrics);
        assert_eq!(updated.blob_key, None);
        assert_eq!(updated.created_at, v0.created_at);

        let err = storage
            .update_version_content(VersionId::new(), "x", &metrics)
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn session_lookup_is_per_session() {
        let (mut storage, task_id, user) = storage_with_task();
        let a = storage.create_version(&new_version(task_id, user, Some("s1"), "a", 0)).unwrap();
        let b = storage.create_version(&new_version(task_id, user, Some("s2"), "b", 5)).unwrap();

        let s1 = SessionId::parse("s1").unwrap();
        let s2 = SessionId::parse("s2").unwrap();
        assert_eq!(storage.get_latest_version_for_session(&s1).unwrap().unwrap().version_id, a.version_id);
        assert_eq!(storage.get_latest_version_for_session(&s2).unwrap().unwrap().version_id, b.version_id);
        assert!(storage
            .get_latest_version_for_session(&SessionId::parse("s3").unwrap())
            .unwrap()
            .is_none());
    }

    #[test]
    fn list_versions_pages_newest_first() {
        let (mut storage, task_id, user) = storage_with_task();
        for i in 0..5 {
            storage.create_version(&new_version(task_id, user, None, "x", i)).unwrap();
        }
        let first = storage.list_versions(task_id, None, 2).unwrap();
        assert_eq!(first.iter().map(|v| v.version_number).collect::<Vec<_>>(), vec![4, 3]);
        let second = storage.list_versions(task_id, Some(3), 2).unwrap();
        assert_eq!(second.iter().map(|v| v.version_number).collect::<Vec<_>>(), vec![2, 1]);
        let last = storage.list_versions(task_id, Some(1), 2).unwrap();
        assert_eq!(last.iter().map(|v| v.version_number).collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn session_close_first_wins() {
        let (mut storage, task_id, user) = storage_with_task();
        let sid = SessionId::parse("tab-1").unwrap();
        let new = NewSession {
            session_id: sid.clone(),
            task_id,
            user_id: user,
            username: "ana".into(),
            access_reason: AccessReason::Owner,
            started_at: Timestamp::from_secs(0),
        };
        let (created, inserted) = storage.create_or_get_session(&new).unwrap();
        assert!(inserted);
        assert!(created.is_open());

        let (again, inserted) = storage.create_or_get_session(&new).unwrap();
        assert!(!inserted);
        assert_eq!(again, created);

        let closed = storage
            .close_session(&sid, SessionOutcome::Cancelled, Timestamp::from_secs(30), None)
            .unwrap();
        assert_eq!(closed.outcome(), Some(SessionOutcome::Cancelled));

        let err = storage
            .close_session(&sid, SessionOutcome::Completed, Timestamp::from_secs(40), None)
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyClosed { .. }), "got {err:?}");
        let still = storage.get_session(&sid).unwrap().unwrap();
        assert_eq!(still.outcome(), Some(SessionOutcome::Cancelled));
        assert_eq!(still.ended_at(), Some(Timestamp::from_secs(30)));

        let err = storage
            .record_autosave(&sid, AutosaveTotals { characters: 1, words: 1 }, Timestamp::from_secs(50))
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyClosed { .. }));
    }

    #[test]
    fn drafts_upsert_per_user_and_publish() {
        let (mut storage, task_id, user) = storage_with_task();
        let upsert = |content: &str, at: i64| DraftUpsert {
            task_id,
            user_id: user,
            content: content.to_string(),
            blob_key: Some("drafts/k".into()),
            metrics: ContentMetrics::compute(content),
            saved_at: Timestamp::from_secs(at),
            expires_at: Timestamp::from_secs(at + 100),
        };
        let first = storage.upsert_draft(&upsert("one", 0)).unwrap();
        let second = storage.upsert_draft(&upsert("one two", 10)).unwrap();
        assert_eq!(first.draft_id, second.draft_id);
        assert_eq!(second.autosave_count, 2);
        assert_eq!(second.content, "one two");
        assert_eq!(second.created_at, Timestamp::from_secs(0));

        let version = storage
            .publish_draft(
                second.draft_id,
                &DraftPublish {
                    edit_reason: Some("final".into()),
                    published_at: Timestamp::from_secs(20),
                },
            )
            .unwrap();
        assert_eq!(version.version_number, 0);
        assert!(version.is_latest);
        assert_eq!(version.content.as_deref(), Some("one two"));
        assert_eq!(version.blob_key, None);
        assert_eq!(version.provenance.edit_reason.as_deref(), Some("final"));
        assert!(storage.get_draft(task_id, user).unwrap().is_none());

        let err = storage
            .publish_draft(
                second.draft_id,
                &DraftPublish {
                    edit_reason: None,
                    published_at: Timestamp::from_secs(30),
                },
            )
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn file_backed_storage_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("folio.db");
        let task_id = TaskId::new();
        {
            let mut storage = SqliteStorage::open(&path).unwrap();
            storage
                .insert_task(&TaskRecord {
                    task_id,
                    owner_id: UserId::new(),
                    title: String::new(),
                    created_at: Timestamp::EPOCH,
                })
                .unwrap();
        }
        let storage = SqliteStorage::open(&path).unwrap();
        assert!(storage.get_task(task_id).unwrap().is_some());
    }
}
