use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("version number race on task {task_id}: {detail}")]
    ConcurrencyConflict { task_id: String, detail: String },

    #[error("session already closed: {session_id}")]
    AlreadyClosed { session_id: String },

    #[error("session still active: {session_id}")]
    SessionActive { session_id: String },

    #[error("core error: {0}")]
    Core(#[from] folio_core::CoreError),
}
