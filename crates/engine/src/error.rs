use folio_core::{AccessReason, CoreError, TaskId, UserId, VersionId};
use folio_storage::StorageError;
use thiserror::Error;

use crate::blob::BlobError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("blob store error: {0}")]
    Blob(#[from] BlobError),

    #[error("permission denied on task {task_id} for user {user_id}: {reason}")]
    PermissionDenied {
        task_id: TaskId,
        user_id: UserId,
        reason: AccessReason,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("session already closed: {0}")]
    AlreadyClosed(String),

    #[error("session {0} has ended; start a new session")]
    SessionClosed(String),

    #[error("session {0} belongs to a different task or user")]
    SessionMismatch(String),

    #[error("version numbering conflict on task {task_id}: {detail}")]
    ConcurrencyConflict { task_id: String, detail: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("checksum mismatch on version {0}")]
    ChecksumMismatch(VersionId),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Rows the engine had just read disappeared under it.
    #[error("internal consistency failure: {0}")]
    Internal(String),
}

impl EngineError {
    /// Errors caused by the caller's input or rights, returned as-is. Everything
    /// else is an internal failure and gets logged with context.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied { .. }
                | Self::Validation(_)
                | Self::NotFound(_)
                | Self::AlreadyClosed(_)
                | Self::SessionClosed(_)
                | Self::SessionMismatch(_)
        )
    }
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => Self::NotFound(what),
            StorageError::AlreadyClosed { session_id } => Self::AlreadyClosed(session_id),
            StorageError::ConcurrencyConflict { task_id, detail } => {
                Self::ConcurrencyConflict { task_id, detail }
            }
            StorageError::Core(e) => Self::Core(e),
            other => Self::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_lift_into_taxonomy() {
        let e: EngineError = StorageError::NotFound("task x".into()).into();
        assert!(matches!(e, EngineError::NotFound(_)));
        assert!(e.is_client_error());

        let e: EngineError = StorageError::AlreadyClosed {
            session_id: "s".into(),
        }
        .into();
        assert!(matches!(e, EngineError::AlreadyClosed(ref s) if s == "s"));

        let e: EngineError = StorageError::ConcurrencyConflict {
            task_id: "t".into(),
            detail: "dup".into(),
        }
        .into();
        assert!(matches!(e, EngineError::ConcurrencyConflict { .. }));
        assert!(!e.is_client_error());

        let e: EngineError = StorageError::Serialization("bad".into()).into();
        assert!(matches!(e, EngineError::Storage(_)));
    }
}
