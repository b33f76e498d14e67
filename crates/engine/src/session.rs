use folio_core::{AccessReason, SessionId, SessionOutcome, TaskId, Timestamp, UserId, VersionId};
use folio_storage::{AutosaveTotals, NewSession, SessionRecord, Storage, StorageError};

use crate::error::EngineError;

/// Edit session lifecycle: created once, updated in place on every autosave,
/// closed exactly once.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionManager;

impl SessionManager {
    pub fn new() -> Self {
        Self
    }

    /// Idempotent on `session_id`: an existing row is returned unchanged.
    #[allow(clippy::too_many_arguments)]
    pub fn create_or_get<S: Storage>(
        &self,
        storage: &mut S,
        session_id: &SessionId,
        task_id: TaskId,
        user_id: UserId,
        username: &str,
        access_reason: AccessReason,
        now: Timestamp,
    ) -> Result<SessionRecord, EngineError> {
        let (session, created) = storage.create_or_get_session(&NewSession {
            session_id: session_id.clone(),
            task_id,
            user_id,
            username: username.to_string(),
            access_reason,
            started_at: now,
        })?;
        if created {
            tracing::info!(
                session_id = %session_id,
                task_id = %task_id,
                user_id = %user_id,
                access_reason = %session.access_reason,
                "edit session started"
            );
        }
        Ok(session)
    }

    pub fn record_autosave<S: Storage>(
        &self,
        storage: &mut S,
        session_id: &SessionId,
        totals: AutosaveTotals,
        now: Timestamp,
    ) -> Result<SessionRecord, EngineError> {
        Ok(storage.record_autosave(session_id, totals, now)?)
    }

    /// First close wins. Closing again fails with `AlreadyClosed` and leaves the
    /// original outcome in place.
    pub fn close<S: Storage>(
        &self,
        storage: &mut S,
        session_id: &SessionId,
        outcome: SessionOutcome,
        published_version_id: Option<VersionId>,
        now: Timestamp,
    ) -> Result<SessionRecord, EngineError> {
        if published_version_id.is_some() && outcome != SessionOutcome::Published {
            return Err(EngineError::Validation(format!(
                "published version given for outcome {outcome}"
            )));
        }
        match storage.close_session(session_id, outcome, now, published_version_id) {
            Ok(session) => {
                tracing::info!(
                    session_id = %session_id,
                    task_id = %session.task_id,
                    outcome = %outcome,
                    autosaves = session.autosave_count,
                    "edit session closed"
                );
                Ok(session)
            }
            Err(StorageError::AlreadyClosed { session_id: sid }) => {
                let original = storage
                    .get_session(session_id)?
                    .and_then(|s| s.outcome())
                    .map(|o| o.as_str())
                    .unwrap_or("unknown");
                tracing::warn!(
                    session_id = %sid,
                    requested = %outcome,
                    original,
                    "ignoring second close of edit session"
                );
                Err(EngineError::AlreadyClosed(sid))
            }
            Err(e) => Err(e.into()),
        }
    }
}
