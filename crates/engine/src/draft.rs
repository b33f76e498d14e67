use folio_core::{Clock, TaskId, Timestamp, UserId, metrics::ContentMetrics};
use folio_storage::{DraftPublish, DraftRecord, DraftUpsert, Storage, VersionRecord};

use crate::blob::BlobStore;
use crate::error::EngineError;
use crate::{Editor, Engine};

fn draft_blob_key(task_id: TaskId, user_id: UserId) -> String {
    format!("drafts/{task_id}/{user_id}")
}

fn release_blob(blobs: &dyn BlobStore, draft: &DraftRecord) {
    let Some(key) = draft.blob_key.as_deref() else {
        return;
    };
    if let Err(e) = blobs.delete(key) {
        tracing::warn!(draft_id = %draft.draft_id, key, error = %e, "failed to delete draft blob");
    }
}

/// Remove every draft that expired at or before `now`, then their blobs.
/// Blob failures are logged; the rows are gone either way.
pub fn cleanup_expired_drafts<S: Storage>(
    storage: &mut S,
    blobs: &dyn BlobStore,
    now: Timestamp,
) -> Result<usize, EngineError> {
    let expired = storage.delete_expired_drafts(now)?;
    for draft in &expired {
        release_blob(blobs, draft);
    }
    if !expired.is_empty() {
        tracing::info!(removed = expired.len(), "expired drafts removed");
    }
    Ok(expired.len())
}

/// One pending draft per (task, user). Drafts never become versions until
/// published, and are discarded after `draft_ttl_secs` without an autosave.
impl Engine {
    pub fn save_draft(
        &mut self,
        task_id: TaskId,
        editor: &Editor,
        content: &str,
    ) -> Result<DraftRecord, EngineError> {
        self.check_content_size(content)?;
        self.require_edit(task_id, editor.user_id)?;
        if self.storage.get_task(task_id)?.is_none() {
            return Err(EngineError::NotFound(format!("task {task_id}")));
        }

        let now = self.clock.now();
        let key = draft_blob_key(task_id, editor.user_id);
        self.blobs.put(&key, content.as_bytes())?;

        let draft = self.storage.upsert_draft(&DraftUpsert {
            task_id,
            user_id: editor.user_id,
            content: content.to_string(),
            blob_key: Some(key),
            metrics: ContentMetrics::compute(content),
            saved_at: now,
            expires_at: now.saturating_add(self.config.draft_ttl()),
        })?;
        tracing::debug!(
            task_id = %task_id,
            user_id = %editor.user_id,
            autosaves = draft.autosave_count,
            "draft saved"
        );
        Ok(draft)
    }

    /// The user's live draft; an expired one reads as absent.
    pub fn get_draft(
        &self,
        task_id: TaskId,
        user_id: UserId,
    ) -> Result<Option<DraftRecord>, EngineError> {
        let now = self.clock.now();
        Ok(self
            .storage
            .get_draft(task_id, user_id)?
            .filter(|d| !d.is_expired(now)))
    }

    /// Turn the user's draft into the task's next, latest version. The draft
    /// and its blob are removed; the new version is archived under its own key
    /// when `archive_on_session_end` is set.
    pub fn publish_draft(
        &mut self,
        task_id: TaskId,
        user_id: UserId,
        reason: Option<&str>,
    ) -> Result<VersionRecord, EngineError> {
        self.require_edit(task_id, user_id)?;
        let draft = self
            .get_draft(task_id, user_id)?
            .ok_or_else(|| EngineError::NotFound(format!("draft of {user_id} on task {task_id}")))?;

        let now = self.clock.now();
        let version = self
            .storage
            .publish_draft(
                draft.draft_id,
                &DraftPublish {
                    edit_reason: reason.map(str::to_string),
                    published_at: now,
                },
            )
            .inspect_err(|e| {
                tracing::error!(task_id = %task_id, draft_id = %draft.draft_id, error = %e, "publish failed");
            })?;
        release_blob(self.blobs.as_ref(), &draft);

        tracing::info!(
            task_id = %task_id,
            user_id = %user_id,
            version_number = version.version_number,
            "draft published"
        );

        if self.config.archive_on_session_end {
            match self.archive_version(version.version_id) {
                Ok(key) => return Ok(VersionRecord {
                    blob_key: Some(key),
                    ..version
                }),
                Err(e) => {
                    tracing::warn!(version_id = %version.version_id, error = %e, "archival after publish failed");
                }
            }
        }
        Ok(version)
    }

    /// Discard the user's draft. Nothing is versioned.
    pub fn cancel_draft(&mut self, task_id: TaskId, user_id: UserId) -> Result<(), EngineError> {
        let draft = self
            .get_draft(task_id, user_id)?
            .ok_or_else(|| EngineError::NotFound(format!("draft of {user_id} on task {task_id}")))?;
        let removed = self.storage.delete_draft(draft.draft_id)?;
        release_blob(self.blobs.as_ref(), &removed);
        tracing::info!(task_id = %task_id, user_id = %user_id, "draft cancelled");
        Ok(())
    }

    pub fn cleanup_expired_drafts(&mut self) -> Result<usize, EngineError> {
        let now = self.clock.now();
        cleanup_expired_drafts(&mut self.storage, self.blobs.as_ref(), now)
    }
}
