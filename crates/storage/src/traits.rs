use folio_core::{
    access::AccessReason,
    clock::Timestamp,
    ids::*,
    metrics::ContentMetrics,
    outcome::SessionOutcome,
};

use crate::error::StorageError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub owner_id: UserId,
    pub title: String,
    pub created_at: Timestamp,
}

/// Who made a revision and from where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub edited_by: UserId,
    pub edit_reason: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl Provenance {
    pub fn user(edited_by: UserId) -> Self {
        Self {
            edited_by,
            edit_reason: None,
            ip_address: None,
            user_agent: None,
        }
    }
}

/// A numbered revision of a task's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRecord {
    pub version_id: VersionId,
    pub task_id: TaskId,
    pub version_number: u32,
    /// Inline content; takes priority over `blob_key` on read.
    pub content: Option<String>,
    pub blob_key: Option<String>,
    pub metrics: ContentMetrics,
    pub is_latest: bool,
    pub provenance: Provenance,
    /// `None` for versions produced by publishing a draft.
    pub session_id: Option<SessionId>,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone)]
pub struct NewVersion {
    pub task_id: TaskId,
    pub session_id: Option<SessionId>,
    pub content: String,
    pub metrics: ContentMetrics,
    pub provenance: Provenance,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closed {
        ended_at: Timestamp,
        outcome: SessionOutcome,
        published_version_id: Option<VersionId>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub task_id: TaskId,
    pub user_id: UserId,
    pub username: String,
    pub access_reason: AccessReason,
    pub started_at: Timestamp,
    pub last_activity_at: Option<Timestamp>,
    pub state: SessionState,
    pub autosave_count: u64,
    pub total_characters_changed: u64,
    pub total_words_changed: u64,
}

impl SessionRecord {
    pub fn is_open(&self) -> bool {
        matches!(self.state, SessionState::Open)
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        match self.state {
            SessionState::Open => None,
            SessionState::Closed { outcome, .. } => Some(outcome),
        }
    }

    pub fn ended_at(&self) -> Option<Timestamp> {
        match self.state {
            SessionState::Open => None,
            SessionState::Closed { ended_at, .. } => Some(ended_at),
        }
    }

    /// The instant the reaper measures idleness from.
    pub fn idle_since(&self) -> Timestamp {
        self.last_activity_at.unwrap_or(self.started_at)
    }
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub session_id: SessionId,
    pub task_id: TaskId,
    pub user_id: UserId,
    pub username: String,
    pub access_reason: AccessReason,
    pub started_at: Timestamp,
}

/// Latest cumulative figures reported by an autosave; they overwrite, not add.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutosaveTotals {
    pub characters: u64,
    pub words: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftRecord {
    pub draft_id: DraftId,
    pub task_id: TaskId,
    pub user_id: UserId,
    pub content: String,
    pub blob_key: Option<String>,
    pub metrics: ContentMetrics,
    pub autosave_count: u64,
    pub last_autosaved_at: Timestamp,
    pub expires_at: Timestamp,
    pub created_at: Timestamp,
}

impl DraftRecord {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone)]
pub struct DraftUpsert {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub content: String,
    pub blob_key: Option<String>,
    pub metrics: ContentMetrics,
    pub saved_at: Timestamp,
    pub expires_at: Timestamp,
}

#[derive(Debug, Clone)]
pub struct DraftPublish {
    pub edit_reason: Option<String>,
    pub published_at: Timestamp,
}

/// Durable home of tasks, versions, edit sessions and drafts.
///
/// Every mutation that touches version numbering or the latest pointer runs in a
/// single write transaction so that separate connections to the same database
/// serialize against each other.
pub trait Storage {
    fn insert_task(&mut self, task: &TaskRecord) -> Result<(), StorageError>;

    fn get_task(&self, task_id: TaskId) -> Result<Option<TaskRecord>, StorageError>;

    // ---- versions ----

    /// `max(version_number) + 1`, or 0 for a task with no versions. Only a hint
    /// outside a write transaction; `create_version` allocates for real.
    fn next_version_number(&self, task_id: TaskId) -> Result<u32, StorageError>;

    fn create_version(&mut self, new: &NewVersion) -> Result<VersionRecord, StorageError>;

    /// Replace content, metrics and checksum in place. Number and latest flag are untouched.
    fn update_version_content(
        &mut self,
        version_id: VersionId,
        content: &str,
        metrics: &ContentMetrics,
    ) -> Result<VersionRecord, StorageError>;

    fn get_version(&self, version_id: VersionId) -> Result<Option<VersionRecord>, StorageError>;

    fn get_latest_version(&self, task_id: TaskId) -> Result<Option<VersionRecord>, StorageError>;

    fn get_latest_version_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<VersionRecord>, StorageError>;

    /// Newest first; `before` excludes version numbers at or above it.
    fn list_versions(
        &self,
        task_id: TaskId,
        before: Option<u32>,
        limit: usize,
    ) -> Result<Vec<VersionRecord>, StorageError>;

    fn attach_blob_key(&mut self, version_id: VersionId, blob_key: &str) -> Result<(), StorageError>;

    // ---- edit sessions ----

    /// Returns the row and whether this call inserted it.
    fn create_or_get_session(
        &mut self,
        new: &NewSession,
    ) -> Result<(SessionRecord, bool), StorageError>;

    fn get_session(&self, session_id: &SessionId) -> Result<Option<SessionRecord>, StorageError>;

    fn record_autosave(
        &mut self,
        session_id: &SessionId,
        totals: AutosaveTotals,
        at: Timestamp,
    ) -> Result<SessionRecord, StorageError>;

    /// First close wins; a second close fails with `AlreadyClosed`.
    fn close_session(
        &mut self,
        session_id: &SessionId,
        outcome: SessionOutcome,
        ended_at: Timestamp,
        published_version_id: Option<VersionId>,
    ) -> Result<SessionRecord, StorageError>;

    /// Close an idle session as `timeout`, backdating `ended_at` to its last
    /// activity plus `timeout_ms`. Fails with `SessionActive` if it saw activity
    /// after `cutoff`.
    fn timeout_session(
        &mut self,
        session_id: &SessionId,
        cutoff: Timestamp,
        timeout_ms: i64,
    ) -> Result<SessionRecord, StorageError>;

    /// Open sessions idle since at or before `cutoff`.
    fn find_orphaned_sessions(&self, cutoff: Timestamp) -> Result<Vec<SessionRecord>, StorageError>;

    fn list_sessions_for_task(&self, task_id: TaskId) -> Result<Vec<SessionRecord>, StorageError>;

    // ---- drafts ----

    fn upsert_draft(&mut self, upsert: &DraftUpsert) -> Result<DraftRecord, StorageError>;

    fn get_draft(&self, task_id: TaskId, user_id: UserId) -> Result<Option<DraftRecord>, StorageError>;

    /// Convert the draft into the next numbered, latest version and remove it.
    /// The version starts inline-only; the draft's blob stays with the draft key.
    fn publish_draft(
        &mut self,
        draft_id: DraftId,
        publish: &DraftPublish,
    ) -> Result<VersionRecord, StorageError>;

    /// Returns the deleted row so the caller can clean up its blob.
    fn delete_draft(&mut self, draft_id: DraftId) -> Result<DraftRecord, StorageError>;

    fn delete_expired_drafts(&mut self, now: Timestamp) -> Result<Vec<DraftRecord>, StorageError>;
}
