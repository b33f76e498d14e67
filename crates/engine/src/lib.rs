pub mod blob;
pub mod config;
pub mod draft;
pub mod error;
pub mod permission;
pub mod reaper;
pub mod scheduler;
pub mod session;
pub mod snapshot;

pub use blob::{BlobError, BlobStore, DirBlobStore, MemoryBlobStore};
pub use config::EngineConfig;
pub use draft::cleanup_expired_drafts;
pub use error::EngineError;
pub use permission::PermissionGate;
pub use reaper::{Maintenance, MaintenanceReport, ReapReport, Reaper};
pub use scheduler::{ScheduledTask, Scheduler, SchedulerHandle};
pub use session::SessionManager;
pub use snapshot::{SnapshotAction, SnapshotPolicy};

use std::sync::Arc;

use folio_core::{
    access::AccessReason,
    clock::{Clock, SystemClock, Timestamp},
    ids::*,
    metrics::ContentMetrics,
    outcome::SessionOutcome,
};
use folio_storage::{
    AutosaveTotals, NewVersion, Provenance, SessionRecord, SqliteStorage, Storage, StorageError,
    TaskRecord, VersionRecord,
};

/// The user on whose behalf an operation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Editor {
    pub user_id: UserId,
    pub username: String,
}

impl Editor {
    pub fn new(user_id: UserId, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// One autosave from an editing client.
#[derive(Debug, Clone)]
pub struct SaveRequest {
    pub task_id: TaskId,
    /// Client-chosen; validated on use.
    pub session_id: String,
    pub editor: Editor,
    pub content: String,
    pub reason: Option<String>,
    pub client: ClientInfo,
}

impl SaveRequest {
    pub fn new(
        task_id: TaskId,
        session_id: impl Into<String>,
        editor: Editor,
        content: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            session_id: session_id.into(),
            editor,
            content: content.into(),
            reason: None,
            client: ClientInfo::default(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_client(mut self, client: ClientInfo) -> Self {
        self.client = client;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveOutcome {
    pub version_id: VersionId,
    pub version_number: u32,
    /// False when the save folded into the session's current snapshot.
    pub is_new_snapshot: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageRequest {
    /// Only versions numbered below this.
    pub before: Option<u32>,
    pub limit: Option<usize>,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self {
            before: None,
            limit: Some(limit),
        }
    }

    pub fn after(page: &VersionPage, limit: usize) -> Option<Self> {
        page.next_before.map(|before| Self {
            before: Some(before),
            limit: Some(limit),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPage {
    /// Newest first.
    pub versions: Vec<VersionRecord>,
    /// Cursor for the next page, `None` on the last one.
    pub next_before: Option<u32>,
}

pub struct Engine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    storage: SqliteStorage,
    gate: Arc<dyn PermissionGate>,
    blobs: Arc<dyn BlobStore>,
    snapshots: SnapshotPolicy,
    sessions: SessionManager,
}

impl Engine {
    pub fn new(
        storage: SqliteStorage,
        gate: Arc<dyn PermissionGate>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        let config = EngineConfig::default();
        Self {
            snapshots: SnapshotPolicy::new(config.snapshot_window()),
            sessions: SessionManager::new(),
            clock: Arc::new(SystemClock),
            config,
            storage,
            gate,
            blobs,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        self.snapshots = SnapshotPolicy::new(config.snapshot_window());
        self.config = config;
        Ok(self)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut SqliteStorage {
        &mut self.storage
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// A sweep bound to its own store handle, ready for [`Scheduler::spawn`].
    pub fn maintenance<S: Storage>(&self, storage: S) -> Maintenance<S> {
        Maintenance::new(storage, Arc::clone(&self.blobs), &self.config)
    }

    /// Run one sweep on the engine's own connection.
    pub fn run_maintenance(&mut self, now: Timestamp) -> Result<MaintenanceReport, EngineError> {
        let reap = Reaper::new(self.config.session_timeout()).reap_once(&mut self.storage, now)?;
        let drafts_removed = cleanup_expired_drafts(&mut self.storage, self.blobs.as_ref(), now)?;
        Ok(MaintenanceReport {
            reap,
            drafts_removed,
        })
    }

    pub fn register_task(
        &mut self,
        task_id: TaskId,
        owner_id: UserId,
        title: impl Into<String>,
    ) -> Result<TaskRecord, EngineError> {
        let task = TaskRecord {
            task_id,
            owner_id,
            title: title.into(),
            created_at: self.clock.now(),
        };
        self.storage.insert_task(&task)?;
        tracing::debug!(task_id = %task_id, owner_id = %owner_id, "task registered");
        Ok(task)
    }

    pub(crate) fn require_edit(
        &self,
        task_id: TaskId,
        user_id: UserId,
    ) -> Result<AccessReason, EngineError> {
        let decision = self.gate.check_edit_permission(task_id, user_id);
        if decision.can_edit {
            return Ok(decision.reason);
        }
        tracing::warn!(
            task_id = %task_id,
            user_id = %user_id,
            reason = %decision.reason,
            "edit permission denied"
        );
        Err(EngineError::PermissionDenied {
            task_id,
            user_id,
            reason: decision.reason,
        })
    }

    pub(crate) fn check_content_size(&self, content: &str) -> Result<(), EngineError> {
        if content.len() > self.config.max_content_bytes {
            return Err(EngineError::Validation(format!(
                "content is {} bytes, limit is {}",
                content.len(),
                self.config.max_content_bytes
            )));
        }
        Ok(())
    }

    // ---- edit sessions ----

    /// Persist an autosave. Within one session, saves less than a snapshot
    /// window after the session's newest version rewrite it in place; later
    /// ones append a new version that becomes the task's latest.
    pub fn save(&mut self, request: SaveRequest) -> Result<SaveOutcome, EngineError> {
        let task_id = request.task_id;
        let raw_session = request.session_id.clone();
        self.save_inner(request).inspect_err(|e| {
            if !e.is_client_error() {
                tracing::error!(task_id = %task_id, session_id = %raw_session, error = %e, "save failed");
            }
        })
    }

    fn save_inner(&mut self, request: SaveRequest) -> Result<SaveOutcome, EngineError> {
        let session_id = SessionId::parse(request.session_id.as_str())
            .map_err(|e| EngineError::Validation(e.to_string()))?;
        self.check_content_size(&request.content)?;
        let access_reason = self.require_edit(request.task_id, request.editor.user_id)?;

        let now = self.clock.now();
        let metrics = ContentMetrics::compute(&request.content);

        let session = self.sessions.create_or_get(
            &mut self.storage,
            &session_id,
            request.task_id,
            request.editor.user_id,
            &request.editor.username,
            access_reason,
            now,
        )?;
        if session.task_id != request.task_id || session.user_id != request.editor.user_id {
            return Err(EngineError::SessionMismatch(session_id.to_string()));
        }
        // A reaped session only records that the client went quiet. A client
        // coming back keeps saving into it; its counters stay frozen.
        let reaped = match session.outcome() {
            None => false,
            Some(SessionOutcome::Timeout) => true,
            Some(_) => return Err(EngineError::SessionClosed(session_id.to_string())),
        };

        let action = self.snapshots.decide(&self.storage, &session_id, now)?;
        let version = self.write_snapshot(
            action,
            NewVersion {
                task_id: request.task_id,
                session_id: Some(session_id.clone()),
                content: request.content,
                metrics,
                provenance: Provenance {
                    edited_by: request.editor.user_id,
                    edit_reason: request.reason,
                    ip_address: request.client.ip_address,
                    user_agent: request.client.user_agent,
                },
                created_at: now,
            },
        )?;

        let totals = AutosaveTotals {
            characters: metrics.character_count,
            words: metrics.word_count,
        };
        let recorded = if reaped {
            tracing::info!(
                session_id = %session_id,
                version_id = %version.version_id,
                "save into reaped session; autosave totals not recorded"
            );
            Ok(session)
        } else {
            self.sessions
                .record_autosave(&mut self.storage, &session_id, totals, now)
        };
        match recorded {
            Ok(_) => {}
            // The reaper got there between our checks; the content is already safe.
            Err(EngineError::AlreadyClosed(_)) => {
                tracing::warn!(
                    session_id = %session_id,
                    version_id = %version.version_id,
                    "session closed during save; version kept"
                );
            }
            Err(e) => return Err(e),
        }

        let is_new_snapshot = matches!(action, SnapshotAction::Create);
        if is_new_snapshot {
            tracing::info!(
                task_id = %version.task_id,
                session_id = %session_id,
                version_number = version.version_number,
                characters = metrics.character_count,
                "snapshot created"
            );
        } else {
            tracing::debug!(
                task_id = %version.task_id,
                session_id = %session_id,
                version_number = version.version_number,
                "snapshot updated"
            );
        }

        Ok(SaveOutcome {
            version_id: version.version_id,
            version_number: version.version_number,
            is_new_snapshot,
        })
    }

    /// Apply a snapshot decision. The target of an update was read moments
    /// earlier, so its absence is an internal failure, not a caller error.
    pub(crate) fn write_snapshot(
        &mut self,
        action: SnapshotAction,
        new: NewVersion,
    ) -> Result<VersionRecord, EngineError> {
        let result = match action {
            SnapshotAction::Create => self.storage.create_version(&new),
            SnapshotAction::Update(version_id) => {
                self.storage
                    .update_version_content(version_id, &new.content, &new.metrics)
            }
        };
        result.map_err(|e| match e {
            StorageError::NotFound(what) => {
                let session = new.session_id.as_ref().map(|s| s.as_str()).unwrap_or("-");
                tracing::error!(
                    task_id = %new.task_id,
                    session_id = session,
                    action = ?action,
                    missing = %what,
                    "snapshot target vanished"
                );
                EngineError::Internal(format!(
                    "{what} vanished while writing snapshot {action:?} for session {session}"
                ))
            }
            other => other.into(),
        })
    }

    /// Close a session on the client's behalf. `timeout` is reserved for the
    /// reaper. Unless the session was cancelled, its newest version is archived
    /// to the blob store when `archive_on_session_end` is set.
    pub fn end_session(
        &mut self,
        session_id: &str,
        outcome: SessionOutcome,
        published_version_id: Option<VersionId>,
    ) -> Result<SessionRecord, EngineError> {
        let session_id =
            SessionId::parse(session_id).map_err(|e| EngineError::Validation(e.to_string()))?;
        if outcome == SessionOutcome::Timeout {
            return Err(EngineError::Validation(
                "timeout is assigned by the session reaper".into(),
            ));
        }

        if let Some(version_id) = published_version_id {
            let session = self.get_session_record(&session_id)?;
            let version = self.get_version(version_id)?;
            if version.task_id != session.task_id {
                return Err(EngineError::Validation(format!(
                    "version {version_id} belongs to another task"
                )));
            }
        }

        let now = self.clock.now();
        let session =
            self.sessions
                .close(&mut self.storage, &session_id, outcome, published_version_id, now)?;

        if self.config.archive_on_session_end && outcome != SessionOutcome::Cancelled {
            if let Err(e) = self.archive_session_tail(&session_id) {
                tracing::warn!(session_id = %session_id, error = %e, "archival after session end failed");
            }
        }
        Ok(session)
    }

    fn archive_session_tail(&mut self, session_id: &SessionId) -> Result<(), EngineError> {
        if let Some(version) = self.storage.get_latest_version_for_session(session_id)? {
            if version.blob_key.is_none() {
                self.archive_version(version.version_id)?;
            }
        }
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> Result<SessionRecord, EngineError> {
        let session_id =
            SessionId::parse(session_id).map_err(|e| EngineError::Validation(e.to_string()))?;
        self.get_session_record(&session_id)
    }

    fn get_session_record(&self, session_id: &SessionId) -> Result<SessionRecord, EngineError> {
        self.storage
            .get_session(session_id)?
            .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))
    }

    pub fn list_sessions(&self, task_id: TaskId) -> Result<Vec<SessionRecord>, EngineError> {
        Ok(self.storage.list_sessions_for_task(task_id)?)
    }

    // ---- versions ----

    /// Copy a version's inline content to the blob store and record the key.
    /// Returns the key; a version that only lives in the blob store already
    /// returns its existing key.
    pub fn archive_version(&mut self, version_id: VersionId) -> Result<String, EngineError> {
        let version = self.get_version(version_id)?;
        let Some(content) = version.content else {
            return version
                .blob_key
                .ok_or_else(|| EngineError::NotFound(format!("content of version {version_id}")));
        };
        let key = format!("versions/{}/{}", version.task_id, version.version_id);
        self.blobs.put(&key, content.as_bytes())?;
        self.storage.attach_blob_key(version_id, &key)?;
        tracing::debug!(version_id = %version_id, key = %key, bytes = content.len(), "version archived");
        Ok(key)
    }

    /// Version content, inline first, else from the blob store. Fails with
    /// `ChecksumMismatch` if the bytes no longer match the stored checksum.
    pub fn read_content(&self, version_id: VersionId) -> Result<String, EngineError> {
        let version = self.get_version(version_id)?;
        let content = match version.content {
            Some(content) => content,
            None => {
                let key = version.blob_key.ok_or_else(|| {
                    EngineError::NotFound(format!("content of version {version_id}"))
                })?;
                let bytes = self.blobs.get(&key)?;
                String::from_utf8(bytes).map_err(|_| EngineError::ChecksumMismatch(version_id))?
            }
        };
        if !version.metrics.matches(&content) {
            tracing::error!(
                version_id = %version_id,
                task_id = %version.task_id,
                expected = %version.metrics.checksum,
                "stored content fails checksum"
            );
            return Err(EngineError::ChecksumMismatch(version_id));
        }
        Ok(content)
    }

    /// Newest first, keyset-paged on version number.
    pub fn list_versions(
        &self,
        task_id: TaskId,
        page: PageRequest,
    ) -> Result<VersionPage, EngineError> {
        if self.storage.get_task(task_id)?.is_none() {
            return Err(EngineError::NotFound(format!("task {task_id}")));
        }
        let limit = page
            .limit
            .unwrap_or(self.config.default_page_size)
            .clamp(1, self.config.max_page_size);

        let mut versions = self.storage.list_versions(task_id, page.before, limit + 1)?;
        let next_before = if versions.len() > limit {
            versions.truncate(limit);
            versions.last().map(|v| v.version_number)
        } else {
            None
        };
        Ok(VersionPage {
            versions,
            next_before,
        })
    }

    pub fn get_latest(&self, task_id: TaskId) -> Result<VersionRecord, EngineError> {
        self.storage
            .get_latest_version(task_id)?
            .ok_or_else(|| EngineError::NotFound(format!("latest version of task {task_id}")))
    }

    pub fn get_version(&self, version_id: VersionId) -> Result<VersionRecord, EngineError> {
        self.storage
            .get_version(version_id)?
            .ok_or_else(|| EngineError::NotFound(format!("version {version_id}")))
    }
}
