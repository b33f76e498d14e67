use std::sync::Arc;
use std::time::Duration;

use folio_core::{SessionId, Timestamp};
use folio_storage::{Storage, StorageError};

use crate::blob::BlobStore;
use crate::config::EngineConfig;
use crate::draft::cleanup_expired_drafts;
use crate::error::EngineError;
use crate::scheduler::ScheduledTask;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapReport {
    /// Sessions closed as `timeout` by this sweep.
    pub closed: Vec<SessionId>,
    /// Candidates that turned out active or already closed when we got to them.
    pub skipped: usize,
    pub failed: usize,
}

/// Closes sessions whose client went silent without ending them.
///
/// Eventually consistent: a session may stay open up to one sweep interval past
/// its timeout.
#[derive(Debug, Clone, Copy)]
pub struct Reaper {
    timeout: Duration,
}

impl Reaper {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// One sweep at `now`. Per-session failures are logged and counted; only a
    /// failure to list candidates aborts the sweep.
    pub fn reap_once<S: Storage>(&self, storage: &mut S, now: Timestamp) -> Result<ReapReport, EngineError> {
        let cutoff = now.saturating_sub(self.timeout);
        let timeout_ms = i64::try_from(self.timeout.as_millis()).unwrap_or(i64::MAX);
        let candidates = storage.find_orphaned_sessions(cutoff)?;

        let mut report = ReapReport::default();
        for session in candidates {
            match storage.timeout_session(&session.session_id, cutoff, timeout_ms) {
                Ok(closed) => {
                    tracing::info!(
                        session_id = %closed.session_id,
                        task_id = %closed.task_id,
                        idle_since = %session.idle_since(),
                        ended_at = ?closed.ended_at(),
                        "reaped orphaned edit session"
                    );
                    report.closed.push(closed.session_id);
                }
                Err(StorageError::SessionActive { .. } | StorageError::AlreadyClosed { .. }) => {
                    tracing::debug!(session_id = %session.session_id, "session changed since sweep query");
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::warn!(session_id = %session.session_id, error = %e, "failed to reap session");
                    report.failed += 1;
                }
            }
        }

        if !report.closed.is_empty() || report.failed > 0 {
            tracing::info!(
                closed = report.closed.len(),
                skipped = report.skipped,
                failed = report.failed,
                "session sweep finished"
            );
        }
        Ok(report)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub reap: ReapReport,
    pub drafts_removed: usize,
}

/// The periodic sweep: reap orphaned sessions, then drop expired drafts.
/// Owns its own store handle so it never contends with request handlers for one.
pub struct Maintenance<S> {
    storage: S,
    blobs: Arc<dyn BlobStore>,
    reaper: Reaper,
    runs: u64,
    last: Option<MaintenanceReport>,
}

impl<S: Storage> Maintenance<S> {
    pub fn new(storage: S, blobs: Arc<dyn BlobStore>, config: &EngineConfig) -> Self {
        Self {
            storage,
            blobs,
            reaper: Reaper::new(config.session_timeout()),
            runs: 0,
            last: None,
        }
    }

    pub fn run_once(&mut self, now: Timestamp) -> Result<MaintenanceReport, EngineError> {
        let reap = self.reaper.reap_once(&mut self.storage, now)?;
        let drafts_removed = cleanup_expired_drafts(&mut self.storage, self.blobs.as_ref(), now)?;
        let report = MaintenanceReport { reap, drafts_removed };
        self.runs += 1;
        self.last = Some(report.clone());
        Ok(report)
    }

    pub fn runs(&self) -> u64 {
        self.runs
    }

    pub fn last_report(&self) -> Option<&MaintenanceReport> {
        self.last.as_ref()
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }
}

impl<S: Storage + Send + 'static> ScheduledTask for Maintenance<S> {
    fn name(&self) -> &'static str {
        "maintenance"
    }

    fn run(&mut self, now: Timestamp) {
        if let Err(e) = self.run_once(now) {
            tracing::error!(error = %e, "maintenance sweep failed");
        }
    }
}
