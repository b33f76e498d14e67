use std::time::Duration;

use folio_core::{SessionId, Timestamp, VersionId};
use folio_storage::{Storage, VersionRecord};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotAction {
    /// Append a new numbered version.
    Create,
    /// Overwrite the session's most recent version in place.
    Update(VersionId),
}

/// Decides whether a save becomes a new version or amends the session's last one.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotPolicy {
    window: Duration,
}

impl SnapshotPolicy {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Looks only at versions produced by `session_id`; other sessions on the same
    /// task never share a snapshot.
    pub fn decide<S: Storage>(
        &self,
        storage: &S,
        session_id: &SessionId,
        now: Timestamp,
    ) -> Result<SnapshotAction, EngineError> {
        let most_recent = storage.get_latest_version_for_session(session_id)?;
        Ok(self.decide_for(most_recent.as_ref(), now))
    }

    pub fn decide_for(&self, most_recent: Option<&VersionRecord>, now: Timestamp) -> SnapshotAction {
        match most_recent {
            None => SnapshotAction::Create,
            Some(v) if now.since(v.created_at) > self.window => SnapshotAction::Create,
            Some(v) => SnapshotAction::Update(v.version_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{ContentMetrics, TaskId, UserId};
    use folio_storage::Provenance;

    fn version_at(secs: i64) -> VersionRecord {
        VersionRecord {
            version_id: VersionId::new(),
            task_id: TaskId::new(),
            version_number: 0,
            content: Some("x".into()),
            blob_key: None,
            metrics: ContentMetrics::compute("x"),
            is_latest: true,
            provenance: Provenance::user(UserId::new()),
            session_id: None,
            created_at: Timestamp::from_secs(secs),
        }
    }

    #[test]
    fn first_save_creates() {
        let policy = SnapshotPolicy::new(Duration::from_secs(300));
        assert_eq!(policy.decide_for(None, Timestamp::from_secs(0)), SnapshotAction::Create);
    }

    #[test]
    fn window_boundary_is_exclusive() {
        let policy = SnapshotPolicy::new(Duration::from_secs(300));
        let v = version_at(1000);

        assert_eq!(
            policy.decide_for(Some(&v), Timestamp::from_secs(1120)),
            SnapshotAction::Update(v.version_id)
        );
        // Exactly at the window still amends.
        assert_eq!(
            policy.decide_for(Some(&v), Timestamp::from_secs(1300)),
            SnapshotAction::Update(v.version_id)
        );
        assert_eq!(
            policy.decide_for(Some(&v), Timestamp::from_millis(1_300_001)),
            SnapshotAction::Create
        );
    }

    #[test]
    fn clock_going_backwards_amends() {
        let policy = SnapshotPolicy::new(Duration::from_secs(300));
        let v = version_at(1000);
        assert_eq!(
            policy.decide_for(Some(&v), Timestamp::from_secs(900)),
            SnapshotAction::Update(v.version_id)
        );
    }
}
