use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Tunables for snapshotting, session reaping and draft expiry.
///
/// ```toml
/// snapshot_window_secs = 300
/// session_timeout_secs = 900
/// sweep_interval_secs = 300
/// draft_ttl_secs = 86400
/// archive_on_session_end = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// A save more than this long after the session's latest version was created
    /// starts a new version instead of updating it.
    pub snapshot_window_secs: u64,
    /// An open session silent for this long is closed as `timeout`.
    pub session_timeout_secs: u64,
    /// How often the maintenance sweep runs.
    pub sweep_interval_secs: u64,
    /// Drafts expire this long after their last autosave.
    pub draft_ttl_secs: u64,
    pub archive_on_session_end: bool,
    pub default_page_size: usize,
    pub max_page_size: usize,
    pub max_content_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_window_secs: 300,
            session_timeout_secs: 900,
            sweep_interval_secs: 300,
            draft_ttl_secs: 86_400,
            archive_on_session_end: true,
            default_page_size: 50,
            max_page_size: 500,
            max_content_bytes: 16 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, EngineError> {
        let config: Self = toml::from_str(raw).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        for (name, value) in [
            ("snapshot_window_secs", self.snapshot_window_secs),
            ("session_timeout_secs", self.session_timeout_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("draft_ttl_secs", self.draft_ttl_secs),
        ] {
            if value == 0 {
                return Err(EngineError::Config(format!("{name} must be positive")));
            }
        }
        // The reaper must never close a session inside one snapshot window.
        if self.session_timeout_secs <= self.snapshot_window_secs {
            return Err(EngineError::Config(format!(
                "session_timeout_secs ({}) must exceed snapshot_window_secs ({})",
                self.session_timeout_secs, self.snapshot_window_secs
            )));
        }
        if self.default_page_size == 0 || self.default_page_size > self.max_page_size {
            return Err(EngineError::Config(format!(
                "default_page_size must be in 1..={}",
                self.max_page_size
            )));
        }
        Ok(())
    }

    pub fn snapshot_window(&self) -> Duration {
        Duration::from_secs(self.snapshot_window_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn draft_ttl(&self) -> Duration {
        Duration::from_secs(self.draft_ttl_secs)
    }

    // Overrides are stored in whole seconds. A fractional duration rounds up,
    // so a nonzero override never collapses to zero.

    pub fn with_snapshot_window(mut self, window: Duration) -> Self {
        self.snapshot_window_secs = whole_secs(window);
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout_secs = whole_secs(timeout);
        self
    }

    pub fn with_draft_ttl(mut self, ttl: Duration) -> Self {
        self.draft_ttl_secs = whole_secs(ttl);
        self
    }

    pub fn with_archive_on_session_end(mut self, archive: bool) -> Self {
        self.archive_on_session_end = archive;
        self
    }
}

fn whole_secs(d: Duration) -> u64 {
    if d.subsec_nanos() > 0 {
        d.as_secs().saturating_add(1)
    } else {
        d.as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.snapshot_window(), Duration::from_secs(300));
        assert_eq!(config.session_timeout(), Duration::from_secs(900));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            "snapshot_window_secs = 60\narchive_on_session_end = false\n",
        )
        .unwrap();
        assert_eq!(config.snapshot_window_secs, 60);
        assert!(!config.archive_on_session_end);
        assert_eq!(config.session_timeout_secs, 900);
        assert_eq!(config.draft_ttl_secs, 86_400);
    }

    #[test]
    fn timeout_must_exceed_snapshot_window() {
        let err = EngineConfig::from_toml_str(
            "snapshot_window_secs = 600\nsession_timeout_secs = 600\n",
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)), "got {err:?}");

        let err = EngineConfig::default()
            .with_snapshot_window(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn fractional_overrides_round_up_to_whole_seconds() {
        let config = EngineConfig::default()
            .with_snapshot_window(Duration::from_millis(500))
            .with_session_timeout(Duration::from_millis(1_500))
            .with_draft_ttl(Duration::from_secs(60));
        assert_eq!(config.snapshot_window(), Duration::from_secs(1));
        assert_eq!(config.session_timeout(), Duration::from_secs(2));
        assert_eq!(config.draft_ttl(), Duration::from_secs(60));
        config.validate().unwrap();

        // Equal after rounding, so the timeout no longer exceeds the window.
        let err = EngineConfig::default()
            .with_snapshot_window(Duration::from_millis(1_200))
            .with_session_timeout(Duration::from_millis(1_900))
            .validate()
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(EngineConfig::from_toml_str("snapshot_window_secs = \"soon\"").is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("folio.toml");
        std::fs::write(&path, "draft_ttl_secs = 3600\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.draft_ttl(), Duration::from_secs(3600));

        assert!(EngineConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
