use std::fmt;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Terminal state of an edit session. An open session has no outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// The client closed the editor normally.
    Completed,
    /// The session ended by publishing a version.
    Published,
    /// The user discarded their edits.
    Cancelled,
    /// Closed by the reaper after the client went silent.
    Timeout,
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Published => "published",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "completed" => Ok(Self::Completed),
            "published" => Ok(Self::Published),
            "cancelled" => Ok(Self::Cancelled),
            "timeout" => Ok(Self::Timeout),
            _ => Err(CoreError::UnknownVariant {
                kind: "session outcome",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
