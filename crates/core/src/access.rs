use std::fmt;

use serde::{Deserialize, Serialize};

/// Why the permission gate allowed or refused access. Retained on the session for audit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessReason {
    Owner,
    GrantedPermission,
    DownloadOnly,
    ViewOnly,
    NoPermission,
    /// Any tag the gate returns that this crate has no name for.
    Other(String),
}

impl AccessReason {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Owner => "owner",
            Self::GrantedPermission => "granted_permission",
            Self::DownloadOnly => "download_only",
            Self::ViewOnly => "view_only",
            Self::NoPermission => "no_permission",
            Self::Other(tag) => tag,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "owner" => Self::Owner,
            "granted_permission" => Self::GrantedPermission,
            "download_only" => Self::DownloadOnly,
            "view_only" => Self::ViewOnly,
            "no_permission" => Self::NoPermission,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for AccessReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The permission gate's answer to "can this user edit this task".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionDecision {
    pub can_edit: bool,
    pub reason: AccessReason,
}

impl PermissionDecision {
    pub fn allow(reason: AccessReason) -> Self {
        Self {
            can_edit: true,
            reason,
        }
    }

    pub fn deny(reason: AccessReason) -> Self {
        Self {
            can_edit: false,
            reason,
        }
    }
}
