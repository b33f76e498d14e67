use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::CoreError;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }

            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.0.to_string()[..8])
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(TaskId);
uuid_id!(VersionId);
uuid_id!(DraftId);
uuid_id!(UserId);

pub const MAX_SESSION_ID_LEN: usize = 128;

/// Client-supplied opaque edit session identifier.
///
/// The client picks it (typically once per editor mount) and sends it with every
/// autosave; it is the idempotency key for session creation.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, CoreError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CoreError::InvalidSessionId("empty".into()));
        }
        if trimmed.len() > MAX_SESSION_ID_LEN {
            return Err(CoreError::InvalidSessionId(format!(
                "longer than {MAX_SESSION_ID_LEN} bytes"
            )));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(CoreError::InvalidSessionId("contains control characters".into()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// BLAKE3 digest of a piece of content.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentChecksum([u8; 32]);

impl ContentChecksum {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from_bytes(self.0).to_hex().to_string()
    }
}

impl fmt::Debug for ContentChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentChecksum({:02x}{:02x}...)", self.0[0], self.0[1])
    }
}

impl fmt::Display for ContentChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_trims_and_rejects_empty() {
        let id = SessionId::parse("  tab-42  ").unwrap();
        assert_eq!(id.as_str(), "tab-42");

        assert!(SessionId::parse("").is_err());
        assert!(SessionId::parse("   ").is_err());
        assert!(SessionId::parse("a\u{7}b").is_err());
        assert!(SessionId::parse("x".repeat(MAX_SESSION_ID_LEN + 1)).is_err());
    }

    #[test]
    fn checksum_hex_matches_blake3() {
        let hash = blake3::hash(b"hello");
        let checksum = ContentChecksum::from_bytes(*hash.as_bytes());
        assert_eq!(checksum.to_hex(), hash.to_hex().as_str());
        assert_eq!(checksum.to_string().len(), 64);
        assert!(ContentChecksum::from_bytes([0xAB; 32]).to_hex().starts_with("abab"));
    }

    #[test]
    fn uuid_id_debug_is_abbreviated() {
        let id = TaskId::from_bytes([0x11; 16]);
        assert_eq!(format!("{id:?}"), "TaskId(11111111)");
        assert_eq!(id.to_string().len(), 36);
    }
}
