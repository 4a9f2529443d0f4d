use std::fmt;

use serde::{Deserialize, Serialize};

/// Which side of the application a contributor belongs to.
///
/// Exactly one registered contributor is `Primary` (the top-level
/// application state); every independent subsystem is `Secondary`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceTag {
    Primary,
    Secondary,
}

/// Stable identifier of a contributor in the capability table.
///
/// Secondary contributors are keyed by this identifier inside the envelope;
/// the identifier must therefore be stable across app versions and devices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContributorId(String);

impl ContributorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContributorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContributorId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Ephemeral flow token tying one backup or restore request together.
///
/// Carried through every engine operation for tracing, and used as the key
/// of the in-flight restore registry between `recover_backup_data` and
/// `restore_full_backup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    /// Mint a fresh request token.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Current wall-clock time in Unix milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time before epoch")
        .as_millis() as u64
}
