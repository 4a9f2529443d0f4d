/// In-flight restore registry.
///
/// Bridges the two-phase recover/restore API: `recover_backup_data` parks
/// the verified, decrypted envelope here under its request token, and the
/// restore orchestrator takes it back out. Entries never outlive the
/// request: the orchestrator removes them on success and failure alike.
use std::collections::HashMap;
use std::sync::RwLock;

use crate::envelope::FullBackup;
use crate::types::RequestId;

/// Thread-safe map from request token to a recovered envelope.
///
/// Readers proceed in parallel; insert/remove are exclusive.
pub struct InFlightRestores {
    entries: RwLock<HashMap<RequestId, FullBackup>>,
}

impl InFlightRestores {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Park a recovered envelope. Replacing an existing entry for the same
    /// request would mean the token was reused; the old envelope is dropped.
    pub fn insert(&self, request: RequestId, envelope: FullBackup) {
        let mut entries = self.entries.write().expect("in-flight lock poisoned");
        let previous = entries.insert(request, envelope);
        debug_assert!(previous.is_none(), "request token reused for recovery");
    }

    /// Remove and return the envelope for this request.
    pub fn take(&self, request: &RequestId) -> Option<FullBackup> {
        self.entries
            .write()
            .expect("in-flight lock poisoned")
            .remove(request)
    }

    /// Whether an envelope is parked under this request.
    pub fn contains(&self, request: &RequestId) -> bool {
        self.entries
            .read()
            .expect("in-flight lock poisoned")
            .contains_key(request)
    }

    /// Number of restores currently in flight.
    pub fn len(&self) -> usize {
        self.entries.read().expect("in-flight lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InFlightRestores {
    fn default() -> Self {
        Self::new()
    }
}
