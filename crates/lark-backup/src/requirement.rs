/// The process-wide "a backup is due" flag.
///
/// Deliberately narrow: the flag is set by housekeeping and by
/// contributor-change notifications, and cleared only after a successful
/// automatic upload. Nothing is scheduled here; an external scheduler
/// reads the flag and decides when to act.
use std::sync::atomic::{AtomicBool, Ordering};

pub struct BackupRequirement {
    required: AtomicBool,
}

impl BackupRequirement {
    /// Starts unset.
    pub fn new() -> Self {
        Self {
            required: AtomicBool::new(false),
        }
    }

    /// A contributor changed, a backup aged out, or one never succeeded.
    pub fn mark_required(&self) {
        self.required.store(true, Ordering::Relaxed);
    }

    /// A backup was uploaded; the pressure is off until something changes.
    pub fn clear_after_upload(&self) {
        self.required.store(false, Ordering::Relaxed);
    }

    pub fn is_required(&self) -> bool {
        self.required.load(Ordering::Relaxed)
    }
}

impl Default for BackupRequirement {
    fn default() -> Self {
        Self::new()
    }
}
