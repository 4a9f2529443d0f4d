/// Row types and the record status machine for the backup store.
use crate::crypto::{BackupKeyId, SealingKeys};
use crate::error::LarkBackupError;

/// How many records to retain per `(key, for_export)` bucket during
/// housekeeping.
pub const DEFAULT_RETAINED_BACKUPS_PER_BUCKET: usize = 3;

/// Lifecycle of one versioned backup record.
///
/// `ongoing → ready → {exported | uploaded}`, with `failed` reachable from
/// `ongoing` and `ready`. `failed`, `exported` and `uploaded` are terminal;
/// retrying means creating a new version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStatus {
    Ongoing,
    Ready,
    Exported,
    Uploaded,
    Failed,
}

impl BackupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupStatus::Ongoing => "ongoing",
            BackupStatus::Ready => "ready",
            BackupStatus::Exported => "exported",
            BackupStatus::Uploaded => "uploaded",
            BackupStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, LarkBackupError> {
        match s {
            "ongoing" => Ok(BackupStatus::Ongoing),
            "ready" => Ok(BackupStatus::Ready),
            "exported" => Ok(BackupStatus::Exported),
            "uploaded" => Ok(BackupStatus::Uploaded),
            "failed" => Ok(BackupStatus::Failed),
            other => Err(LarkBackupError::Storage(format!(
                "unknown backup status in store: {other}"
            ))),
        }
    }

    /// Whether the state machine permits `self → next`.
    pub fn can_transition_to(self, next: BackupStatus) -> bool {
        matches!(
            (self, next),
            (BackupStatus::Ongoing, BackupStatus::Ready)
                | (BackupStatus::Ongoing, BackupStatus::Failed)
                | (BackupStatus::Ready, BackupStatus::Exported)
                | (BackupStatus::Ready, BackupStatus::Uploaded)
                | (BackupStatus::Ready, BackupStatus::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BackupStatus::Exported | BackupStatus::Uploaded | BackupStatus::Failed
        )
    }
}

impl std::fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One versioned backup attempt under a key.
#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub key_id: String,
    /// Monotonically increasing per key, starting at 0.
    pub version: i64,
    /// Export (user-visible file) vs. automatic upload.
    pub for_export: bool,
    pub status: BackupStatus,
    /// Creation time, Unix ms.
    pub created_at: u64,
    /// Last status change, Unix ms.
    pub status_changed_at: u64,
    /// Sealed bytes, present from `ready` onward.
    pub encrypted_content: Option<Vec<u8>>,
}

/// A persisted backup key row: the public sealing half only.
#[derive(Debug, Clone)]
pub struct StoredBackupKey {
    pub key_id: String,
    pub encryption_public_key: [u8; 32],
    pub mac_key: [u8; 32],
    pub created_at: u64,
}

impl StoredBackupKey {
    /// Rebuild the sealing keys from the row.
    pub fn sealing_keys(&self) -> Result<SealingKeys, LarkBackupError> {
        let key_id = BackupKeyId::from_hex(&self.key_id).ok_or_else(|| {
            LarkBackupError::Storage(format!("corrupt key id in store: {}", self.key_id))
        })?;
        Ok(SealingKeys {
            key_id,
            encryption_public: x25519_dalek::PublicKey::from(self.encryption_public_key),
            mac_key: self.mac_key,
        })
    }
}

/// Summary of the current key, surfaced to the caller layer.
#[derive(Debug, Clone)]
pub struct BackupKeyInfo {
    pub key_id: String,
    pub created_at: u64,
    /// Most recent successful export/upload under this key, Unix ms.
    pub last_success_ms: Option<u64>,
}
