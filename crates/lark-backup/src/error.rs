/// Engine-level errors for Lark backups.
///
/// Every internal failure (store, serializer, crypto) is wrapped into one of
/// these variants before crossing the crate boundary; callers never see raw
/// rusqlite or serde error types.
#[derive(Debug, thiserror::Error)]
pub enum LarkBackupError {
    /// No primary contributor is registered (or it was deallocated).
    /// Backups and restores cannot start without it.
    #[error("the primary contributor is not registered")]
    PrimaryContributorNotRegistered,

    /// Secondary contributors may only be registered once.
    #[error("secondary contributors are already registered")]
    ContributorsAlreadyRegistered,

    /// No backup key has been generated yet.
    #[error("no backup key is configured")]
    NoBackupKey,

    /// More than one backup key row exists: an integrity violation.
    #[error("expected exactly one backup key, found {count}")]
    MultipleBackupKeys { count: usize },

    /// The operation named a key that is not the current one.
    #[error("backup key mismatch: {key_id} is not the current key")]
    KeyMismatch { key_id: String },

    /// Contributor outputs could not be assembled into an envelope.
    #[error("malformed envelope: {reason}")]
    MalformedEnvelope { reason: String },

    /// Decrypted bytes could not be parsed, even after the legacy
    /// decompression fallback.
    #[error("malformed backup data")]
    MalformedBackupData,

    /// The sealed bytes are too short to even contain a MAC.
    #[error("mac computation failed: sealed data too short")]
    MacComputationFailed,

    /// The recomputed MAC does not match the trailing MAC. The data was
    /// tampered with, or the wrong backup seed was entered.
    #[error("mac comparison failed")]
    MacComparisonFailed,

    /// MAC verified but decryption failed.
    #[error("backup data decryption failed")]
    DecryptionFailed,

    /// A contributor failed to produce or consume its slice.
    #[error("contributor {identifier} failed: {reason}")]
    Contributor { identifier: String, reason: String },

    /// No recovered envelope is parked under this request token.
    #[error("no recovered backup for request {request}")]
    RestoreRequestNotFound { request: String },

    /// A record was asked to transition out of order.
    #[error("invalid status transition from {from} to {attempted}")]
    InvalidStatusTransition { from: String, attempted: String },

    /// The record's for-export flag does not match the operation.
    #[error("record version {version} has for_export = {for_export}, which does not match the operation")]
    ForExportMismatch { version: i64, for_export: bool },

    /// No record with this version exists under the key.
    #[error("no backup record with version {version}")]
    RecordNotFound { version: i64 },

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("store error: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for LarkBackupError {
    fn from(e: rusqlite::Error) -> Self {
        LarkBackupError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for LarkBackupError {
    fn from(e: serde_json::Error) -> Self {
        LarkBackupError::MalformedEnvelope {
            reason: e.to_string(),
        }
    }
}
