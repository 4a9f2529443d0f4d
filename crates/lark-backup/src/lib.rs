//! Lark backup engine.
//!
//! Aggregates application state from independently owned contributors,
//! seals it into a single authenticated encrypted envelope, persists a
//! bounded history of sealed backups, and restores an envelope's contents
//! back to the contributors on a new device.
//!
//! Wire format: JSON envelope (`app` / `engine` / `backup_timestamp` /
//! `backup_json_version`), sealed as `ciphertext || mac`.
//! Crypto: X25519 + XChaCha20-Poly1305 encryption, HMAC-SHA256
//! authentication, everything derived from the user-held backup seed.

pub mod contributor;
pub mod crypto;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod inflight;
pub mod requirement;
pub mod store;
pub mod types;

pub use contributor::{Contributor, ContributorData, ContributorRegistry};
pub use crypto::{
    derive_keys, seal, unseal, BackupKeyId, BackupSeed, DerivedBackupKeys, SealingKeys,
    MAC_LENGTH,
};
pub use engine::{BackupEngine, EngineConfig, RecoveredBackup, SealedBackup};
pub use envelope::{FullBackup, BACKUP_JSON_VERSION};
pub use error::LarkBackupError;
pub use inflight::InFlightRestores;
pub use requirement::BackupRequirement;
pub use store::{
    BackupKeyInfo, BackupRecord, BackupStatus, RecordStore, StoredBackupKey,
    DEFAULT_RETAINED_BACKUPS_PER_BUCKET,
};
pub use types::{now_ms, ContributorId, RequestId, SourceTag};
