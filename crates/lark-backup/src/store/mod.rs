/// Backup record store — versioned record lifecycle under a single key.
///
/// Two layers:
/// - **Types**: the status machine and row structs
/// - **Sqlite**: the transactional store itself
pub mod sqlite;
pub mod types;

pub use sqlite::RecordStore;
pub use types::{
    BackupKeyInfo, BackupRecord, BackupStatus, StoredBackupKey,
    DEFAULT_RETAINED_BACKUPS_PER_BUCKET,
};
