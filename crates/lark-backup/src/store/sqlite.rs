/// SQLite-backed store for backup keys and versioned backup records.
///
/// Every operation runs inside a single transaction, so read-then-write
/// sequences (version allocation, status transitions) stay atomic under
/// concurrent callers. The connection sits behind a mutex and is never
/// held across an await point.
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::crypto::SealingKeys;
use crate::error::LarkBackupError;
use crate::types::now_ms;

use super::types::{BackupKeyInfo, BackupRecord, BackupStatus, StoredBackupKey};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS backup_key (
    key_id                TEXT PRIMARY KEY,
    encryption_public_key BLOB NOT NULL,
    mac_key               BLOB NOT NULL,
    created_at            INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS backup_record (
    key_id            TEXT NOT NULL REFERENCES backup_key(key_id) ON DELETE CASCADE,
    version           INTEGER NOT NULL,
    for_export        INTEGER NOT NULL,
    status            TEXT NOT NULL,
    created_at        INTEGER NOT NULL,
    status_changed_at INTEGER NOT NULL,
    encrypted_content BLOB,
    PRIMARY KEY (key_id, version)
);
";

/// Transactional store for `backup_key` and `backup_record` rows.
pub struct RecordStore {
    conn: Mutex<Connection>,
}

impl RecordStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LarkBackupError> {
        Self::setup(Connection::open(path)?)
    }

    /// Open an in-memory store. Used by tests.
    pub fn open_in_memory() -> Result<Self, LarkBackupError> {
        Self::setup(Connection::open_in_memory()?)
    }

    fn setup(conn: Connection) -> Result<Self, LarkBackupError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── Keys ─────────────────────────────────────────────────────────────

    /// Persist the public half of a freshly derived key.
    pub fn install_key(&self, keys: &SealingKeys) -> Result<(), LarkBackupError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO backup_key (key_id, encryption_public_key, mac_key, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                keys.key_id.to_hex(),
                keys.encryption_public.as_bytes().as_slice(),
                keys.mac_key.as_slice(),
                now_ms() as i64,
            ],
        )?;
        Ok(())
    }

    /// The single current key.
    ///
    /// Zero rows is `Ok(None)` ("no key configured"); more than one is an
    /// integrity violation.
    pub fn current_key(&self) -> Result<Option<StoredBackupKey>, LarkBackupError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT key_id, encryption_public_key, mac_key, created_at FROM backup_key",
        )?;
        let keys: Vec<StoredBackupKey> = stmt
            .query_map([], |row| {
                Ok(StoredBackupKey {
                    key_id: row.get(0)?,
                    encryption_public_key: blob_to_array(row.get::<_, Vec<u8>>(1)?)?,
                    mac_key: blob_to_array(row.get::<_, Vec<u8>>(2)?)?,
                    created_at: row.get::<_, i64>(3)? as u64,
                })
            })?
            .collect::<Result<_, _>>()?;

        match keys.len() {
            0 => Ok(None),
            1 => Ok(keys.into_iter().next()),
            count => Err(LarkBackupError::MultipleBackupKeys { count }),
        }
    }

    /// Summary of the current key for the caller layer.
    pub fn key_info(&self) -> Result<Option<BackupKeyInfo>, LarkBackupError> {
        let Some(key) = self.current_key()? else {
            return Ok(None);
        };
        let last_success_ms = self.last_success_ms(&key.key_id)?;
        Ok(Some(BackupKeyInfo {
            key_id: key.key_id,
            created_at: key.created_at,
            last_success_ms,
        }))
    }

    /// All key ids, for housekeeping sweeps.
    pub fn all_key_ids(&self) -> Result<Vec<String>, LarkBackupError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare("SELECT key_id FROM backup_key")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(ids)
    }

    // ── Record lifecycle ─────────────────────────────────────────────────

    /// Allocate the next version under the key and insert an `ongoing` record.
    pub fn create_ongoing(
        &self,
        key_id: &str,
        for_export: bool,
    ) -> Result<BackupRecord, LarkBackupError> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;

        let version: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version) + 1, 0) FROM backup_record WHERE key_id = ?1",
            params![key_id],
            |row| row.get(0),
        )?;
        let now = now_ms();
        tx.execute(
            "INSERT INTO backup_record
             (key_id, version, for_export, status, created_at, status_changed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                key_id,
                version,
                for_export,
                BackupStatus::Ongoing.as_str(),
                now as i64,
            ],
        )?;
        tx.commit()?;

        Ok(BackupRecord {
            key_id: key_id.to_string(),
            version,
            for_export,
            status: BackupStatus::Ongoing,
            created_at: now,
            status_changed_at: now,
            encrypted_content: None,
        })
    }

    /// Transition `ongoing → ready`, attaching the sealed bytes.
    pub fn set_ready(
        &self,
        key_id: &str,
        version: i64,
        encrypted_content: &[u8],
    ) -> Result<(), LarkBackupError> {
        self.transition(key_id, version, BackupStatus::Ready, |record| {
            if !record
                .status
                .can_transition_to(BackupStatus::Ready)
            {
                return Err(invalid_transition(record.status, BackupStatus::Ready));
            }
            Ok(Some(encrypted_content.to_vec()))
        })
    }

    /// Transition `ready → exported`. The record must be an export record.
    pub fn mark_exported(&self, key_id: &str, version: i64) -> Result<(), LarkBackupError> {
        self.transition(key_id, version, BackupStatus::Exported, |record| {
            if !record.for_export {
                return Err(LarkBackupError::ForExportMismatch {
                    version,
                    for_export: record.for_export,
                });
            }
            if !record.status.can_transition_to(BackupStatus::Exported) {
                return Err(invalid_transition(record.status, BackupStatus::Exported));
            }
            Ok(None)
        })
    }

    /// Transition `ready → uploaded`. The record must be an upload record.
    pub fn mark_uploaded(&self, key_id: &str, version: i64) -> Result<(), LarkBackupError> {
        self.transition(key_id, version, BackupStatus::Uploaded, |record| {
            if record.for_export {
                return Err(LarkBackupError::ForExportMismatch {
                    version,
                    for_export: record.for_export,
                });
            }
            if !record.status.can_transition_to(BackupStatus::Uploaded) {
                return Err(invalid_transition(record.status, BackupStatus::Uploaded));
            }
            Ok(None)
        })
    }

    /// Transition `ongoing | ready → failed`. Terminal states are an error.
    pub fn mark_failed(&self, key_id: &str, version: i64) -> Result<(), LarkBackupError> {
        self.transition(key_id, version, BackupStatus::Failed, |record| {
            if !record.status.can_transition_to(BackupStatus::Failed) {
                return Err(invalid_transition(record.status, BackupStatus::Failed));
            }
            Ok(None)
        })
    }

    /// Shared read-check-write transition, one transaction.
    ///
    /// `check` validates the loaded record and may return replacement
    /// content to attach with the status change.
    fn transition(
        &self,
        key_id: &str,
        version: i64,
        next: BackupStatus,
        check: impl FnOnce(&BackupRecord) -> Result<Option<Vec<u8>>, LarkBackupError>,
    ) -> Result<(), LarkBackupError> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;

        let record = query_record(&tx, key_id, version)?
            .ok_or(LarkBackupError::RecordNotFound { version })?;
        let content = check(&record)?;

        match content {
            Some(bytes) => {
                tx.execute(
                    "UPDATE backup_record
                     SET status = ?1, status_changed_at = ?2, encrypted_content = ?3
                     WHERE key_id = ?4 AND version = ?5",
                    params![next.as_str(), now_ms() as i64, bytes, key_id, version],
                )?;
            }
            None => {
                tx.execute(
                    "UPDATE backup_record
                     SET status = ?1, status_changed_at = ?2
                     WHERE key_id = ?3 AND version = ?4",
                    params![next.as_str(), now_ms() as i64, key_id, version],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────────────────

    /// The most recent non-failed record under the key, if any.
    pub fn get_current(&self, key_id: &str) -> Result<Option<BackupRecord>, LarkBackupError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let record = conn
            .query_row(
                "SELECT key_id, version, for_export, status, created_at, status_changed_at,
                        encrypted_content
                 FROM backup_record
                 WHERE key_id = ?1 AND status <> 'failed'
                 ORDER BY version DESC LIMIT 1",
                params![key_id],
                row_to_record,
            )
            .optional()?;
        record.map(record_from_row).transpose()
    }

    /// The most recent record under the key regardless of status.
    pub fn last_record(&self, key_id: &str) -> Result<Option<BackupRecord>, LarkBackupError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let record = conn
            .query_row(
                "SELECT key_id, version, for_export, status, created_at, status_changed_at,
                        encrypted_content
                 FROM backup_record
                 WHERE key_id = ?1
                 ORDER BY version DESC LIMIT 1",
                params![key_id],
                row_to_record,
            )
            .optional()?;
        record.map(record_from_row).transpose()
    }

    /// Fetch one record by version.
    pub fn get_record(
        &self,
        key_id: &str,
        version: i64,
    ) -> Result<Option<BackupRecord>, LarkBackupError> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;
        let record = query_record(&tx, key_id, version)?;
        tx.commit()?;
        Ok(record)
    }

    /// Timestamp of the most recent successful export/upload under the key.
    pub fn last_success_ms(&self, key_id: &str) -> Result<Option<u64>, LarkBackupError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let ts: Option<i64> = conn.query_row(
            "SELECT MAX(status_changed_at) FROM backup_record
             WHERE key_id = ?1 AND status IN ('exported', 'uploaded')",
            params![key_id],
            |row| row.get(0),
        )?;
        Ok(ts.map(|t| t as u64))
    }

    // ── Housekeeping ─────────────────────────────────────────────────────

    /// Retain the newest `keep` records per `(key, for_export)` bucket and
    /// delete the rest. Never touches an `ongoing` record.
    pub fn delete_obsolete(&self, key_id: &str, keep: usize) -> Result<usize, LarkBackupError> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;
        let mut deleted = 0;
        for for_export in [false, true] {
            deleted += tx.execute(
                "DELETE FROM backup_record
                 WHERE key_id = ?1 AND for_export = ?2 AND status <> 'ongoing'
                   AND version NOT IN (
                       SELECT version FROM backup_record
                       WHERE key_id = ?1 AND for_export = ?2
                       ORDER BY version DESC LIMIT ?3
                   )",
                params![key_id, for_export, keep as i64],
            )?;
        }
        tx.commit()?;
        Ok(deleted)
    }

    /// Phase one of the legacy wipe: drop every key (records cascade).
    pub fn delete_all_keys(&self) -> Result<(), LarkBackupError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute("DELETE FROM backup_key", [])?;
        Ok(())
    }

    /// Phase two of the legacy wipe: sweep any orphaned records.
    pub fn delete_all_records(&self) -> Result<(), LarkBackupError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute("DELETE FROM backup_record", [])?;
        Ok(())
    }
}

/// Intermediate row shape: status still a string, decoded after the
/// rusqlite error boundary.
type RawRecord = (String, i64, bool, String, i64, i64, Option<Vec<u8>>);

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn record_from_row(raw: RawRecord) -> Result<BackupRecord, LarkBackupError> {
    let (key_id, version, for_export, status, created_at, status_changed_at, encrypted_content) =
        raw;
    Ok(BackupRecord {
        key_id,
        version,
        for_export,
        status: BackupStatus::parse(&status)?,
        created_at: created_at as u64,
        status_changed_at: status_changed_at as u64,
        encrypted_content,
    })
}

fn query_record(
    tx: &rusqlite::Transaction<'_>,
    key_id: &str,
    version: i64,
) -> Result<Option<BackupRecord>, LarkBackupError> {
    let raw = tx
        .query_row(
            "SELECT key_id, version, for_export, status, created_at, status_changed_at,
                    encrypted_content
             FROM backup_record WHERE key_id = ?1 AND version = ?2",
            params![key_id, version],
            row_to_record,
        )
        .optional()?;
    raw.map(record_from_row).transpose()
}

fn blob_to_array(blob: Vec<u8>) -> rusqlite::Result<[u8; 32]> {
    blob.try_into().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            32,
            rusqlite::types::Type::Blob,
            "expected a 32-byte key blob".into(),
        )
    })
}

fn invalid_transition(from: BackupStatus, attempted: BackupStatus) -> LarkBackupError {
    LarkBackupError::InvalidStatusTransition {
        from: from.to_string(),
        attempted: attempted.to_string(),
    }
}
