/// The full-backup envelope and its wire codec.
///
/// Serialized as JSON with a fixed field vocabulary (`app`, `engine`,
/// `backup_timestamp`, `backup_json_version`). Unknown fields are ignored
/// on parse so newer writers stay readable.
///
/// Historical versions of the app compressed the serialized envelope before
/// encryption; `from_bytes` therefore falls back to a deflate pass when the
/// direct decode fails. There is no format marker; compressed vs. not is
/// detected purely by decode failure.
use std::collections::{BTreeMap, HashMap};

use flate2::{Decompress, FlushDecompress, Status};
use serde::{Deserialize, Serialize};

use crate::error::LarkBackupError;
use crate::types::{now_ms, SourceTag};

/// The single supported envelope format version.
pub const BACKUP_JSON_VERSION: u32 = 0;

/// Hard ceiling on the decompression buffer (~100 MB).
const MAX_DECOMPRESSED_CAPACITY: usize = 100_000_000;

/// Assembled, not-yet-encrypted state of one backup attempt.
///
/// Immutable after construction: built fresh for every backup, or
/// reconstructed by parsing during a restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullBackup {
    /// The primary contributor's opaque payload. Absent in very old
    /// envelopes made before the application contributed data.
    #[serde(rename = "app", default, skip_serializing_if = "Option::is_none")]
    app_backup: Option<String>,
    /// Secondary contributors' payloads, keyed by contributor identifier.
    #[serde(rename = "engine")]
    engine_backups: BTreeMap<String, String>,
    /// Creation time, Unix milliseconds.
    #[serde(rename = "backup_timestamp")]
    backup_timestamp: u64,
    #[serde(rename = "backup_json_version")]
    json_version: u32,
}

impl FullBackup {
    /// Assemble an envelope from collected contributor outputs.
    ///
    /// The primary source may carry zero or one entry; more is a
    /// construction error. The secondary map must be present whenever any
    /// secondary contributor is registered; its absence means a
    /// contributor failed to report without surfacing an error.
    pub fn assemble(
        mut outputs: HashMap<SourceTag, HashMap<String, String>>,
        secondaries_registered: bool,
    ) -> Result<Self, LarkBackupError> {
        let app_backup = match outputs.remove(&SourceTag::Primary) {
            Some(map) => {
                if map.len() > 1 {
                    return Err(LarkBackupError::MalformedEnvelope {
                        reason: format!("expected at most one primary payload, got {}", map.len()),
                    });
                }
                map.into_values().next()
            }
            None => None,
        };

        let engine_backups = match outputs.remove(&SourceTag::Secondary) {
            Some(map) => map.into_iter().collect(),
            None if secondaries_registered => {
                return Err(LarkBackupError::MalformedEnvelope {
                    reason: "no secondary contributor data".into(),
                });
            }
            None => BTreeMap::new(),
        };

        Ok(Self {
            app_backup,
            engine_backups,
            backup_timestamp: now_ms(),
            json_version: BACKUP_JSON_VERSION,
        })
    }

    /// Serialize to the JSON wire format.
    pub fn to_bytes(&self) -> Result<Vec<u8>, LarkBackupError> {
        serde_json::to_vec(self).map_err(Into::into)
    }

    /// Parse an envelope, falling back to legacy decompression.
    pub fn from_bytes(data: &[u8]) -> Result<Self, LarkBackupError> {
        if let Ok(envelope) = serde_json::from_slice::<FullBackup>(data) {
            return Ok(envelope);
        }
        // Pre-dating the uncompressed format, envelopes were deflated
        // before encryption. No marker distinguishes the two.
        tracing::info!("direct envelope decode failed, trying legacy decompression");
        let decompressed = decompress_legacy(data)?;
        serde_json::from_slice(&decompressed).map_err(|_| LarkBackupError::MalformedBackupData)
    }

    /// The slice belonging to a contributor, if the envelope carries one.
    pub fn slice_for(&self, source: SourceTag, identifier: &str) -> Option<&str> {
        match source {
            SourceTag::Primary => self.app_backup.as_deref(),
            SourceTag::Secondary => self.engine_backups.get(identifier).map(String::as_str),
        }
    }

    /// Identifiers of every secondary slice in the envelope.
    pub fn secondary_identifiers(&self) -> impl Iterator<Item = &str> {
        self.engine_backups.keys().map(String::as_str)
    }

    /// Creation time, Unix milliseconds.
    pub fn backup_timestamp(&self) -> u64 {
        self.backup_timestamp
    }
}

/// Legacy deflate fallback with a capacity-doubling buffer.
///
/// The decompressed size is unknown, so the guess starts at 8× the input
/// size. Zero bytes produced or an exactly-filled buffer both read as "too
/// small": double and retry, up to the hard ceiling.
fn decompress_legacy(data: &[u8]) -> Result<Vec<u8>, LarkBackupError> {
    if data.is_empty() {
        return Err(LarkBackupError::MalformedBackupData);
    }

    let mut capacity = data.len().saturating_mul(8);
    while capacity < MAX_DECOMPRESSED_CAPACITY {
        let mut output = Vec::with_capacity(capacity);
        let mut decoder = Decompress::new(false);
        let ambiguous = match decoder.decompress_vec(data, &mut output, FlushDecompress::Finish) {
            Ok(Status::StreamEnd) => output.is_empty() || output.len() == capacity,
            // Buffer filled before the stream ended, or the decoder wants
            // more room: same signal as a corrupt stream in the legacy
            // format. Retry bigger until the ceiling rules it out.
            Ok(Status::Ok) | Ok(Status::BufError) => true,
            Err(_) => true,
        };
        if !ambiguous {
            return Ok(output);
        }
        capacity *= 2;
    }

    tracing::warn!("legacy decompression gave up at the capacity ceiling");
    Err(LarkBackupError::MalformedBackupData)
}
