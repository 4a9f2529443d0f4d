/// The backup engine facade.
///
/// Ties the contributor registry, the envelope codec, the sealer, the
/// record store, and the in-flight restore registry into the operations
/// the application layer calls: initiate a backup, recover and restore
/// one, mark outcomes, wipe legacy data, and run the periodic evaluation.
///
/// Create path: contributors produce concurrently → assemble → serialize →
/// seal → persist (`ongoing → ready`). Restore path: unseal → parse → park
/// in flight → redistribute (secondaries first, then the primary).
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use crate::contributor::{Contributor, ContributorRegistry};
use crate::crypto::{self, BackupSeed};
use crate::envelope::FullBackup;
use crate::error::LarkBackupError;
use crate::inflight::InFlightRestores;
use crate::requirement::BackupRequirement;
use crate::store::{BackupKeyInfo, RecordStore, DEFAULT_RETAINED_BACKUPS_PER_BUCKET};
use crate::types::{RequestId, SourceTag};

/// Tunables for the engine.
pub struct EngineConfig {
    /// A backup becomes required once the last success is older than this.
    pub max_backup_age: Duration,
    /// Records retained per `(key, for_export)` bucket during housekeeping.
    pub retained_backups_per_bucket: usize,
    /// Attempts for the legacy-data deletion before surfacing the error.
    pub legacy_delete_max_attempts: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_backup_age: Duration::from_secs(7 * 24 * 60 * 60),
            retained_backups_per_bucket: DEFAULT_RETAINED_BACKUPS_PER_BUCKET,
            legacy_delete_max_attempts: 10,
        }
    }
}

/// Outcome of a successful `initiate_backup`.
#[derive(Debug, Clone)]
pub struct SealedBackup {
    pub key_id: String,
    pub version: i64,
    pub encrypted_content: Vec<u8>,
}

/// Outcome of a successful `recover_backup_data`.
#[derive(Debug, Clone, Copy)]
pub struct RecoveredBackup {
    /// Token to pass to `restore_full_backup`.
    pub request: RequestId,
    /// When the recovered envelope was created, Unix ms.
    pub backup_timestamp: u64,
}

/// Aggregates a user's application state from registered contributors,
/// seals it, persists a bounded history, and restores it back.
pub struct BackupEngine {
    registry: ContributorRegistry,
    store: RecordStore,
    inflight: InFlightRestores,
    requirement: BackupRequirement,
    config: EngineConfig,
}

impl BackupEngine {
    pub fn new(store: RecordStore, config: EngineConfig) -> Self {
        Self {
            registry: ContributorRegistry::new(),
            store,
            inflight: InFlightRestores::new(),
            requirement: BackupRequirement::new(),
            config,
        }
    }

    // ── Registration ─────────────────────────────────────────────────────

    /// One-shot registration of the secondary contributors.
    pub fn register_secondary_contributors(
        &self,
        contributors: &[Arc<dyn Contributor>],
    ) -> Result<(), LarkBackupError> {
        self.registry.register_secondary_contributors(contributors)
    }

    /// Register the single primary contributor.
    pub fn register_primary_contributor(&self, contributor: &Arc<dyn Contributor>) {
        self.registry.register_primary_contributor(contributor);
    }

    /// Whether the primary contributor is registered and alive.
    pub fn is_primary_registered(&self) -> bool {
        self.registry.is_primary_registered()
    }

    // ── Key management ───────────────────────────────────────────────────

    /// Derive keys from a fresh seed and persist their public half.
    ///
    /// Returns the new key id. The store enforces at most one current key;
    /// installing a second without wiping first will surface as an
    /// integrity error on the next read.
    pub fn generate_backup_key(&self, seed: &BackupSeed) -> Result<String, LarkBackupError> {
        let keys = crypto::derive_keys(seed).sealing_keys();
        self.store.install_key(&keys)?;
        let key_id = keys.key_id.to_hex();
        tracing::info!(%key_id, "installed new backup key");
        Ok(key_id)
    }

    /// Summary of the current key, or `None` when no key is configured.
    pub fn backup_key_information(
        &self,
        request: RequestId,
    ) -> Result<Option<BackupKeyInfo>, LarkBackupError> {
        tracing::debug!(%request, "reading backup key information");
        self.store.key_info()
    }

    // ── Create path ──────────────────────────────────────────────────────

    /// Collect every contributor's state, seal it, and persist a new
    /// versioned record under the current key.
    pub async fn initiate_backup(
        &self,
        for_export: bool,
        request: RequestId,
    ) -> Result<SealedBackup, LarkBackupError> {
        if !self.registry.is_primary_registered() {
            tracing::error!(%request, "cannot back up: primary contributor not registered");
            return Err(LarkBackupError::PrimaryContributorNotRegistered);
        }

        let contributors = self.registry.live_contributors();
        tracing::info!(%request, contributors = contributors.len(), for_export, "initiating backup");

        let outputs = collect_contributor_outputs(&contributors, request).await?;
        let envelope = FullBackup::assemble(outputs, self.registry.has_secondary_contributors())?;
        let envelope_bytes = envelope.to_bytes()?;
        tracing::debug!(%request, bytes = envelope_bytes.len(), "assembled full backup");

        let key = self.store.current_key()?.ok_or(LarkBackupError::NoBackupKey)?;
        let record = self.store.create_ongoing(&key.key_id, for_export)?;

        let sealed = match key
            .sealing_keys()
            .and_then(|keys| crypto::seal(&envelope_bytes, &keys))
        {
            Ok(sealed) => sealed,
            Err(e) => {
                self.fail_record_best_effort(&key.key_id, record.version);
                return Err(e);
            }
        };

        if let Err(e) = self.store.set_ready(&key.key_id, record.version, &sealed) {
            self.fail_record_best_effort(&key.key_id, record.version);
            return Err(e);
        }

        tracing::info!(
            %request,
            key_id = %key.key_id,
            version = record.version,
            bytes = sealed.len(),
            "backup sealed and persisted"
        );

        Ok(SealedBackup {
            key_id: key.key_id,
            version: record.version,
            encrypted_content: sealed,
        })
    }

    fn fail_record_best_effort(&self, key_id: &str, version: i64) {
        if let Err(e) = self.store.mark_failed(key_id, version) {
            tracing::warn!(key_id, version, error = %e, "could not mark ongoing backup as failed");
        }
    }

    // ── Restore path ─────────────────────────────────────────────────────

    /// Verify, decrypt, and parse sealed bytes, then park the envelope for
    /// a subsequent `restore_full_backup`. Restores nothing by itself.
    pub async fn recover_backup_data(
        &self,
        sealed: &[u8],
        seed: &BackupSeed,
        request: RequestId,
    ) -> Result<RecoveredBackup, LarkBackupError> {
        tracing::info!(%request, bytes = sealed.len(), "recovering backup data");

        let keys = crypto::derive_keys(seed);
        let envelope_bytes = crypto::unseal(sealed, &keys)?;
        tracing::debug!(%request, "backup data authenticated and decrypted");

        let envelope = FullBackup::from_bytes(&envelope_bytes)?;
        let backup_timestamp = envelope.backup_timestamp();
        self.inflight.insert(request, envelope);

        Ok(RecoveredBackup {
            request,
            backup_timestamp,
        })
    }

    /// Redistribute a recovered envelope back to the contributors.
    ///
    /// Secondary contributors consume their slices concurrently; the first
    /// failure aborts the whole restore. Only after every secondary has
    /// succeeded does the primary consume its slice: its restoration logic
    /// assumes secondary state (e.g. cryptographic identities) is present.
    pub async fn restore_full_backup(&self, request: RequestId) -> Result<(), LarkBackupError> {
        let envelope =
            self.inflight
                .take(&request)
                .ok_or_else(|| LarkBackupError::RestoreRequestNotFound {
                    request: request.to_string(),
                })?;

        if !self.registry.is_primary_registered() {
            tracing::error!(%request, "cannot restore: primary contributor not registered");
            return Err(LarkBackupError::PrimaryContributorNotRegistered);
        }

        let (primaries, secondaries) = self.registry.partition_live();
        let primary = primaries
            .into_iter()
            .next()
            .ok_or(LarkBackupError::PrimaryContributorNotRegistered)?;

        tracing::info!(%request, secondaries = secondaries.len(), "restoring full backup");

        let mut tasks = JoinSet::new();
        for contributor in secondaries {
            let identifier = contributor.backup_identifier();
            let Some(slice) = envelope.slice_for(SourceTag::Secondary, identifier.as_str()) else {
                // Envelope predates this contributor: nothing to restore.
                tracing::debug!(%request, contributor = %identifier, "no slice in envelope, skipping");
                continue;
            };
            let slice = slice.to_string();
            tasks.spawn(async move {
                contributor.consume(request, Some(slice)).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            // First failure wins; dropping the set aborts the rest.
            joined.map_err(|e| LarkBackupError::Contributor {
                identifier: "secondary".into(),
                reason: format!("consume task aborted: {e}"),
            })??;
        }
        tracing::debug!(%request, "all secondary contributors restored");

        // The primary slice may be absent in very old envelopes; the
        // primary treats that as "keep current state".
        let primary_slice = envelope
            .slice_for(SourceTag::Primary, primary.backup_identifier().as_str())
            .map(str::to_string);
        primary.consume(request, primary_slice).await?;

        tracing::info!(%request, "full backup restored");
        Ok(())
    }

    // ── Outcome reporting ────────────────────────────────────────────────

    /// Record that the user exported this backup version.
    pub fn mark_exported(
        &self,
        key_id: &str,
        version: i64,
        request: RequestId,
    ) -> Result<(), LarkBackupError> {
        self.check_current_key(key_id)?;
        self.store.mark_exported(key_id, version)?;
        tracing::info!(%request, key_id, version, "backup marked exported");
        Ok(())
    }

    /// Record that this backup version was uploaded. Clears the
    /// backup-required flag.
    pub fn mark_uploaded(
        &self,
        key_id: &str,
        version: i64,
        request: RequestId,
    ) -> Result<(), LarkBackupError> {
        self.check_current_key(key_id)?;
        self.store.mark_uploaded(key_id, version)?;
        self.requirement.clear_after_upload();
        tracing::info!(%request, key_id, version, "backup marked uploaded");
        Ok(())
    }

    /// Record that this backup attempt failed. The required flag stays set
    /// so a future attempt retries.
    pub fn mark_failed(
        &self,
        key_id: &str,
        version: i64,
        request: RequestId,
    ) -> Result<(), LarkBackupError> {
        self.check_current_key(key_id)?;
        self.store.mark_failed(key_id, version)?;
        tracing::warn!(%request, key_id, version, "backup marked failed");
        Ok(())
    }

    fn check_current_key(&self, key_id: &str) -> Result<(), LarkBackupError> {
        let current = self.store.current_key()?.ok_or(LarkBackupError::NoBackupKey)?;
        if current.key_id != key_id {
            return Err(LarkBackupError::KeyMismatch {
                key_id: key_id.to_string(),
            });
        }
        Ok(())
    }

    // ── Migration ────────────────────────────────────────────────────────

    /// Delete every legacy key and record, as the user migrates away from
    /// this backup scheme.
    ///
    /// The two-phase delete is retried with sub-second random backoff; the
    /// final error is surfaced only once the attempt bound is exhausted.
    pub async fn delete_all_legacy_data(&self, request: RequestId) -> Result<(), LarkBackupError> {
        let max_attempts = self.config.legacy_delete_max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let outcome = self
                .store
                .delete_all_keys()
                .and_then(|()| self.store.delete_all_records());
            match outcome {
                Ok(()) => {
                    tracing::info!(%request, attempt, "legacy backup data deleted");
                    return Ok(());
                }
                Err(e) if attempt == max_attempts => {
                    tracing::error!(%request, attempt, error = %e, "legacy deletion giving up");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(%request, attempt, error = %e, "legacy deletion failed, retrying");
                    let jitter = Duration::from_millis(rand::random_range(0..1000u64));
                    tokio::time::sleep(jitter).await;
                }
            }
        }
        unreachable!("retry loop returns on the final attempt")
    }

    // ── Periodic evaluation ──────────────────────────────────────────────

    /// Decide whether a backup is due and prune obsolete records.
    ///
    /// Sets the required flag when the last success is too old, when the
    /// current key has never produced a successful backup, or when the most
    /// recent record failed. No scheduling happens here.
    pub fn evaluate_and_housekeep(&self, request: RequestId) -> Result<(), LarkBackupError> {
        if let Some(key) = self.store.current_key()? {
            match self.store.last_success_ms(&key.key_id)? {
                None => {
                    tracing::info!(%request, "no backup ever succeeded under the current key");
                    self.requirement.mark_required();
                }
                Some(last_success) => {
                    let age_ms = crate::types::now_ms().saturating_sub(last_success);
                    if age_ms > self.config.max_backup_age.as_millis() as u64 {
                        tracing::info!(%request, age_ms, "last successful backup is too old");
                        self.requirement.mark_required();
                    } else if let Some(last) = self.store.last_record(&key.key_id)? {
                        if last.status == crate::store::BackupStatus::Failed {
                            tracing::info!(%request, "most recent backup failed");
                            self.requirement.mark_required();
                        }
                    }
                }
            }
        }

        for key_id in self.store.all_key_ids()? {
            let deleted = self
                .store
                .delete_obsolete(&key_id, self.config.retained_backups_per_bucket)?;
            if deleted > 0 {
                tracing::debug!(%request, key_id, deleted, "pruned obsolete backup records");
            }
        }
        Ok(())
    }

    /// A contributor reported that its state changed since the last backup.
    pub fn note_contributor_changed(&self) {
        self.requirement.mark_required();
    }

    /// The user switched automatic backups on.
    pub fn user_activated_automatic_backup(&self) {
        self.requirement.mark_required();
    }

    /// Whether an automatic backup is currently due.
    pub fn is_backup_required(&self) -> bool {
        self.requirement.is_required()
    }
}

/// Concurrent produce fan-out with a fan-in barrier.
///
/// Every contributor must report before assembly starts; the first failure
/// aborts the collection.
async fn collect_contributor_outputs(
    contributors: &[Arc<dyn Contributor>],
    request: RequestId,
) -> Result<HashMap<SourceTag, HashMap<String, String>>, LarkBackupError> {
    let mut tasks = JoinSet::new();
    for contributor in contributors {
        let contributor = contributor.clone();
        tasks.spawn(async move { contributor.produce(request).await });
    }

    let mut outputs: HashMap<SourceTag, HashMap<String, String>> = HashMap::new();
    while let Some(joined) = tasks.join_next().await {
        let data = joined.map_err(|e| LarkBackupError::Contributor {
            identifier: "unknown".into(),
            reason: format!("produce task aborted: {e}"),
        })??;
        outputs
            .entry(data.source)
            .or_default()
            .insert(data.identifier.to_string(), data.payload);
    }
    Ok(outputs)
}
