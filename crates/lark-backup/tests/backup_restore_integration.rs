//! End-to-end scenarios: create a backup on one engine, recover and
//! restore it on another, and exercise the failure paths in between.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lark_backup::{
    BackupEngine, BackupSeed, Contributor, ContributorData, ContributorId, EngineConfig,
    LarkBackupError, RecordStore, RequestId, SourceTag,
};

/// Scriptable contributor double.
///
/// Records every consume call, optionally fails, and participates in a
/// shared restore log so tests can assert ordering.
struct TestContributor {
    id: String,
    source: SourceTag,
    payload: String,
    fail_consume: bool,
    consumed: Mutex<Vec<Option<String>>>,
    /// Shared across contributors: secondaries append their id here.
    restore_log: Arc<Mutex<Vec<String>>>,
    /// Primary only: snapshot of the restore log taken during consume.
    seen_at_primary: Mutex<Option<Vec<String>>>,
}

impl TestContributor {
    fn new(
        id: &str,
        source: SourceTag,
        payload: &str,
        restore_log: Arc<Mutex<Vec<String>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            source,
            payload: payload.to_string(),
            fail_consume: false,
            consumed: Mutex::new(Vec::new()),
            restore_log,
            seen_at_primary: Mutex::new(None),
        })
    }

    fn failing(id: &str, restore_log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            source: SourceTag::Secondary,
            payload: String::new(),
            fail_consume: true,
            consumed: Mutex::new(Vec::new()),
            restore_log,
            seen_at_primary: Mutex::new(None),
        })
    }

    fn consumed(&self) -> Vec<Option<String>> {
        self.consumed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Contributor for TestContributor {
    fn backup_identifier(&self) -> ContributorId {
        ContributorId::new(self.id.clone())
    }

    fn backup_source(&self) -> SourceTag {
        self.source
    }

    async fn produce(&self, _request: RequestId) -> Result<ContributorData, LarkBackupError> {
        Ok(ContributorData {
            identifier: self.backup_identifier(),
            source: self.source,
            payload: self.payload.clone(),
        })
    }

    async fn consume(
        &self,
        _request: RequestId,
        payload: Option<String>,
    ) -> Result<(), LarkBackupError> {
        if self.fail_consume {
            return Err(LarkBackupError::Contributor {
                identifier: self.id.clone(),
                reason: "simulated consume failure".into(),
            });
        }
        self.consumed.lock().unwrap().push(payload);
        match self.source {
            SourceTag::Secondary => {
                self.restore_log.lock().unwrap().push(self.id.clone());
            }
            SourceTag::Primary => {
                let snapshot = self.restore_log.lock().unwrap().clone();
                *self.seen_at_primary.lock().unwrap() = Some(snapshot);
            }
        }
        Ok(())
    }
}

fn new_engine() -> BackupEngine {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    BackupEngine::new(RecordStore::open_in_memory().unwrap(), EngineConfig::default())
}

struct Fixture {
    engine: BackupEngine,
    app: Arc<TestContributor>,
    x: Arc<TestContributor>,
    y: Arc<TestContributor>,
}

/// An engine with primary "app" = "A" and secondaries x = "1", y = "2".
fn fixture() -> Fixture {
    let log = Arc::new(Mutex::new(Vec::new()));
    let engine = new_engine();
    let app = TestContributor::new("app", SourceTag::Primary, "A", log.clone());
    let x = TestContributor::new("x", SourceTag::Secondary, "1", log.clone());
    let y = TestContributor::new("y", SourceTag::Secondary, "2", log.clone());

    engine.register_primary_contributor(&(app.clone() as Arc<dyn Contributor>));
    engine
        .register_secondary_contributors(&[
            x.clone() as Arc<dyn Contributor>,
            y.clone() as Arc<dyn Contributor>,
        ])
        .unwrap();

    Fixture { engine, app, x, y }
}

#[tokio::test]
async fn create_then_restore_roundtrip() {
    let source = fixture();
    source
        .engine
        .generate_backup_key(&BackupSeed::new("seed1"))
        .unwrap();

    let sealed = source
        .engine
        .initiate_backup(true, RequestId::new())
        .await
        .unwrap();

    // Restore on a "new device": fresh engine, fresh contributors.
    let target = fixture();
    let recovered = target
        .engine
        .recover_backup_data(
            &sealed.encrypted_content,
            &BackupSeed::new("seed1"),
            RequestId::new(),
        )
        .await
        .unwrap();
    assert!(recovered.backup_timestamp > 0);

    target
        .engine
        .restore_full_backup(recovered.request)
        .await
        .unwrap();

    assert_eq!(target.app.consumed(), vec![Some("A".to_string())]);
    assert_eq!(target.x.consumed(), vec![Some("1".to_string())]);
    assert_eq!(target.y.consumed(), vec![Some("2".to_string())]);
}

#[tokio::test]
async fn primary_runs_after_every_secondary() {
    let source = fixture();
    source
        .engine
        .generate_backup_key(&BackupSeed::new("seed1"))
        .unwrap();
    let sealed = source
        .engine
        .initiate_backup(false, RequestId::new())
        .await
        .unwrap();

    let target = fixture();
    let recovered = target
        .engine
        .recover_backup_data(
            &sealed.encrypted_content,
            &BackupSeed::new("seed1"),
            RequestId::new(),
        )
        .await
        .unwrap();
    target
        .engine
        .restore_full_backup(recovered.request)
        .await
        .unwrap();

    // By the time the primary consumed, both secondaries already had.
    let mut seen = target
        .app
        .seen_at_primary
        .lock()
        .unwrap()
        .clone()
        .expect("primary consume ran");
    seen.sort();
    assert_eq!(seen, vec!["x".to_string(), "y".to_string()]);
}

#[tokio::test]
async fn wrong_secret_fails_before_decryption() {
    let source = fixture();
    source
        .engine
        .generate_backup_key(&BackupSeed::new("seed1"))
        .unwrap();
    let sealed = source
        .engine
        .initiate_backup(false, RequestId::new())
        .await
        .unwrap();

    let target = fixture();
    let err = target
        .engine
        .recover_backup_data(
            &sealed.encrypted_content,
            &BackupSeed::new("seed2"),
            RequestId::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LarkBackupError::MacComparisonFailed));
}

#[tokio::test]
async fn registered_contributor_missing_from_envelope_is_skipped() {
    // The envelope only carries x and y.
    let source = fixture();
    source
        .engine
        .generate_backup_key(&BackupSeed::new("seed1"))
        .unwrap();
    let sealed = source
        .engine
        .initiate_backup(false, RequestId::new())
        .await
        .unwrap();

    // The target additionally registers "z", unknown to the envelope.
    let log = Arc::new(Mutex::new(Vec::new()));
    let engine = new_engine();
    let app = TestContributor::new("app", SourceTag::Primary, "A", log.clone());
    let x = TestContributor::new("x", SourceTag::Secondary, "", log.clone());
    let y = TestContributor::new("y", SourceTag::Secondary, "", log.clone());
    let z = TestContributor::new("z", SourceTag::Secondary, "", log.clone());
    engine.register_primary_contributor(&(app.clone() as Arc<dyn Contributor>));
    engine
        .register_secondary_contributors(&[
            x.clone() as Arc<dyn Contributor>,
            y.clone() as Arc<dyn Contributor>,
            z.clone() as Arc<dyn Contributor>,
        ])
        .unwrap();

    let recovered = engine
        .recover_backup_data(
            &sealed.encrypted_content,
            &BackupSeed::new("seed1"),
            RequestId::new(),
        )
        .await
        .unwrap();
    engine.restore_full_backup(recovered.request).await.unwrap();

    // z's consume was never called, not even with an absent payload.
    assert!(z.consumed().is_empty());
    assert_eq!(x.consumed().len(), 1);
    assert_eq!(y.consumed().len(), 1);
}

#[tokio::test]
async fn secondary_failure_aborts_restore_before_primary() {
    let source = fixture();
    source
        .engine
        .generate_backup_key(&BackupSeed::new("seed1"))
        .unwrap();
    let sealed = source
        .engine
        .initiate_backup(false, RequestId::new())
        .await
        .unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let engine = new_engine();
    let app = TestContributor::new("app", SourceTag::Primary, "A", log.clone());
    let x = TestContributor::failing("x", log.clone());
    let y = TestContributor::new("y", SourceTag::Secondary, "", log.clone());
    engine.register_primary_contributor(&(app.clone() as Arc<dyn Contributor>));
    engine
        .register_secondary_contributors(&[
            x.clone() as Arc<dyn Contributor>,
            y.clone() as Arc<dyn Contributor>,
        ])
        .unwrap();

    let recovered = engine
        .recover_backup_data(
            &sealed.encrypted_content,
            &BackupSeed::new("seed1"),
            RequestId::new(),
        )
        .await
        .unwrap();
    let request = recovered.request;
    let err = engine.restore_full_backup(request).await.unwrap_err();
    assert!(matches!(err, LarkBackupError::Contributor { .. }));

    // The primary never consumed, and the in-flight entry is gone: the
    // user must recover again to retry.
    assert!(app.consumed().is_empty());
    let err = engine.restore_full_backup(request).await.unwrap_err();
    assert!(matches!(err, LarkBackupError::RestoreRequestNotFound { .. }));
}

#[tokio::test]
async fn restore_writes_nothing_to_the_record_store() {
    let source = fixture();
    source
        .engine
        .generate_backup_key(&BackupSeed::new("seed1"))
        .unwrap();
    let sealed = source
        .engine
        .initiate_backup(false, RequestId::new())
        .await
        .unwrap();

    // The target engine has no key and no records; restore must not mind.
    let target = fixture();
    let recovered = target
        .engine
        .recover_backup_data(
            &sealed.encrypted_content,
            &BackupSeed::new("seed1"),
            RequestId::new(),
        )
        .await
        .unwrap();
    target
        .engine
        .restore_full_backup(recovered.request)
        .await
        .unwrap();

    assert!(target
        .engine
        .backup_key_information(RequestId::new())
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn legacy_compressed_backup_restores() {
    use std::io::Write;

    // Hand-build a pre-uncompressed-era sealed backup: deflate the JSON
    // envelope, then seal the compressed bytes.
    let envelope_json = serde_json::json!({
        "app": "A",
        "engine": { "x": "1", "y": "2" },
        "backup_timestamp": 1_600_000_000_000u64,
        "backup_json_version": 0,
    });
    let mut encoder =
        flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(envelope_json.to_string().as_bytes())
        .unwrap();
    let compressed = encoder.finish().unwrap();

    let keys = lark_backup::derive_keys(&BackupSeed::new("seed1"));
    let sealed = lark_backup::seal(&compressed, &keys.sealing_keys()).unwrap();

    let target = fixture();
    let recovered = target
        .engine
        .recover_backup_data(&sealed, &BackupSeed::new("seed1"), RequestId::new())
        .await
        .unwrap();
    assert_eq!(recovered.backup_timestamp, 1_600_000_000_000);

    target
        .engine
        .restore_full_backup(recovered.request)
        .await
        .unwrap();
    assert_eq!(target.x.consumed(), vec![Some("1".to_string())]);
    assert_eq!(target.app.consumed(), vec![Some("A".to_string())]);
}

#[tokio::test]
async fn legacy_envelope_without_primary_slice_restores() {
    // Very old envelopes carry no "app" field at all.
    let envelope_json = serde_json::json!({
        "engine": { "x": "1", "y": "2" },
        "backup_timestamp": 1_500_000_000_000u64,
        "backup_json_version": 0,
    });
    let keys = lark_backup::derive_keys(&BackupSeed::new("seed1"));
    let sealed =
        lark_backup::seal(envelope_json.to_string().as_bytes(), &keys.sealing_keys()).unwrap();

    let target = fixture();
    let recovered = target
        .engine
        .recover_backup_data(&sealed, &BackupSeed::new("seed1"), RequestId::new())
        .await
        .unwrap();
    target
        .engine
        .restore_full_backup(recovered.request)
        .await
        .unwrap();

    // The primary is told "nothing to restore" rather than skipped.
    assert_eq!(target.app.consumed(), vec![None]);
    assert_eq!(target.x.consumed(), vec![Some("1".to_string())]);
}

#[tokio::test]
async fn versions_and_retention_across_attempts() {
    let source = fixture();
    let key_id = source
        .engine
        .generate_backup_key(&BackupSeed::new("seed1"))
        .unwrap();

    let mut last_version = 0;
    for _ in 0..5 {
        let sealed = source
            .engine
            .initiate_backup(false, RequestId::new())
            .await
            .unwrap();
        source
            .engine
            .mark_uploaded(&key_id, sealed.version, RequestId::new())
            .unwrap();
        last_version = sealed.version;
    }
    assert_eq!(last_version, 4);

    source
        .engine
        .evaluate_and_housekeep(RequestId::new())
        .unwrap();

    // Housekeeping keeps the bucket bounded but the newest upload stays
    // visible as the latest success.
    let info = source
        .engine
        .backup_key_information(RequestId::new())
        .unwrap()
        .unwrap();
    assert_eq!(info.key_id, key_id);
    assert!(info.last_success_ms.is_some());
    assert!(!source.engine.is_backup_required());
}

#[tokio::test]
async fn concurrent_backups_allocate_distinct_versions() {
    let source = fixture();
    source
        .engine
        .generate_backup_key(&BackupSeed::new("seed1"))
        .unwrap();

    let engine = &source.engine;
    let (a, b) = tokio::join!(
        engine.initiate_backup(false, RequestId::new()),
        engine.initiate_backup(false, RequestId::new()),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.version, b.version);
}

#[tokio::test]
async fn dead_secondary_is_temporarily_unavailable() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let engine = new_engine();
    let app = TestContributor::new("app", SourceTag::Primary, "A", log.clone());
    let x = TestContributor::new("x", SourceTag::Secondary, "1", log.clone());
    let y = TestContributor::new("y", SourceTag::Secondary, "2", log.clone());
    engine.register_primary_contributor(&(app.clone() as Arc<dyn Contributor>));
    engine
        .register_secondary_contributors(&[
            x.clone() as Arc<dyn Contributor>,
            y.clone() as Arc<dyn Contributor>,
        ])
        .unwrap();
    engine
        .generate_backup_key(&BackupSeed::new("seed1"))
        .unwrap();

    // y goes away between registration and the backup.
    drop(y);
    let sealed = engine
        .initiate_backup(false, RequestId::new())
        .await
        .unwrap();

    // The envelope simply lacks y's slice.
    let keys = lark_backup::derive_keys(&BackupSeed::new("seed1"));
    let plaintext = lark_backup::unseal(&sealed.encrypted_content, &keys).unwrap();
    let decoded: serde_json::Value = serde_json::from_slice(&plaintext).unwrap();
    assert_eq!(decoded["engine"]["x"], "1");
    assert!(decoded["engine"].get("y").is_none());
}

#[tokio::test]
async fn dead_primary_is_a_precondition_failure() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let engine = new_engine();
    let app = TestContributor::new("app", SourceTag::Primary, "A", log.clone());
    engine.register_primary_contributor(&(app.clone() as Arc<dyn Contributor>));
    engine
        .generate_backup_key(&BackupSeed::new("seed1"))
        .unwrap();

    drop(app);
    let err = engine
        .initiate_backup(false, RequestId::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LarkBackupError::PrimaryContributorNotRegistered
    ));
}

#[tokio::test]
async fn slow_secondary_still_completes_before_primary() {
    // A deliberately slow secondary must still beat the primary to the
    // restore log: the barrier is explicit, not incidental.
    struct SlowContributor {
        inner: Arc<TestContributor>,
    }

    #[async_trait]
    impl Contributor for SlowContributor {
        fn backup_identifier(&self) -> ContributorId {
            self.inner.backup_identifier()
        }

        fn backup_source(&self) -> SourceTag {
            self.inner.backup_source()
        }

        async fn produce(&self, request: RequestId) -> Result<ContributorData, LarkBackupError> {
            self.inner.produce(request).await
        }

        async fn consume(
            &self,
            request: RequestId,
            payload: Option<String>,
        ) -> Result<(), LarkBackupError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.inner.consume(request, payload).await
        }
    }

    let source = fixture();
    source
        .engine
        .generate_backup_key(&BackupSeed::new("seed1"))
        .unwrap();
    let sealed = source
        .engine
        .initiate_backup(false, RequestId::new())
        .await
        .unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let engine = new_engine();
    let app = TestContributor::new("app", SourceTag::Primary, "A", log.clone());
    let x_inner = TestContributor::new("x", SourceTag::Secondary, "", log.clone());
    let slow_x = Arc::new(SlowContributor {
        inner: x_inner.clone(),
    });
    let y = TestContributor::new("y", SourceTag::Secondary, "", log.clone());
    engine.register_primary_contributor(&(app.clone() as Arc<dyn Contributor>));
    engine
        .register_secondary_contributors(&[
            slow_x.clone() as Arc<dyn Contributor>,
            y.clone() as Arc<dyn Contributor>,
        ])
        .unwrap();

    let recovered = engine
        .recover_backup_data(
            &sealed.encrypted_content,
            &BackupSeed::new("seed1"),
            RequestId::new(),
        )
        .await
        .unwrap();
    engine.restore_full_backup(recovered.request).await.unwrap();

    let mut seen = app
        .seen_at_primary
        .lock()
        .unwrap()
        .clone()
        .expect("primary consume ran");
    seen.sort();
    assert_eq!(seen, vec!["x".to_string(), "y".to_string()]);
}
