/// Contributor capability and registry.
///
/// A contributor is an independent subsystem (cryptographic identity store,
/// protocol session state, the application itself) that owns one slice of
/// the data to back up. The engine never parses a contributor's payload;
/// it only collects, seals, and later redistributes the opaque blobs.
///
/// The registry holds non-owning handles: a contributor that has been torn
/// down between registration and use is simply absent from the live set,
/// except for the primary contributor, whose absence is a precondition
/// failure for both backup and restore.
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;

use crate::error::LarkBackupError;
use crate::types::{ContributorId, RequestId, SourceTag};

/// One contributor's identifier-tagged, source-tagged payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContributorData {
    /// Stable identifier of the contributor that produced this payload.
    pub identifier: ContributorId,
    /// Primary or secondary.
    pub source: SourceTag,
    /// Opaque serialized internal state. The engine never inspects it.
    pub payload: String,
}

/// An independent data owner that can serialize and re-apply its own state.
#[async_trait]
pub trait Contributor: Send + Sync {
    /// Stable identifier, used to key this contributor's slice in the envelope.
    fn backup_identifier(&self) -> ContributorId;

    /// Primary or secondary.
    fn backup_source(&self) -> SourceTag;

    /// Serialize the contributor's current internal state.
    async fn produce(&self, request: RequestId) -> Result<ContributorData, LarkBackupError>;

    /// Re-apply a previously produced payload.
    ///
    /// Secondary contributors always receive `Some`. The primary contributor
    /// may receive `None` for envelopes predating primary participation and
    /// must treat that as "nothing to restore, keep current state".
    async fn consume(
        &self,
        request: RequestId,
        payload: Option<String>,
    ) -> Result<(), LarkBackupError>;
}

/// Capability table of registered contributors.
///
/// Holds `Weak` handles; liveness is checked at call time via `upgrade()`.
pub struct ContributorRegistry {
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    secondaries_registered: bool,
    contributors: Vec<Weak<dyn Contributor>>,
}

impl ContributorRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                secondaries_registered: false,
                contributors: Vec::new(),
            }),
        }
    }

    /// One-shot registration of every secondary contributor.
    ///
    /// A second call is an error: the secondary set is fixed at startup.
    pub fn register_secondary_contributors(
        &self,
        contributors: &[Arc<dyn Contributor>],
    ) -> Result<(), LarkBackupError> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if inner.secondaries_registered {
            return Err(LarkBackupError::ContributorsAlreadyRegistered);
        }
        tracing::info!(count = contributors.len(), "registering secondary contributors");
        inner.secondaries_registered = true;
        inner
            .contributors
            .extend(contributors.iter().map(Arc::downgrade));
        Ok(())
    }

    /// Register the single primary contributor (the application state).
    pub fn register_primary_contributor(&self, contributor: &Arc<dyn Contributor>) {
        tracing::info!("registering the primary contributor");
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.contributors.push(Arc::downgrade(contributor));
    }

    /// True iff exactly one live registered contributor is tagged primary.
    pub fn is_primary_registered(&self) -> bool {
        self.live_contributors()
            .iter()
            .filter(|c| c.backup_source() == SourceTag::Primary)
            .count()
            == 1
    }

    /// Whether any secondary contributors were registered (live or not).
    pub fn has_secondary_contributors(&self) -> bool {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .secondaries_registered
    }

    /// Upgrade every handle that is still alive.
    pub fn live_contributors(&self) -> Vec<Arc<dyn Contributor>> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .contributors
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Live contributors, split into (primaries, secondaries).
    pub fn partition_live(&self) -> (Vec<Arc<dyn Contributor>>, Vec<Arc<dyn Contributor>>) {
        self.live_contributors()
            .into_iter()
            .partition(|c| c.backup_source() == SourceTag::Primary)
    }
}

impl Default for ContributorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
