use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use dtx_core::{
    BackendError, BackendKind, DeviceId, LockSet, Participant, TransactionHandle,
};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::cache::CachingTransaction;
use crate::config::CoordinatorConfig;
use crate::dtx::{DistributedTransaction, DtxIdentifier, DtxInner};
use crate::error::{DtxError, Result};
use crate::lock::{DeviceLockRegistry, ProviderTable};

/// Lock table plus the bookkeeping of open transactions. Both change under
/// the `open` lock.
pub(crate) struct RegistryShared {
    locks: DeviceLockRegistry,
    open: Mutex<HashMap<DtxIdentifier, Weak<DtxInner>>>,
}

impl RegistryShared {
    /// Forget `identifier` and release its devices.
    pub(crate) fn release(&self, identifier: &DtxIdentifier, lock_set: &LockSet) {
        let mut open = self.open.lock();
        open.remove(identifier);
        self.locks.release_all(lock_set);
        debug!("Released {}", identifier);
    }

    /// Open a fresh backend transaction for `participant`.
    pub(crate) fn open_transaction(
        &self,
        participant: &Participant,
    ) -> std::result::Result<Arc<dyn TransactionHandle>, BackendError> {
        let provider = self.locks.providers().get(participant.kind).ok_or_else(|| {
            BackendError::Initialization(format!(
                "no provider registered for {} devices",
                participant.kind
            ))
        })?;
        provider.new_tx(&participant.device)
    }
}

/// Creates distributed transactions and tracks the ones still alive.
///
/// A device can belong to at most one live transaction; creating a second
/// one over any of its devices fails until the first finishes.
pub struct DtxProvider {
    shared: Arc<RegistryShared>,
    config: CoordinatorConfig,
}

impl std::fmt::Debug for DtxProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DtxProvider")
            .field("providers", self.shared.locks.providers())
            .field("outstanding", &self.outstanding())
            .field("config", &self.config)
            .finish()
    }
}

impl DtxProvider {
    pub fn new(providers: ProviderTable) -> Self {
        Self::with_config(providers, CoordinatorConfig::default())
    }

    pub fn with_config(providers: ProviderTable, config: CoordinatorConfig) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                locks: DeviceLockRegistry::new(providers),
                open: Mutex::new(HashMap::new()),
            }),
            config,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// A transaction over `devices` of the configured default kind.
    pub fn new_transaction<I, D>(&self, devices: I) -> Result<DistributedTransaction>
    where
        I: IntoIterator<Item = D>,
        D: Into<DeviceId>,
    {
        self.new_transaction_for(LockSet::of_kind(self.config.default_kind, devices))
    }

    /// Lock every device of `lock_set`, open one backend transaction per
    /// participant and register the result.
    #[instrument(skip(self), level = "debug")]
    pub fn new_transaction_for(&self, lock_set: LockSet) -> Result<DistributedTransaction> {
        if lock_set.is_empty() {
            return Err(DtxError::InitializationFailed(
                "no devices requested".to_string(),
            ));
        }
        let providers = self.shared.locks.providers();
        if let Some(kind) = lock_set.kinds().find(|kind| providers.get(*kind).is_none()) {
            return Err(DtxError::InitializationFailed(format!(
                "no provider registered for {} devices",
                kind
            )));
        }

        let mut open = self.shared.open.lock();
        if !self.shared.locks.lock_all(&lock_set) {
            return Err(DtxError::InitializationFailed(format!(
                "some of {} are locked by another transaction",
                DtxIdentifier::from(&lock_set)
            )));
        }

        let mut caches = BTreeMap::new();
        for participant in lock_set.participants() {
            match self.shared.open_transaction(&participant) {
                Ok(handle) => {
                    let cache = CachingTransaction::new(participant.clone(), handle);
                    caches.insert(participant, Arc::new(cache));
                }
                Err(e) => {
                    for cache in caches.values() {
                        cache.cancel();
                    }
                    self.shared.locks.release_all(&lock_set);
                    return Err(DtxError::InitializationFailed(format!(
                        "could not open transaction on {}: {}",
                        participant, e
                    )));
                }
            }
        }

        let inner = Arc::new(DtxInner::new(
            lock_set,
            caches,
            Arc::clone(&self.shared),
            self.config.clone(),
        ));
        open.insert(inner.identifier().clone(), Arc::downgrade(&inner));
        drop(open);

        info!("Created distributed transaction {}", inner.identifier());
        Ok(DistributedTransaction::new(inner))
    }

    /// Number of registered transactions that have not finished.
    pub fn outstanding(&self) -> usize {
        self.shared.open.lock().len()
    }

    pub fn is_locked(&self, kind: BackendKind, device: &DeviceId) -> bool {
        self.shared.locks.is_locked(kind, device)
    }

    /// Cancel every transaction still registered and release its devices.
    pub fn shutdown(&self) {
        let (live, orphaned): (Vec<_>, Vec<_>) = {
            let open = self.shared.open.lock();
            open.iter()
                .map(|(identifier, weak)| (identifier.clone(), weak.upgrade()))
                .partition(|(_, inner)| inner.is_some())
        };

        for (identifier, inner) in live {
            if let Some(inner) = inner {
                warn!(
                    "Cancelling abandoned transaction {} in state {}",
                    identifier,
                    inner.state()
                );
                inner.force_cancel();
            }
        }
        for (identifier, _) in orphaned {
            warn!("Releasing devices of dropped transaction {}", identifier);
            self.shared.release(&identifier, &identifier.lock_set());
        }
    }
}

impl Drop for DtxProvider {
    fn drop(&mut self) {
        self.shutdown();
    }
}
