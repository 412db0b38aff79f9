use std::collections::BTreeSet;
use std::sync::Arc;

use dtx_core::{BackendKind, DeviceId, LockSet, TransactionProvider};
use tracing::{debug, warn};

/// The transaction provider registered for each backend kind.
#[derive(Clone, Default)]
pub struct ProviderTable {
    local: Option<Arc<dyn TransactionProvider>>,
    remote: Option<Arc<dyn TransactionProvider>>,
}

impl std::fmt::Debug for ProviderTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderTable")
            .field("local", &self.local.is_some())
            .field("remote", &self.remote.is_some())
            .finish()
    }
}

impl ProviderTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` under its own kind, replacing any previous one.
    pub fn with_provider(mut self, provider: Arc<dyn TransactionProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn register(&mut self, provider: Arc<dyn TransactionProvider>) {
        let slot = match provider.kind() {
            BackendKind::Local => &mut self.local,
            BackendKind::Remote => &mut self.remote,
        };
        *slot = Some(provider);
    }

    pub fn get(&self, kind: BackendKind) -> Option<&Arc<dyn TransactionProvider>> {
        match kind {
            BackendKind::Local => self.local.as_ref(),
            BackendKind::Remote => self.remote.as_ref(),
        }
    }

    /// Kinds with a registered provider.
    pub fn kinds(&self) -> impl Iterator<Item = BackendKind> + '_ {
        BackendKind::ALL
            .into_iter()
            .filter(|kind| self.get(*kind).is_some())
    }
}

/// Locks devices across backend kinds.
///
/// Per-kind locking belongs to each kind's provider. This type only makes a
/// multi-kind `LockSet` all-or-nothing.
#[derive(Debug, Clone)]
pub struct DeviceLockRegistry {
    providers: ProviderTable,
}

impl DeviceLockRegistry {
    pub fn new(providers: ProviderTable) -> Self {
        Self { providers }
    }

    pub fn providers(&self) -> &ProviderTable {
        &self.providers
    }

    /// Lock `devices` of one kind. Fails if the kind has no provider.
    pub fn lock(&self, kind: BackendKind, devices: &BTreeSet<DeviceId>) -> bool {
        let Some(provider) = self.providers.get(kind) else {
            warn!("No provider registered for {} devices", kind);
            return false;
        };
        let locked = provider.lock_devices(devices);
        debug!("Lock {} {:?}: {}", kind, devices, locked);
        locked
    }

    /// Lock every kind of `lock_set`, or nothing.
    pub fn lock_all(&self, lock_set: &LockSet) -> bool {
        let mut locked: Vec<(BackendKind, &BTreeSet<DeviceId>)> = Vec::new();
        for (kind, devices) in lock_set.iter() {
            if !self.lock(kind, devices) {
                for (kind, devices) in locked.into_iter().rev() {
                    self.release(kind, devices);
                }
                return false;
            }
            locked.push((kind, devices));
        }
        true
    }

    pub fn release(&self, kind: BackendKind, devices: &BTreeSet<DeviceId>) {
        match self.providers.get(kind) {
            Some(provider) => {
                provider.release_devices(devices);
                debug!("Released {} {:?}", kind, devices);
            }
            None => warn!("No provider registered for {} devices", kind),
        }
    }

    pub fn release_all(&self, lock_set: &LockSet) {
        for (kind, devices) in lock_set.iter() {
            self.release(kind, devices);
        }
    }

    pub fn is_locked(&self, kind: BackendKind, device: &DeviceId) -> bool {
        self.providers
            .get(kind)
            .is_some_and(|provider| provider.is_device_locked(device))
    }
}
