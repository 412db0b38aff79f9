use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use dtx_core::{BackendError, BackendKind, DeviceId, TransactionHandle, TransactionProvider};
use parking_lot::Mutex;
use tracing::debug;

use crate::device::MemoryDevice;
use crate::fault::Fault;
use crate::transaction::MemoryTransaction;

/// In-memory `TransactionProvider` serving one backend kind.
///
/// Device locks are in-process and all-or-nothing per call.
pub struct MemoryProvider {
    kind: BackendKind,
    devices: DashMap<DeviceId, Arc<MemoryDevice>>,
    locked: Mutex<HashSet<DeviceId>>,
    transactions_opened: AtomicUsize,
    release_calls: AtomicUsize,
}

impl std::fmt::Debug for MemoryProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryProvider")
            .field("kind", &self.kind)
            .field("devices", &self.devices.len())
            .field("locked", &self.locked.lock().len())
            .finish()
    }
}

impl MemoryProvider {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            devices: DashMap::new(),
            locked: Mutex::new(HashSet::new()),
            transactions_opened: AtomicUsize::new(0),
            release_calls: AtomicUsize::new(0),
        }
    }

    /// A provider with one empty device per id.
    pub fn with_devices<I, D>(kind: BackendKind, devices: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<DeviceId>,
    {
        let provider = Self::new(kind);
        for device in devices {
            provider.add_device(device);
        }
        provider
    }

    /// Register a device, or return the existing one.
    pub fn add_device(&self, id: impl Into<DeviceId>) -> Arc<MemoryDevice> {
        let id = id.into();
        self.devices
            .entry(id.clone())
            .or_insert_with(|| Arc::new(MemoryDevice::new(id)))
            .clone()
    }

    pub fn device(&self, id: &DeviceId) -> Option<Arc<MemoryDevice>> {
        self.devices.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn device_ids(&self) -> BTreeSet<DeviceId> {
        self.devices.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn locked_devices(&self) -> BTreeSet<DeviceId> {
        self.locked.lock().iter().cloned().collect()
    }

    /// Transactions opened since creation, including post-submit ones.
    pub fn transactions_opened(&self) -> usize {
        self.transactions_opened.load(Ordering::Relaxed)
    }

    pub fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::Relaxed)
    }
}

impl TransactionProvider for MemoryProvider {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn new_tx(&self, device: &DeviceId) -> Result<Arc<dyn TransactionHandle>, BackendError> {
        let Some(target) = self.device(device) else {
            return Err(BackendError::Initialization(format!(
                "unknown {} device {}",
                self.kind, device
            )));
        };
        if target.trip(|fault| *fault == Fault::FailNewTx) {
            return Err(BackendError::Initialization(format!(
                "injected failure opening transaction on {}",
                device
            )));
        }

        let tx = MemoryTransaction::new(target);
        self.transactions_opened.fetch_add(1, Ordering::Relaxed);
        debug!("Opened {} transaction {}", self.kind, tx.identifier());
        Ok(Arc::new(tx))
    }

    fn is_device_locked(&self, device: &DeviceId) -> bool {
        self.locked.lock().contains(device)
    }

    fn lock_devices(&self, devices: &BTreeSet<DeviceId>) -> bool {
        let mut locked = self.locked.lock();
        if let Some(busy) = devices.iter().find(|d| locked.contains(*d)) {
            debug!("{} device {} already locked", self.kind, busy);
            return false;
        }
        locked.extend(devices.iter().cloned());
        debug!("Locked {} {} devices", devices.len(), self.kind);
        true
    }

    fn release_devices(&self, devices: &BTreeSet<DeviceId>) {
        self.release_calls.fetch_add(1, Ordering::Relaxed);
        let mut locked = self.locked.lock();
        for device in devices {
            locked.remove(device);
        }
        debug!("Released {} {} devices", devices.len(), self.kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> BTreeSet<DeviceId> {
        ids.iter().map(|id| DeviceId::from(*id)).collect()
    }

    #[test]
    fn test_lock_is_all_or_nothing() {
        let provider = MemoryProvider::with_devices(BackendKind::Remote, ["a", "b", "c"]);

        assert!(provider.lock_devices(&set(&["a", "b"])));
        assert!(!provider.lock_devices(&set(&["b", "c"])));
        // c must not have been taken by the failed call
        assert!(!provider.is_device_locked(&DeviceId::from("c")));
        assert!(provider.lock_devices(&set(&["c"])));

        provider.release_devices(&set(&["a", "b", "c"]));
        assert!(provider.locked_devices().is_empty());
        assert_eq!(provider.release_calls(), 1);
    }

    #[test]
    fn test_release_unlocked_is_ignored() {
        let provider = MemoryProvider::new(BackendKind::Local);
        provider.release_devices(&set(&["x"]));
        assert!(provider.locked_devices().is_empty());
    }

    #[test]
    fn test_new_tx_unknown_device() {
        let provider = MemoryProvider::new(BackendKind::Local);
        let result = provider.new_tx(&DeviceId::from("missing"));
        assert!(matches!(result, Err(BackendError::Initialization(_))));
        assert_eq!(provider.transactions_opened(), 0);
    }

    #[test]
    fn test_new_tx_fault() {
        let provider = MemoryProvider::with_devices(BackendKind::Remote, ["a"]);
        provider
            .device(&DeviceId::from("a"))
            .unwrap()
            .inject(Fault::FailNewTx);

        assert!(provider.new_tx(&DeviceId::from("a")).is_err());
        assert!(provider.new_tx(&DeviceId::from("a")).is_ok());
        assert_eq!(provider.transactions_opened(), 1);
    }

    #[test]
    fn test_add_device_is_idempotent() {
        let provider = MemoryProvider::new(BackendKind::Remote);
        let first = provider.add_device("a");
        let second = provider.add_device("a");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(provider.device_ids(), set(&["a"]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_lock_single_winner() {
        let provider = Arc::new(MemoryProvider::with_devices(BackendKind::Remote, ["shared"]));
        let barrier = Arc::new(tokio::sync::Barrier::new(10));

        let mut handles = vec![];
        for _ in 0..10 {
            let provider = Arc::clone(&provider);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                provider.lock_devices(&set(&["shared"]))
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
