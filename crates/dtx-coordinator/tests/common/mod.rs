#![allow(dead_code)]

use std::sync::Arc;

use dtx_coordinator::{CoordinatorConfig, DtxProvider, ProviderTable};
use dtx_core::{BackendKind, DataPath, DatastoreScope, DeviceId};
use dtx_memory::{MemoryDevice, MemoryProvider};
use tracing_subscriber::EnvFilter;

pub const CONFIG: DatastoreScope = DatastoreScope::Configuration;

/// Initialize tracing once for the test binary. `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn path(p: &str) -> DataPath {
    DataPath::new(p)
}

pub fn id(d: &str) -> DeviceId {
    DeviceId::from(d)
}

/// Memory-backed local and remote providers behind one coordinator.
pub struct Harness {
    pub local: Arc<MemoryProvider>,
    pub remote: Arc<MemoryProvider>,
    pub dtx: DtxProvider,
}

impl Harness {
    pub fn new(local: &[&str], remote: &[&str]) -> Self {
        Self::with_config(local, remote, CoordinatorConfig::default())
    }

    pub fn with_config(local: &[&str], remote: &[&str], config: CoordinatorConfig) -> Self {
        init_tracing();
        let local = Arc::new(MemoryProvider::with_devices(
            BackendKind::Local,
            local.iter().copied(),
        ));
        let remote = Arc::new(MemoryProvider::with_devices(
            BackendKind::Remote,
            remote.iter().copied(),
        ));
        let table = ProviderTable::new()
            .with_provider(local.clone())
            .with_provider(remote.clone());
        Self {
            local,
            remote,
            dtx: DtxProvider::with_config(table, config),
        }
    }

    pub fn provider(&self, kind: BackendKind) -> &MemoryProvider {
        match kind {
            BackendKind::Local => &self.local,
            BackendKind::Remote => &self.remote,
        }
    }

    pub fn device(&self, kind: BackendKind, device: &str) -> Arc<MemoryDevice> {
        self.provider(kind)
            .device(&id(device))
            .unwrap_or_else(|| panic!("no {} device {}", kind, device))
    }

    pub fn remote_device(&self, device: &str) -> Arc<MemoryDevice> {
        self.device(BackendKind::Remote, device)
    }

    pub fn local_device(&self, device: &str) -> Arc<MemoryDevice> {
        self.device(BackendKind::Local, device)
    }

    /// True once no device of either kind is locked.
    pub fn all_unlocked(&self) -> bool {
        self.local.locked_devices().is_empty() && self.remote.locked_devices().is_empty()
    }
}
