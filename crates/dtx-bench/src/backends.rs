use std::sync::Arc;
use std::time::Duration;

use dtx_coordinator::{DtxProvider, ProviderTable};
use dtx_core::{BackendKind, LockSet, Participant};
use dtx_memory::{MemoryDevice, MemoryProvider};
use tracing::debug;

use crate::config::Config;

/// A fresh set of in-memory providers and the coordinator driving them.
pub struct Backends {
    local: Arc<MemoryProvider>,
    remote: Arc<MemoryProvider>,
    participants: Vec<Participant>,
    pub dtx: DtxProvider,
}

impl Backends {
    pub fn new(config: &Config) -> Self {
        let local = Arc::new(MemoryProvider::new(BackendKind::Local));
        let remote = Arc::new(MemoryProvider::new(BackendKind::Remote));
        let latency = Duration::from_millis(config.latency_ms);

        let mut participants = Vec::new();
        for &kind in config.mode.kinds() {
            let provider = if kind == BackendKind::Local { &local } else { &remote };
            for n in 0..config.devices {
                let device = provider.add_device(format!("{}-{}", kind, n));
                device.set_latency(latency);
                participants.push(Participant::new(kind, device.id().clone()));
            }
        }
        debug!("Created {} participants", participants.len());

        let table = ProviderTable::new()
            .with_provider(local.clone())
            .with_provider(remote.clone());
        Self {
            local,
            remote,
            participants,
            dtx: DtxProvider::with_config(table, config.coordinator_config()),
        }
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn provider(&self, kind: BackendKind) -> &Arc<MemoryProvider> {
        match kind {
            BackendKind::Local => &self.local,
            BackendKind::Remote => &self.remote,
        }
    }

    pub fn device(&self, participant: &Participant) -> Option<Arc<MemoryDevice>> {
        self.provider(participant.kind).device(&participant.device)
    }

    /// Every participant, as one lock set.
    pub fn lock_set(&self) -> LockSet {
        self.participants.iter().cloned().collect()
    }

    pub fn locked_devices(&self) -> usize {
        self.local.locked_devices().len() + self.remote.locked_devices().len()
    }
}
