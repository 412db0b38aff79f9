use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dtx_core::{DataPath, DatastoreScope, DeviceId, Value};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::fault::{ArmedFault, Fault};
use crate::store::{StagedOp, Store};

/// One successful submit against a device.
#[derive(Debug, Clone, Serialize)]
pub struct CommitRecord {
    pub transaction: String,
    pub committed_at: DateTime<Utc>,
    pub operations: usize,
}

/// A simulated device or store partition.
///
/// Holds committed data only; uncommitted edits live in the transactions
/// opened against it.
pub struct MemoryDevice {
    id: DeviceId,
    store: Mutex<Store>,
    faults: Mutex<Vec<ArmedFault>>,
    commits: Mutex<Vec<CommitRecord>>,
    latency_ms: AtomicU64,
    submit_latency_ms: AtomicU64,
}

impl std::fmt::Debug for MemoryDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDevice")
            .field("id", &self.id)
            .field("entries", &self.store.lock().len())
            .field("faults", &self.faults.lock().len())
            .finish()
    }
}

impl MemoryDevice {
    pub fn new(id: impl Into<DeviceId>) -> Self {
        Self {
            id: id.into(),
            store: Mutex::new(Store::new()),
            faults: Mutex::new(Vec::new()),
            commits: Mutex::new(Vec::new()),
            latency_ms: AtomicU64::new(0),
            submit_latency_ms: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Committed value at `path`.
    pub fn get(&self, scope: DatastoreScope, path: &DataPath) -> Option<Value> {
        self.store.lock().get(&(scope, path.clone())).cloned()
    }

    /// Write committed data directly, bypassing transactions.
    pub fn set(&self, scope: DatastoreScope, path: impl Into<DataPath>, value: Value) {
        self.store.lock().insert((scope, path.into()), value);
    }

    /// Number of committed entries across both scopes.
    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.lock().is_empty()
    }

    /// Arm `fault` to fire once.
    pub fn inject(&self, fault: Fault) {
        debug!("Injecting one-shot fault {:?} on {}", fault, self.id);
        self.faults.lock().push(ArmedFault {
            fault,
            remaining: Some(1),
        });
    }

    /// Arm `fault` to fire `times` times.
    pub fn inject_times(&self, fault: Fault, times: usize) {
        self.faults.lock().push(ArmedFault {
            fault,
            remaining: Some(times),
        });
    }

    /// Arm `fault` to fire on every matching operation.
    pub fn inject_persistent(&self, fault: Fault) {
        debug!("Injecting persistent fault {:?} on {}", fault, self.id);
        self.faults.lock().push(ArmedFault {
            fault,
            remaining: None,
        });
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Latency applied to every read and write.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Latency applied to every submit.
    pub fn set_submit_latency(&self, latency: Duration) {
        self.submit_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Successful submits, oldest first.
    pub fn commits(&self) -> Vec<CommitRecord> {
        self.commits.lock().clone()
    }

    pub(crate) fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms.load(Ordering::Relaxed))
    }

    pub(crate) fn submit_latency(&self) -> Duration {
        Duration::from_millis(self.submit_latency_ms.load(Ordering::Relaxed))
    }

    /// Fire the first armed fault matching `pred`. Exhausted faults are
    /// disarmed.
    pub(crate) fn trip(&self, pred: impl Fn(&Fault) -> bool) -> bool {
        let mut faults = self.faults.lock();
        let Some(idx) = faults.iter().position(|armed| pred(&armed.fault)) else {
            return false;
        };
        if let Some(remaining) = faults[idx].remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                faults.remove(idx);
            }
        }
        true
    }

    /// Apply `ops` in order under one lock and record the commit.
    pub(crate) fn commit(&self, transaction: &str, ops: Vec<StagedOp>) {
        let operations = ops.len();
        {
            let mut store = self.store.lock();
            for op in ops {
                op.apply(&mut store);
            }
        }
        self.commits.lock().push(CommitRecord {
            transaction: transaction.to_string(),
            committed_at: Utc::now(),
            operations,
        });
        debug!(
            "Committed {} operations from {} on {}",
            operations, transaction, self.id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_one_shot_fault_fires_once() {
        let device = MemoryDevice::new("d1");
        device.inject(Fault::FailSubmit);

        assert!(device.trip(|f| *f == Fault::FailSubmit));
        assert!(!device.trip(|f| *f == Fault::FailSubmit));
    }

    #[test]
    fn test_persistent_fault_keeps_firing() {
        let device = MemoryDevice::new("d1");
        device.inject_persistent(Fault::FailNewTx);

        for _ in 0..5 {
            assert!(device.trip(|f| *f == Fault::FailNewTx));
        }
        device.clear_faults();
        assert!(!device.trip(|f| *f == Fault::FailNewTx));
    }

    #[test]
    fn test_counted_fault() {
        let device = MemoryDevice::new("d1");
        device.inject_times(Fault::FailAnyWrite, 2);

        assert!(device.trip(|f| *f == Fault::FailAnyWrite));
        assert!(device.trip(|f| *f == Fault::FailAnyWrite));
        assert!(!device.trip(|f| *f == Fault::FailAnyWrite));
    }

    #[test]
    fn test_trip_ignores_non_matching() {
        let device = MemoryDevice::new("d1");
        device.inject(Fault::FailRead(DataPath::new("/a")));

        assert!(!device.trip(|f| *f == Fault::FailRead(DataPath::new("/b"))));
        assert!(device.trip(|f| *f == Fault::FailRead(DataPath::new("/a"))));
    }

    #[test]
    fn test_commit_records() {
        let device = MemoryDevice::new("d1");
        let scope = DatastoreScope::Configuration;
        device.commit(
            "tx-1",
            vec![StagedOp::Put {
                scope,
                path: DataPath::new("/a"),
                value: json!(1),
            }],
        );

        assert_eq!(device.get(scope, &DataPath::new("/a")), Some(json!(1)));
        let commits = device.commits();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].transaction, "tx-1");
        assert_eq!(commits[0].operations, 1);
    }
}
