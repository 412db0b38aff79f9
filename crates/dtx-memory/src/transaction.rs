use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dtx_core::{BackendError, DataPath, DatastoreScope, TransactionHandle, Value};
use parking_lot::Mutex;
use tracing::{debug, instrument};

use crate::device::MemoryDevice;
use crate::fault::Fault;
use crate::store::StagedOp;

/// A transaction against one `MemoryDevice`.
///
/// Edits are staged and become visible to other transactions only on
/// submit. Reads see committed data overlaid with this transaction's own
/// staged edits.
pub struct MemoryTransaction {
    id: String,
    device: Arc<MemoryDevice>,
    staged: Mutex<Vec<StagedOp>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for MemoryTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransaction")
            .field("id", &self.id)
            .field("device", self.device.id())
            .field("staged", &self.staged.lock().len())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl MemoryTransaction {
    pub(crate) fn new(device: Arc<MemoryDevice>) -> Self {
        Self {
            id: format!("{}-{}", device.id(), uuid::Uuid::new_v4()),
            device,
            staged: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of edits staged and not yet submitted.
    pub fn staged_len(&self) -> usize {
        self.staged.lock().len()
    }

    fn ensure_open(&self) -> Result<(), BackendError> {
        if self.is_closed() {
            return Err(BackendError::Closed);
        }
        Ok(())
    }

    async fn simulate_latency(&self) {
        let latency = self.device.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    async fn stage(&self, op: StagedOp, path: &DataPath) -> Result<(), BackendError> {
        self.ensure_open()?;
        self.simulate_latency().await;

        let failed = self.device.trip(|fault| match fault {
            Fault::FailWrite(p) => p == path,
            Fault::FailAnyWrite => true,
            _ => false,
        });
        if failed {
            return Err(BackendError::Write(format!(
                "injected write failure at {} on {}",
                path,
                self.device.id()
            )));
        }

        // Closed while we slept
        self.ensure_open()?;
        self.staged.lock().push(op);
        Ok(())
    }
}

#[async_trait]
impl TransactionHandle for MemoryTransaction {
    fn identifier(&self) -> String {
        self.id.clone()
    }

    #[instrument(skip(self), level = "trace", fields(tx = %self.id))]
    async fn read(
        &self,
        scope: DatastoreScope,
        path: &DataPath,
    ) -> Result<Option<Value>, BackendError> {
        self.ensure_open()?;
        self.simulate_latency().await;

        if self
            .device
            .trip(|fault| matches!(fault, Fault::FailRead(p) if p == path))
        {
            return Err(BackendError::Read(format!(
                "injected read failure at {} on {}",
                path,
                self.device.id()
            )));
        }

        let mut current = self.device.get(scope, path);
        for op in self.staged.lock().iter() {
            if op.targets(scope, path) {
                op.apply_to(&mut current);
            }
        }
        Ok(current)
    }

    #[instrument(skip(self, value), level = "trace", fields(tx = %self.id))]
    async fn put(
        &self,
        scope: DatastoreScope,
        path: &DataPath,
        value: Value,
    ) -> Result<(), BackendError> {
        let op = StagedOp::Put {
            scope,
            path: path.clone(),
            value,
        };
        self.stage(op, path).await
    }

    #[instrument(skip(self, value), level = "trace", fields(tx = %self.id))]
    async fn merge(
        &self,
        scope: DatastoreScope,
        path: &DataPath,
        value: Value,
    ) -> Result<(), BackendError> {
        let op = StagedOp::Merge {
            scope,
            path: path.clone(),
            value,
        };
        self.stage(op, path).await
    }

    #[instrument(skip(self), level = "trace", fields(tx = %self.id))]
    async fn delete(&self, scope: DatastoreScope, path: &DataPath) -> Result<(), BackendError> {
        let op = StagedOp::Delete {
            scope,
            path: path.clone(),
        };
        self.stage(op, path).await
    }

    #[instrument(skip(self), level = "debug", fields(tx = %self.id))]
    async fn submit(&self) -> Result<(), BackendError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(BackendError::Closed);
        }

        let latency = self.device.submit_latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let ops = std::mem::take(&mut *self.staged.lock());
        if self.device.trip(|fault| *fault == Fault::FailSubmit) {
            debug!("Injected submit failure, discarding {} staged ops", ops.len());
            return Err(BackendError::Commit(format!(
                "injected submit failure on {}",
                self.device.id()
            )));
        }

        self.device.commit(&self.id, ops);
        Ok(())
    }

    fn cancel(&self) -> bool {
        let was_closed = self.closed.swap(true, Ordering::AcqRel);
        self.staged.lock().clear();
        if !was_closed {
            debug!("Cancelled {}", self.id);
        }
        !was_closed
    }
}
