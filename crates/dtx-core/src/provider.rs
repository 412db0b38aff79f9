use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BackendError;
use crate::types::{BackendKind, DataPath, DatastoreScope, DeviceId, Value};

/// One transaction against one device or store partition.
///
/// Writes are staged by the backend until `submit`. How they reach the
/// device (wire protocol, session handling) is the backend's business.
#[async_trait]
pub trait TransactionHandle: Send + Sync {
    /// Backend-assigned identifier, for logging.
    fn identifier(&self) -> String;

    /// Read the value stored at `path`, or `None` if nothing is there.
    async fn read(
        &self,
        scope: DatastoreScope,
        path: &DataPath,
    ) -> Result<Option<Value>, BackendError>;

    /// Replace whatever is stored at `path` with `value`.
    async fn put(
        &self,
        scope: DatastoreScope,
        path: &DataPath,
        value: Value,
    ) -> Result<(), BackendError>;

    /// Merge `value` into whatever is stored at `path`.
    async fn merge(
        &self,
        scope: DatastoreScope,
        path: &DataPath,
        value: Value,
    ) -> Result<(), BackendError>;

    /// Remove whatever is stored at `path`.
    async fn delete(&self, scope: DatastoreScope, path: &DataPath) -> Result<(), BackendError>;

    /// Commit the staged edits.
    async fn submit(&self) -> Result<(), BackendError>;

    /// Discard the staged edits. Returns `false` if the transaction was
    /// already closed.
    fn cancel(&self) -> bool;
}

/// Factory and lock owner for the transactions of one backend kind.
///
/// Locking is synchronous: the coordinator calls these methods from inside
/// its own critical section and must not hold it across an await point.
pub trait TransactionProvider: Send + Sync {
    /// The backend kind this provider serves.
    fn kind(&self) -> BackendKind;

    /// Open a new transaction against `device`.
    fn new_tx(&self, device: &DeviceId) -> Result<Arc<dyn TransactionHandle>, BackendError>;

    fn is_device_locked(&self, device: &DeviceId) -> bool;

    /// Lock every device in `devices`, all or nothing.
    fn lock_devices(&self, devices: &BTreeSet<DeviceId>) -> bool;

    /// Release `devices`. Devices that are not locked are ignored.
    fn release_devices(&self, devices: &BTreeSet<DeviceId>);
}
