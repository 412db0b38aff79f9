use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dtx_core::{
    BackendError, DataPath, DatastoreScope, EditKind, Participant, TransactionHandle, Value,
};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use crate::error::EditError;

/// One edit applied against one participant, with the value that was at its
/// path before the edit.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEdit {
    pub scope: DatastoreScope,
    pub path: DataPath,
    pub prior: Option<Value>,
    pub kind: EditKind,
}

/// Forward write dispatched after the prior value is cached.
#[derive(Debug, Clone)]
pub(crate) enum ForwardOp {
    Merge(Value),
    Replace(Value),
    Delete,
}

impl ForwardOp {
    pub(crate) fn kind(&self) -> EditKind {
        match self {
            ForwardOp::Merge(_) => EditKind::Merge,
            ForwardOp::Replace(_) => EditKind::Replace,
            ForwardOp::Delete => EditKind::Delete,
        }
    }
}

/// Counts an in-flight edit until dropped.
pub(crate) struct ActiveGuard<'a>(&'a watch::Sender<usize>);

impl<'a> ActiveGuard<'a> {
    fn new(active: &'a watch::Sender<usize>) -> Self {
        active.send_modify(|n| *n += 1);
        Self(active)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n -= 1);
    }
}

/// A participant's backend transaction that records a pre-image before
/// every write, so the write can be compensated later.
///
/// Cached entries are ordered by when their edit was initiated, not by when
/// the read completed.
pub struct CachingTransaction {
    participant: Participant,
    handle: Arc<dyn TransactionHandle>,
    cache: Mutex<BTreeMap<u64, CachedEdit>>,
    next_seq: AtomicU64,
    active: watch::Sender<usize>,
}

impl std::fmt::Debug for CachingTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingTransaction")
            .field("participant", &self.participant)
            .field("handle", &self.handle.identifier())
            .field("cached", &self.cache.lock().len())
            .field("active", &self.active_operations())
            .finish()
    }
}

impl CachingTransaction {
    pub fn new(participant: Participant, handle: Arc<dyn TransactionHandle>) -> Self {
        let (active, _) = watch::channel(0);
        Self {
            participant,
            handle,
            cache: Mutex::new(BTreeMap::new()),
            next_seq: AtomicU64::new(0),
            active,
        }
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    /// The wrapped backend transaction.
    pub fn handle(&self) -> Arc<dyn TransactionHandle> {
        Arc::clone(&self.handle)
    }

    pub async fn async_merge(
        &self,
        scope: DatastoreScope,
        path: &DataPath,
        value: Value,
    ) -> Result<(), EditError> {
        self.apply(scope, path, ForwardOp::Merge(value)).await
    }

    pub async fn async_put(
        &self,
        scope: DatastoreScope,
        path: &DataPath,
        value: Value,
    ) -> Result<(), EditError> {
        self.apply(scope, path, ForwardOp::Replace(value)).await
    }

    pub async fn async_delete(&self, scope: DatastoreScope, path: &DataPath) -> Result<(), EditError> {
        self.apply(scope, path, ForwardOp::Delete).await
    }

    /// Fire-and-forget delete. Failures are logged, never reported.
    pub fn delete(self: &Arc<Self>, scope: DatastoreScope, path: DataPath) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.async_delete(scope, &path).await {
                warn!("Best-effort delete of {} on {} failed: {}", path, this.participant, e);
            }
        });
    }

    #[instrument(skip(self, op), level = "debug", fields(participant = %self.participant, kind = %op.kind()))]
    pub(crate) async fn apply(
        &self,
        scope: DatastoreScope,
        path: &DataPath,
        op: ForwardOp,
    ) -> Result<(), EditError> {
        let _active = ActiveGuard::new(&self.active);
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);

        let prior = self
            .handle
            .read(scope, path)
            .await
            .map_err(EditError::Read)?;

        // The pre-image is cached before the write goes out
        self.cache.lock().insert(
            seq,
            CachedEdit {
                scope,
                path: path.clone(),
                prior,
                kind: op.kind(),
            },
        );

        let written = match op {
            ForwardOp::Merge(value) => self.handle.merge(scope, path, value).await,
            ForwardOp::Replace(value) => self.handle.put(scope, path, value).await,
            ForwardOp::Delete => self.handle.delete(scope, path).await,
        };
        written.map_err(EditError::Write)?;

        debug!("Edit #{} on {} applied", seq, path);
        Ok(())
    }

    pub async fn submit(&self) -> Result<(), BackendError> {
        self.handle.submit().await
    }

    /// Cancel the backend transaction and drop the cache.
    pub fn cancel(&self) -> bool {
        let cancelled = self.handle.cancel();
        self.cache.lock().clear();
        cancelled
    }

    /// Snapshot of the cached edits in initiation order.
    pub fn edits(&self) -> Vec<CachedEdit> {
        self.cache.lock().values().cloned().collect()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Count the caller as in flight until the guard drops, so that
    /// `wait_for_active_operations` waits for it.
    pub(crate) fn track(&self) -> ActiveGuard<'_> {
        ActiveGuard::new(&self.active)
    }

    /// Edits started and not yet finished.
    pub fn active_operations(&self) -> usize {
        *self.active.borrow()
    }

    /// Wait until no edit is in flight.
    pub async fn wait_for_active_operations(&self) {
        let mut rx = self.active.subscribe();
        if let Err(e) = rx.wait_for(|n| *n == 0).await {
            warn!("{}: stopped waiting for in-flight edits: {}", self.participant, e);
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtx_core::{BackendKind, DeviceId, TransactionProvider};
    use dtx_memory::{Fault, MemoryProvider};
    use serde_json::json;
    use std::time::Duration;

    const CONFIG: DatastoreScope = DatastoreScope::Configuration;

    fn setup() -> (MemoryProvider, Arc<CachingTransaction>) {
        let provider = MemoryProvider::with_devices(BackendKind::Remote, ["r1"]);
        let handle = provider.new_tx(&DeviceId::from("r1")).unwrap();
        let cache = CachingTransaction::new(Participant::new(BackendKind::Remote, "r1"), handle);
        (provider, Arc::new(cache))
    }

    #[tokio::test]
    async fn test_each_edit_caches_prior_value() {
        let (provider, cache) = setup();
        let device = provider.device(&DeviceId::from("r1")).unwrap();
        device.set(CONFIG, "/a", json!({"x": 1}));

        cache.async_merge(CONFIG, &DataPath::new("/a"), json!({"x": 2})).await.unwrap();
        cache.async_put(CONFIG, &DataPath::new("/b"), json!({"y": 1})).await.unwrap();
        cache.async_delete(CONFIG, &DataPath::new("/a")).await.unwrap();

        let edits = cache.edits();
        assert_eq!(edits.len(), 3);
        assert_eq!(edits[0].kind, EditKind::Merge);
        assert_eq!(edits[0].prior, Some(json!({"x": 1})));
        assert_eq!(edits[1].kind, EditKind::Replace);
        assert_eq!(edits[1].prior, None);
        // Reads see the transaction's own staged merge
        assert_eq!(edits[2].kind, EditKind::Delete);
        assert_eq!(edits[2].prior, Some(json!({"x": 2})));
    }

    #[tokio::test]
    async fn test_read_failure_leaves_no_entry() {
        let (provider, cache) = setup();
        let device = provider.device(&DeviceId::from("r1")).unwrap();
        device.inject(Fault::FailRead(DataPath::new("/bad")));

        cache.async_put(CONFIG, &DataPath::new("/ok"), json!(1)).await.unwrap();
        let result = cache.async_put(CONFIG, &DataPath::new("/bad"), json!(1)).await;

        assert!(matches!(result, Err(EditError::Read(BackendError::Read(_)))));
        assert_eq!(cache.cache_len(), 1);
    }

    #[tokio::test]
    async fn test_write_failure_keeps_entry() {
        let (provider, cache) = setup();
        let device = provider.device(&DeviceId::from("r1")).unwrap();
        device.inject(Fault::FailWrite(DataPath::new("/bad")));

        let result = cache.async_merge(CONFIG, &DataPath::new("/bad"), json!(1)).await;

        assert!(matches!(result, Err(EditError::Write(BackendError::Write(_)))));
        assert_eq!(cache.cache_len(), 1);
        assert_eq!(cache.active_operations(), 0);
    }

    #[tokio::test]
    async fn test_cancel_clears_cache() {
        let (_provider, cache) = setup();
        cache.async_put(CONFIG, &DataPath::new("/a"), json!(1)).await.unwrap();

        assert!(cache.cancel());
        assert_eq!(cache.cache_len(), 0);
        assert!(!cache.cancel());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_edits_all_cached() {
        let (provider, cache) = setup();
        let device = provider.device(&DeviceId::from("r1")).unwrap();
        device.set_latency(Duration::from_millis(5));

        let mut handles = vec![];
        for i in 0..20 {
            let cache = Arc::clone(&cache);
            let path = DataPath::new(format!("/item/{}", i));
            handles.push(tokio::spawn(async move {
                cache.async_put(CONFIG, &path, json!(i)).await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(cache.cache_len(), 20);
        assert_eq!(cache.active_operations(), 0);
        assert!(cache.edits().iter().all(|edit| edit.prior.is_none()));
    }

    #[tokio::test]
    async fn test_wait_for_active_operations() {
        let (provider, cache) = setup();
        let device = provider.device(&DeviceId::from("r1")).unwrap();
        device.set_latency(Duration::from_millis(30));

        let pending = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.async_put(CONFIG, &DataPath::new("/a"), json!(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.active_operations(), 1);

        cache.wait_for_active_operations().await;
        assert_eq!(cache.active_operations(), 0);
        assert_eq!(cache.cache_len(), 1);
        pending.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_best_effort_delete_swallows_failure() {
        let (provider, cache) = setup();
        let device = provider.device(&DeviceId::from("r1")).unwrap();
        device.set(CONFIG, "/a", json!(1));
        device.inject(Fault::FailAnyWrite);

        cache.delete(CONFIG, DataPath::new("/a"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.wait_for_active_operations().await;

        // Read succeeded, write failed: the pre-image is still cached
        assert_eq!(cache.cache_len(), 1);
        assert_eq!(cache.edits()[0].prior, Some(json!(1)));
    }
}
