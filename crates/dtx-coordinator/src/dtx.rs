use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dtx_core::{
    BackendError, BackendKind, DataPath, DatastoreScope, DeviceId, LockSet, Participant,
    TransactionHandle, Value,
};
use parking_lot::Mutex;
use tokio::sync::{oneshot, OnceCell};
use tracing::{debug, info, instrument, warn};

use crate::cache::{CachedEdit, CachingTransaction, ForwardOp};
use crate::config::CoordinatorConfig;
use crate::error::{DtxError, EditError, Result};
use crate::registry::RegistryShared;
use crate::rollback::rollback;
use crate::state::TxState;

/// Identity of a distributed transaction: the set of its participants.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DtxIdentifier(BTreeSet<Participant>);

impl DtxIdentifier {
    pub fn new(participants: BTreeSet<Participant>) -> Self {
        Self(participants)
    }

    pub fn participants(&self) -> &BTreeSet<Participant> {
        &self.0
    }

    /// Device ids of every participant, regardless of kind.
    pub fn devices(&self) -> BTreeSet<DeviceId> {
        self.0.iter().map(|p| p.device.clone()).collect()
    }

    pub fn lock_set(&self) -> LockSet {
        self.0.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&LockSet> for DtxIdentifier {
    fn from(lock_set: &LockSet) -> Self {
        Self(lock_set.participants().collect())
    }
}

impl fmt::Display for DtxIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, participant) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", participant)?;
        }
        write!(f, "]")
    }
}

/// Commit outcome of one participant, plus the transaction opened after it
/// for a possible rollback.
#[derive(Clone)]
pub struct PerNodeStatus {
    pub success: bool,
    pub error: Option<BackendError>,
    pub rollback_tx: Option<Arc<dyn TransactionHandle>>,
}

impl fmt::Debug for PerNodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerNodeStatus")
            .field("success", &self.success)
            .field("error", &self.error)
            .field(
                "rollback_tx",
                &self.rollback_tx.as_ref().map(|tx| tx.identifier()),
            )
            .finish()
    }
}

impl PerNodeStatus {
    pub fn committed(rollback_tx: Arc<dyn TransactionHandle>) -> Self {
        Self {
            success: true,
            error: None,
            rollback_tx: Some(rollback_tx),
        }
    }

    pub fn failed(error: BackendError, rollback_tx: Option<Arc<dyn TransactionHandle>>) -> Self {
        Self {
            success: false,
            error: Some(error),
            rollback_tx,
        }
    }
}

#[derive(Default)]
struct TrackerState {
    statuses: BTreeMap<Participant, PerNodeStatus>,
    finalized: bool,
}

/// Collects per-participant commit outcomes.
///
/// Recording and the completeness check share one lock, so exactly one
/// `record` call (the one that completes the set) gets the statuses back.
pub struct SubmitTracker {
    total: usize,
    state: Mutex<TrackerState>,
}

impl SubmitTracker {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn recorded(&self) -> usize {
        self.state.lock().statuses.len()
    }

    /// Record `status`. Returns every status if this call completed the set.
    pub fn record(
        &self,
        participant: Participant,
        status: PerNodeStatus,
    ) -> Option<BTreeMap<Participant, PerNodeStatus>> {
        let mut state = self.state.lock();
        state.statuses.insert(participant, status);
        if state.finalized || state.statuses.len() < self.total {
            return None;
        }
        state.finalized = true;
        Some(state.statuses.clone())
    }
}

/// Shared state of a distributed transaction. Owned by the caller's
/// `DistributedTransaction` and by its in-flight tasks; the registry keeps
/// only a weak reference.
pub(crate) struct DtxInner {
    identifier: DtxIdentifier,
    lock_set: LockSet,
    caches: BTreeMap<Participant, Arc<CachingTransaction>>,
    registry: Arc<RegistryShared>,
    config: CoordinatorConfig,
    state: Mutex<TxState>,
    abort: OnceCell<Result<()>>,
    /// First participant whose edit failed, set before the edit stops
    /// counting as in flight.
    failed_edit: Mutex<Option<Participant>>,
    released: AtomicBool,
}

impl DtxInner {
    pub(crate) fn new(
        lock_set: LockSet,
        caches: BTreeMap<Participant, Arc<CachingTransaction>>,
        registry: Arc<RegistryShared>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            identifier: DtxIdentifier::from(&lock_set),
            lock_set,
            caches,
            registry,
            config,
            state: Mutex::new(TxState::Open),
            abort: OnceCell::new(),
            failed_edit: Mutex::new(None),
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn identifier(&self) -> &DtxIdentifier {
        &self.identifier
    }

    pub(crate) fn state(&self) -> TxState {
        *self.state.lock()
    }

    fn ensure_open(&self) -> Result<()> {
        let state = self.state();
        if !state.is_open() {
            return Err(DtxError::InvalidState(state));
        }
        Ok(())
    }

    fn transition(&self, from: TxState, to: TxState) -> Result<()> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(DtxError::InvalidState(*state));
        }
        debug!("{}: {} -> {}", self.identifier, *state, to);
        *state = to;
        Ok(())
    }

    /// Enter a terminal state (unless already in one), close every
    /// participant and release the locks.
    fn finish(&self, to: TxState) {
        {
            let mut state = self.state.lock();
            if !state.is_terminal() {
                debug!("{}: {} -> {}", self.identifier, *state, to);
                *state = to;
            }
        }
        for cache in self.caches.values() {
            cache.cancel();
        }
        self.release_locks();
    }

    fn release_locks(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.registry.release(&self.identifier, &self.lock_set);
    }

    pub(crate) fn cancel(&self) -> bool {
        if self.transition(TxState::Open, TxState::Cancelled).is_err() {
            return false;
        }
        for cache in self.caches.values() {
            cache.cancel();
        }
        self.release_locks();
        true
    }

    /// Cancel regardless of state. In-flight work finishes against closed
    /// handles.
    pub(crate) fn force_cancel(&self) {
        self.finish(TxState::Cancelled);
    }

    async fn wait_idle(&self) {
        for cache in self.caches.values() {
            cache.wait_for_active_operations().await;
        }
    }

    fn cached_edits(&self) -> BTreeMap<Participant, Vec<CachedEdit>> {
        self.caches
            .iter()
            .map(|(participant, cache)| (participant.clone(), cache.edits()))
            .collect()
    }

    fn original_handles(&self) -> HashMap<Participant, Arc<dyn TransactionHandle>> {
        self.caches
            .iter()
            .map(|(participant, cache)| (participant.clone(), cache.handle()))
            .collect()
    }

    /// Roll back through the original handles. Runs at most once; every
    /// caller gets the same outcome. Fails with `InvalidState` if the
    /// transaction could no longer be rolled back in place.
    async fn abort(&self) -> Result<()> {
        self.abort
            .get_or_init(|| self.rollback_in_place())
            .await
            .clone()
    }

    async fn rollback_in_place(&self) -> Result<()> {
        {
            let failed_edit = self.failed_edit.lock().is_some();
            let mut state = self.state.lock();
            match *state {
                TxState::Open => {}
                // Nothing is committed until every admitted edit settled
                TxState::Submitting if failed_edit => {}
                other => {
                    debug!("{}: cannot roll back in state {}", self.identifier, other);
                    return Err(DtxError::InvalidState(other));
                }
            }
            debug!("{}: {} -> {}", self.identifier, *state, TxState::RollingBack);
            *state = TxState::RollingBack;
        }

        self.wait_idle().await;
        match rollback(self.cached_edits(), &self.original_handles()).await {
            Ok(()) => {
                info!("{}: rolled back", self.identifier);
                self.finish(TxState::RolledBack);
                Ok(())
            }
            Err(e) => {
                warn!("{}: {}", self.identifier, e);
                self.finish(TxState::Unknown);
                Err(DtxError::RollbackFailed(e))
            }
        }
    }

    async fn run_edit(
        &self,
        participant: Participant,
        cache: Arc<CachingTransaction>,
        scope: DatastoreScope,
        path: DataPath,
        op: ForwardOp,
    ) -> Result<()> {
        let applied = {
            // Registered before the state check so an abort that starts
            // afterwards waits for this edit
            let _active = cache.track();
            self.ensure_open()?;
            let applied = match self.config.edit_timeout() {
                Some(limit) => tokio::time::timeout(limit, cache.apply(scope, &path, op))
                    .await
                    .unwrap_or(Err(EditError::Timeout(limit.as_millis() as u64))),
                None => cache.apply(scope, &path, op).await,
            };
            if applied.is_err() {
                // Seen by a submit waiting on this edit
                let mut failed_edit = self.failed_edit.lock();
                if failed_edit.is_none() {
                    *failed_edit = Some(participant.clone());
                }
            }
            applied
        };
        let Err(source) = applied else {
            return Ok(());
        };

        warn!(
            "Edit of {} on {} failed, rolling back {}: {}",
            path, participant, self.identifier, source
        );
        self.abort().await?;
        Err(DtxError::EditFailed {
            participant,
            source,
        })
    }

    async fn submit_all(self: Arc<Self>, done: oneshot::Sender<Result<()>>) {
        self.wait_idle().await;

        // An edit admitted before the submit failed: nothing was committed,
        // so roll back in place instead
        let failed_edit = self.failed_edit.lock().clone();
        if let Some(participant) = failed_edit {
            warn!(
                "{}: edit on {} failed before commit, rolling back",
                self.identifier, participant
            );
            let outcome = self.abort().await.and(Err(DtxError::SubmitFailed {
                failed: BTreeSet::from([participant]),
            }));
            let _ = done.send(outcome);
            return;
        }

        if self.caches.is_empty() {
            let _ = done.send(self.finalize(BTreeMap::new()).await);
            return;
        }

        let tracker = Arc::new(SubmitTracker::new(self.caches.len()));
        let done = Arc::new(Mutex::new(Some(done)));
        for (participant, cache) in &self.caches {
            let inner = Arc::clone(&self);
            let tracker = Arc::clone(&tracker);
            let done = Arc::clone(&done);
            let participant = participant.clone();
            let cache = Arc::clone(cache);
            tokio::spawn(async move {
                let status = inner.submit_participant(&participant, &cache).await;
                if let Some(statuses) = tracker.record(participant, status) {
                    let outcome = inner.finalize(statuses).await;
                    if let Some(done) = done.lock().take() {
                        let _ = done.send(outcome);
                    }
                }
            });
        }
    }

    async fn submit_participant(
        &self,
        participant: &Participant,
        cache: &CachingTransaction,
    ) -> PerNodeStatus {
        let committed = match self.config.submit_timeout() {
            Some(limit) => tokio::time::timeout(limit, cache.submit())
                .await
                .unwrap_or(Err(BackendError::Timeout(limit.as_millis() as u64))),
            None => cache.submit().await,
        };

        let rollback_tx = self.registry.open_transaction(participant);
        if let Err(e) = &rollback_tx {
            warn!(
                "Could not open post-submit transaction on {}: {}",
                participant, e
            );
        }

        match (committed, rollback_tx) {
            (Ok(()), Ok(tx)) => PerNodeStatus::committed(tx),
            (Ok(()), Err(e)) => PerNodeStatus::failed(e, None),
            (Err(e), tx) => {
                debug!("Submit on {} failed: {}", participant, e);
                PerNodeStatus::failed(e, tx.ok())
            }
        }
    }

    async fn finalize(&self, statuses: BTreeMap<Participant, PerNodeStatus>) -> Result<()> {
        let failed: BTreeSet<Participant> = statuses
            .iter()
            .filter(|(_, status)| !status.success)
            .map(|(participant, _)| participant.clone())
            .collect();

        if failed.is_empty() {
            for status in statuses.values() {
                if let Some(tx) = &status.rollback_tx {
                    tx.cancel();
                }
            }
            self.finish(TxState::Committed);
            info!("{}: committed", self.identifier);
            return Ok(());
        }

        warn!(
            "{}: submit failed on {} participant(s), rolling back",
            self.identifier,
            failed.len()
        );
        let targets: HashMap<Participant, Arc<dyn TransactionHandle>> = statuses
            .into_iter()
            .filter_map(|(participant, status)| status.rollback_tx.map(|tx| (participant, tx)))
            .collect();
        let result = rollback(self.cached_edits(), &targets).await;

        match result {
            Ok(()) => {
                self.finish(TxState::RolledBack);
                Err(DtxError::SubmitFailed { failed })
            }
            Err(e) => {
                self.finish(TxState::Unknown);
                Err(DtxError::RollbackFailed(e))
            }
        }
    }
}

/// A transaction spanning several devices across backend kinds.
///
/// Edits are cached per participant so they can be compensated. The first
/// failing edit rolls back every participant; `submit` commits all
/// participants in parallel and rolls everyone back if any of them fails.
/// Dropping an open transaction cancels it.
pub struct DistributedTransaction {
    inner: Arc<DtxInner>,
}

impl fmt::Debug for DistributedTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedTransaction")
            .field("identifier", &self.inner.identifier)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl DistributedTransaction {
    pub(crate) fn new(inner: Arc<DtxInner>) -> Self {
        Self { inner }
    }

    pub fn identifier(&self) -> &DtxIdentifier {
        &self.inner.identifier
    }

    pub fn state(&self) -> TxState {
        self.inner.state()
    }

    pub fn participants(&self) -> &BTreeSet<Participant> {
        self.inner.identifier.participants()
    }

    pub fn lock_set(&self) -> &LockSet {
        &self.inner.lock_set
    }

    /// Number of cached edits for `participant`.
    pub fn cache_len(&self, participant: &Participant) -> Option<usize> {
        self.inner.caches.get(participant).map(|cache| cache.cache_len())
    }

    pub async fn put_and_rollback_on_failure(
        &self,
        kind: BackendKind,
        scope: DatastoreScope,
        path: &DataPath,
        value: Value,
        device: &DeviceId,
    ) -> Result<()> {
        let participant = Participant::new(kind, device.clone());
        self.edit(participant, scope, path, ForwardOp::Replace(value))
            .await
    }

    pub async fn merge_and_rollback_on_failure(
        &self,
        kind: BackendKind,
        scope: DatastoreScope,
        path: &DataPath,
        value: Value,
        device: &DeviceId,
    ) -> Result<()> {
        let participant = Participant::new(kind, device.clone());
        self.edit(participant, scope, path, ForwardOp::Merge(value))
            .await
    }

    pub async fn delete_and_rollback_on_failure(
        &self,
        kind: BackendKind,
        scope: DatastoreScope,
        path: &DataPath,
        device: &DeviceId,
    ) -> Result<()> {
        let participant = Participant::new(kind, device.clone());
        self.edit(participant, scope, path, ForwardOp::Delete).await
    }

    /// `put_and_rollback_on_failure` against the configured default kind.
    pub async fn put_and_rollback_on_failure_default(
        &self,
        scope: DatastoreScope,
        path: &DataPath,
        value: Value,
        device: &DeviceId,
    ) -> Result<()> {
        let kind = self.inner.config.default_kind;
        self.put_and_rollback_on_failure(kind, scope, path, value, device)
            .await
    }

    /// `merge_and_rollback_on_failure` against the configured default kind.
    pub async fn merge_and_rollback_on_failure_default(
        &self,
        scope: DatastoreScope,
        path: &DataPath,
        value: Value,
        device: &DeviceId,
    ) -> Result<()> {
        let kind = self.inner.config.default_kind;
        self.merge_and_rollback_on_failure(kind, scope, path, value, device)
            .await
    }

    /// `delete_and_rollback_on_failure` against the configured default kind.
    pub async fn delete_and_rollback_on_failure_default(
        &self,
        scope: DatastoreScope,
        path: &DataPath,
        device: &DeviceId,
    ) -> Result<()> {
        let kind = self.inner.config.default_kind;
        self.delete_and_rollback_on_failure(kind, scope, path, device)
            .await
    }

    #[instrument(skip(self, op), level = "debug", fields(dtx = %self.inner.identifier))]
    async fn edit(
        &self,
        participant: Participant,
        scope: DatastoreScope,
        path: &DataPath,
        op: ForwardOp,
    ) -> Result<()> {
        let Some(cache) = self.inner.caches.get(&participant).cloned() else {
            return Err(DtxError::UnknownParticipant(participant));
        };
        self.inner.ensure_open()?;

        // The edit outlives a dropped caller future
        let inner = Arc::clone(&self.inner);
        let reported = participant.clone();
        let path = path.clone();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = inner.run_edit(participant, cache, scope, path, op).await;
            let _ = tx.send(outcome);
        });

        rx.await.unwrap_or_else(|_| {
            Err(DtxError::EditFailed {
                participant: reported,
                source: EditError::Interrupted,
            })
        })
    }

    /// Commit every participant in parallel.
    ///
    /// Each participant opens a fresh transaction once its commit settles;
    /// if any participant failed, all of them are compensated through those.
    /// Locks are released on every outcome.
    #[instrument(skip(self), level = "debug", fields(dtx = %self.inner.identifier))]
    pub async fn submit(&self) -> Result<()> {
        self.inner.transition(TxState::Open, TxState::Submitting)?;

        let (done, outcome) = oneshot::channel();
        tokio::spawn(Arc::clone(&self.inner).submit_all(done));

        outcome
            .await
            .unwrap_or_else(|_| Err(DtxError::InvalidState(self.inner.state())))
    }

    /// Compensate every cached edit, commit the compensations and release
    /// the locks.
    #[instrument(skip(self), level = "debug", fields(dtx = %self.inner.identifier))]
    pub async fn rollback(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.abort().await
    }

    /// Discard every participant's edits and release the locks without
    /// compensating. Returns `false` if the transaction was not open.
    pub fn cancel(&self) -> bool {
        self.inner.cancel()
    }
}

impl Drop for DistributedTransaction {
    fn drop(&mut self) {
        if self.inner.state().is_open() && self.inner.cancel() {
            debug!("{}: cancelled on drop", self.inner.identifier);
        }
    }
}
