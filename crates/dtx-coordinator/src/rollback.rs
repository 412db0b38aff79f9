use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use dtx_core::{
    BackendError, DataPath, DatastoreScope, EditKind, Participant, TransactionHandle, Value,
};
use futures::future::join_all;
use tracing::{debug, warn};

use crate::cache::CachedEdit;
use crate::error::{RollbackError, RollbackFailure, RollbackStage};

/// The inverse of one cached edit.
#[derive(Debug, Clone, PartialEq)]
pub enum CompensatingAction {
    Replace {
        scope: DatastoreScope,
        path: DataPath,
        value: Value,
    },
    Delete {
        scope: DatastoreScope,
        path: DataPath,
    },
}

impl CompensatingAction {
    async fn apply(&self, target: &dyn TransactionHandle) -> Result<(), BackendError> {
        match self {
            CompensatingAction::Replace { scope, path, value } => {
                target.put(*scope, path, value.clone()).await
            }
            CompensatingAction::Delete { scope, path } => target.delete(*scope, path).await,
        }
    }
}

impl fmt::Display for CompensatingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompensatingAction::Replace { scope, path, .. } => {
                write!(f, "replace {} ({})", path, scope)
            }
            CompensatingAction::Delete { scope, path } => write!(f, "delete {} ({})", path, scope),
        }
    }
}

impl CachedEdit {
    /// The action that undoes this edit, or `None` if the edit removed
    /// nothing.
    pub fn compensation(&self) -> Option<CompensatingAction> {
        match (&self.prior, self.kind) {
            (Some(prior), _) => Some(CompensatingAction::Replace {
                scope: self.scope,
                path: self.path.clone(),
                value: prior.clone(),
            }),
            (None, EditKind::Merge | EditKind::Replace) => Some(CompensatingAction::Delete {
                scope: self.scope,
                path: self.path.clone(),
            }),
            (None, EditKind::Delete) => None,
        }
    }
}

/// Stage every participant's compensations, newest edit first, then
/// submit all staged participants concurrently.
///
/// Each compensation restores the value seen before its own edit, so a path
/// edited several times ends at the value it had before the first edit.
///
/// A participant whose compensation fails is cancelled and reported; the
/// others carry on. `targets` may be the handles the edits were made through
/// or fresh ones opened after a failed submit.
pub async fn rollback(
    caches: BTreeMap<Participant, Vec<CachedEdit>>,
    targets: &HashMap<Participant, Arc<dyn TransactionHandle>>,
) -> Result<(), RollbackError> {
    let staging = caches.into_iter().map(|(participant, edits)| {
        let target = targets.get(&participant).cloned();
        stage(participant, edits, target)
    });

    let mut failures = Vec::new();
    let mut staged = Vec::new();
    for outcome in join_all(staging).await {
        match outcome {
            Ok(ready) => staged.push(ready),
            Err(failure) => failures.push(failure),
        }
    }

    let submits = staged.into_iter().map(|(participant, target)| async move {
        target.submit().await.map_err(|source| RollbackFailure {
            participant,
            stage: RollbackStage::Submit,
            source,
        })
    });
    failures.extend(join_all(submits).await.into_iter().filter_map(|r| r.err()));

    if failures.is_empty() {
        Ok(())
    } else {
        for failure in &failures {
            warn!("{}", failure);
        }
        Err(RollbackError { failures })
    }
}

async fn stage(
    participant: Participant,
    edits: Vec<CachedEdit>,
    target: Option<Arc<dyn TransactionHandle>>,
) -> Result<(Participant, Arc<dyn TransactionHandle>), RollbackFailure> {
    let Some(target) = target else {
        return Err(RollbackFailure {
            participant,
            stage: RollbackStage::MissingTransaction,
            source: BackendError::Initialization("no transaction to roll back through".into()),
        });
    };

    for action in edits.iter().rev().filter_map(CachedEdit::compensation) {
        if let Err(source) = action.apply(target.as_ref()).await {
            target.cancel();
            return Err(RollbackFailure {
                participant,
                stage: RollbackStage::Apply(action),
                source,
            });
        }
    }

    debug!("Staged {} compensations on {}", edits.len(), participant);
    Ok((participant, target))
}
