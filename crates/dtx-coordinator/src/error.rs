use std::collections::BTreeSet;
use std::fmt;

use dtx_core::{BackendError, Participant};
use thiserror::Error;

use crate::rollback::CompensatingAction;
use crate::state::TxState;

/// Failure of one cached edit against one participant.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EditError {
    #[error("Reading the prior value failed: {0}")]
    Read(#[source] BackendError),

    #[error("Write failed: {0}")]
    Write(#[source] BackendError),

    #[error("Edit timed out after {0} ms")]
    Timeout(u64),

    #[error("Edit task ended without reporting an outcome")]
    Interrupted,
}

/// Where a participant's rollback stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum RollbackStage {
    /// A compensating action was rejected by the backend.
    Apply(CompensatingAction),
    /// No transaction was available to compensate through.
    MissingTransaction,
    /// The compensations were staged but the commit failed.
    Submit,
}

impl fmt::Display for RollbackStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackStage::Apply(action) => write!(f, "apply {}", action),
            RollbackStage::MissingTransaction => write!(f, "open transaction"),
            RollbackStage::Submit => write!(f, "submit"),
        }
    }
}

/// One participant left in an unknown state.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Rollback of {participant} failed at {stage}: {source}")]
pub struct RollbackFailure {
    pub participant: Participant,
    pub stage: RollbackStage,
    pub source: BackendError,
}

/// Aggregate rollback outcome. Only produced when at least one participant
/// failed.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Rollback failed on {} participant(s)", failures.len())]
pub struct RollbackError {
    pub failures: Vec<RollbackFailure>,
}

impl RollbackError {
    /// Participants whose state is unknown.
    pub fn participants(&self) -> BTreeSet<Participant> {
        self.failures
            .iter()
            .map(|failure| failure.participant.clone())
            .collect()
    }
}

/// Errors returned by distributed transaction operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DtxError {
    #[error("Distributed transaction initialization failed: {0}")]
    InitializationFailed(String),

    #[error("{0} is not a participant of this transaction")]
    UnknownParticipant(Participant),

    #[error("Edit on {participant} failed and the transaction was rolled back: {source}")]
    EditFailed {
        participant: Participant,
        #[source]
        source: EditError,
    },

    #[error("Submit failed on {} participant(s) and the transaction was rolled back", failed.len())]
    SubmitFailed { failed: BTreeSet<Participant> },

    #[error(transparent)]
    RollbackFailed(#[from] RollbackError),

    #[error("Transaction is {0}")]
    InvalidState(TxState),
}

impl DtxError {
    /// Returns false when some participant may hold partially applied data.
    pub fn is_consistent(&self) -> bool {
        match self {
            DtxError::RollbackFailed(_) => false,
            DtxError::InvalidState(state) => *state != TxState::Unknown,
            _ => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, DtxError>;

#[cfg(test)]
mod tests {
    use super::*;
    use dtx_core::{BackendKind, DataPath, DatastoreScope};

    #[test]
    fn test_consistency() {
        let participant = Participant::new(BackendKind::Remote, "r1");
        let edit = DtxError::EditFailed {
            participant: participant.clone(),
            source: EditError::Write(BackendError::Write("boom".into())),
        };
        assert!(edit.is_consistent());

        let rollback = DtxError::RollbackFailed(RollbackError {
            failures: vec![RollbackFailure {
                participant: participant.clone(),
                stage: RollbackStage::Apply(CompensatingAction::Delete {
                    scope: DatastoreScope::Configuration,
                    path: DataPath::new("/a"),
                }),
                source: BackendError::Write("boom".into()),
            }],
        });
        assert!(!rollback.is_consistent());
        assert!(!DtxError::InvalidState(TxState::Unknown).is_consistent());
        assert!(DtxError::InvalidState(TxState::Committed).is_consistent());
    }

    #[test]
    fn test_messages() {
        let failure = RollbackFailure {
            participant: Participant::new(BackendKind::Local, "l1"),
            stage: RollbackStage::Submit,
            source: BackendError::Commit("disk full".into()),
        };
        assert_eq!(
            failure.to_string(),
            "Rollback of local:l1 failed at submit: Commit failed: disk full"
        );

        let error = RollbackError {
            failures: vec![failure],
        };
        assert_eq!(error.to_string(), "Rollback failed on 1 participant(s)");
        assert_eq!(error.participants().len(), 1);
    }
}
