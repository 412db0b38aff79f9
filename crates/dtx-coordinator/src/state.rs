/// Lifecycle of a distributed transaction.
///
/// `Open` accepts edits. Every other state rejects them, and no state leads
/// back to `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxState {
    /// Accepting edits.
    Open,
    /// Participants are committing.
    Submitting,
    /// Compensating edits after an edit failure or an explicit rollback.
    RollingBack,
    /// Every participant committed.
    Committed,
    /// Every participant was restored.
    RolledBack,
    /// At least one participant could not be restored.
    Unknown,
    /// Discarded without rollback.
    Cancelled,
}

impl TxState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Returns true once the transaction can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Committed | Self::RolledBack | Self::Unknown | Self::Cancelled
        )
    }
}

impl std::fmt::Display for TxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::Submitting => write!(f, "Submitting"),
            Self::RollingBack => write!(f, "RollingBack"),
            Self::Committed => write!(f, "Committed"),
            Self::RolledBack => write!(f, "RolledBack"),
            Self::Unknown => write!(f, "Unknown"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(TxState::Open.is_open());
        assert!(!TxState::Open.is_terminal());
        assert!(!TxState::Submitting.is_terminal());
        assert!(!TxState::RollingBack.is_terminal());
        assert!(TxState::Committed.is_terminal());
        assert!(TxState::RolledBack.is_terminal());
        assert!(TxState::Unknown.is_terminal());
        assert!(TxState::Cancelled.is_terminal());
    }
}
