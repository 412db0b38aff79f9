use dtx_core::DataPath;

/// A failure injected into a `MemoryDevice`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Reads of this path fail.
    FailRead(DataPath),
    /// Put, merge and delete of this path fail.
    FailWrite(DataPath),
    /// Every put, merge and delete fails.
    FailAnyWrite,
    /// Submit fails and the staged edits are discarded.
    FailSubmit,
    /// Opening a new transaction against the device fails.
    FailNewTx,
}

/// A fault together with how many more times it fires.
#[derive(Debug, Clone)]
pub(crate) struct ArmedFault {
    pub(crate) fault: Fault,
    /// `None` fires forever.
    pub(crate) remaining: Option<usize>,
}
