//! In-memory transactional backends.
//!
//! A `MemoryProvider` serves one `BackendKind` and owns a set of named
//! `MemoryDevice`s. Transactions stage their edits and apply them atomically
//! on submit. Faults and latency can be injected per device so every failure
//! path of the coordinator can be driven deterministically.

mod device;
mod fault;
mod provider;
mod store;
mod transaction;

pub use device::{CommitRecord, MemoryDevice};
pub use fault::Fault;
pub use provider::MemoryProvider;
pub use store::merge_value;
pub use transaction::MemoryTransaction;
