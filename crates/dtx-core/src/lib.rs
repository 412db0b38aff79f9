//! Core traits and types for distributed transaction backends.
//!
//! This crate defines the abstractions shared between the coordinator and the
//! transactional backends it drives:
//! - `TransactionProvider`: Opens per-device transactions and owns device locking
//! - `TransactionHandle`: One transaction against one device or store partition
//! - `Participant` / `LockSet`: Addressing of `(BackendKind, DeviceId)` pairs

mod error;
mod provider;
mod types;

pub use error::BackendError;
pub use provider::{TransactionHandle, TransactionProvider};
pub use types::{
    BackendKind, DataPath, DatastoreScope, DeviceId, EditKind, LockSet, Participant, Value,
};
