//! Distributed transaction coordinator.
//!
//! Spans one logical edit across independent transactional backends:
//! - `DeviceLockRegistry`: All-or-nothing device locking across backend kinds
//! - `CachingTransaction`: Per-participant edits with their pre-images recorded
//! - `rollback`: Compensation of cached edits against fresh or original handles
//! - `DistributedTransaction`: Parallel submit, outcome aggregation, abort-once
//! - `DtxProvider`: Creates transactions and cleans up abandoned ones

mod cache;
mod config;
mod dtx;
mod error;
mod lock;
mod registry;
mod rollback;
mod state;

pub use cache::{CachedEdit, CachingTransaction};
pub use config::CoordinatorConfig;
pub use dtx::{DistributedTransaction, DtxIdentifier, PerNodeStatus, SubmitTracker};
pub use error::{DtxError, EditError, Result, RollbackError, RollbackFailure, RollbackStage};
pub use lock::{DeviceLockRegistry, ProviderTable};
pub use registry::DtxProvider;
pub use rollback::{rollback, CompensatingAction};
pub use state::TxState;
