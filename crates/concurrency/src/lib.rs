//! Transaction layer for seep
//!
//! This crate implements Percolator-style snapshot isolation over any
//! [`seep_core::Store`]:
//! - [`Transaction`]: buffered reads/writes with a two-phase commit
//! - [`SnapshotReader`]: reads at a start timestamp, resolving stray locks
//! - [`LockResolver`]: rolls abandoned locks forward or back
//! - [`OracleClient`]: retrying timestamp source and active-transaction registry
//! - [`TransactionManager`]: creates transactions against shared handles
//!
//! Commit conflicts are reported as `SeepError::CommitConflict`; a caller
//! retries with a new transaction (see [`TransactionManager::execute`]).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod commit;
pub mod manager;
pub mod oracle;
pub mod resolver;
pub mod snapshot;
pub mod transaction;

pub use backoff::{Backoff, BackoffAction};
pub use commit::{CommitData, PendingCell};
pub use manager::TransactionManager;
pub use oracle::{ActiveTimestamps, LocalOracle, OracleClient, TimestampTracker};
pub use resolver::{LockResolver, PrimaryStatus, Resolution};
pub use snapshot::{ReadStats, SnapshotReader};
pub use transaction::{Transaction, TransactionStats, TxState};
