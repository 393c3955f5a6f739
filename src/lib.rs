//! Seep - snapshot-isolated transactions and incremental observers
//!
//! Seep layers multi-row ACID transactions over a sorted, versioned
//! key-value store and runs application observers whenever observed columns
//! change.
//!
//! # Quick Start
//!
//! ```ignore
//! use seep::{Column, NotificationType, ObserverFactories, ObserverSpecification, Seep, SharedConfig};
//!
//! let check = Column::new("stat", "check");
//! let shared = SharedConfig {
//!     observers: vec![ObserverSpecification::new("summer", &check, NotificationType::Weak)],
//!     ..SharedConfig::default()
//! };
//! let seep = Seep::in_memory(shared, ObserverFactories::new().with_instance("summer", summer))?;
//!
//! seep.transaction(|tx| {
//!     tx.set_i64("r1", Column::new("stats", "af89"), 5)?;
//!     tx.weakly_notify("r1", check.clone())
//! })?;
//! seep.run_observers()?;
//! ```
//!
//! # Architecture
//!
//! - `seep-core`: data model, store keys and values, errors, configuration
//! - `seep-storage`: in-memory store and garbage collection
//! - `seep-concurrency`: oracle client, transactions, lock resolution
//! - `seep-engine`: observer registry, notification scanning, worker
//!
//! [`Seep`] bundles one of each for embedded use.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod embedded;

pub use embedded::Seep;

pub use seep_concurrency::{
    CommitData, LocalOracle, OracleClient, Transaction, TransactionManager, TransactionStats,
    TxState,
};
pub use seep_core::{
    Bytes, Column, ColumnFilter, Notification, NotificationType, ObserverSpecification,
    RowColumn, SeepConfig, SeepError, SeepResult, SharedConfig, Span, Store, TimestampOracle,
};
pub use seep_engine::{
    Environment, FileConfigSource, Observer, ObserverFactories, ObserverFailure,
    ObserverRegistry, SharedConfigSource, StaticConfigSource, Worker, WorkerStats,
};
pub use seep_storage::{CompactionStats, GarbageCollectionFilter, MemoryStore};
