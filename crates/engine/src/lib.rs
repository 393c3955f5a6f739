//! Observer engine for seep
//!
//! This crate runs application code when observed columns change:
//! - Environment: store, oracle, configuration and observer registry
//! - Observer registry: observed column to observer, from shared configuration
//! - Notification manager: pending marker discovery and acknowledgement checks
//! - Worker: scan loop and bounded thread pool running observer transactions
//!
//! Only the engine knows how notifications become observer transactions;
//! the transaction layer just carries the trigger through commit.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config_source;
pub mod environment;
pub mod notification;
pub mod observer;
pub mod pool;
pub mod worker;

pub use config_source::{FileConfigSource, SharedConfigSource, StaticConfigSource};
pub use environment::Environment;
pub use notification::{NotificationManager, PendingNotifications};
pub use observer::{Observer, ObserverFactories, ObserverRegistry, RegisteredObserver};
pub use pool::{PoolStats, SubmitError, WorkerPool};
pub use worker::{ObserverFailure, ScanPass, Worker, WorkerStats};
