//! Core types and traits for seep
//!
//! This crate defines the foundational types used throughout the system:
//! - Bytes, Column, RowColumn, Span: row/column addressing
//! - Key, EntryKind, Cell: physical layout of a versioned cell
//! - LockValue, WriteValue, notification columns: entry value codecs
//! - ConditionalMutation, ScanRequest: store requests
//! - Store, TimestampOracle, CompactionFilter: service boundaries
//! - SeepConfig, SharedConfig: configuration
//! - ObservedColumns: weak/strong observed column sets
//! - SeepError: error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod encoding;
pub mod error;
pub mod key;
pub mod mutation;
pub mod observed;
pub mod traits;
pub mod types;

pub use config::{
    ObserverSpecification, RetryPolicy, SeepConfig, SharedConfig, TransactionConfig, WorkerConfig,
};
pub use encoding::{
    decode, decode_ack, encode, encode_ack, notify_column, observed_column, DelLockValue,
    LockType, LockValue, Notification, NotificationType, WriteKind, WriteValue,
};
pub use error::{SeepError, SeepResult};
pub use key::{validate_user_column, Cell, EntryKind, Key, KeyError, NOTIFY_FAMILY};
pub use mutation::{
    CellOp, ColumnFilter, Condition, ConditionStatus, ConditionalMutation, RejectReason,
    ScanRequest,
};
pub use observed::ObservedColumns;
pub use traits::{CellIter, CompactionFilter, CompactionPass, Store, TimestampOracle};
pub use types::{Bytes, Column, RowColumn, Span};
