//! Physical store keys
//!
//! Every entry a transaction leaves in the store is keyed by
//! `(row, column, kind, timestamp)`. The kind says how the timestamp and the
//! value are to be read:
//!
//! | kind      | timestamp               | value                     |
//! |-----------|-------------------------|---------------------------|
//! | `TxDone`  | start ts                | empty                     |
//! | `Write`   | commit ts               | [`WriteValue`]            |
//! | `DelLock` | start ts                | [`DelLockValue`]          |
//! | `Lock`    | start ts                | [`LockValue`]             |
//! | `Data`    | start ts                | user bytes                |
//! | `Ack`     | observer start ts       | commit ts, 8 bytes BE     |
//! | `Notify`  | arming commit ts        | notification type byte    |
//!
//! Keys sort by row, column, kind, then timestamp *descending* so the newest
//! version of each kind comes first in a scan.
//!
//! [`WriteValue`]: crate::encoding::WriteValue
//! [`DelLockValue`]: crate::encoding::DelLockValue
//! [`LockValue`]: crate::encoding::LockValue

use crate::types::{Bytes, Column, RowColumn};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Column family reserved for notification markers
pub const NOTIFY_FAMILY: &[u8] = b"\x00ntfy";

/// Reserved prefix for every internal column family
pub const RESERVED_FAMILY_PREFIX: u8 = 0x00;

/// What a store entry means
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// All secondaries of a committed transaction were finalized
    TxDone,
    /// Committed version pointer
    Write,
    /// A lock that was resolved by rollback
    DelLock,
    /// Lock held by an in-flight transaction
    Lock,
    /// Value written by a transaction, keyed by its start timestamp
    Data,
    /// Strong notification acknowledged by an observer transaction
    Ack,
    /// Pending notification marker
    Notify,
}

impl EntryKind {
    /// Short name used in logs and debug output
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::TxDone => "TX_DONE",
            EntryKind::Write => "WRITE",
            EntryKind::DelLock => "DEL_LOCK",
            EntryKind::Lock => "LOCK",
            EntryKind::Data => "DATA",
            EntryKind::Ack => "ACK",
            EntryKind::Notify => "NOTIFY",
        }
    }
}

/// Key of one store entry
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    /// Row key
    pub row: Bytes,
    /// Column within the row
    pub column: Column,
    /// Entry kind
    pub kind: EntryKind,
    /// Timestamp (meaning depends on `kind`)
    pub ts: u64,
}

impl Key {
    /// Create a key
    pub fn new(row: impl Into<Bytes>, column: Column, kind: EntryKind, ts: u64) -> Self {
        Key {
            row: row.into(),
            column,
            kind,
            ts,
        }
    }

    /// Create a key for a `(row, column)` coordinate
    pub fn at(rc: &RowColumn, kind: EntryKind, ts: u64) -> Self {
        Key {
            row: rc.row.clone(),
            column: rc.column.clone(),
            kind,
            ts,
        }
    }

    /// The `(row, column)` this key belongs to
    pub fn row_column(&self) -> RowColumn {
        RowColumn {
            row: self.row.clone(),
            column: self.column.clone(),
        }
    }

    /// True if `other` addresses the same `(row, column)`
    pub fn same_row_column(&self, other: &Key) -> bool {
        self.row == other.row && self.column == other.column
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.row
            .cmp(&other.row)
            .then_with(|| self.column.cmp(&other.column))
            .then_with(|| self.kind.cmp(&other.kind))
            // newest first
            .then_with(|| other.ts.cmp(&self.ts))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.row,
            self.column,
            self.kind.as_str(),
            self.ts
        )
    }
}

/// A store entry: key plus value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    /// Entry key
    pub key: Key,
    /// Entry value
    pub value: Bytes,
}

impl Cell {
    /// Create a cell
    pub fn new(key: Key, value: impl Into<Bytes>) -> Self {
        Cell {
            key,
            value: value.into(),
        }
    }
}

/// Validate a column supplied by user code
///
/// Internal families start with a NUL byte and are off-limits to
/// transactions.
pub fn validate_user_column(column: &Column) -> Result<(), KeyError> {
    if column.family.as_slice().first() == Some(&RESERVED_FAMILY_PREFIX) {
        return Err(KeyError::ReservedFamily(column.clone()));
    }
    Ok(())
}

/// Key validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    /// Column family uses the reserved internal prefix
    #[error("column {0} uses a reserved family")]
    ReservedFamily(Column),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(row: &str, fam: &str, kind: EntryKind, ts: u64) -> Key {
        Key::new(row, Column::new(fam, "q"), kind, ts)
    }

    #[test]
    fn test_newest_version_sorts_first() {
        let older = key("r", "f", EntryKind::Write, 5);
        let newer = key("r", "f", EntryKind::Write, 9);
        assert!(newer < older);
    }

    #[test]
    fn test_kind_sorts_before_timestamp() {
        let write = key("r", "f", EntryKind::Write, 1);
        let lock = key("r", "f", EntryKind::Lock, 100);
        assert!(write < lock);
    }

    #[test]
    fn test_row_dominates() {
        let a = key("a", "z", EntryKind::Notify, 1);
        let b = key("b", "a", EntryKind::TxDone, 1);
        assert!(a < b);
    }

    #[test]
    fn test_reserved_family_rejected() {
        let col = Column::new(NOTIFY_FAMILY, "x");
        assert_eq!(
            validate_user_column(&col),
            Err(KeyError::ReservedFamily(col.clone()))
        );
        assert!(validate_user_column(&Column::new("stat", "count")).is_ok());
    }
}
