//! Store requests: scans, writes and conditional writes
//!
//! A conditional write is atomic for one row. Its conditions are evaluated by
//! the store against the row's current entries, and the operations are
//! applied only if every condition holds. This is the only cross-transaction
//! coordination primitive the commit protocol needs.

use crate::key::{Cell, EntryKind, Key};
use crate::types::{Bytes, Column, Span};
use std::collections::BTreeSet;
use std::fmt;

/// Which columns a scan returns
///
/// An empty filter matches every column. Otherwise a column matches if its
/// family was requested or the exact column was requested.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnFilter {
    families: BTreeSet<Bytes>,
    columns: BTreeSet<Column>,
}

impl ColumnFilter {
    /// Match every column
    pub fn all() -> Self {
        ColumnFilter::default()
    }

    /// Match one column
    pub fn column(column: Column) -> Self {
        ColumnFilter::default().with_column(column)
    }

    /// Match every column of one family
    pub fn family(family: impl Into<Bytes>) -> Self {
        ColumnFilter::default().with_family(family)
    }

    /// Match the given columns
    pub fn columns<I: IntoIterator<Item = Column>>(columns: I) -> Self {
        ColumnFilter {
            families: BTreeSet::new(),
            columns: columns.into_iter().collect(),
        }
    }

    /// Add a column
    pub fn with_column(mut self, column: Column) -> Self {
        self.columns.insert(column);
        self
    }

    /// Add a family
    pub fn with_family(mut self, family: impl Into<Bytes>) -> Self {
        self.families.insert(family.into());
        self
    }

    /// True if no restriction was added
    pub fn is_all(&self) -> bool {
        self.families.is_empty() && self.columns.is_empty()
    }

    /// Test a column against the filter
    pub fn matches(&self, column: &Column) -> bool {
        self.is_all() || self.families.contains(&column.family) || self.columns.contains(column)
    }

    /// Requested exact columns
    pub fn requested_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter()
    }

    /// Requested families
    pub fn requested_families(&self) -> impl Iterator<Item = &Bytes> {
        self.families.iter()
    }
}

/// A store scan
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    /// Rows to visit
    pub span: Span,
    /// Columns to return
    pub columns: ColumnFilter,
    /// Entry kinds to return (empty = all)
    pub kinds: BTreeSet<EntryKind>,
    /// Only entries with timestamp strictly below this bound
    pub max_ts: Option<u64>,
}

impl ScanRequest {
    /// Scan a span with a column filter
    pub fn new(span: Span, columns: ColumnFilter) -> Self {
        ScanRequest {
            span,
            columns,
            kinds: BTreeSet::new(),
            max_ts: None,
        }
    }

    /// Restrict to the given entry kinds
    pub fn kinds<I: IntoIterator<Item = EntryKind>>(mut self, kinds: I) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    /// Exclude entries at or above `ts`
    pub fn before(mut self, ts: u64) -> Self {
        self.max_ts = Some(ts);
        self
    }

    /// True if `cell` passes every restriction of this request
    pub fn accepts(&self, key: &Key) -> bool {
        self.span.contains(key.row.as_slice())
            && self.columns.matches(&key.column)
            && (self.kinds.is_empty() || self.kinds.contains(&key.kind))
            && self.max_ts.map_or(true, |max| key.ts < max)
    }
}

/// One unconditional change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellOp {
    /// Insert or overwrite an entry
    Put(Cell),
    /// Remove an entry if present
    Delete(Key),
}

impl CellOp {
    /// Key touched by this op
    pub fn key(&self) -> &Key {
        match self {
            CellOp::Put(cell) => &cell.key,
            CellOp::Delete(key) => key,
        }
    }
}

/// Guard evaluated against one column of the mutation's row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// Lock placement guard
    ///
    /// Holds when the column has no lock at any timestamp, has not been rolled
    /// back at `start_ts`, has no write committed at or after `start_ts`
    /// (when `check_writes`), and has no ack at or after `ack_since`.
    Prewrite {
        /// Column to lock
        column: Column,
        /// Start timestamp of the locking transaction
        start_ts: u64,
        /// Enforce first-committer-wins against writes
        check_writes: bool,
        /// Notification timestamp a trigger is acknowledging
        ack_since: Option<u64>,
    },
    /// Holds when a lock exists at exactly `start_ts`
    LockHeld {
        /// Locked column
        column: Column,
        /// Start timestamp of the lock owner
        start_ts: u64,
    },
}

impl Condition {
    /// Column the condition inspects
    pub fn column(&self) -> &Column {
        match self {
            Condition::Prewrite { column, .. } | Condition::LockHeld { column, .. } => column,
        }
    }
}

/// Why a conditional write was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Column is locked by the transaction started at `lock_ts`
    Locked {
        /// Start timestamp of the lock
        lock_ts: u64,
    },
    /// A write committed at `commit_ts`, at or after our start
    WriteAfterStart {
        /// Commit timestamp of the newer write
        commit_ts: u64,
    },
    /// Our lock was rolled back by another party
    RolledBack,
    /// The notification was already acknowledged at `ack_ts`
    Acknowledged {
        /// Start timestamp of the acknowledging transaction
        ack_ts: u64,
    },
    /// Expected lock is gone
    LockMissing,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Locked { lock_ts } => write!(f, "locked by transaction at {}", lock_ts),
            RejectReason::WriteAfterStart { commit_ts } => {
                write!(f, "write committed at {} after start", commit_ts)
            }
            RejectReason::RolledBack => write!(f, "rolled back by another transaction"),
            RejectReason::Acknowledged { ack_ts } => {
                write!(f, "notification already acknowledged at {}", ack_ts)
            }
            RejectReason::LockMissing => write!(f, "lock no longer held"),
        }
    }
}

/// Outcome of a conditional write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionStatus {
    /// All conditions held; ops were applied
    Accepted,
    /// A condition failed; nothing was applied
    Rejected {
        /// Column whose condition failed
        column: Column,
        /// Why
        reason: RejectReason,
    },
}

impl ConditionStatus {
    /// True if the write was applied
    pub fn is_accepted(&self) -> bool {
        matches!(self, ConditionStatus::Accepted)
    }
}

/// Atomic, guarded change to a single row
#[derive(Debug, Clone)]
pub struct ConditionalMutation {
    /// Row every condition and op applies to
    pub row: Bytes,
    /// Guards, all of which must hold
    pub conditions: Vec<Condition>,
    /// Changes applied when the guards hold
    pub ops: Vec<CellOp>,
}

impl ConditionalMutation {
    /// Empty mutation for `row`
    pub fn new(row: impl Into<Bytes>) -> Self {
        ConditionalMutation {
            row: row.into(),
            conditions: Vec::new(),
            ops: Vec::new(),
        }
    }

    /// Add a guard
    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Add an insert
    pub fn put(mut self, cell: Cell) -> Self {
        self.ops.push(CellOp::Put(cell));
        self
    }

    /// Add a removal
    pub fn delete(mut self, key: Key) -> Self {
        self.ops.push(CellOp::Delete(key));
        self
    }
}
