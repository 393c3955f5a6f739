//! MemoryStore: in-process sorted, multi-versioned table
//!
//! This module implements the Store trait using:
//! - `BTreeMap<Key, Bytes>` ordered by row, column, kind, then timestamp descending
//! - `parking_lot::RwLock` for thread-safe access
//! - A single write lock per mutation, so every conditional write is atomic
//!
//! # Design Notes
//!
//! - **Row atomicity only**: a conditional write covers exactly one row; batches
//!   are applied under one lock but callers must not rely on that
//! - **Eager scans**: results are collected under the read lock and handed out
//!   as an owned iterator, so no lock is held while callers consume them
//! - **Compaction on demand**: registered filters only run when `compact()` is
//!   called (directly or by the background `Compactor`)

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use seep_core::{
    Bytes, Cell, CellIter, CellOp, Column, CompactionFilter, CompactionPass, Condition,
    ConditionStatus, ConditionalMutation, EntryKind, Key, RejectReason, ScanRequest, SeepError,
    SeepResult, Store,
};

/// Counters describing one compaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// `(row, column)` groups visited
    pub groups: usize,
    /// Entries before filtering
    pub examined: usize,
    /// Entries dropped by filters
    pub removed: usize,
    /// Filters that could not start and were skipped
    pub filters_skipped: usize,
}

/// Operation counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Scans served
    pub scans: u64,
    /// Conditional writes applied
    pub conditional_accepted: u64,
    /// Conditional writes refused
    pub conditional_rejected: u64,
    /// Unconditional batches applied
    pub batches: u64,
    /// Compactions run
    pub compactions: u64,
}

#[derive(Debug, Default)]
struct Counters {
    scans: AtomicU64,
    conditional_accepted: AtomicU64,
    conditional_rejected: AtomicU64,
    batches: AtomicU64,
    compactions: AtomicU64,
}

/// In-memory implementation of [`Store`]
///
/// Thread-safe through `parking_lot::RwLock`. Intended for tests and for
/// embedding the transaction layer in a single process.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use seep_storage::MemoryStore;
///
/// let store = Arc::new(MemoryStore::new());
/// store.register_filter(Arc::new(GarbageCollectionFilter::new(oracle)));
/// let stats = store.compact()?;
/// ```
pub struct MemoryStore {
    /// All entries in key order
    data: RwLock<BTreeMap<Key, Bytes>>,
    /// Filters applied by `compact()`, in registration order
    filters: RwLock<Vec<Arc<dyn CompactionFilter>>>,
    counters: Counters,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.len())
            .field("filters", &self.filters.read().len())
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Smallest possible key in `row`
fn row_floor(row: &Bytes) -> Key {
    Key::new(row.clone(), Column::new(Bytes::EMPTY, Bytes::EMPTY), EntryKind::TxDone, u64::MAX)
}

/// Smallest possible key in `(row, column)`
fn column_floor(row: &Bytes, column: &Column) -> Key {
    Key::new(row.clone(), column.clone(), EntryKind::TxDone, u64::MAX)
}

/// Iterate every entry of one `(row, column)` in key order
fn column_entries<'a>(
    data: &'a BTreeMap<Key, Bytes>,
    row: &'a Bytes,
    column: &'a Column,
) -> impl Iterator<Item = (&'a Key, &'a Bytes)> + 'a {
    data.range(column_floor(row, column)..)
        .take_while(move |(k, _)| &k.row == row && &k.column == column)
}

/// Evaluate one condition against the current contents of its column
fn evaluate(data: &BTreeMap<Key, Bytes>, row: &Bytes, condition: &Condition) -> Option<RejectReason> {
    match condition {
        Condition::Prewrite {
            column,
            start_ts,
            check_writes,
            ack_since,
        } => {
            let mut locked = None;
            let mut rolled_back = false;
            let mut newer_write = None;
            let mut acked = None;
            for (key, _) in column_entries(data, row, column) {
                match key.kind {
                    EntryKind::Lock if locked.is_none() => locked = Some(key.ts),
                    EntryKind::DelLock if key.ts == *start_ts => rolled_back = true,
                    EntryKind::Write if *check_writes && key.ts >= *start_ts => {
                        newer_write.get_or_insert(key.ts);
                    }
                    EntryKind::Ack => {
                        if let Some(since) = ack_since {
                            if key.ts >= *since {
                                acked.get_or_insert(key.ts);
                            }
                        }
                    }
                    _ => {}
                }
            }
            if let Some(lock_ts) = locked {
                Some(RejectReason::Locked { lock_ts })
            } else if rolled_back {
                Some(RejectReason::RolledBack)
            } else if let Some(commit_ts) = newer_write {
                Some(RejectReason::WriteAfterStart { commit_ts })
            } else {
                acked.map(|ack_ts| RejectReason::Acknowledged { ack_ts })
            }
        }
        Condition::LockHeld { column, start_ts } => {
            let lock = Key::new(row.clone(), column.clone(), EntryKind::Lock, *start_ts);
            if data.contains_key(&lock) {
                return None;
            }
            let del = Key::new(row.clone(), column.clone(), EntryKind::DelLock, *start_ts);
            if data.contains_key(&del) {
                Some(RejectReason::RolledBack)
            } else {
                Some(RejectReason::LockMissing)
            }
        }
    }
}

fn apply(data: &mut BTreeMap<Key, Bytes>, op: CellOp) {
    match op {
        CellOp::Put(cell) => {
            data.insert(cell.key, cell.value);
        }
        CellOp::Delete(key) => {
            data.remove(&key);
        }
    }
}

impl MemoryStore {
    /// Create a new empty store
    pub fn new() -> Self {
        MemoryStore {
            data: RwLock::new(BTreeMap::new()),
            filters: RwLock::new(Vec::new()),
            counters: Counters::default(),
        }
    }

    /// Number of entries, all kinds and versions included
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// True if the store holds nothing
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Copy of every entry in key order
    pub fn dump(&self) -> Vec<Cell> {
        self.data
            .read()
            .iter()
            .map(|(k, v)| Cell::new(k.clone(), v.clone()))
            .collect()
    }

    /// Operation counters
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            scans: self.counters.scans.load(Ordering::Relaxed),
            conditional_accepted: self.counters.conditional_accepted.load(Ordering::Relaxed),
            conditional_rejected: self.counters.conditional_rejected.load(Ordering::Relaxed),
            batches: self.counters.batches.load(Ordering::Relaxed),
            compactions: self.counters.compactions.load(Ordering::Relaxed),
        }
    }

    /// Run every registered filter over the whole table
    ///
    /// Each filter's pass is started before the write lock is taken, so
    /// filters may call out to other services (the oracle) without blocking
    /// writers. A filter whose pass fails to start is skipped and logged.
    ///
    /// # Errors
    ///
    /// Currently infallible for the in-memory table; the `Result` leaves
    /// room for adapters whose compaction can fail.
    pub fn compact(&self) -> SeepResult<CompactionStats> {
        let filters: Vec<Arc<dyn CompactionFilter>> = self.filters.read().clone();
        let mut stats = CompactionStats::default();
        let mut passes: Vec<Box<dyn CompactionPass>> = Vec::with_capacity(filters.len());
        for filter in &filters {
            match filter.begin() {
                Ok(pass) => passes.push(pass),
                Err(e) => {
                    warn!(filter = filter.name(), error = %e, "Compaction filter skipped");
                    stats.filters_skipped += 1;
                }
            }
        }

        let mut data = self.data.write();
        let old = std::mem::take(&mut *data);
        stats.examined = old.len();

        let mut group: Vec<Cell> = Vec::new();
        let mut flush = |group: &mut Vec<Cell>, data: &mut BTreeMap<Key, Bytes>| {
            if group.is_empty() {
                return;
            }
            stats.groups += 1;
            let mut kept = std::mem::take(group);
            for pass in passes.iter_mut() {
                kept = pass.filter(kept);
            }
            for cell in kept {
                data.insert(cell.key, cell.value);
            }
        };

        for (key, value) in old {
            if let Some(first) = group.first() {
                if !first.key.same_row_column(&key) {
                    flush(&mut group, &mut *data);
                }
            }
            group.push(Cell::new(key, value));
        }
        flush(&mut group, &mut *data);

        stats.removed = stats.examined - data.len();
        drop(data);

        self.counters.compactions.fetch_add(1, Ordering::Relaxed);
        debug!(
            groups = stats.groups,
            examined = stats.examined,
            removed = stats.removed,
            "Compaction finished"
        );
        Ok(stats)
    }

    fn check_row(row: &Bytes, key: &Key) -> SeepResult<()> {
        if &key.row != row {
            return Err(SeepError::invalid_input(format!(
                "conditional mutation for row {} touches row {}",
                row, key.row
            )));
        }
        Ok(())
    }
}

impl Store for MemoryStore {
    fn scan(&self, request: &ScanRequest) -> SeepResult<CellIter<'_>> {
        self.counters.scans.fetch_add(1, Ordering::Relaxed);
        let data = self.data.read();
        let lower = match &request.span.start {
            Bound::Included(row) | Bound::Excluded(row) => Bound::Included(row_floor(row)),
            Bound::Unbounded => Bound::Unbounded,
        };
        let cells: Vec<Cell> = data
            .range((lower, Bound::Unbounded))
            .take_while(|(k, _)| !request.span.is_past_end(k.row.as_slice()))
            .filter(|(k, _)| request.accepts(k))
            .map(|(k, v)| Cell::new(k.clone(), v.clone()))
            .collect();
        Ok(Box::new(cells.into_iter()))
    }

    fn conditional_write(&self, mutation: ConditionalMutation) -> SeepResult<ConditionStatus> {
        for op in &mutation.ops {
            Self::check_row(&mutation.row, op.key())?;
        }

        let mut data = self.data.write();
        for condition in &mutation.conditions {
            if let Some(reason) = evaluate(&data, &mutation.row, condition) {
                self.counters
                    .conditional_rejected
                    .fetch_add(1, Ordering::Relaxed);
                return Ok(ConditionStatus::Rejected {
                    column: condition.column().clone(),
                    reason,
                });
            }
        }
        for op in mutation.ops {
            apply(&mut data, op);
        }
        self.counters
            .conditional_accepted
            .fetch_add(1, Ordering::Relaxed);
        Ok(ConditionStatus::Accepted)
    }

    fn batch_write(&self, ops: Vec<CellOp>) -> SeepResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut data = self.data.write();
        for op in ops {
            apply(&mut data, op);
        }
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn register_filter(&self, filter: Arc<dyn CompactionFilter>) {
        debug!(filter = filter.name(), "Compaction filter registered");
        self.filters.write().push(filter);
    }
}
