//! Snapshot reads at a transaction's start timestamp
//!
//! A read sees, for every requested cell, the newest `Write` committed
//! strictly before the start timestamp. Locks below the start timestamp
//! belong to transactions that may commit below it, so they are resolved
//! first (rolled forward, rolled back, or waited out with backoff) and the
//! scan is repeated.
//!
//! Columns in reserved families are never returned.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use seep_core::{
    decode, validate_user_column, Bytes, Cell, Column, ColumnFilter, EntryKind, LockValue,
    RetryPolicy, RowColumn, ScanRequest, SeepError, SeepResult, Span, Store, WriteKind,
    WriteValue,
};

use crate::backoff::{Backoff, BackoffAction};
use crate::resolver::{LockResolver, Resolution};

/// Counters a reader updates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    /// Cells returned
    pub cells_read: u64,
    /// Scans repeated because of a live lock
    pub lock_waits: u64,
    /// Locks this reader resolved
    pub locks_resolved: u64,
}

/// Point-in-time reader over a store
#[derive(Clone)]
pub struct SnapshotReader {
    store: Arc<dyn Store>,
    resolver: LockResolver,
    start_ts: u64,
    lock_wait: RetryPolicy,
}

impl std::fmt::Debug for SnapshotReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotReader")
            .field("start_ts", &self.start_ts)
            .finish()
    }
}

/// Newest visible write of one cell seen during a scan
struct Visible {
    write: WriteValue,
    value: Option<Bytes>,
}

impl SnapshotReader {
    /// Reader at `start_ts`
    pub fn new(
        store: Arc<dyn Store>,
        resolver: LockResolver,
        start_ts: u64,
        lock_wait: RetryPolicy,
    ) -> Self {
        SnapshotReader {
            store,
            resolver,
            start_ts,
            lock_wait,
        }
    }

    /// Snapshot timestamp
    pub fn start_ts(&self) -> u64 {
        self.start_ts
    }

    /// Read every visible cell in `span` matching `columns`
    ///
    /// # Errors
    ///
    /// - `CommitConflict` if a live lock is still present after the lock-wait
    ///   budget is spent
    /// - `Storage`/`Serialization` if the store fails or holds a bad entry
    pub fn read(
        &self,
        span: &Span,
        columns: &ColumnFilter,
        stats: &mut ReadStats,
    ) -> SeepResult<BTreeMap<RowColumn, Bytes>> {
        let mut backoff = Backoff::new(self.lock_wait.clone());
        loop {
            let request = ScanRequest::new(span.clone(), columns.clone())
                .kinds([EntryKind::Write, EntryKind::Lock, EntryKind::Data])
                .before(self.start_ts);
            let (visible, locks) = self.collect(self.store.scan(&request)?)?;

            if locks.is_empty() {
                let mut out = BTreeMap::new();
                for (rc, seen) in visible {
                    if seen.write.kind == WriteKind::Delete {
                        continue;
                    }
                    match seen.value {
                        Some(value) => {
                            out.insert(rc, value);
                        }
                        None => {
                            return Err(SeepError::storage(format!(
                                "{} {} has a write at start ts {} but no data",
                                rc.row, rc.column, seen.write.start_ts
                            )))
                        }
                    }
                }
                stats.cells_read += out.len() as u64;
                return Ok(out);
            }

            let mut live = None;
            for (rc, lock_ts, lock) in &locks {
                match self.resolver.resolve(rc, *lock_ts, lock)? {
                    Resolution::Live => {
                        live.get_or_insert((rc.clone(), *lock_ts));
                    }
                    _ => stats.locks_resolved += 1,
                }
            }

            if let Some((rc, lock_ts)) = live {
                stats.lock_waits += 1;
                debug!(
                    row = %rc.row,
                    column = %rc.column,
                    lock_ts,
                    start_ts = self.start_ts,
                    "Read waiting on live lock"
                );
                if backoff.wait() == BackoffAction::Abort {
                    return Err(SeepError::conflict(
                        &rc.row,
                        &rc.column,
                        format!("still locked by transaction at {}", lock_ts),
                    ));
                }
            }
        }
    }

    /// Read one cell
    ///
    /// # Errors
    ///
    /// Same as [`read`](Self::read).
    pub fn read_cell(
        &self,
        row: &Bytes,
        column: &Column,
        stats: &mut ReadStats,
    ) -> SeepResult<Option<Bytes>> {
        let rc = RowColumn::new(row.clone(), column.clone());
        let mut cells = self.read(
            &Span::exact(row.clone()),
            &ColumnFilter::column(column.clone()),
            stats,
        )?;
        Ok(cells.remove(&rc))
    }

    #[allow(clippy::type_complexity)]
    fn collect(
        &self,
        cells: impl Iterator<Item = Cell>,
    ) -> SeepResult<(BTreeMap<RowColumn, Visible>, Vec<(RowColumn, u64, LockValue)>)> {
        let mut visible: BTreeMap<RowColumn, Visible> = BTreeMap::new();
        let mut locks = Vec::new();
        for cell in cells {
            if validate_user_column(&cell.key.column).is_err() {
                continue;
            }
            let rc = cell.key.row_column();
            match cell.key.kind {
                EntryKind::Lock => {
                    locks.push((rc, cell.key.ts, decode::<LockValue>(&cell.value)?));
                }
                EntryKind::Write => {
                    // newest first: only the first write of a cell counts
                    if !visible.contains_key(&rc) {
                        let write: WriteValue = decode(&cell.value)?;
                        visible.insert(rc, Visible { write, value: None });
                    }
                }
                EntryKind::Data => {
                    if let Some(seen) = visible.get_mut(&rc) {
                        if seen.write.start_ts == cell.key.ts {
                            seen.value = Some(cell.value);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok((visible, locks))
    }
}
