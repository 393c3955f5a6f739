//! Snapshot-isolated transaction with a Percolator commit
//!
//! A Transaction reads a consistent snapshot at its start timestamp, buffers
//! writes and notifications locally, and commits in three store-visible steps:
//!
//! 1. `pre_commit`: lock every written cell, primary first. A lock is only
//!    placed if no other lock exists and nothing committed at or after our
//!    start timestamp (first committer wins).
//! 2. `commit_primary_column`: write the notification markers, then turn
//!    the primary lock into a write at the commit timestamp. Once this
//!    succeeds the transaction is committed, even if the process dies right
//!    after.
//! 3. `finish_commit`: roll every secondary lock forward and clear the
//!    notification being processed.
//!
//! Reads see committed data only; a transaction does not read its own
//! buffered writes.
//!
//! # State machine
//!
//! ```text
//! Open ──pre_commit──▶ PreCommitted ──commit_primary_column──▶ PrimaryCommitted ──finish_commit──▶ Committed
//!   │                      │
//!   └──────────────────────┴──▶ RolledBack
//! ```
//!
//! Calling an operation from the wrong state fails with
//! `SeepError::InvalidState`, which is never retryable.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use seep_core::{
    validate_user_column, Bytes, CellOp, Column, ColumnFilter, ConditionStatus,
    ConditionalMutation, EntryKind, LockType, LockValue, Notification, NotificationType,
    ObservedColumns, RejectReason, RetryPolicy, RowColumn, ScanRequest, SeepError, SeepResult,
    Span, Store,
};

use crate::commit::{
    commit_cell_mutation, marker_op, prewrite_mutation, tx_done_op, CommitData, PendingCell,
};
use crate::oracle::{OracleClient, TimestampTracker};
use crate::resolver::LockResolver;
use crate::snapshot::{ReadStats, SnapshotReader};

/// Lifecycle state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Reading and buffering
    Open,
    /// Every lock is placed
    PreCommitted,
    /// Primary committed; secondaries may still be locked
    PrimaryCommitted,
    /// Fully committed
    Committed,
    /// Abandoned; nothing of it is visible
    RolledBack,
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxState::Open => "Open",
            TxState::PreCommitted => "PreCommitted",
            TxState::PrimaryCommitted => "PrimaryCommitted",
            TxState::Committed => "Committed",
            TxState::RolledBack => "RolledBack",
        };
        f.write_str(name)
    }
}

/// Diagnostic counters for one transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionStats {
    /// Cells returned by reads
    pub cells_read: u64,
    /// Reads that waited on a live lock
    pub lock_waits: u64,
    /// Other transactions' locks this one resolved
    pub locks_resolved: u64,
    /// Locks placed by `pre_commit`
    pub locks_placed: u64,
}

/// Shared handles every transaction of a process works against
#[derive(Clone)]
pub(crate) struct TransactionParts {
    pub store: Arc<dyn Store>,
    pub oracle: Arc<OracleClient>,
    pub observed: Arc<ObservedColumns>,
    pub resolver: LockResolver,
    pub lock_wait: RetryPolicy,
    pub transactor: u128,
}

/// A snapshot-isolated transaction
///
/// Created by `TransactionManager::begin`. Never reused across commits.
pub struct Transaction {
    store: Arc<dyn Store>,
    oracle: Arc<OracleClient>,
    observed: Arc<ObservedColumns>,
    resolver: LockResolver,
    reader: SnapshotReader,
    /// Keeps the start timestamp registered until the transaction ends
    tracker: Option<TimestampTracker>,
    start_ts: u64,
    transactor: u128,
    state: TxState,

    /// Buffered changes; `None` is a delete
    updates: BTreeMap<RowColumn, Option<Bytes>>,
    /// Buffered notification arms
    notifications: BTreeMap<RowColumn, NotificationType>,
    /// Notification this transaction was opened to process
    trigger: Option<Notification>,

    /// Locks placed so far, primary first
    placed: Vec<PendingCell>,
    /// Why the last conditional write was refused
    last_rejection: Option<(RowColumn, RejectReason)>,
    stats: TransactionStats,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("start_ts", &self.start_ts)
            .field("state", &self.state)
            .field("updates", &self.updates.len())
            .field("notifications", &self.notifications.len())
            .finish()
    }
}

impl Transaction {
    pub(crate) fn new(parts: TransactionParts) -> SeepResult<Self> {
        let tracker = parts.oracle.start_timestamp()?;
        let start_ts = tracker.timestamp();
        let reader = SnapshotReader::new(
            Arc::clone(&parts.store),
            parts.resolver.clone(),
            start_ts,
            parts.lock_wait,
        );
        debug!(start_ts, "Transaction started");
        Ok(Transaction {
            store: parts.store,
            oracle: parts.oracle,
            observed: parts.observed,
            resolver: parts.resolver,
            reader,
            tracker: Some(tracker),
            start_ts,
            transactor: parts.transactor,
            state: TxState::Open,
            updates: BTreeMap::new(),
            notifications: BTreeMap::new(),
            trigger: None,
            placed: Vec::new(),
            last_rejection: None,
            stats: TransactionStats::default(),
        })
    }

    /// Snapshot timestamp
    pub fn start_ts(&self) -> u64 {
        self.start_ts
    }

    /// Current lifecycle state
    pub fn state(&self) -> TxState {
        self.state
    }

    /// Diagnostic counters
    pub fn stats(&self) -> TransactionStats {
        self.stats
    }

    /// Number of buffered cell changes
    pub fn pending_updates(&self) -> usize {
        self.updates.len()
    }

    /// Notification this transaction is processing
    pub fn trigger(&self) -> Option<&Notification> {
        self.trigger.as_ref()
    }

    fn ensure_state(&self, expected: TxState) -> SeepResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SeepError::invalid_state(
                expected.to_string(),
                self.state.to_string(),
            ))
        }
    }

    fn check_commit_data(&self, cd: &CommitData) -> SeepResult<()> {
        if cd.start_ts != self.start_ts {
            return Err(SeepError::invalid_input(format!(
                "commit data of transaction {} used with transaction {}",
                cd.start_ts, self.start_ts
            )));
        }
        Ok(())
    }

    // === Reads ===

    fn read(&mut self, span: &Span, columns: &ColumnFilter) -> SeepResult<BTreeMap<RowColumn, Bytes>> {
        self.ensure_state(TxState::Open)?;
        let mut rs = ReadStats::default();
        let result = self.reader.read(span, columns, &mut rs);
        self.stats.cells_read += rs.cells_read;
        self.stats.lock_waits += rs.lock_waits;
        self.stats.locks_resolved += rs.locks_resolved;
        result
    }

    /// Read one cell as of the start timestamp
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for a reserved column
    /// - `CommitConflict` if a live lock could not be waited out
    /// - `InvalidState` unless the transaction is `Open`
    pub fn get(&mut self, row: impl Into<Bytes>, column: &Column) -> SeepResult<Option<Bytes>> {
        validate_user_column(column)?;
        let row = row.into();
        let rc = RowColumn::new(row.clone(), column.clone());
        let mut cells = self.read(&Span::exact(row), &ColumnFilter::column(column.clone()))?;
        Ok(cells.remove(&rc))
    }

    /// Read several columns of one row
    ///
    /// Columns without a visible value are absent from the result.
    pub fn get_columns(
        &mut self,
        row: impl Into<Bytes>,
        columns: &[Column],
    ) -> SeepResult<BTreeMap<Column, Bytes>> {
        if columns.is_empty() {
            self.ensure_state(TxState::Open)?;
            return Ok(BTreeMap::new());
        }
        for column in columns {
            validate_user_column(column)?;
        }
        self.get_row(row, &ColumnFilter::columns(columns.iter().cloned()))
    }

    /// Read every matching column of one row
    pub fn get_row(
        &mut self,
        row: impl Into<Bytes>,
        columns: &ColumnFilter,
    ) -> SeepResult<BTreeMap<Column, Bytes>> {
        let cells = self.read(&Span::exact(row), columns)?;
        Ok(cells.into_iter().map(|(rc, v)| (rc.column, v)).collect())
    }

    /// Read every matching column of every row in `span`, grouped by row
    pub fn get_span(
        &mut self,
        span: &Span,
        columns: &ColumnFilter,
    ) -> SeepResult<Vec<(Bytes, BTreeMap<Column, Bytes>)>> {
        let cells = self.read(span, columns)?;
        let mut rows: Vec<(Bytes, BTreeMap<Column, Bytes>)> = Vec::new();
        for (rc, value) in cells {
            match rows.last_mut() {
                Some((row, columns)) if *row == rc.row => {
                    columns.insert(rc.column, value);
                }
                _ => {
                    let mut columns = BTreeMap::new();
                    columns.insert(rc.column, value);
                    rows.push((rc.row, columns));
                }
            }
        }
        Ok(rows)
    }

    /// Read a cell holding a decimal integer
    ///
    /// # Errors
    ///
    /// `Serialization` if the cell holds something else.
    pub fn get_i64(&mut self, row: impl Into<Bytes>, column: &Column) -> SeepResult<Option<i64>> {
        let row = row.into();
        match self.get(row.clone(), column)? {
            None => Ok(None),
            Some(value) => value
                .to_str()
                .and_then(|s| s.parse::<i64>().ok())
                .map(Some)
                .ok_or_else(|| {
                    SeepError::Serialization(format!(
                        "{} {} is not an integer: {}",
                        row, column, value
                    ))
                }),
        }
    }

    // === Buffering ===

    /// Buffer a write
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a reserved column, `InvalidState` unless `Open`.
    pub fn set(
        &mut self,
        row: impl Into<Bytes>,
        column: Column,
        value: impl Into<Bytes>,
    ) -> SeepResult<()> {
        self.ensure_state(TxState::Open)?;
        validate_user_column(&column)?;
        self.updates
            .insert(RowColumn::new(row, column), Some(value.into()));
        Ok(())
    }

    /// Buffer a write of a decimal integer
    pub fn set_i64(&mut self, row: impl Into<Bytes>, column: Column, value: i64) -> SeepResult<()> {
        self.set(row, column, value.to_string())
    }

    /// Buffer a delete
    pub fn delete(&mut self, row: impl Into<Bytes>, column: Column) -> SeepResult<()> {
        self.ensure_state(TxState::Open)?;
        validate_user_column(&column)?;
        self.updates.insert(RowColumn::new(row, column), None);
        Ok(())
    }

    /// Arm a weak notification
    ///
    /// Arming is a plain set: concurrent transactions arming the same
    /// notification never conflict with each other.
    ///
    /// # Errors
    ///
    /// `Configuration` if `column` is not weak-observed. Everything buffered
    /// is discarded and the transaction is rolled back.
    pub fn weakly_notify(&mut self, row: impl Into<Bytes>, column: Column) -> SeepResult<()> {
        self.arm(row.into(), column, NotificationType::Weak)
    }

    /// Arm a strong notification without writing the observed column
    ///
    /// Writing a strong-observed column arms its notification automatically.
    ///
    /// # Errors
    ///
    /// `Configuration` if `column` is not strong-observed. Everything buffered
    /// is discarded and the transaction is rolled back.
    pub fn notify(&mut self, row: impl Into<Bytes>, column: Column) -> SeepResult<()> {
        self.arm(row.into(), column, NotificationType::Strong)
    }

    fn arm(&mut self, row: Bytes, column: Column, ntype: NotificationType) -> SeepResult<()> {
        self.ensure_state(TxState::Open)?;
        if let Err(e) = self.observed.require(&column, ntype) {
            warn!(
                start_ts = self.start_ts,
                row = %row,
                column = %column,
                error = %e,
                "Notification refused, discarding transaction"
            );
            self.discard();
            return Err(e);
        }
        self.notifications.insert(RowColumn::new(row, column), ntype);
        Ok(())
    }

    /// Mark this transaction as processing `notification`
    ///
    /// The marker is cleared when the transaction commits. The observed cell
    /// is also locked with an acknowledgement, so two transactions
    /// processing the same notification conflict.
    pub fn set_trigger(&mut self, notification: Notification) -> SeepResult<()> {
        self.ensure_state(TxState::Open)?;
        self.trigger = Some(notification);
        Ok(())
    }

    /// Drop everything buffered and end the transaction
    fn discard(&mut self) {
        self.updates.clear();
        self.notifications.clear();
        self.trigger = None;
        self.end(TxState::RolledBack);
    }

    fn end(&mut self, state: TxState) {
        self.state = state;
        self.tracker = None;
    }

    // === Commit protocol ===

    /// Snapshot the buffer into a commit working set
    ///
    /// The primary is the first written cell in `(row, column)` order. A
    /// transaction that writes nothing but processes a notification uses the
    /// acknowledgement lock as its primary.
    pub fn create_commit_data(&self) -> SeepResult<CommitData> {
        self.ensure_state(TxState::Open)?;
        let trigger = self.trigger.as_ref();
        let trigger_rc = trigger.map(Notification::row_column);

        let primary_rc = self
            .updates
            .keys()
            .next()
            .cloned()
            .or_else(|| trigger_rc.clone());
        let Some(primary_rc) = primary_rc else {
            return Ok(CommitData {
                start_ts: self.start_ts,
                primary: None,
                secondaries: Vec::new(),
                notifications: self.notifications.clone(),
                trigger: self.trigger.clone(),
            });
        };

        let created_ms = Utc::now().timestamp_millis();
        let make_lock = |rc: &RowColumn, lock_type: LockType| LockValue {
            primary: primary_rc.clone(),
            lock_type,
            trigger: match (&trigger_rc, trigger) {
                (Some(t), Some(n)) if t == rc => Some(n.ts),
                _ => None,
            },
            observed: lock_type != LockType::Ack && self.observed.is_strong(&rc.column),
            transactor: self.transactor,
            created_ms,
        };

        let mut cells: Vec<PendingCell> = self
            .updates
            .iter()
            .map(|(rc, value)| {
                let lock_type = if value.is_some() {
                    LockType::Put
                } else {
                    LockType::Delete
                };
                PendingCell {
                    rc: rc.clone(),
                    lock: make_lock(rc, lock_type),
                    value: value.clone(),
                }
            })
            .collect();
        if let Some(rc) = &trigger_rc {
            if !self.updates.contains_key(rc) {
                cells.push(PendingCell {
                    rc: rc.clone(),
                    lock: make_lock(rc, LockType::Ack),
                    value: None,
                });
            }
        }

        let mut cells = cells.into_iter();
        let primary = cells.next();
        let mut secondaries: Vec<PendingCell> = cells.collect();
        secondaries.sort_by(|a, b| a.rc.cmp(&b.rc));

        Ok(CommitData {
            start_ts: self.start_ts,
            primary,
            secondaries,
            notifications: self.notifications.clone(),
            trigger: self.trigger.clone(),
        })
    }

    /// Lock every cell of `cd`, primary first
    ///
    /// Returns `false` on a conflict, after rolling back whatever was locked;
    /// the transaction is then `RolledBack`. A lock that blocked us is
    /// resolved on the way out if its owner is gone, so a retry can succeed.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless `Open`; store errors after a best-effort rollback.
    pub fn pre_commit(&mut self, cd: &mut CommitData) -> SeepResult<bool> {
        self.ensure_state(TxState::Open)?;
        self.check_commit_data(cd)?;
        match self.place_locks(cd) {
            Ok(true) => {
                self.state = TxState::PreCommitted;
                debug!(start_ts = self.start_ts, locks = cd.lock_count(), "Pre-committed");
                Ok(true)
            }
            Ok(false) => {
                self.rollback_placed()?;
                self.end(TxState::RolledBack);
                Ok(false)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback_placed() {
                    warn!(start_ts = self.start_ts, error = %rollback_err, "Rollback after failed pre-commit failed");
                }
                self.end(TxState::RolledBack);
                Err(e)
            }
        }
    }

    fn place_locks(&mut self, cd: &mut CommitData) -> SeepResult<bool> {
        let now = Utc::now().timestamp_millis();
        if let Some(primary) = cd.primary.as_mut() {
            primary.lock.created_ms = now;
        }
        for cell in cd.secondaries.iter_mut() {
            cell.lock.created_ms = now;
        }

        let Some(primary) = cd.primary.as_ref() else {
            return Ok(true);
        };
        let mutation = prewrite_mutation(&primary.rc.row, &[primary], self.start_ts)?;
        if !self.apply_locks(mutation, &[primary])? {
            return Ok(false);
        }
        for (row, cells) in cd.secondaries_by_row() {
            let mutation = prewrite_mutation(row, &cells, self.start_ts)?;
            if !self.apply_locks(mutation, &cells)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn apply_locks(
        &mut self,
        mutation: ConditionalMutation,
        cells: &[&PendingCell],
    ) -> SeepResult<bool> {
        let row = mutation.row.clone();
        match self.store.conditional_write(mutation)? {
            ConditionStatus::Accepted => {
                self.placed.extend(cells.iter().map(|cell| (*cell).clone()));
                self.stats.locks_placed += cells.len() as u64;
                Ok(true)
            }
            ConditionStatus::Rejected { column, reason } => {
                let rc = RowColumn::new(row, column);
                debug!(
                    start_ts = self.start_ts,
                    row = %rc.row,
                    column = %rc.column,
                    %reason,
                    "Prewrite rejected"
                );
                if let RejectReason::Locked { lock_ts } = reason {
                    self.resolve_blocking_lock(&rc, lock_ts);
                }
                self.last_rejection = Some((rc, reason));
                Ok(false)
            }
        }
    }

    /// Clear an orphaned lock so the next attempt does not hit it again
    fn resolve_blocking_lock(&mut self, rc: &RowColumn, lock_ts: u64) {
        let outcome = self
            .resolver
            .read_lock(rc, lock_ts)
            .and_then(|lock| match lock {
                Some(lock) => self.resolver.resolve(rc, lock_ts, &lock).map(Some),
                None => Ok(None),
            });
        match outcome {
            Ok(Some(resolution)) if resolution.is_resolved() => self.stats.locks_resolved += 1,
            Ok(_) => {}
            Err(e) => debug!(row = %rc.row, column = %rc.column, error = %e, "Could not resolve blocking lock"),
        }
    }

    /// Commit the primary cell at `commit_ts`
    ///
    /// This is the point of no return: once it returns `true` the
    /// transaction is committed. Returns `false` if the primary lock was
    /// taken away (rolled back by another party); the remaining locks are
    /// then rolled back and the transaction is `RolledBack`.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless `PreCommitted`; `InvalidArgument` if
    /// `commit_ts` is not after the start timestamp.
    pub fn commit_primary_column(&mut self, cd: &CommitData, commit_ts: u64) -> SeepResult<bool> {
        self.ensure_state(TxState::PreCommitted)?;
        self.check_commit_data(cd)?;
        if commit_ts <= self.start_ts {
            return Err(SeepError::invalid_input(format!(
                "commit timestamp {} is not after start timestamp {}",
                commit_ts, self.start_ts
            )));
        }

        // markers outside the primary's row must exist before the primary commits
        let primary_row = cd.primary.as_ref().map(|p| &p.rc.row);
        let early: Vec<CellOp> = cd
            .notifications
            .iter()
            .filter(|(rc, _)| Some(&rc.row) != primary_row)
            .map(|(rc, ntype)| marker_op(rc, *ntype, commit_ts))
            .collect();
        if !early.is_empty() {
            self.store.batch_write(early)?;
        }

        let Some(primary) = cd.primary.as_ref() else {
            self.state = TxState::PrimaryCommitted;
            return Ok(true);
        };

        let mut mutation =
            commit_cell_mutation(&primary.rc, &primary.lock, self.start_ts, commit_ts)?;
        // notifications in the primary's row become visible atomically with it
        for (rc, ntype) in &cd.notifications {
            if rc.row == primary.rc.row {
                mutation.ops.push(marker_op(rc, *ntype, commit_ts));
            }
        }
        // with nothing left to roll forward the transaction is done right here
        if cd.secondaries.is_empty() {
            mutation.ops.push(tx_done_op(&primary.rc, self.start_ts));
        }

        match self.store.conditional_write(mutation)? {
            ConditionStatus::Accepted => {
                self.state = TxState::PrimaryCommitted;
                debug!(start_ts = self.start_ts, commit_ts, "Primary committed");
                Ok(true)
            }
            ConditionStatus::Rejected { column, reason } => {
                warn!(
                    start_ts = self.start_ts,
                    row = %primary.rc.row,
                    column = %column,
                    %reason,
                    "Primary lock lost before commit"
                );
                self.last_rejection = Some((RowColumn::new(primary.rc.row.clone(), column), reason));
                self.rollback_placed()?;
                self.end(TxState::RolledBack);
                Ok(false)
            }
        }
    }

    /// Finalize a transaction whose primary is committed
    ///
    /// Rolls every secondary forward, clears the processed notification and
    /// records that the transaction is done. Each step is idempotent, so a
    /// crash here leaves nothing another reader cannot finish.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless `PrimaryCommitted`; store errors.
    pub fn finish_commit(&mut self, cd: CommitData, commit_ts: u64) -> SeepResult<()> {
        self.ensure_state(TxState::PrimaryCommitted)?;
        self.check_commit_data(&cd)?;

        for cell in &cd.secondaries {
            self.resolver
                .roll_forward(&cell.rc, &cell.lock, self.start_ts, commit_ts)?;
        }

        let mut ops = Vec::new();
        if let Some(notification) = &cd.trigger {
            ops.extend(self.clear_marker_ops(notification)?);
        }
        if let Some(primary) = &cd.primary {
            if !cd.secondaries.is_empty() {
                ops.push(tx_done_op(&primary.rc, self.start_ts));
            }
        }
        self.store.batch_write(ops)?;

        self.placed.clear();
        self.end(TxState::Committed);
        debug!(start_ts = self.start_ts, commit_ts, "Transaction committed");
        Ok(())
    }

    /// Deletes for every marker version of `notification` up to its timestamp
    fn clear_marker_ops(&self, notification: &Notification) -> SeepResult<Vec<CellOp>> {
        let marker = notification.marker_key();
        let request = ScanRequest::new(
            Span::exact(marker.row.clone()),
            ColumnFilter::column(marker.column.clone()),
        )
        .kinds([EntryKind::Notify])
        .before(notification.ts.saturating_add(1));
        Ok(self
            .store
            .scan(&request)?
            .map(|cell| CellOp::Delete(cell.key))
            .collect())
    }

    /// Run the whole commit protocol
    ///
    /// # Errors
    ///
    /// - `CommitConflict` if another transaction won; retry with a new
    ///   transaction
    /// - `Unavailable` if the oracle could not be reached
    /// - `InvalidState` unless `Open`
    pub fn commit(&mut self) -> SeepResult<()> {
        self.ensure_state(TxState::Open)?;
        let mut cd = self.create_commit_data()?;
        if cd.is_empty() {
            self.end(TxState::Committed);
            return Ok(());
        }

        if !self.pre_commit(&mut cd)? {
            return Err(self.conflict_error());
        }

        let commit_ts = match self.oracle.get_timestamp() {
            Ok(ts) => ts,
            Err(e) => {
                if let Err(rollback_err) = self.rollback_placed() {
                    warn!(start_ts = self.start_ts, error = %rollback_err, "Rollback after oracle failure failed");
                }
                self.end(TxState::RolledBack);
                return Err(e);
            }
        };

        if !self.commit_primary_column(&cd, commit_ts)? {
            return Err(self.conflict_error());
        }
        self.finish_commit(cd, commit_ts)
    }

    /// Abandon the transaction
    ///
    /// Locks placed by `pre_commit` are rolled back.
    ///
    /// # Errors
    ///
    /// `InvalidState` once the primary is committed or the transaction ended.
    pub fn rollback(&mut self) -> SeepResult<()> {
        match self.state {
            TxState::Open => {
                self.discard();
                Ok(())
            }
            TxState::PreCommitted => {
                let result = self.rollback_placed();
                self.end(TxState::RolledBack);
                result
            }
            other => Err(SeepError::invalid_state(
                "Open or PreCommitted",
                other.to_string(),
            )),
        }
    }

    fn rollback_placed(&mut self) -> SeepResult<()> {
        let placed = std::mem::take(&mut self.placed);
        let mut first_err = None;
        for cell in &placed {
            if let Err(e) = self.resolver.roll_back(&cell.rc, &cell.lock, self.start_ts) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn conflict_error(&self) -> SeepError {
        match &self.last_rejection {
            Some((rc, reason)) => SeepError::conflict(&rc.row, &rc.column, reason.to_string()),
            None => SeepError::conflict(&Bytes::EMPTY, &Column::default(), "unknown conflict"),
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        match self.state {
            TxState::PreCommitted => {
                if let Err(e) = self.rollback_placed() {
                    warn!(
                        start_ts = self.start_ts,
                        error = %e,
                        "Rollback of abandoned transaction failed, locks left for resolution"
                    );
                } else {
                    debug!(start_ts = self.start_ts, "Abandoned transaction rolled back");
                }
            }
            TxState::PrimaryCommitted => {
                debug!(
                    start_ts = self.start_ts,
                    "Transaction dropped before finishing, secondaries left for roll-forward"
                );
            }
            _ => {}
        }
    }
}
