//! Resolution of locks left behind by other transactions
//!
//! A lock is finished by looking at its transaction's primary cell:
//! - primary committed → roll the lock forward at the primary's commit ts
//! - primary rolled back → roll the lock back
//! - primary still locked → wait, unless the lock is older than the
//!   rollback time, in which case the primary is rolled back first
//!
//! Every resolution step is a conditional write guarded by the lock still
//! being held, so any number of parties can race to resolve the same lock
//! and the outcome is the same as if one of them did it alone.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use seep_core::{
    decode, decode_ack, ColumnFilter, ConditionStatus, EntryKind, LockValue, RowColumn,
    ScanRequest, SeepResult, Span, Store, TransactionConfig, WriteValue,
};

use crate::commit::{commit_cell_mutation, rollback_cell_mutation};

/// What resolving a lock did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The lock was turned into a committed cell at `commit_ts`
    RolledForward {
        /// Commit timestamp of the owning transaction
        commit_ts: u64,
    },
    /// The lock was removed and a rollback marker written
    RolledBack,
    /// Another party finished the lock first
    AlreadyResolved,
    /// The owner is alive; the caller must wait
    Live,
}

impl Resolution {
    /// True unless the caller must wait
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Resolution::Live)
    }
}

/// State of a transaction as recorded on its primary cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimaryStatus {
    /// Committed at the given timestamp
    Committed(u64),
    /// Rolled back, or never got past the primary
    RolledBack,
    /// Still locked
    Locked(LockValue),
}

/// Rolls other transactions' locks forward or back
#[derive(Clone)]
pub struct LockResolver {
    store: Arc<dyn Store>,
    rollback_time: Duration,
}

impl std::fmt::Debug for LockResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockResolver")
            .field("rollback_time", &self.rollback_time)
            .finish()
    }
}

impl LockResolver {
    /// Resolver using the transaction settings' rollback time
    pub fn new(store: Arc<dyn Store>, config: &TransactionConfig) -> Self {
        LockResolver {
            store,
            rollback_time: config.rollback_time(),
        }
    }

    /// True if the lock is older than the rollback time
    pub fn is_stale(&self, lock: &LockValue) -> bool {
        let age_ms = chrono::Utc::now().timestamp_millis() - lock.created_ms;
        age_ms >= 0 && age_ms as u128 >= self.rollback_time.as_millis()
    }

    /// Read the lock at `(rc, start_ts)` if it is still there
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or the lock cannot be decoded.
    pub fn read_lock(&self, rc: &RowColumn, start_ts: u64) -> SeepResult<Option<LockValue>> {
        let request = ScanRequest::new(
            Span::exact(rc.row.clone()),
            ColumnFilter::column(rc.column.clone()),
        )
        .kinds([EntryKind::Lock]);
        for cell in self.store.scan(&request)? {
            if cell.key.ts == start_ts {
                return Ok(Some(decode(&cell.value)?));
            }
        }
        Ok(None)
    }

    /// Look up what happened to the transaction that started at `start_ts`
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or an entry cannot be decoded.
    pub fn primary_status(&self, primary: &RowColumn, start_ts: u64) -> SeepResult<PrimaryStatus> {
        let request = ScanRequest::new(
            Span::exact(primary.row.clone()),
            ColumnFilter::column(primary.column.clone()),
        )
        .kinds([
            EntryKind::Write,
            EntryKind::DelLock,
            EntryKind::Lock,
            EntryKind::Ack,
        ]);
        let mut lock = None;
        let mut rolled_back = false;
        for cell in self.store.scan(&request)? {
            match cell.key.kind {
                // commit timestamps are always above the start timestamp
                EntryKind::Write if cell.key.ts > start_ts => {
                    let wv: WriteValue = decode(&cell.value)?;
                    if wv.start_ts == start_ts {
                        return Ok(PrimaryStatus::Committed(cell.key.ts));
                    }
                }
                EntryKind::Ack if cell.key.ts == start_ts => {
                    return Ok(PrimaryStatus::Committed(decode_ack(&cell.value)?));
                }
                EntryKind::DelLock if cell.key.ts == start_ts => rolled_back = true,
                EntryKind::Lock if cell.key.ts == start_ts => {
                    lock = Some(decode::<LockValue>(&cell.value)?);
                }
                _ => {}
            }
        }
        match lock {
            Some(lock) if !rolled_back => Ok(PrimaryStatus::Locked(lock)),
            _ => Ok(PrimaryStatus::RolledBack),
        }
    }

    /// Resolve the lock `lock` found at `(rc, start_ts)`
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn resolve(&self, rc: &RowColumn, start_ts: u64, lock: &LockValue) -> SeepResult<Resolution> {
        // A stale primary is rolled back and then looked at again
        for _ in 0..2 {
            match self.primary_status(&lock.primary, start_ts)? {
                PrimaryStatus::Committed(commit_ts) => {
                    return if self.roll_forward(rc, lock, start_ts, commit_ts)? {
                        Ok(Resolution::RolledForward { commit_ts })
                    } else {
                        Ok(Resolution::AlreadyResolved)
                    };
                }
                PrimaryStatus::RolledBack => {
                    return if self.roll_back(rc, lock, start_ts)? {
                        Ok(Resolution::RolledBack)
                    } else {
                        Ok(Resolution::AlreadyResolved)
                    };
                }
                PrimaryStatus::Locked(primary_lock) => {
                    if !self.is_stale(&primary_lock) {
                        return Ok(Resolution::Live);
                    }
                    warn!(
                        row = %lock.primary.row,
                        column = %lock.primary.column,
                        start_ts,
                        "Rolling back stale primary lock"
                    );
                    if self.roll_back(&lock.primary, &primary_lock, start_ts)?
                        && rc == &lock.primary
                    {
                        return Ok(Resolution::RolledBack);
                    }
                }
            }
        }
        Ok(Resolution::Live)
    }

    /// Roll the lock at `(rc, start_ts)` forward; false if it was already gone
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub fn roll_forward(
        &self,
        rc: &RowColumn,
        lock: &LockValue,
        start_ts: u64,
        commit_ts: u64,
    ) -> SeepResult<bool> {
        let status = self
            .store
            .conditional_write(commit_cell_mutation(rc, lock, start_ts, commit_ts)?)?;
        let applied = status.is_accepted();
        debug!(row = %rc.row, column = %rc.column, start_ts, commit_ts, applied, "Roll forward");
        Ok(applied)
    }

    /// Roll the lock at `(rc, start_ts)` back; false if it was already gone
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub fn roll_back(&self, rc: &RowColumn, lock: &LockValue, start_ts: u64) -> SeepResult<bool> {
        let status = self
            .store
            .conditional_write(rollback_cell_mutation(rc, lock, start_ts)?)?;
        let applied = matches!(status, ConditionStatus::Accepted);
        debug!(row = %rc.row, column = %rc.column, start_ts, applied, "Roll back");
        Ok(applied)
    }
}
