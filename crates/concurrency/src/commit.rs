//! Commit working set and the store mutations of the commit protocol
//!
//! Every store change the protocol makes is built here so the committing
//! transaction and any party resolving its locks write exactly the same
//! entries:
//!
//! | step        | condition                   | effect                                         |
//! |-------------|-----------------------------|------------------------------------------------|
//! | prewrite    | `Prewrite` per cell         | `Lock` + `Data` at start ts                    |
//! | commit cell | `LockHeld` at start ts      | `Write` at commit ts, `Ack`, strong `Notify`   |
//! | roll back   | `LockHeld` at start ts      | `DelLock` at start ts, lock and data removed   |

use std::collections::BTreeMap;

use seep_core::{
    encode, encode_ack, notify_column, Bytes, Cell, CellOp, Condition, ConditionalMutation,
    DelLockValue, EntryKind, Key, LockType, LockValue, Notification, NotificationType, RowColumn,
    SeepResult, WriteKind, WriteValue,
};

/// One cell the transaction will lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCell {
    /// Locked coordinate
    pub rc: RowColumn,
    /// Lock to place
    pub lock: LockValue,
    /// New value for `LockType::Put`
    pub value: Option<Bytes>,
}

impl PendingCell {
    /// Notification timestamp this cell acknowledges, if it is the trigger cell
    pub fn ack_since(&self) -> Option<u64> {
        self.lock.trigger
    }
}

/// Per-transaction working set assembled at commit time
///
/// Owned by exactly one transaction and discarded after commit or rollback.
#[derive(Debug, Clone)]
pub struct CommitData {
    pub(crate) start_ts: u64,
    pub(crate) primary: Option<PendingCell>,
    pub(crate) secondaries: Vec<PendingCell>,
    pub(crate) notifications: BTreeMap<RowColumn, NotificationType>,
    pub(crate) trigger: Option<Notification>,
}

impl CommitData {
    /// Start timestamp used for every conflict check
    pub fn start_ts(&self) -> u64 {
        self.start_ts
    }

    /// The cell whose commit decides the transaction
    pub fn primary(&self) -> Option<&RowColumn> {
        self.primary.as_ref().map(|cell| &cell.rc)
    }

    /// Every other locked cell, in `(row, column)` order
    pub fn secondaries(&self) -> impl Iterator<Item = &RowColumn> {
        self.secondaries.iter().map(|cell| &cell.rc)
    }

    /// Number of cells that will be locked
    pub fn lock_count(&self) -> usize {
        self.secondaries.len() + usize::from(self.primary.is_some())
    }

    /// Notifications armed by this transaction
    pub fn notifications(&self) -> impl Iterator<Item = (&RowColumn, &NotificationType)> {
        self.notifications.iter()
    }

    /// Notification this transaction is processing, if any
    pub fn trigger(&self) -> Option<&Notification> {
        self.trigger.as_ref()
    }

    /// True if committing would change nothing in the store
    pub fn is_empty(&self) -> bool {
        self.primary.is_none() && self.notifications.is_empty() && self.trigger.is_none()
    }

    /// Secondaries grouped by row
    pub(crate) fn secondaries_by_row(&self) -> BTreeMap<&Bytes, Vec<&PendingCell>> {
        let mut rows: BTreeMap<&Bytes, Vec<&PendingCell>> = BTreeMap::new();
        for cell in &self.secondaries {
            rows.entry(&cell.rc.row).or_default().push(cell);
        }
        rows
    }
}

// ============================================================================
// Mutation builders
// ============================================================================

fn prewrite_condition(cell: &PendingCell, start_ts: u64) -> Condition {
    Condition::Prewrite {
        column: cell.rc.column.clone(),
        start_ts,
        check_writes: cell.lock.lock_type != LockType::Ack,
        ack_since: cell.ack_since(),
    }
}

/// Lock placement for cells that all live in `row`
pub(crate) fn prewrite_mutation(
    row: &Bytes,
    cells: &[&PendingCell],
    start_ts: u64,
) -> SeepResult<ConditionalMutation> {
    let mut mutation = ConditionalMutation::new(row.clone());
    for cell in cells {
        mutation = mutation
            .condition(prewrite_condition(cell, start_ts))
            .put(Cell::new(
                Key::at(&cell.rc, EntryKind::Lock, start_ts),
                encode(&cell.lock)?,
            ));
        if let Some(value) = &cell.value {
            mutation = mutation.put(Cell::new(
                Key::at(&cell.rc, EntryKind::Data, start_ts),
                value.clone(),
            ));
        }
    }
    Ok(mutation)
}

/// Entries that turn the lock at `(rc, start_ts)` into a committed cell
pub(crate) fn commit_cell_ops(
    rc: &RowColumn,
    lock: &LockValue,
    start_ts: u64,
    commit_ts: u64,
) -> SeepResult<Vec<CellOp>> {
    let mut ops = vec![CellOp::Delete(Key::at(rc, EntryKind::Lock, start_ts))];
    let kind = match lock.lock_type {
        LockType::Put => Some(WriteKind::Put),
        LockType::Delete => Some(WriteKind::Delete),
        LockType::Ack => None,
    };
    if let Some(kind) = kind {
        let write = WriteValue {
            start_ts,
            primary: lock.is_primary(rc),
            kind,
        };
        ops.push(CellOp::Put(Cell::new(
            Key::at(rc, EntryKind::Write, commit_ts),
            encode(&write)?,
        )));
    }
    if lock.trigger.is_some() {
        ops.push(CellOp::Put(Cell::new(
            Key::at(rc, EntryKind::Ack, start_ts),
            encode_ack(commit_ts),
        )));
    }
    if lock.observed {
        ops.push(marker_op(rc, NotificationType::Strong, commit_ts));
    }
    Ok(ops)
}

/// Conditional roll-forward of one locked cell
pub(crate) fn commit_cell_mutation(
    rc: &RowColumn,
    lock: &LockValue,
    start_ts: u64,
    commit_ts: u64,
) -> SeepResult<ConditionalMutation> {
    let mut mutation = ConditionalMutation::new(rc.row.clone()).condition(Condition::LockHeld {
        column: rc.column.clone(),
        start_ts,
    });
    mutation.ops = commit_cell_ops(rc, lock, start_ts, commit_ts)?;
    Ok(mutation)
}

/// Conditional rollback of one locked cell
pub(crate) fn rollback_cell_mutation(
    rc: &RowColumn,
    lock: &LockValue,
    start_ts: u64,
) -> SeepResult<ConditionalMutation> {
    let marker = DelLockValue {
        primary: lock.is_primary(rc),
    };
    Ok(ConditionalMutation::new(rc.row.clone())
        .condition(Condition::LockHeld {
            column: rc.column.clone(),
            start_ts,
        })
        .delete(Key::at(rc, EntryKind::Lock, start_ts))
        .delete(Key::at(rc, EntryKind::Data, start_ts))
        .put(Cell::new(
            Key::at(rc, EntryKind::DelLock, start_ts),
            encode(&marker)?,
        )))
}

/// Record that every cell of the transaction with primary `rc` is final
pub(crate) fn tx_done_op(rc: &RowColumn, start_ts: u64) -> CellOp {
    CellOp::Put(Cell::new(Key::at(rc, EntryKind::TxDone, start_ts), Bytes::EMPTY))
}

/// Arm a notification marker for `rc` at `ts`
pub(crate) fn marker_op(rc: &RowColumn, ntype: NotificationType, ts: u64) -> CellOp {
    CellOp::Put(Cell::new(
        Key::new(rc.row.clone(), notify_column(&rc.column), EntryKind::Notify, ts),
        vec![ntype.to_byte()],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use seep_core::Column;

    fn lock(primary: &RowColumn, lock_type: LockType) -> LockValue {
        LockValue {
            primary: primary.clone(),
            lock_type,
            trigger: None,
            observed: false,
            transactor: 1,
            created_ms: 0,
        }
    }

    #[test]
    fn test_commit_ops_for_primary_put() {
        let rc = RowColumn::new("r1", Column::new("stat", "count"));
        let ops = commit_cell_ops(&rc, &lock(&rc, LockType::Put), 5, 9).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0], CellOp::Delete(Key::at(&rc, EntryKind::Lock, 5)));
        match &ops[1] {
            CellOp::Put(cell) => {
                assert_eq!(cell.key, Key::at(&rc, EntryKind::Write, 9));
                let wv: WriteValue = seep_core::decode(&cell.value).unwrap();
                assert_eq!(wv.start_ts, 5);
                assert!(wv.primary);
                assert_eq!(wv.kind, WriteKind::Put);
            }
            other => panic!("expected put, got {:?}", other),
        }
    }

    #[test]
    fn test_ack_trigger_writes_ack_but_no_write() {
        let rc = RowColumn::new("r1", Column::new("doc", "body"));
        let mut value = lock(&rc, LockType::Ack);
        value.trigger = Some(3);
        let ops = commit_cell_ops(&rc, &value, 5, 9).unwrap();
        assert!(ops
            .iter()
            .all(|op| op.key().kind != EntryKind::Write));
        assert!(ops.iter().any(|op| op.key() == &Key::at(&rc, EntryKind::Ack, 5)));
    }

    #[test]
    fn test_observed_cell_arms_strong_marker() {
        let primary = RowColumn::new("r0", Column::new("a", "b"));
        let rc = RowColumn::new("r1", Column::new("doc", "body"));
        let mut value = lock(&primary, LockType::Delete);
        value.observed = true;
        let ops = commit_cell_ops(&rc, &value, 5, 9).unwrap();
        let marker = Key::new("r1", notify_column(&rc.column), EntryKind::Notify, 9);
        assert!(ops.iter().any(|op| op.key() == &marker));
    }

    #[test]
    fn test_prewrite_of_delete_writes_no_data() {
        let rc = RowColumn::new("r1", Column::new("f", "q"));
        let cell = PendingCell {
            rc: rc.clone(),
            lock: lock(&rc, LockType::Delete),
            value: None,
        };
        let m = prewrite_mutation(&rc.row, &[&cell], 4).unwrap();
        assert_eq!(m.conditions.len(), 1);
        assert_eq!(m.ops.len(), 1);
        assert_eq!(m.ops[0].key().kind, EntryKind::Lock);
    }
}
