//! Integration tests for seep-concurrency
//!
//! These tests drive the commit protocol against the in-memory store and
//! inspect the raw entries it leaves behind:
//!
//! 1. **Snapshot isolation** - reads see exactly what committed before start
//! 2. **Conflicts** - first committer wins, locks block writers
//! 3. **State machine** - illegal calls fail with `InvalidState`
//! 4. **Notifications** - markers are armed, cleared and acknowledged
//! 5. **Recovery** - abandoned locks are rolled forward or back

use std::sync::Arc;

use seep_concurrency::{
    LocalOracle, OracleClient, Resolution, TransactionManager, TxState,
};
use seep_core::{
    notify_column, Column, EntryKind, Notification, NotificationType, ObservedColumns,
    RetryPolicy, RowColumn, SeepError, Span, Store, TransactionConfig, NOTIFY_FAMILY,
};
use seep_storage::MemoryStore;

// ============================================================================
// Test Helpers
// ============================================================================

struct Env {
    store: Arc<MemoryStore>,
    mgr: TransactionManager,
}

fn quick_lock_wait() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        base_delay_ms: 0,
        max_delay_ms: 0,
    }
}

fn env_with(observed: ObservedColumns, config: TransactionConfig) -> Env {
    let store = Arc::new(MemoryStore::new());
    let dyn_store: Arc<dyn Store> = store.clone();
    let oracle = Arc::new(OracleClient::local(
        Arc::new(LocalOracle::new()),
        RetryPolicy::default(),
    ));
    let mgr = TransactionManager::new(dyn_store, oracle, observed, config);
    Env { store, mgr }
}

fn env() -> Env {
    env_with(
        ObservedColumns::new(),
        TransactionConfig {
            lock_wait: quick_lock_wait(),
            ..TransactionConfig::default()
        },
    )
}

fn observed(weak: &[&Column], strong: &[&Column]) -> ObservedColumns {
    let mut set = ObservedColumns::new();
    for col in weak {
        set.add((*col).clone(), NotificationType::Weak).unwrap();
    }
    for col in strong {
        set.add((*col).clone(), NotificationType::Strong).unwrap();
    }
    set
}

fn count_kind(store: &MemoryStore, kind: EntryKind) -> usize {
    store.dump().iter().filter(|c| c.key.kind == kind).count()
}

fn markers(store: &MemoryStore) -> Vec<(RowColumn, u64, u8)> {
    store
        .dump()
        .into_iter()
        .filter(|c| c.key.kind == EntryKind::Notify)
        .map(|c| (c.key.row_column(), c.key.ts, c.value.as_slice()[0]))
        .collect()
}

fn col(family: &str, qualifier: &str) -> Column {
    Column::new(family, qualifier)
}

// ============================================================================
// Snapshot Isolation
// ============================================================================

mod snapshot_isolation {
    use super::*;

    #[test]
    fn test_reads_see_start_snapshot() {
        let env = env();
        let c = col("f", "q");
        env.mgr.execute(1, |tx| tx.set("a", c.clone(), "1")).unwrap();

        let mut reader = env.mgr.begin().unwrap();
        env.mgr.execute(1, |tx| tx.set("a", c.clone(), "2")).unwrap();

        assert_eq!(reader.get("a", &c).unwrap().unwrap().as_slice(), b"1");
        let mut fresh = env.mgr.begin().unwrap();
        assert_eq!(fresh.get("a", &c).unwrap().unwrap().as_slice(), b"2");
    }

    #[test]
    fn test_buffered_writes_are_not_read_back() {
        let env = env();
        let c = col("f", "q");
        let mut tx = env.mgr.begin().unwrap();
        tx.set("a", c.clone(), "1").unwrap();
        assert_eq!(tx.get("a", &c).unwrap(), None);
        assert_eq!(tx.pending_updates(), 1);
    }

    #[test]
    fn test_delete_hides_older_value() {
        let env = env();
        let c = col("f", "q");
        env.mgr.execute(1, |tx| tx.set("a", c.clone(), "1")).unwrap();
        env.mgr.execute(1, |tx| tx.delete("a", c.clone())).unwrap();

        let mut tx = env.mgr.begin().unwrap();
        assert_eq!(tx.get("a", &c).unwrap(), None);
    }

    #[test]
    fn test_reader_older_than_lock_is_not_blocked() {
        let env = env();
        let c = col("f", "q");
        env.mgr.execute(1, |tx| tx.set("a", c.clone(), "old")).unwrap();

        let mut reader = env.mgr.begin().unwrap();
        let mut writer = env.mgr.begin().unwrap();
        writer.set("a", c.clone(), "new").unwrap();
        let mut cd = writer.create_commit_data().unwrap();
        assert!(writer.pre_commit(&mut cd).unwrap());

        assert_eq!(reader.get("a", &c).unwrap().unwrap().as_slice(), b"old");
    }

    #[test]
    fn test_live_lock_below_start_reports_conflict() {
        let env = env();
        let c = col("f", "q");
        let mut writer = env.mgr.begin().unwrap();
        writer.set("a", c.clone(), "new").unwrap();
        let mut cd = writer.create_commit_data().unwrap();
        assert!(writer.pre_commit(&mut cd).unwrap());

        let mut reader = env.mgr.begin().unwrap();
        let err = reader.get("a", &c).unwrap_err();
        assert!(err.is_conflict(), "unexpected error: {}", err);
        assert!(reader.stats().lock_waits >= 1);
    }

    #[test]
    fn test_get_span_groups_by_row() {
        let env = env();
        env.mgr
            .execute(1, |tx| {
                tx.set("user:1", col("p", "name"), "ann")?;
                tx.set("user:1", col("p", "age"), "30")?;
                tx.set("user:2", col("p", "name"), "bob")?;
                tx.set("zzz", col("p", "name"), "outside")
            })
            .unwrap();

        let mut tx = env.mgr.begin().unwrap();
        let rows = tx
            .get_span(&Span::prefix("user:"), &seep_core::ColumnFilter::all())
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0.as_slice(), b"user:1");
        assert_eq!(rows[0].1.len(), 2);
        assert_eq!(rows[1].1[&col("p", "name")].as_slice(), b"bob");

        let some = tx
            .get_columns("user:1", &[col("p", "age"), col("p", "missing")])
            .unwrap();
        assert_eq!(some.len(), 1);
        assert_eq!(tx.stats().cells_read, 4);
    }

    #[test]
    fn test_get_i64_rejects_non_integer() {
        let env = env();
        let c = col("f", "q");
        env.mgr.execute(1, |tx| tx.set("a", c.clone(), "seven")).unwrap();
        let mut tx = env.mgr.begin().unwrap();
        assert!(matches!(
            tx.get_i64("a", &c),
            Err(SeepError::Serialization(_))
        ));
    }

    #[test]
    fn test_reads_never_return_reserved_columns() {
        let c = col("stat", "check");
        let env = env_with(observed(&[&c], &[]), TransactionConfig::default());
        env.mgr.execute(1, |tx| tx.weakly_notify("r", c.clone())).unwrap();

        let mut tx = env.mgr.begin().unwrap();
        let row = tx.get_row("r", &seep_core::ColumnFilter::all()).unwrap();
        assert!(row.is_empty());
    }
}

// ============================================================================
// Conflicts
// ============================================================================

mod conflicts {
    use super::*;

    #[test]
    fn test_first_committer_wins() {
        let env = env();
        let c = col("f", "q");
        let mut t1 = env.mgr.begin().unwrap();
        let mut t2 = env.mgr.begin().unwrap();
        t1.set("a", c.clone(), "one").unwrap();
        t2.set("a", c.clone(), "two").unwrap();

        t1.commit().unwrap();
        let err = t2.commit().unwrap_err();
        assert!(err.is_conflict());
        assert!(err.is_retryable());
        assert_eq!(t2.state(), TxState::RolledBack);

        let mut tx = env.mgr.begin().unwrap();
        assert_eq!(tx.get("a", &c).unwrap().unwrap().as_slice(), b"one");
        assert_eq!(count_kind(&env.store, EntryKind::Lock), 0);
    }

    #[test]
    fn test_live_lock_blocks_writer() {
        let env = env();
        let c = col("f", "q");
        let mut holder = env.mgr.begin().unwrap();
        holder.set("a", c.clone(), "held").unwrap();
        let mut cd = holder.create_commit_data().unwrap();
        assert!(holder.pre_commit(&mut cd).unwrap());

        let mut other = env.mgr.begin().unwrap();
        other.set("a", c.clone(), "other").unwrap();
        other.set("b", c.clone(), "other").unwrap();
        assert!(other.commit().unwrap_err().is_conflict());
        // the blocked writer cleaned up after itself
        assert_eq!(count_kind(&env.store, EntryKind::Lock), 1);

        let commit_ts = env.mgr.oracle().get_timestamp().unwrap();
        assert!(holder.commit_primary_column(&cd, commit_ts).unwrap());
        holder.finish_commit(cd, commit_ts).unwrap();
        assert_eq!(holder.state(), TxState::Committed);
    }

    #[test]
    fn test_reserved_column_rejected() {
        let env = env();
        let mut tx = env.mgr.begin().unwrap();
        let err = tx.set("a", Column::new(NOTIFY_FAMILY, "x"), "v").unwrap_err();
        assert!(matches!(err, SeepError::InvalidArgument(_)));
        assert!(tx.get("a", &Column::new(NOTIFY_FAMILY, "x")).is_err());
        // the transaction itself is still usable
        assert_eq!(tx.state(), TxState::Open);
    }
}

// ============================================================================
// State Machine
// ============================================================================

mod state_machine {
    use super::*;

    fn is_invalid_state<T: std::fmt::Debug>(result: Result<T, SeepError>) -> bool {
        matches!(result, Err(SeepError::InvalidState { .. }))
    }

    #[test]
    fn test_operations_after_commit_fail() {
        let env = env();
        let c = col("f", "q");
        let mut tx = env.mgr.begin().unwrap();
        tx.set("a", c.clone(), "v").unwrap();
        tx.commit().unwrap();

        assert!(is_invalid_state(tx.commit()));
        assert!(is_invalid_state(tx.set("a", c.clone(), "w")));
        assert!(is_invalid_state(tx.get("a", &c)));
        assert!(is_invalid_state(tx.rollback()));
        assert!(is_invalid_state(tx.create_commit_data()));
    }

    #[test]
    fn test_phases_must_run_in_order() {
        let env = env();
        let mut tx = env.mgr.begin().unwrap();
        tx.set("a", col("f", "q"), "v").unwrap();
        let mut cd = tx.create_commit_data().unwrap();
        let ts = env.mgr.oracle().get_timestamp().unwrap();

        assert!(is_invalid_state(tx.commit_primary_column(&cd, ts)));
        assert!(tx.pre_commit(&mut cd).unwrap());
        assert!(is_invalid_state(tx.pre_commit(&mut cd)));
        assert!(is_invalid_state(tx.finish_commit(cd.clone(), ts)));
        assert_eq!(tx.state(), TxState::PreCommitted);
    }

    #[test]
    fn test_manual_two_phase_commit() {
        let env = env();
        let c = col("f", "q");
        let mut tx = env.mgr.begin().unwrap();
        tx.set("r1", c.clone(), "x").unwrap();
        tx.set("r2", c.clone(), "y").unwrap();

        let mut cd = tx.create_commit_data().unwrap();
        assert_eq!(cd.primary(), Some(&RowColumn::new("r1", c.clone())));
        assert_eq!(cd.lock_count(), 2);
        assert!(tx.pre_commit(&mut cd).unwrap());
        assert_eq!(count_kind(&env.store, EntryKind::Lock), 2);

        let ts = env.mgr.oracle().get_timestamp().unwrap();
        assert!(tx.commit_primary_column(&cd, ts).unwrap());
        assert_eq!(tx.state(), TxState::PrimaryCommitted);
        tx.finish_commit(cd, ts).unwrap();

        assert_eq!(tx.state(), TxState::Committed);
        assert_eq!(count_kind(&env.store, EntryKind::Lock), 0);
        assert_eq!(count_kind(&env.store, EntryKind::Write), 2);
        assert_eq!(count_kind(&env.store, EntryKind::TxDone), 1);
    }

    #[test]
    fn test_commit_timestamp_must_follow_start() {
        let env = env();
        let mut tx = env.mgr.begin().unwrap();
        tx.set("a", col("f", "q"), "v").unwrap();
        let mut cd = tx.create_commit_data().unwrap();
        assert!(tx.pre_commit(&mut cd).unwrap());

        let start = tx.start_ts();
        assert!(matches!(
            tx.commit_primary_column(&cd, start),
            Err(SeepError::InvalidArgument(_))
        ));
        assert_eq!(tx.state(), TxState::PreCommitted);
        tx.rollback().unwrap();
        assert_eq!(tx.state(), TxState::RolledBack);
    }

    #[test]
    fn test_rollback_after_pre_commit_removes_locks() {
        let env = env();
        let mut tx = env.mgr.begin().unwrap();
        tx.set("a", col("f", "q"), "v").unwrap();
        tx.set("b", col("f", "q"), "v").unwrap();
        let mut cd = tx.create_commit_data().unwrap();
        assert!(tx.pre_commit(&mut cd).unwrap());

        tx.rollback().unwrap();
        assert_eq!(count_kind(&env.store, EntryKind::Lock), 0);
        assert_eq!(count_kind(&env.store, EntryKind::Data), 0);
        assert_eq!(count_kind(&env.store, EntryKind::DelLock), 2);
    }

    #[test]
    fn test_dropping_pre_committed_transaction_rolls_back() {
        let env = env();
        let c = col("f", "q");
        {
            let mut tx = env.mgr.begin().unwrap();
            tx.set("a", c.clone(), "v").unwrap();
            let mut cd = tx.create_commit_data().unwrap();
            assert!(tx.pre_commit(&mut cd).unwrap());
        }
        assert_eq!(count_kind(&env.store, EntryKind::Lock), 0);
        env.mgr.execute(1, |tx| tx.set("a", c.clone(), "w")).unwrap();
    }

    #[test]
    fn test_empty_commit_writes_nothing() {
        let env = env();
        let mut tx = env.mgr.begin().unwrap();
        tx.commit().unwrap();
        assert_eq!(tx.state(), TxState::Committed);
        assert!(env.store.is_empty());
    }
}

// ============================================================================
// Notifications
// ============================================================================

mod notifications {
    use super::*;

    #[test]
    fn test_unobserved_notification_discards_transaction() {
        let env = env();
        let mut tx = env.mgr.begin().unwrap();
        tx.set("a", col("f", "q"), "v").unwrap();
        let err = tx.weakly_notify("a", col("f", "unobserved")).unwrap_err();
        assert!(matches!(err, SeepError::Configuration(_)));
        assert!(!err.is_retryable());
        assert_eq!(tx.state(), TxState::RolledBack);
        assert!(is_rolled_back_commit(tx.commit()));
        assert!(env.store.is_empty());
    }

    fn is_rolled_back_commit(result: Result<(), SeepError>) -> bool {
        matches!(result, Err(SeepError::InvalidState { .. }))
    }

    #[test]
    fn test_notification_type_must_match_registration() {
        let strong = col("doc", "body");
        let weak = col("stat", "check");
        let env = env_with(observed(&[&weak], &[&strong]), TransactionConfig::default());

        let mut tx = env.mgr.begin().unwrap();
        assert!(matches!(
            tx.weakly_notify("r", strong.clone()),
            Err(SeepError::Configuration(_))
        ));
        let mut tx = env.mgr.begin().unwrap();
        assert!(matches!(
            tx.notify("r", weak.clone()),
            Err(SeepError::Configuration(_))
        ));
        let mut tx = env.mgr.begin().unwrap();
        tx.notify("r", strong).unwrap();
        tx.weakly_notify("r", weak).unwrap();
        tx.commit().unwrap();
        assert_eq!(markers(&env.store).len(), 2);
    }

    #[test]
    fn test_weak_notify_writes_marker_in_other_row() {
        let weak = col("stat", "check");
        let env = env_with(observed(&[&weak], &[]), TransactionConfig::default());
        let mut tx = env.mgr.begin().unwrap();
        tx.set("data", col("f", "q"), "v").unwrap();
        tx.weakly_notify("stats", weak.clone()).unwrap();
        tx.commit().unwrap();

        let found = markers(&env.store);
        assert_eq!(found.len(), 1);
        let (rc, ts, byte) = &found[0];
        assert_eq!(rc.row.as_slice(), b"stats");
        assert_eq!(rc.column, notify_column(&weak));
        assert!(*ts > tx.start_ts());
        assert_eq!(*byte, b'w');
    }

    #[test]
    fn test_concurrent_weak_arms_do_not_conflict() {
        let weak = col("stat", "check");
        let env = env_with(observed(&[&weak], &[]), TransactionConfig::default());
        let mut t1 = env.mgr.begin().unwrap();
        let mut t2 = env.mgr.begin().unwrap();
        t1.weakly_notify("stats", weak.clone()).unwrap();
        t2.weakly_notify("stats", weak.clone()).unwrap();
        t1.commit().unwrap();
        t2.commit().unwrap();
        assert_eq!(markers(&env.store).len(), 2);
    }

    #[test]
    fn test_strong_observed_write_arms_marker() {
        let strong = col("doc", "body");
        let env = env_with(observed(&[], &[&strong]), TransactionConfig::default());
        env.mgr
            .execute(1, |tx| tx.set("page", strong.clone(), "text"))
            .unwrap();

        let found = markers(&env.store);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].2, b's');
    }

    #[test]
    fn test_weak_trigger_cleared_on_commit() {
        let weak = col("stat", "check");
        let env = env_with(observed(&[&weak], &[]), TransactionConfig::default());
        env.mgr
            .execute(1, |tx| tx.weakly_notify("stats", weak.clone()))
            .unwrap();
        let (_, ts, _) = markers(&env.store)[0].clone();

        let mut tx = env.mgr.begin().unwrap();
        tx.set_trigger(Notification {
            row: "stats".into(),
            column: weak.clone(),
            ts,
            ntype: NotificationType::Weak,
        })
        .unwrap();
        tx.set("stats", col("stat", "total"), "1").unwrap();
        tx.commit().unwrap();

        assert!(markers(&env.store).is_empty());
    }

    #[test]
    fn test_weak_trigger_is_processed_once() {
        let weak = col("stat", "check");
        let env = env_with(observed(&[&weak], &[]), TransactionConfig::default());
        env.mgr
            .execute(1, |tx| tx.weakly_notify("stats", weak.clone()))
            .unwrap();
        let (_, ts, _) = markers(&env.store)[0].clone();
        let notification = Notification {
            row: "stats".into(),
            column: weak.clone(),
            ts,
            ntype: NotificationType::Weak,
        };

        let mut first = env.mgr.begin().unwrap();
        let mut second = env.mgr.begin().unwrap();
        for (tx, out) in [(&mut first, "out-a"), (&mut second, "out-b")] {
            tx.set_trigger(notification.clone()).unwrap();
            tx.set(out, col("stat", "total"), "1").unwrap();
        }

        first.commit().unwrap();
        assert!(second.commit().unwrap_err().is_conflict());

        assert!(markers(&env.store).is_empty());
        assert_eq!(count_kind(&env.store, EntryKind::Ack), 1);
        assert_eq!(count_kind(&env.store, EntryKind::Lock), 0);
        // only the winner's output is visible
        let mut reader = env.mgr.begin().unwrap();
        assert!(reader.get("out-a", &col("stat", "total")).unwrap().is_some());
        assert!(reader.get("out-b", &col("stat", "total")).unwrap().is_none());
    }

    #[test]
    fn test_weak_trigger_without_writes_locks_marker_cell() {
        let weak = col("stat", "check");
        let env = env_with(observed(&[&weak], &[]), TransactionConfig::default());
        env.mgr
            .execute(1, |tx| tx.weakly_notify("stats", weak.clone()))
            .unwrap();
        let (_, ts, _) = markers(&env.store)[0].clone();

        let mut tx = env.mgr.begin().unwrap();
        tx.set_trigger(Notification {
            row: "stats".into(),
            column: weak.clone(),
            ts,
            ntype: NotificationType::Weak,
        })
        .unwrap();
        let cd = tx.create_commit_data().unwrap();
        assert_eq!(cd.primary(), Some(&RowColumn::new("stats", weak.clone())));
        tx.commit().unwrap();

        assert!(markers(&env.store).is_empty());
        assert_eq!(count_kind(&env.store, EntryKind::Write), 0);
    }

    #[test]
    fn test_strong_trigger_is_processed_once() {
        let strong = col("doc", "body");
        let env = env_with(observed(&[], &[&strong]), TransactionConfig::default());
        env.mgr
            .execute(1, |tx| tx.set("page", strong.clone(), "text"))
            .unwrap();
        let (_, ts, _) = markers(&env.store)[0].clone();
        let notification = Notification {
            row: "page".into(),
            column: strong.clone(),
            ts,
            ntype: NotificationType::Strong,
        };

        let mut first = env.mgr.begin().unwrap();
        let mut second = env.mgr.begin().unwrap();
        for (tx, out) in [(&mut first, "a"), (&mut second, "b")] {
            tx.set_trigger(notification.clone()).unwrap();
            tx.set("index", col("idx", out), "1").unwrap();
        }

        first.commit().unwrap();
        assert!(second.commit().unwrap_err().is_conflict());

        assert!(markers(&env.store).is_empty());
        assert_eq!(count_kind(&env.store, EntryKind::Ack), 1);
        assert_eq!(count_kind(&env.store, EntryKind::Lock), 0);
    }

    #[test]
    fn test_strong_trigger_without_writes_commits_ack() {
        let strong = col("doc", "body");
        let env = env_with(observed(&[], &[&strong]), TransactionConfig::default());
        env.mgr
            .execute(1, |tx| tx.set("page", strong.clone(), "text"))
            .unwrap();
        let (_, ts, _) = markers(&env.store)[0].clone();

        let mut tx = env.mgr.begin().unwrap();
        tx.set_trigger(Notification {
            row: "page".into(),
            column: strong.clone(),
            ts,
            ntype: NotificationType::Strong,
        })
        .unwrap();
        let cd = tx.create_commit_data().unwrap();
        assert_eq!(cd.primary(), Some(&RowColumn::new("page", strong.clone())));
        assert_eq!(cd.lock_count(), 1);
        tx.commit().unwrap();

        assert_eq!(count_kind(&env.store, EntryKind::Ack), 1);
        assert!(markers(&env.store).is_empty());
        // only the original write exists
        assert_eq!(count_kind(&env.store, EntryKind::Write), 1);
    }
}

// ============================================================================
// Recovery
// ============================================================================

mod recovery {
    use super::*;
    use std::thread;

    #[test]
    fn test_secondary_rolled_forward_after_crash() {
        let env = env();
        let c = col("f", "q");
        let mut tx = env.mgr.begin().unwrap();
        tx.set("r1", c.clone(), "x").unwrap();
        tx.set("r2", c.clone(), "y").unwrap();
        let mut cd = tx.create_commit_data().unwrap();
        assert!(tx.pre_commit(&mut cd).unwrap());
        let ts = env.mgr.oracle().get_timestamp().unwrap();
        assert!(tx.commit_primary_column(&cd, ts).unwrap());
        let start = tx.start_ts();
        drop(tx);

        let secondary = RowColumn::new("r2", c.clone());
        let lock = env
            .mgr
            .resolver()
            .read_lock(&secondary, start)
            .unwrap()
            .unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let resolver = env.mgr.resolver().clone();
                let secondary = secondary.clone();
                let lock = lock.clone();
                thread::spawn(move || resolver.resolve(&secondary, start, &lock).unwrap())
            })
            .collect();
        let outcomes: Vec<Resolution> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let forwarded = outcomes
            .iter()
            .filter(|r| matches!(r, Resolution::RolledForward { commit_ts } if *commit_ts == ts))
            .count();
        assert_eq!(forwarded, 1);
        assert!(outcomes.iter().all(|r| r.is_resolved()));

        assert_eq!(count_kind(&env.store, EntryKind::Lock), 0);
        assert_eq!(count_kind(&env.store, EntryKind::Write), 2);
        let mut reader = env.mgr.begin().unwrap();
        assert_eq!(reader.get("r2", &c).unwrap().unwrap().as_slice(), b"y");
    }

    #[test]
    fn test_single_cell_transaction_done_with_primary() {
        let env = env();
        let c = col("f", "q");
        let mut tx = env.mgr.begin().unwrap();
        tx.set("r1", c.clone(), "x").unwrap();
        let mut cd = tx.create_commit_data().unwrap();
        assert!(tx.pre_commit(&mut cd).unwrap());
        let ts = env.mgr.oracle().get_timestamp().unwrap();
        assert!(tx.commit_primary_column(&cd, ts).unwrap());
        // nothing is left for finish_commit to roll forward
        assert_eq!(count_kind(&env.store, EntryKind::TxDone), 1);
        tx.finish_commit(cd, ts).unwrap();
        assert_eq!(count_kind(&env.store, EntryKind::TxDone), 1);
        assert_eq!(tx.state(), TxState::Committed);
    }

    #[test]
    fn test_reader_rolls_forward_committed_secondary() {
        let env = env();
        let c = col("f", "q");
        let mut tx = env.mgr.begin().unwrap();
        tx.set("r1", c.clone(), "x").unwrap();
        tx.set("r2", c.clone(), "y").unwrap();
        let mut cd = tx.create_commit_data().unwrap();
        assert!(tx.pre_commit(&mut cd).unwrap());
        let ts = env.mgr.oracle().get_timestamp().unwrap();
        assert!(tx.commit_primary_column(&cd, ts).unwrap());
        drop(tx);

        let mut reader = env.mgr.begin().unwrap();
        assert_eq!(reader.get("r2", &c).unwrap().unwrap().as_slice(), b"y");
        assert_eq!(reader.stats().locks_resolved, 1);
    }

    #[test]
    fn test_stale_lock_rolled_back_by_next_writer() {
        let env = env_with(
            ObservedColumns::new(),
            TransactionConfig {
                rollback_time_ms: 0,
                lock_wait: quick_lock_wait(),
            },
        );
        let c = col("f", "q");
        let mut crashed = env.mgr.begin().unwrap();
        crashed.set("a", c.clone(), "lost").unwrap();
        let mut cd = crashed.create_commit_data().unwrap();
        assert!(crashed.pre_commit(&mut cd).unwrap());
        // simulate a process that died holding its locks
        std::mem::forget(crashed);

        env.mgr.execute(3, |tx| tx.set("a", c.clone(), "won")).unwrap();

        let mut reader = env.mgr.begin().unwrap();
        assert_eq!(reader.get("a", &c).unwrap().unwrap().as_slice(), b"won");
        assert_eq!(count_kind(&env.store, EntryKind::DelLock), 1);
    }

    #[test]
    fn test_stale_lock_rolled_back_by_reader() {
        let env = env_with(
            ObservedColumns::new(),
            TransactionConfig {
                rollback_time_ms: 0,
                lock_wait: quick_lock_wait(),
            },
        );
        let c = col("f", "q");
        let mut crashed = env.mgr.begin().unwrap();
        crashed.set("a", c.clone(), "lost").unwrap();
        crashed.set("b", c.clone(), "lost").unwrap();
        let mut cd = crashed.create_commit_data().unwrap();
        assert!(crashed.pre_commit(&mut cd).unwrap());
        std::mem::forget(crashed);

        // reading the secondary rolls back the stale primary first
        let mut reader = env.mgr.begin().unwrap();
        assert_eq!(reader.get("b", &c).unwrap(), None);
        assert_eq!(count_kind(&env.store, EntryKind::Lock), 0);
        assert_eq!(count_kind(&env.store, EntryKind::DelLock), 2);
        assert_eq!(reader.get("a", &c).unwrap(), None);
    }

    #[test]
    fn test_lost_primary_rolls_back_secondaries() {
        let env = env();
        let c = col("f", "q");
        let mut tx = env.mgr.begin().unwrap();
        tx.set("r1", c.clone(), "x").unwrap();
        tx.set("r2", c.clone(), "y").unwrap();
        let mut cd = tx.create_commit_data().unwrap();
        assert!(tx.pre_commit(&mut cd).unwrap());

        // another party rolls back the primary
        let primary = RowColumn::new("r1", c.clone());
        let lock = env
            .mgr
            .resolver()
            .read_lock(&primary, tx.start_ts())
            .unwrap()
            .unwrap();
        assert!(env
            .mgr
            .resolver()
            .roll_back(&primary, &lock, tx.start_ts())
            .unwrap());

        let ts = env.mgr.oracle().get_timestamp().unwrap();
        assert!(!tx.commit_primary_column(&cd, ts).unwrap());
        assert_eq!(tx.state(), TxState::RolledBack);
        assert_eq!(count_kind(&env.store, EntryKind::Lock), 0);
        assert_eq!(count_kind(&env.store, EntryKind::Write), 0);
    }
}
