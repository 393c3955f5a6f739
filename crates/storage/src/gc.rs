//! Garbage collection compaction filter
//!
//! Decides, for one `(row, column)` at a time, which entries no live or
//! future transaction can observe. The watermark `W` is the oracle's oldest
//! active start timestamp, fetched once when a compaction begins.
//!
//! Retention rules:
//! - `Write`: every version at or above `W`, plus the newest version below
//!   `W`. A primary write whose transaction has no `TxDone` yet is kept so
//!   its secondaries can still be rolled forward. Single-cell transactions
//!   get their `TxDone` with the primary commit; a multi-cell transaction
//!   whose committer died before `finish_commit` keeps its primary write.
//! - `Data`: only when a kept `Write` or a present `Lock` points at it.
//! - `Lock`: until it is resolved by a `Write` or `DelLock` at its start
//!   timestamp. Unresolved locks are never dropped here.
//! - `DelLock`: at or above `W`, or while a lock at that start timestamp remains.
//! - `TxDone`: like `DelLock`, and also while a kept write still refers to it.
//! - `Ack`: the newest, plus anything at or above `W`.
//! - `Notify`: the newest marker only.
//!
//! Entries whose value cannot be decoded are always kept.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use seep_core::{
    decode, Cell, CompactionFilter, CompactionPass, EntryKind, SeepResult, TimestampOracle,
    WriteValue,
};

/// Compaction filter that drops versions hidden below the oracle watermark
pub struct GarbageCollectionFilter {
    oracle: Arc<dyn TimestampOracle>,
}

impl GarbageCollectionFilter {
    /// Create a filter that reads its watermark from `oracle`
    pub fn new(oracle: Arc<dyn TimestampOracle>) -> Self {
        GarbageCollectionFilter { oracle }
    }
}

impl CompactionFilter for GarbageCollectionFilter {
    fn name(&self) -> &str {
        "gc"
    }

    fn begin(&self) -> SeepResult<Box<dyn CompactionPass>> {
        let watermark = self.oracle.oldest_active_timestamp()?;
        debug!(watermark, "Garbage collection pass starting");
        Ok(Box::new(GcPass { watermark }))
    }
}

/// One garbage collection pass at a fixed watermark
#[derive(Debug, Clone, Copy)]
pub struct GcPass {
    watermark: u64,
}

impl GcPass {
    /// Pass at `watermark`
    pub fn new(watermark: u64) -> Self {
        GcPass { watermark }
    }
}

impl CompactionPass for GcPass {
    fn filter(&mut self, group: Vec<Cell>) -> Vec<Cell> {
        collect_garbage(group, self.watermark)
    }
}

/// Apply the retention rules to every entry of one `(row, column)`
///
/// `group` must be in key order; the result is in key order too.
pub fn collect_garbage(group: Vec<Cell>, watermark: u64) -> Vec<Cell> {
    // Facts gathered over the whole group before deciding anything
    let mut lock_ts = BTreeSet::new();
    let mut resolved_ts = BTreeSet::new();
    let mut done_ts = BTreeSet::new();
    let mut writes: Vec<(u64, Option<WriteValue>)> = Vec::new();
    for cell in &group {
        match cell.key.kind {
            EntryKind::Lock => {
                lock_ts.insert(cell.key.ts);
            }
            EntryKind::DelLock => {
                resolved_ts.insert(cell.key.ts);
            }
            EntryKind::TxDone => {
                done_ts.insert(cell.key.ts);
            }
            EntryKind::Write => {
                let value = decode::<WriteValue>(&cell.value).ok();
                if let Some(wv) = &value {
                    resolved_ts.insert(wv.start_ts);
                }
                writes.push((cell.key.ts, value));
            }
            _ => {}
        }
    }

    // Writes arrive newest first
    let mut kept_write_commits = BTreeSet::new();
    let mut kept_data_ts = BTreeSet::new();
    let mut seen_below = false;
    for (commit_ts, value) in &writes {
        let keep = match value {
            None => true,
            Some(_) if *commit_ts >= watermark => true,
            Some(_) if !seen_below => true,
            Some(wv) => wv.primary && !done_ts.contains(&wv.start_ts),
        };
        if *commit_ts < watermark {
            seen_below = true;
        }
        if keep {
            kept_write_commits.insert(*commit_ts);
            if let Some(wv) = value {
                kept_data_ts.insert(wv.start_ts);
            }
        }
    }

    let kept_locks: BTreeSet<u64> = lock_ts
        .iter()
        .copied()
        .filter(|ts| !resolved_ts.contains(ts))
        .collect();

    let mut newest_ack_seen = false;
    let mut newest_notify_seen = false;
    let mut out = Vec::with_capacity(group.len());
    for cell in group {
        let ts = cell.key.ts;
        let keep = match cell.key.kind {
            EntryKind::Write => kept_write_commits.contains(&ts),
            EntryKind::Data => kept_data_ts.contains(&ts) || kept_locks.contains(&ts),
            EntryKind::Lock => kept_locks.contains(&ts),
            EntryKind::DelLock => ts >= watermark || kept_locks.contains(&ts),
            EntryKind::TxDone => {
                ts >= watermark || kept_locks.contains(&ts) || kept_data_ts.contains(&ts)
            }
            EntryKind::Ack => {
                let newest = !newest_ack_seen;
                newest_ack_seen = true;
                newest || ts >= watermark
            }
            EntryKind::Notify => {
                let newest = !newest_notify_seen;
                newest_notify_seen = true;
                newest
            }
        };
        if keep {
            out.push(cell);
        }
    }
    out
}
