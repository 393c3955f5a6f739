//! Core traits for the store adapter and the timestamp oracle
//!
//! These are the service boundaries of the transaction layer. The store is an
//! external sorted, multi-versioned table; the oracle is an external
//! timestamp service. Upper layers only ever see them through these traits,
//! held as long-lived `Arc<dyn ...>` handles.

use std::sync::Arc;

use crate::error::SeepResult;
use crate::key::Cell;
use crate::mutation::{CellOp, ConditionStatus, ConditionalMutation, ScanRequest};

/// Lazily produced scan results, in key order
pub type CellIter<'a> = Box<dyn Iterator<Item = Cell> + Send + 'a>;

/// Sorted, multi-versioned table
///
/// Thread safety: all methods must be safe to call concurrently from
/// multiple threads (requires Send + Sync).
pub trait Store: Send + Sync {
    /// Scan entries matching `request`, in key order
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn scan(&self, request: &ScanRequest) -> SeepResult<CellIter<'_>>;

    /// Apply `mutation` atomically if all of its conditions hold
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written or the mutation
    /// touches a row other than its own.
    fn conditional_write(&self, mutation: ConditionalMutation) -> SeepResult<ConditionStatus>;

    /// Apply unconditional changes
    ///
    /// Each row's changes are applied atomically; the batch as a whole is not.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn batch_write(&self, ops: Vec<CellOp>) -> SeepResult<()>;

    /// Install a filter that runs whenever the table compacts
    fn register_filter(&self, filter: Arc<dyn CompactionFilter>);
}

/// Server-side filter applied during compaction
///
/// `begin` is called once per compaction so the filter can fetch whatever
/// global state it needs (for garbage collection, the watermark). The
/// returned pass then sees every `(row, column)` group exactly once.
pub trait CompactionFilter: Send + Sync {
    /// Name for logs
    fn name(&self) -> &str;

    /// Start a compaction pass
    ///
    /// # Errors
    ///
    /// Returns an error if the filter's inputs are unavailable; the store
    /// then skips this filter for the pass.
    fn begin(&self) -> SeepResult<Box<dyn CompactionPass>>;
}

/// One compaction pass of a [`CompactionFilter`]
pub trait CompactionPass: Send {
    /// Given every entry of one `(row, column)` in key order, return the
    /// entries to keep (also in key order)
    fn filter(&mut self, group: Vec<Cell>) -> Vec<Cell>;
}

/// Source of strictly increasing timestamps
pub trait TimestampOracle: Send + Sync {
    /// A timestamp strictly greater than every one returned before
    ///
    /// # Errors
    ///
    /// Returns an error if the oracle is unreachable.
    fn get_timestamp(&self) -> SeepResult<u64>;

    /// Oldest start timestamp any live transaction may still read at
    ///
    /// No live or future transaction reads below this value, which makes it
    /// the garbage collection watermark.
    ///
    /// # Errors
    ///
    /// Returns an error if the oracle is unreachable.
    fn oldest_active_timestamp(&self) -> SeepResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingOracle {
        next: AtomicU64,
    }

    impl TimestampOracle for CountingOracle {
        fn get_timestamp(&self) -> SeepResult<u64> {
            Ok(self.next.fetch_add(1, Ordering::SeqCst) + 1)
        }

        fn oldest_active_timestamp(&self) -> SeepResult<u64> {
            Ok(self.next.load(Ordering::SeqCst) + 1)
        }
    }

    #[test]
    fn test_oracle_usable_as_trait_object() {
        let oracle: Arc<dyn TimestampOracle> = Arc::new(CountingOracle {
            next: AtomicU64::new(0),
        });
        let a = oracle.get_timestamp().unwrap();
        let b = oracle.get_timestamp().unwrap();
        assert!(b > a);
        assert!(oracle.oldest_active_timestamp().unwrap() > b);
    }
}
