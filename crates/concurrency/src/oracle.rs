//! Timestamp oracle client and active-transaction tracking
//!
//! Every start and commit timestamp comes from a [`TimestampOracle`]. This
//! module provides:
//! - [`LocalOracle`]: in-process oracle backed by an `AtomicU64`
//! - [`ActiveTimestamps`]: registry of start timestamps still in use, which
//!   is what the garbage collection watermark is computed from
//! - [`OracleClient`]: retrying wrapper used by transactions
//! - [`TimestampTracker`]: RAII registration of one start timestamp
//!
//! # Watermark safety
//!
//! Issuing a start timestamp and registering it happen under one gate that
//! the watermark computation also takes. Otherwise a compaction could run
//! between the two steps, see no active transaction, and drop a version the
//! new transaction still needs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::warn;

use seep_core::{RetryPolicy, SeepError, SeepResult, TimestampOracle};

use crate::backoff::{Backoff, BackoffAction};

/// Start timestamps of live transactions
///
/// Values are reference counts so the same timestamp may be registered more
/// than once.
#[derive(Debug, Default)]
pub struct ActiveTimestamps {
    active: DashMap<u64, usize>,
    gate: Mutex<()>,
}

impl ActiveTimestamps {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a timestamp with `issue` and register it atomically with respect
    /// to [`oldest`](Self::oldest)
    ///
    /// # Errors
    ///
    /// Returns whatever `issue` returns; nothing is registered in that case.
    pub fn register_with<F>(self: &Arc<Self>, issue: F) -> SeepResult<TimestampTracker>
    where
        F: FnOnce() -> SeepResult<u64>,
    {
        let _gate = self.gate.lock();
        let ts = issue()?;
        *self.active.entry(ts).or_insert(0) += 1;
        Ok(TimestampTracker {
            ts,
            registry: Arc::clone(self),
        })
    }

    /// Oldest registered timestamp, or `next()` when nothing is registered
    pub fn oldest<F>(&self, next: F) -> u64
    where
        F: FnOnce() -> u64,
    {
        let _gate = self.gate.lock();
        self.active
            .iter()
            .map(|entry| *entry.key())
            .min()
            .unwrap_or_else(next)
    }

    /// Number of distinct registered timestamps
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// True if no timestamp is registered
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    fn release(&self, ts: u64) {
        let remove = match self.active.get_mut(&ts) {
            Some(mut count) => {
                *count -= 1;
                *count == 0
            }
            None => false,
        };
        if remove {
            self.active.remove_if(&ts, |_, count| *count == 0);
        }
    }
}

/// Registration of one start timestamp; unregisters on drop
#[derive(Debug)]
pub struct TimestampTracker {
    ts: u64,
    registry: Arc<ActiveTimestamps>,
}

impl TimestampTracker {
    /// The registered timestamp
    pub fn timestamp(&self) -> u64 {
        self.ts
    }
}

impl Drop for TimestampTracker {
    fn drop(&mut self) {
        self.registry.release(self.ts);
    }
}

/// In-process oracle
///
/// Timestamps start at 1. The watermark is the oldest registered start
/// timestamp, or the next timestamp to be issued when none is registered.
#[derive(Debug)]
pub struct LocalOracle {
    last: AtomicU64,
    active: Arc<ActiveTimestamps>,
}

impl Default for LocalOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalOracle {
    /// Oracle whose first timestamp is 1
    pub fn new() -> Self {
        Self::with_initial(0)
    }

    /// Oracle whose first timestamp is `last + 1`
    pub fn with_initial(last: u64) -> Self {
        LocalOracle {
            last: AtomicU64::new(last),
            active: Arc::new(ActiveTimestamps::new()),
        }
    }

    /// Registry consulted for the watermark
    pub fn active(&self) -> Arc<ActiveTimestamps> {
        Arc::clone(&self.active)
    }

    /// Last timestamp issued
    pub fn current(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

impl TimestampOracle for LocalOracle {
    fn get_timestamp(&self) -> SeepResult<u64> {
        Ok(self.last.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn oldest_active_timestamp(&self) -> SeepResult<u64> {
        Ok(self
            .active
            .oldest(|| self.last.load(Ordering::SeqCst) + 1))
    }
}

/// Retrying oracle handle shared by every transaction of a process
///
/// `active` must be the registry the oracle's `oldest_active_timestamp`
/// consults; for a [`LocalOracle`] use [`OracleClient::local`].
pub struct OracleClient {
    oracle: Arc<dyn TimestampOracle>,
    active: Arc<ActiveTimestamps>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for OracleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OracleClient")
            .field("active", &self.active.len())
            .field("policy", &self.policy)
            .finish()
    }
}

impl OracleClient {
    /// Wrap `oracle`, registering start timestamps in `active`
    pub fn new(
        oracle: Arc<dyn TimestampOracle>,
        active: Arc<ActiveTimestamps>,
        policy: RetryPolicy,
    ) -> Self {
        OracleClient {
            oracle,
            active,
            policy,
        }
    }

    /// Wrap an in-process oracle
    pub fn local(oracle: Arc<LocalOracle>, policy: RetryPolicy) -> Self {
        let active = oracle.active();
        Self::new(oracle, active, policy)
    }

    /// Underlying oracle
    pub fn oracle(&self) -> Arc<dyn TimestampOracle> {
        Arc::clone(&self.oracle)
    }

    /// Registry of live start timestamps
    pub fn active(&self) -> &Arc<ActiveTimestamps> {
        &self.active
    }

    /// A fresh timestamp, retried with backoff
    ///
    /// # Errors
    ///
    /// Returns `SeepError::Unavailable` once the retry budget is spent.
    pub fn get_timestamp(&self) -> SeepResult<u64> {
        self.with_retry("get_timestamp", || self.oracle.get_timestamp())
    }

    /// A fresh start timestamp, registered as active until the tracker drops
    ///
    /// # Errors
    ///
    /// Returns `SeepError::Unavailable` once the retry budget is spent.
    pub fn start_timestamp(&self) -> SeepResult<TimestampTracker> {
        self.active.register_with(|| self.get_timestamp())
    }

    /// The garbage collection watermark, retried with backoff
    ///
    /// # Errors
    ///
    /// Returns `SeepError::Unavailable` once the retry budget is spent.
    pub fn oldest_active_timestamp(&self) -> SeepResult<u64> {
        self.with_retry("oldest_active_timestamp", || {
            self.oracle.oldest_active_timestamp()
        })
    }

    fn with_retry<F>(&self, op: &'static str, mut call: F) -> SeepResult<u64>
    where
        F: FnMut() -> SeepResult<u64>,
    {
        let mut backoff = Backoff::new(self.policy.clone());
        loop {
            match call() {
                Ok(ts) => return Ok(ts),
                Err(e) => {
                    let attempts = backoff.attempts();
                    if backoff.wait() == BackoffAction::Abort {
                        return Err(SeepError::Unavailable {
                            service: "oracle",
                            attempts,
                            message: e.to_string(),
                        });
                    }
                    warn!(op, attempt = attempts, error = %e, "Oracle call failed, retrying");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    struct FlakyOracle {
        inner: LocalOracle,
        failures_left: AtomicU64,
    }

    impl TimestampOracle for FlakyOracle {
        fn get_timestamp(&self) -> SeepResult<u64> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(SeepError::storage("connection refused"));
            }
            self.inner.get_timestamp()
        }

        fn oldest_active_timestamp(&self) -> SeepResult<u64> {
            self.inner.oldest_active_timestamp()
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    #[test]
    fn test_local_oracle_strictly_increasing_across_threads() {
        let oracle = Arc::new(LocalOracle::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let oracle = Arc::clone(&oracle);
                thread::spawn(move || {
                    (0..250)
                        .map(|_| oracle.get_timestamp().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all = HashSet::new();
        for h in handles {
            let seen = h.join().unwrap();
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
            all.extend(seen);
        }
        assert_eq!(all.len(), 1000);
        assert_eq!(oracle.current(), 1000);
    }

    #[test]
    fn test_watermark_tracks_oldest_registration() {
        let oracle = Arc::new(LocalOracle::new());
        let client = OracleClient::local(Arc::clone(&oracle), fast_policy(1));

        // nothing active: watermark is the next timestamp
        assert_eq!(client.oldest_active_timestamp().unwrap(), 1);

        let first = client.start_timestamp().unwrap();
        let second = client.start_timestamp().unwrap();
        client.get_timestamp().unwrap();
        assert_eq!(client.oldest_active_timestamp().unwrap(), first.timestamp());

        drop(first);
        assert_eq!(client.oldest_active_timestamp().unwrap(), second.timestamp());

        drop(second);
        assert_eq!(client.oldest_active_timestamp().unwrap(), 4);
        assert!(client.active().is_empty());
    }

    #[test]
    fn test_client_retries_transient_failures() {
        let flaky = Arc::new(FlakyOracle {
            inner: LocalOracle::new(),
            failures_left: AtomicU64::new(2),
        });
        let client = OracleClient::new(flaky, Arc::new(ActiveTimestamps::new()), fast_policy(3));
        assert_eq!(client.get_timestamp().unwrap(), 1);
    }

    #[test]
    fn test_client_gives_up_after_budget() {
        let flaky = Arc::new(FlakyOracle {
            inner: LocalOracle::new(),
            failures_left: AtomicU64::new(10),
        });
        let active = Arc::new(ActiveTimestamps::new());
        let client = OracleClient::new(flaky, Arc::clone(&active), fast_policy(3));
        let err = client.start_timestamp().unwrap_err();
        match err {
            SeepError::Unavailable {
                service, attempts, ..
            } => {
                assert_eq!(service, "oracle");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {}", other),
        }
        // failed issue registers nothing
        assert!(active.is_empty());
    }
}
