//! Transaction manager: shared handles and transaction creation
//!
//! One manager per process holds the store, the oracle client, the observed
//! column set and the transaction settings. Every transaction is created
//! from it and shares its resolver, so lock resolution behaves the same no
//! matter which transaction runs into a lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use seep_core::{ObservedColumns, SeepError, SeepResult, Store, TransactionConfig};

use crate::oracle::OracleClient;
use crate::resolver::LockResolver;
use crate::transaction::{Transaction, TransactionParts};

/// Creates transactions against one store and oracle
pub struct TransactionManager {
    store: Arc<dyn Store>,
    oracle: Arc<OracleClient>,
    observed: RwLock<Arc<ObservedColumns>>,
    config: TransactionConfig,
    resolver: LockResolver,

    /// Identifies this process in the locks it writes
    transactor: u128,

    begun: AtomicU64,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("transactor", &Uuid::from_u128(self.transactor))
            .field("config", &self.config)
            .field("begun", &self.begun.load(Ordering::Relaxed))
            .finish()
    }
}

impl TransactionManager {
    /// Create a manager
    pub fn new(
        store: Arc<dyn Store>,
        oracle: Arc<OracleClient>,
        observed: ObservedColumns,
        config: TransactionConfig,
    ) -> Self {
        let resolver = LockResolver::new(Arc::clone(&store), &config);
        TransactionManager {
            store,
            oracle,
            observed: RwLock::new(Arc::new(observed)),
            config,
            resolver,
            transactor: Uuid::new_v4().as_u128(),
            begun: AtomicU64::new(0),
        }
    }

    /// Start a transaction
    ///
    /// # Errors
    ///
    /// `Unavailable` if no start timestamp could be obtained.
    pub fn begin(&self) -> SeepResult<Transaction> {
        let parts = TransactionParts {
            store: Arc::clone(&self.store),
            oracle: Arc::clone(&self.oracle),
            observed: self.observed(),
            resolver: self.resolver.clone(),
            lock_wait: self.config.lock_wait.clone(),
            transactor: self.transactor,
        };
        let tx = Transaction::new(parts)?;
        self.begun.fetch_add(1, Ordering::Relaxed);
        Ok(tx)
    }

    /// Run `work` in a fresh transaction and commit, retrying on conflicts
    ///
    /// `work` may run several times and must not have side effects outside
    /// the transaction. At most `max_attempts` transactions are tried.
    ///
    /// # Errors
    ///
    /// The last conflict once `max_attempts` is spent, or the first
    /// non-retryable error from `work` or the commit.
    pub fn execute<T, F>(&self, max_attempts: u32, mut work: F) -> SeepResult<T>
    where
        F: FnMut(&mut Transaction) -> SeepResult<T>,
    {
        Self::check_attempts(max_attempts)?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut tx = self.begin()?;
            let result = work(&mut tx).and_then(|value| tx.commit().map(|()| value));
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_conflict() && attempt < max_attempts => {
                    debug!(attempt, error = %e, "Transaction conflicted, retrying");
                }
                Err(e) => {
                    if e.is_conflict() {
                        warn!(attempts = attempt, error = %e, "Giving up after repeated conflicts");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Store every transaction works against
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Oracle client
    pub fn oracle(&self) -> &Arc<OracleClient> {
        &self.oracle
    }

    /// Observed columns new transactions validate against
    pub fn observed(&self) -> Arc<ObservedColumns> {
        self.observed.read().clone()
    }

    /// Replace the observed column set
    ///
    /// Transactions already begun keep the set they started with.
    pub fn set_observed(&self, observed: ObservedColumns) {
        *self.observed.write() = Arc::new(observed);
    }

    /// Transaction settings
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Resolver shared by every transaction of this manager
    pub fn resolver(&self) -> &LockResolver {
        &self.resolver
    }

    /// Identifier written into every lock of this process
    pub fn transactor(&self) -> u128 {
        self.transactor
    }

    /// Transactions begun so far
    pub fn begun(&self) -> u64 {
        self.begun.load(Ordering::Relaxed)
    }

    /// Reject an empty attempt budget
    pub(crate) fn check_attempts(attempts: u32) -> SeepResult<()> {
        if attempts == 0 {
            return Err(SeepError::invalid_input("max_attempts must be at least 1"));
        }
        Ok(())
    }
}
