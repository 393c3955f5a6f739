//! Long-lived service handles shared by transactions and workers
//!
//! An [`Environment`] is built once per process and passed by reference to
//! everything that needs the store, the oracle, or the observer registry.
//!
//! # Example
//!
//! ```ignore
//! let env = Environment::local(store, SeepConfig::default(), source, factories)?;
//! let mut tx = env.begin()?;
//! tx.set("r1", Column::new("stat", "count"), "3")?;
//! tx.commit()?;
//! ```

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use seep_concurrency::{LocalOracle, OracleClient, Transaction, TransactionManager};
use seep_core::{SeepConfig, SeepResult, Store};
use seep_storage::GarbageCollectionFilter;

use crate::config_source::SharedConfigSource;
use crate::notification::NotificationManager;
use crate::observer::{ObserverFactories, ObserverRegistry};

/// Store, oracle, configuration and observer registry of one process
pub struct Environment {
    store: Arc<dyn Store>,
    oracle: Arc<OracleClient>,
    config: SeepConfig,
    source: Arc<dyn SharedConfigSource>,
    factories: ObserverFactories,
    registry: RwLock<Arc<ObserverRegistry>>,
    transactions: TransactionManager,
    notifications: NotificationManager,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("config", &self.config)
            .field("registry_version", &self.registry.read().version())
            .field("transactions", &self.transactions)
            .finish()
    }
}

impl Environment {
    /// Assemble an environment from existing handles
    ///
    /// The shared configuration is loaded and the observer registry built
    /// immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be loaded or names an
    /// unknown or conflicting observer.
    pub fn new(
        store: Arc<dyn Store>,
        oracle: Arc<OracleClient>,
        config: SeepConfig,
        source: Arc<dyn SharedConfigSource>,
        factories: ObserverFactories,
    ) -> SeepResult<Self> {
        config.validate()?;
        let registry = ObserverRegistry::build(&source.load()?, &factories)?;
        let transactions = TransactionManager::new(
            Arc::clone(&store),
            Arc::clone(&oracle),
            registry.observed().clone(),
            config.transaction.clone(),
        );
        info!(
            observers = registry.len(),
            version = registry.version(),
            "Environment ready"
        );
        Ok(Environment {
            notifications: NotificationManager::new(Arc::clone(&store)),
            store,
            oracle,
            config,
            source,
            factories,
            registry: RwLock::new(Arc::new(registry)),
            transactions,
        })
    }

    /// Environment with an in-process oracle
    ///
    /// Also registers the garbage collection filter on `store`, with the
    /// watermark taken from the new oracle.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn local(
        store: Arc<dyn Store>,
        config: SeepConfig,
        source: Arc<dyn SharedConfigSource>,
        factories: ObserverFactories,
    ) -> SeepResult<Self> {
        let local = Arc::new(LocalOracle::new());
        store.register_filter(Arc::new(GarbageCollectionFilter::new(local.clone())));
        let oracle = Arc::new(OracleClient::local(local, config.oracle.clone()));
        Self::new(store, oracle, config, source, factories)
    }

    /// Re-read the shared configuration
    ///
    /// The registry is rebuilt only if the version changed. Transactions
    /// begun afterwards validate notifications against the new registry.
    /// Returns whether anything changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be loaded or is invalid;
    /// the current registry stays in place.
    pub fn refresh(&self) -> SeepResult<bool> {
        let shared = self.source.load()?;
        let current = self.registry().version();
        if shared.version == current {
            return Ok(false);
        }
        let registry = ObserverRegistry::build(&shared, &self.factories)?;
        self.transactions.set_observed(registry.observed().clone());
        *self.registry.write() = Arc::new(registry);
        info!(from = current, to = shared.version, "Shared configuration reloaded");
        Ok(true)
    }

    /// Start a transaction
    ///
    /// # Errors
    ///
    /// `Unavailable` if the oracle cannot be reached.
    pub fn begin(&self) -> SeepResult<Transaction> {
        self.transactions.begin()
    }

    /// Transaction manager
    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    /// Current observer registry
    pub fn registry(&self) -> Arc<ObserverRegistry> {
        self.registry.read().clone()
    }

    /// Notification marker access
    pub fn notifications(&self) -> &NotificationManager {
        &self.notifications
    }

    /// Store handle
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Oracle client
    pub fn oracle(&self) -> &Arc<OracleClient> {
        &self.oracle
    }

    /// Process configuration
    pub fn config(&self) -> &SeepConfig {
        &self.config
    }
}
