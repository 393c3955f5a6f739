//! Single-process handle over an in-memory store

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use seep_concurrency::Transaction;
use seep_core::{SeepConfig, SeepResult, SharedConfig, Store};
use seep_engine::{
    Environment, ObserverFactories, SharedConfigSource, StaticConfigSource, Worker, WorkerStats,
};
use seep_storage::{CompactionStats, Compactor, MemoryStore};

/// Store, environment and worker in one value
///
/// Garbage collection is registered on the store; it runs when
/// [`compact`](Self::compact) is called, or periodically once
/// [`start_compactor`](Self::start_compactor) has been.
#[derive(Debug)]
pub struct Seep {
    store: Arc<MemoryStore>,
    env: Arc<Environment>,
    worker: Worker,
    compactor: Mutex<Option<(Compactor, JoinHandle<()>)>>,
}

impl Seep {
    /// In-memory instance with default process configuration
    ///
    /// # Errors
    ///
    /// Returns an error if `shared` names an unknown observer or observes a
    /// column twice.
    pub fn in_memory(shared: SharedConfig, factories: ObserverFactories) -> SeepResult<Self> {
        Self::with_config(
            SeepConfig::default(),
            Arc::new(StaticConfigSource::new(shared)),
            factories,
        )
    }

    /// In-memory instance reading shared configuration from `source`
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the worker
    /// threads cannot be started.
    pub fn with_config(
        config: SeepConfig,
        source: Arc<dyn SharedConfigSource>,
        factories: ObserverFactories,
    ) -> SeepResult<Self> {
        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn Store> = store.clone();
        let env = Arc::new(Environment::local(dyn_store, config, source, factories)?);
        let worker = Worker::new(Arc::clone(&env))?;
        Ok(Seep {
            store,
            env,
            worker,
            compactor: Mutex::new(None),
        })
    }

    /// Start a transaction
    ///
    /// # Errors
    ///
    /// `Unavailable` if the oracle cannot be reached.
    pub fn begin(&self) -> SeepResult<Transaction> {
        self.env.begin()
    }

    /// Run `work` in a transaction and commit it, retrying on conflict
    ///
    /// Attempts are bounded by `worker.max_commit_retries`.
    ///
    /// # Errors
    ///
    /// Whatever `work` returns, or the last conflict once attempts run out.
    pub fn transaction<T, F>(&self, work: F) -> SeepResult<T>
    where
        F: FnMut(&mut Transaction) -> SeepResult<T>,
    {
        let attempts = self.env.config().worker.max_commit_retries.max(1);
        self.env.transactions().execute(attempts, work)
    }

    /// Process pending notifications until none can make progress
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be scanned.
    pub fn run_observers(&self) -> SeepResult<WorkerStats> {
        self.worker.run_until_quiescent()
    }

    /// Start processing notifications in the background
    ///
    /// # Errors
    ///
    /// Returns an error if the scan thread cannot be spawned.
    pub fn start_worker(&self) -> SeepResult<()> {
        self.worker.start()
    }

    /// Run garbage collection over the whole store
    ///
    /// # Errors
    ///
    /// Returns an error if compaction fails.
    pub fn compact(&self) -> SeepResult<CompactionStats> {
        self.store.compact()
    }

    /// Run garbage collection every `interval` on a background thread
    ///
    /// Calling it again while running does nothing.
    pub fn start_compactor(&self, interval: Duration) {
        let mut slot = self.compactor.lock();
        if slot.is_none() {
            let compactor = Compactor::new(Arc::clone(&self.store), interval);
            let handle = compactor.start();
            *slot = Some((compactor, handle));
        }
    }

    /// Re-read the shared configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the new configuration is invalid.
    pub fn refresh(&self) -> SeepResult<bool> {
        self.env.refresh()
    }

    /// Service handles
    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Notification worker
    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// Stop the worker and the compactor, finishing queued notifications
    ///
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        self.worker.shutdown();
        if let Some((compactor, handle)) = self.compactor.lock().take() {
            compactor.shutdown();
            let _ = handle.join();
        }
    }
}

impl Drop for Seep {
    fn drop(&mut self) {
        self.shutdown();
    }
}
