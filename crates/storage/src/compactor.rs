//! Background compaction task
//!
//! This module provides Compactor that runs in a background thread and
//! periodically compacts a MemoryStore, which runs every registered filter
//! (garbage collection included).
//!
//! # Design Notes
//!
//! - Runs in background thread; compaction itself holds the store's write
//!   lock only while rewriting the table
//! - Graceful shutdown via atomic flag
//! - Configurable interval

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::MemoryStore;

/// Periodic compaction driver
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use std::time::Duration;
/// use seep_storage::{Compactor, MemoryStore};
///
/// let store = Arc::new(MemoryStore::new());
/// let compactor = Compactor::new(Arc::clone(&store), Duration::from_secs(60));
/// let handle = compactor.start();
///
/// // ... use the store ...
///
/// compactor.shutdown();
/// handle.join().unwrap();
/// ```
#[derive(Debug)]
pub struct Compactor {
    /// Store to compact
    store: Arc<MemoryStore>,
    /// Time between compactions
    interval: Duration,
    /// Shutdown signal
    shutdown: Arc<AtomicBool>,
}

impl Compactor {
    /// Create a compactor for `store`
    pub fn new(store: Arc<MemoryStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the background task
    ///
    /// The thread runs until `shutdown()` is called.
    pub fn start(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.interval;

        thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                // Sleep in short slices so shutdown is noticed quickly
                let slice = Duration::from_millis(50).min(interval);
                let mut elapsed = Duration::ZERO;
                while elapsed < interval {
                    if shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    thread::sleep(slice);
                    elapsed += slice;
                }

                match store.compact() {
                    Ok(stats) => debug!(removed = stats.removed, "Background compaction"),
                    Err(e) => warn!(error = %e, "Background compaction failed"),
                }
            }
        })
    }

    /// Signal shutdown
    ///
    /// The background thread exits on its next check.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Check if shutdown has been signaled
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}
