//! Notification worker
//!
//! The worker repeatedly scans for pending notifications and hands each one
//! to the pool. A pool task runs the registered observer inside a fresh
//! transaction that carries the notification as its trigger, then commits.
//!
//! ## Delivery
//!
//! A notification may be handed to an observer more than once: after a
//! commit conflict, or when two workers race for it. Only one of those
//! transactions can commit, so the effect is applied once.
//!
//! Observer failures never stop the worker. The transaction is abandoned,
//! the marker stays pending, and the failure is logged, kept in a small
//! ring of recent failures and sent to subscribers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use seep_concurrency::{Backoff, BackoffAction, TxState};
use seep_core::{
    Notification, RetryPolicy, RowColumn, SeepError, SeepResult, Span, WorkerConfig,
};

use crate::environment::Environment;
use crate::pool::{SubmitError, WorkerPool};

const RECENT_FAILURES: usize = 64;

/// An observer that returned an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverFailure {
    /// Notification being processed
    pub notification: Notification,
    /// Observer id
    pub observer: String,
    /// Error text, causes included
    pub message: String,
    /// Wall clock time of the failure
    pub at_ms: i64,
}

impl ObserverFailure {
    /// The failure as an error value
    pub fn to_error(&self) -> SeepError {
        SeepError::Observer {
            observer: self.observer.clone(),
            row: self.notification.row.clone(),
            column: self.notification.column.clone(),
            message: self.message.clone(),
        }
    }
}

/// Worker counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Observer transactions committed
    pub processed: u64,
    /// Notifications found already handled or with no observer
    pub skipped: u64,
    /// Notifications cleared because an acknowledgement existed
    pub acknowledged: u64,
    /// Observer transactions that lost a conflict
    pub conflicts: u64,
    /// Observer errors
    pub failures: u64,
    /// Notifications given up on after too many conflicts
    pub abandoned: u64,
}

impl WorkerStats {
    /// Outcomes that changed what is pending
    fn progress(&self) -> u64 {
        self.processed + self.skipped + self.acknowledged
    }
}

/// Result of one scan pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanPass {
    /// Pending notifications seen
    pub found: usize,
    /// Handed to the pool
    pub dispatched: usize,
    /// Already being processed
    pub busy: usize,
    /// No observer registered for the column
    pub unobserved: usize,
    /// Markers that could not be decoded
    pub corrupt: usize,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    skipped: AtomicU64,
    acknowledged: AtomicU64,
    conflicts: AtomicU64,
    failures: AtomicU64,
    abandoned: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Processed,
    Skipped,
    Acknowledged,
}

/// State shared by the scan thread and every pool task
struct Shared {
    env: Arc<Environment>,
    config: WorkerConfig,
    in_flight: DashMap<RowColumn, u64>,
    counters: Counters,
    failures: Mutex<VecDeque<ObserverFailure>>,
    subscribers: Mutex<Vec<Sender<ObserverFailure>>>,
    shutdown: AtomicBool,
}

/// Scans for notifications and runs observers on a thread pool
pub struct Worker {
    shared: Arc<Shared>,
    pool: Arc<WorkerPool>,
    scanner: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("stats", &self.stats())
            .field("pool", &self.pool)
            .finish()
    }
}

impl Worker {
    /// Worker over `env`, sized by its worker configuration
    ///
    /// No scanning happens until [`start`](Self::start) or one of the
    /// explicit pass methods is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool threads cannot be spawned.
    pub fn new(env: Arc<Environment>) -> SeepResult<Self> {
        let config = env.config().worker.clone();
        let pool = WorkerPool::new("seep-worker", config.threads, config.queue_depth)?;
        info!(threads = config.threads, queue_depth = config.queue_depth, "Worker created");
        Ok(Worker {
            shared: Arc::new(Shared {
                env,
                config,
                in_flight: DashMap::new(),
                counters: Counters::default(),
                failures: Mutex::new(VecDeque::with_capacity(RECENT_FAILURES)),
                subscribers: Mutex::new(Vec::new()),
                shutdown: AtomicBool::new(false),
            }),
            pool: Arc::new(pool),
            scanner: Mutex::new(None),
        })
    }

    /// Receive every observer failure from now on
    pub fn subscribe(&self) -> Receiver<ObserverFailure> {
        let (tx, rx) = mpsc::channel();
        self.shared.subscribers.lock().push(tx);
        rx
    }

    /// Most recent observer failures, oldest first
    pub fn recent_failures(&self) -> Vec<ObserverFailure> {
        self.shared.failures.lock().iter().cloned().collect()
    }

    /// Counter snapshot
    pub fn stats(&self) -> WorkerStats {
        self.shared.stats()
    }

    /// Scan once and dispatch what was found
    ///
    /// Returns without waiting for the dispatched work. Dispatch stops early
    /// when the pool queue is full; the rest is found by a later pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be scanned.
    pub fn scan_once(&self) -> SeepResult<ScanPass> {
        scan_and_dispatch(&self.shared, &self.pool)
    }

    /// Scan and process until a pass makes no progress
    ///
    /// A pass makes progress when at least one notification was processed,
    /// skipped or acknowledged. Notifications whose observer keeps failing
    /// do not count, so this returns even while some stay pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be scanned.
    pub fn run_until_quiescent(&self) -> SeepResult<WorkerStats> {
        let mut passes = 0u64;
        loop {
            let before = self.stats().progress();
            let pass = self.scan_once()?;
            self.pool.drain();
            passes += 1;
            if pass.found == 0 || self.stats().progress() == before {
                break;
            }
        }
        debug!(passes, "Worker quiescent");
        Ok(self.stats())
    }

    /// Process one notification on the calling thread
    ///
    /// Retries on conflict up to the configured limit. Returns `true` if the
    /// notification is no longer pending because of this call.
    pub fn process(&self, notification: &Notification) -> bool {
        self.shared.process(notification)
    }

    /// Start the background scan thread
    ///
    /// Scans every `scan_interval_ms`. Calling it again while running does
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start(&self) -> SeepResult<()> {
        let mut scanner = self.scanner.lock();
        if scanner.is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let pool = Arc::clone(&self.pool);
        let interval = Duration::from_millis(shared.config.scan_interval_ms);
        let handle = thread::Builder::new()
            .name("seep-scanner".to_string())
            .spawn(move || {
                while !shared.shutdown.load(Ordering::Relaxed) {
                    if let Err(e) = scan_and_dispatch(&shared, &pool) {
                        warn!(error = %e, "Notification scan failed");
                    }
                    // Sleep in short slices so shutdown is noticed quickly
                    let slice = Duration::from_millis(10).min(interval);
                    let mut elapsed = Duration::ZERO;
                    while elapsed < interval {
                        if shared.shutdown.load(Ordering::Relaxed) {
                            return;
                        }
                        thread::sleep(slice);
                        elapsed += slice;
                    }
                }
            })?;
        *scanner = Some(handle);
        info!(interval_ms = interval.as_millis() as u64, "Notification scanner started");
        Ok(())
    }

    /// Stop scanning, finish queued work and join every thread
    ///
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.scanner.lock().take() {
            let _ = handle.join();
        }
        self.pool.shutdown();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Removes a notification from the in-flight set when its task ends
struct InFlight {
    shared: Arc<Shared>,
    rc: RowColumn,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.shared.in_flight.remove(&self.rc);
    }
}

fn scan_and_dispatch(shared: &Arc<Shared>, pool: &WorkerPool) -> SeepResult<ScanPass> {
    let registry = shared.env.registry();
    let mut pass = ScanPass::default();
    for item in shared.env.notifications().scan_pending(&Span::all())? {
        let notification = match item {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable notification marker");
                pass.corrupt += 1;
                continue;
            }
        };
        pass.found += 1;
        if registry.get(&notification.column).is_none() {
            pass.unobserved += 1;
            continue;
        }

        let rc = notification.row_column();
        match shared.in_flight.entry(rc.clone()) {
            Entry::Occupied(_) => {
                pass.busy += 1;
                continue;
            }
            Entry::Vacant(slot) => {
                slot.insert(notification.ts);
            }
        }

        let guard = InFlight {
            shared: Arc::clone(shared),
            rc,
        };
        let task_shared = Arc::clone(shared);
        let submitted = pool.submit(move || {
            let _guard = guard;
            task_shared.process(&notification);
        });
        match submitted {
            Ok(()) => pass.dispatched += 1,
            Err(SubmitError::Full) => {
                debug!(dispatched = pass.dispatched, "Worker queue full, deferring the rest");
                break;
            }
            Err(SubmitError::ShutDown) => break,
        }
    }
    if pass.found > 0 {
        debug!(
            found = pass.found,
            dispatched = pass.dispatched,
            busy = pass.busy,
            unobserved = pass.unobserved,
            "Notification scan pass"
        );
    }
    Ok(pass)
}

impl Shared {
    fn stats(&self) -> WorkerStats {
        let c = &self.counters;
        WorkerStats {
            processed: c.processed.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            acknowledged: c.acknowledged.load(Ordering::Relaxed),
            conflicts: c.conflicts.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
        }
    }

    fn process(&self, notification: &Notification) -> bool {
        let mut backoff = Backoff::new(RetryPolicy {
            max_attempts: self.config.max_commit_retries.max(1),
            base_delay_ms: 1,
            max_delay_ms: 50,
        });
        loop {
            match self.attempt(notification) {
                Ok(outcome) => {
                    let counter = match outcome {
                        Outcome::Processed => &self.counters.processed,
                        Outcome::Skipped => &self.counters.skipped,
                        Outcome::Acknowledged => &self.counters.acknowledged,
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(e) if e.is_conflict() => {
                    self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        row = %notification.row,
                        column = %notification.column,
                        error = %e,
                        "Observer transaction conflicted"
                    );
                    if backoff.wait() == BackoffAction::Abort {
                        self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            row = %notification.row,
                            column = %notification.column,
                            attempts = backoff.attempts(),
                            "Giving up on notification after repeated conflicts"
                        );
                        return false;
                    }
                }
                Err(SeepError::Observer { .. }) => return false,
                Err(e) => {
                    warn!(
                        row = %notification.row,
                        column = %notification.column,
                        error = %e,
                        "Notification processing failed"
                    );
                    return false;
                }
            }
        }
    }

    fn attempt(&self, notification: &Notification) -> SeepResult<Outcome> {
        let registry = self.env.registry();
        let Some(entry) = registry.get(&notification.column) else {
            return Ok(Outcome::Skipped);
        };
        let markers = self.env.notifications();

        let mut tx = self.env.begin()?;
        let Some(current) =
            markers.newest_marker(&notification.row, &notification.column, tx.start_ts())?
        else {
            // cleared by someone else since the scan
            return Ok(Outcome::Skipped);
        };
        if markers.is_acknowledged(&current)? {
            markers.clear(&current)?;
            return Ok(Outcome::Acknowledged);
        }

        tx.set_trigger(current.clone())?;
        if let Err(e) = entry.observer().process(&mut tx, &current.row, &current.column) {
            // a refused notify has already discarded the transaction
            if matches!(tx.state(), TxState::Open | TxState::PreCommitted) {
                if let Err(rollback_err) = tx.rollback() {
                    warn!(
                        row = %current.row,
                        column = %current.column,
                        error = %rollback_err,
                        "Rollback after observer failure failed"
                    );
                }
            }
            let failure = ObserverFailure {
                notification: current,
                observer: entry.id().to_string(),
                message: format!("{:#}", e),
                at_ms: Utc::now().timestamp_millis(),
            };
            let err = failure.to_error();
            self.report(failure);
            return Err(err);
        }
        tx.commit()?;
        Ok(Outcome::Processed)
    }

    fn report(&self, failure: ObserverFailure) {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        error!(
            observer = %failure.observer,
            row = %failure.notification.row,
            column = %failure.notification.column,
            error = %failure.message,
            "Observer failed, notification left pending"
        );
        {
            let mut ring = self.failures.lock();
            if ring.len() == RECENT_FAILURES {
                ring.pop_front();
            }
            ring.push_back(failure.clone());
        }
        // dropped receivers unsubscribe
        self.subscribers
            .lock()
            .retain(|tx| tx.send(failure.clone()).is_ok());
    }
}
