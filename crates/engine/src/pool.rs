//! Bounded pool of notification worker threads
//!
//! A fixed set of threads drains a FIFO queue of boxed tasks. The queue has a
//! hard capacity so a scan pass that finds a flood of notifications cannot
//! pile up unbounded work; the producer stops dispatching when `submit`
//! refuses and the rest is picked up by a later pass.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::error;

use seep_core::SeepResult;

/// Why a task was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The queue is at capacity
    #[error("worker pool queue is full")]
    Full,
    /// The pool was shut down
    #[error("worker pool is shut down")]
    ShutDown,
}

/// Pool metrics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Tasks waiting in the queue
    pub queue_depth: usize,
    /// Tasks currently running
    pub active_tasks: usize,
    /// Tasks finished, panicked ones included
    pub tasks_completed: u64,
    /// Tasks that panicked
    pub tasks_panicked: u64,
    /// Worker threads
    pub worker_count: usize,
}

type Task = Box<dyn FnOnce() + Send>;

struct PoolInner {
    queue: Mutex<VecDeque<Task>>,
    work_ready: Condvar,
    idle: Condvar,
    shutdown: AtomicBool,
    active_tasks: AtomicUsize,
    capacity: usize,
    tasks_completed: AtomicU64,
    tasks_panicked: AtomicU64,
}

/// Fixed-size thread pool with a bounded FIFO queue
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("stats", &self.stats())
            .finish()
    }
}

impl WorkerPool {
    /// Start `threads` workers named `{name}-0`, `{name}-1`, ...
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a thread cannot be spawned; threads already
    /// started are shut down again.
    pub fn new(name: &str, threads: usize, capacity: usize) -> SeepResult<Self> {
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(VecDeque::new()),
            work_ready: Condvar::new(),
            idle: Condvar::new(),
            shutdown: AtomicBool::new(false),
            active_tasks: AtomicUsize::new(0),
            capacity,
            tasks_completed: AtomicU64::new(0),
            tasks_panicked: AtomicU64::new(0),
        });

        let pool = WorkerPool {
            inner,
            threads: Mutex::new(Vec::with_capacity(threads)),
            worker_count: threads,
        };
        for i in 0..threads {
            let inner = Arc::clone(&pool.inner);
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || run_worker(&inner))?;
            pool.threads.lock().push(handle);
        }
        Ok(pool)
    }

    /// Queue a task
    ///
    /// # Errors
    ///
    /// `SubmitError::Full` at capacity, `SubmitError::ShutDown` after
    /// [`shutdown`](Self::shutdown).
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> Result<(), SubmitError> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(SubmitError::ShutDown);
        }
        {
            let mut queue = self.inner.queue.lock();
            if queue.len() >= self.inner.capacity {
                return Err(SubmitError::Full);
            }
            queue.push_back(Box::new(task));
        }
        self.inner.work_ready.notify_one();
        Ok(())
    }

    /// Block until the queue is empty and no task is running
    ///
    /// Workers keep running afterwards.
    pub fn drain(&self) {
        let mut queue = self.inner.queue.lock();
        while !queue.is_empty() || self.inner.active_tasks.load(Ordering::Acquire) > 0 {
            self.inner.idle.wait(&mut queue);
        }
    }

    /// Stop accepting tasks, finish the queued ones and join every thread
    ///
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        {
            // taken so a worker between its shutdown check and wait() cannot miss the wakeup
            let _queue = self.inner.queue.lock();
            self.inner.work_ready.notify_all();
        }
        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }

    /// True once [`shutdown`](Self::shutdown) was called
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Metrics snapshot
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            queue_depth: self.inner.queue.lock().len(),
            active_tasks: self.inner.active_tasks.load(Ordering::Relaxed),
            tasks_completed: self.inner.tasks_completed.load(Ordering::Relaxed),
            tasks_panicked: self.inner.tasks_panicked.load(Ordering::Relaxed),
            worker_count: self.worker_count,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Marks a task finished even if it panicked, so `drain` cannot hang
struct ActiveGuard<'a> {
    inner: &'a PoolInner,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let was_active = self.inner.active_tasks.fetch_sub(1, Ordering::AcqRel);
        self.inner.tasks_completed.fetch_add(1, Ordering::Relaxed);
        if was_active == 1 {
            let queue = self.inner.queue.lock();
            if queue.is_empty() {
                self.inner.idle.notify_all();
            }
        }
    }
}

fn run_worker(inner: &PoolInner) {
    loop {
        let task = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(task) = queue.pop_front() {
                    inner.active_tasks.fetch_add(1, Ordering::AcqRel);
                    break task;
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                inner.work_ready.wait(&mut queue);
            }
        };

        let _guard = ActiveGuard { inner };
        if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
            inner.tasks_panicked.fetch_add(1, Ordering::Relaxed);
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "(non-string panic)".to_string());
            error!(panic = %message, "Worker task panicked");
        }
    }
}
