//! Worker pool.
//!
//! A fixed set of threads executing submitted closures in FIFO order. The
//! reactor submits one task per readiness event; tasks are fire-and-forget
//! and must not panic the pool: a panicking task is caught, logged and
//! swallowed.
//!
//! The queue is a crossbeam channel, bounded by `max_queue_size` (0 means
//! unbounded). [`WorkerPool::shutdown`] flips an atomic flag and closes the
//! sending side, waking every blocked worker; it either joins the workers,
//! draining the remaining queue, or drops the queued tasks and detaches.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use log::{error, trace};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Pool of worker threads executing submitted tasks.
#[derive(Debug)]
pub struct WorkerPool {
    /// `None` after shutdown started.
    sender: Mutex<Option<Sender<Task>>>,
    /// Kept to drain the queue on a non-waiting shutdown and to report the
    /// queue length.
    receiver: Receiver<Task>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<Stats>,
    thread_count: usize,
}

#[derive(Debug, Default)]
struct Stats {
    submitted: AtomicU64,
    completed: AtomicU64,
    active: AtomicUsize,
}

impl WorkerPool {
    /// Create a pool of `threads` workers with a queue bounded at
    /// `max_queue_size` tasks (0 means unbounded).
    pub fn new(threads: usize, max_queue_size: usize) -> std::io::Result<WorkerPool> {
        let (sender, receiver) = if max_queue_size == 0 {
            unbounded()
        } else {
            bounded(max_queue_size)
        };
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Stats::default());

        let mut workers = Vec::with_capacity(threads);
        for id in 0..threads {
            let receiver: Receiver<Task> = receiver.clone();
            let stats = Arc::clone(&stats);
            let handle = thread::Builder::new()
                .name(format!("depot-worker-{id}"))
                .spawn(move || worker_main(id, &receiver, &stats))?;
            workers.push(handle);
        }

        Ok(WorkerPool {
            sender: Mutex::new(Some(sender)),
            receiver,
            workers: Mutex::new(workers),
            shutdown,
            stats,
            thread_count: threads,
        })
    }

    /// Submit a task for execution.
    ///
    /// Tasks run in submission order but may complete out of order across
    /// workers.
    pub fn submit<F>(&self, task: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(SubmitError::PoolShutDown);
        }
        let sender = lock(&self.sender);
        let sender = sender.as_ref().ok_or(SubmitError::PoolShutDown)?;
        match sender.try_send(Box::new(task)) {
            Ok(()) => {
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(SubmitError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(SubmitError::PoolShutDown),
        }
    }

    /// Shut the pool down.
    ///
    /// With `wait_for_completion` the queued tasks are drained and every
    /// worker is joined; without it the remaining queue is dropped and the
    /// workers are detached. Calling this a second time is a no-op.
    pub fn shutdown(&self, wait_for_completion: bool) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        // Closing the sending side wakes every worker blocked on the queue;
        // they drain what is left and stop.
        drop(lock(&self.sender).take());
        if wait_for_completion {
            let workers = std::mem::take(&mut *lock(&self.workers));
            for worker in workers {
                // Workers swallow task panics, a join error means the
                // runtime itself is beyond saving.
                let _ = worker.join();
            }
        } else {
            while self.receiver.try_recv().is_ok() {}
            lock(&self.workers).clear();
        }
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::Relaxed)
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Number of tasks accepted by `submit`.
    pub fn submitted_tasks(&self) -> u64 {
        self.stats.submitted.load(Ordering::Relaxed)
    }

    /// Number of tasks that finished executing.
    pub fn completed_tasks(&self) -> u64 {
        self.stats.completed.load(Ordering::Relaxed)
    }

    /// Number of workers currently executing a task.
    pub fn active_workers(&self) -> usize {
        self.stats.active.load(Ordering::Relaxed)
    }

    /// Number of tasks waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.receiver.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown(true);
    }
}

fn worker_main(id: usize, receiver: &Receiver<Task>, stats: &Stats) {
    trace!(worker_id = id; "worker thread started");
    while let Ok(task) = receiver.recv() {
        stats.active.fetch_add(1, Ordering::Relaxed);
        let result = panic::catch_unwind(AssertUnwindSafe(task));
        stats.active.fetch_sub(1, Ordering::Relaxed);
        stats.completed.fetch_add(1, Ordering::Relaxed);
        if let Err(panic) = result {
            let reason = panic_message(&panic);
            error!(worker_id = id; "task panicked: {reason}");
        }
    }
    trace!(worker_id = id; "worker thread stopped");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    match panic.downcast_ref::<&'static str>() {
        Some(s) => s,
        None => match panic.downcast_ref::<String>() {
            Some(s) => s.as_str(),
            None => "<unknown>",
        },
    }
}

/// Recover from a poisoned mutex; the pool's locks guard plain data.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Error returned by [`WorkerPool::submit`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SubmitError {
    /// Shutdown already started.
    PoolShutDown,
    /// The bounded queue is saturated.
    QueueFull,
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SubmitError::PoolShutDown => "worker pool is shut down",
            SubmitError::QueueFull => "worker pool queue is full",
        })
    }
}

impl std::error::Error for SubmitError {}
