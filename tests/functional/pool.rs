//! Worker pool tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use depot::pool::{SubmitError, WorkerPool};

/// Spin until `condition` holds or a deadline passes.
fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn executes_submitted_tasks() {
    let pool = WorkerPool::new(2, 0).unwrap();
    let counter = Arc::new(AtomicU32::new(0));
    for _ in 0..10 {
        let counter = Arc::clone(&counter);
        pool.submit(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
    }
    wait_for(|| pool.completed_tasks() == 10);
    assert_eq!(counter.load(Ordering::Relaxed), 10);
    assert_eq!(pool.submitted_tasks(), 10);
    // All bookkeeping must balance once the queue drained.
    assert_eq!(pool.queue_len(), 0);
    assert_eq!(pool.active_workers(), 0);
    pool.shutdown(true);
}

#[test]
fn counters_balance_while_tasks_are_queued() {
    let pool = WorkerPool::new(1, 0).unwrap();

    // A single worker blocked on the first task queues the rest.
    let gate = Arc::new(Mutex::new(()));
    let guard = gate.lock().unwrap();
    for _ in 0..5 {
        let gate = Arc::clone(&gate);
        pool.submit(move || {
            let _guard = gate.lock().unwrap();
        })
        .unwrap();
    }
    wait_for(|| pool.active_workers() == 1);
    // submitted == completed + queued + active at any observable point.
    assert_eq!(
        pool.submitted_tasks(),
        pool.completed_tasks() + pool.queue_len() as u64 + pool.active_workers() as u64,
    );
    drop(guard);
    wait_for(|| pool.completed_tasks() == 5);
    assert_eq!(pool.submitted_tasks(), 5);
    pool.shutdown(true);
}

#[test]
fn bounded_queue_reports_full() {
    let pool = WorkerPool::new(1, 1).unwrap();
    let gate = Arc::new(Mutex::new(()));
    let guard = gate.lock().unwrap();

    // Occupies the single worker.
    let blocker = Arc::clone(&gate);
    pool.submit(move || {
        let _guard = blocker.lock().unwrap();
    })
    .unwrap();
    wait_for(|| pool.active_workers() == 1);

    // Fills the queue.
    pool.submit(|| {}).unwrap();
    // No room left.
    assert_eq!(pool.submit(|| {}).unwrap_err(), SubmitError::QueueFull);

    drop(guard);
    wait_for(|| pool.completed_tasks() == 2);
    pool.shutdown(true);
}

#[test]
fn tasks_run_in_submission_order() {
    let pool = WorkerPool::new(1, 0).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..8 {
        let order = Arc::clone(&order);
        pool.submit(move || order.lock().unwrap().push(i)).unwrap();
    }
    wait_for(|| pool.completed_tasks() == 8);
    assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
    pool.shutdown(true);
}

#[test]
fn panicking_task_does_not_kill_the_pool() {
    let pool = WorkerPool::new(1, 0).unwrap();
    pool.submit(|| panic!("task blew up")).unwrap();
    let counter = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&counter);
    pool.submit(move || {
        c.fetch_add(1, Ordering::Relaxed);
    })
    .unwrap();
    wait_for(|| pool.completed_tasks() == 2);
    assert_eq!(counter.load(Ordering::Relaxed), 1);
    pool.shutdown(true);
}

#[test]
fn submit_after_shutdown_fails() {
    let pool = WorkerPool::new(1, 0).unwrap();
    pool.shutdown(true);
    assert_eq!(pool.submit(|| {}).unwrap_err(), SubmitError::PoolShutDown);
    assert!(!pool.is_running());
    // Re-entrant shutdown is a no-op.
    pool.shutdown(true);
    pool.shutdown(false);
}

#[test]
fn waiting_shutdown_drains_the_queue() {
    let pool = WorkerPool::new(1, 0).unwrap();
    let counter = Arc::new(AtomicU32::new(0));
    for _ in 0..20 {
        let counter = Arc::clone(&counter);
        pool.submit(move || {
            thread::sleep(Duration::from_millis(1));
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
    }
    pool.shutdown(true);
    assert_eq!(counter.load(Ordering::Relaxed), 20);
    assert_eq!(pool.completed_tasks(), 20);
}
