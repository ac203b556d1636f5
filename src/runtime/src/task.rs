//! Bounded worker pool for the boot-time pass.
//!
//! Tasks return whether they succeeded; the pool folds the results into a
//! single flag with logical AND and tracks how many tasks are still queued
//! or running so the caller can block until the pass completes.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::JoinHandle;

type Task = Box<dyn FnOnce() -> bool + Send + 'static>;

struct PoolState {
    tasks: VecDeque<Task>,
    /// Queued plus running.
    pending: usize,
    all_succeeded: bool,
    stopped: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
    idle: Condvar,
}

/// Fixed-size worker pool with a bounded task queue.
pub struct TaskManager {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("workers", &self.workers.len())
            .field("capacity", &self.shared.capacity)
            .field("pending", &self.pending())
            .finish()
    }
}

impl TaskManager {
    /// Spawn `workers` threads (at least one) serving a queue of
    /// `capacity` slots (at least one).
    pub fn new(workers: usize, capacity: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                tasks: VecDeque::new(),
                pending: 0,
                all_succeeded: true,
                stopped: false,
            }),
            capacity: capacity.max(1),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            idle: Condvar::new(),
        });

        let workers = (0..workers.max(1))
            .filter_map(|index| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("hmp-task-{}", index))
                    .spawn(move || worker_loop(&shared))
                    .map_err(|e| tracing::error!(index, error = %e, "Failed to spawn task worker"))
                    .ok()
            })
            .collect();

        Self { shared, workers }
    }

    /// Queue a task, blocking while the queue is full.
    ///
    /// Returns `false` when the pool has no workers or was stopped.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce() -> bool + Send + 'static,
    {
        if self.workers.is_empty() {
            return false;
        }
        let mut state = self.shared.state.lock();
        while state.tasks.len() >= self.shared.capacity && !state.stopped {
            self.shared.not_full.wait(&mut state);
        }
        if state.stopped {
            return false;
        }
        state.tasks.push_back(Box::new(task));
        state.pending += 1;
        self.shared.not_empty.notify_one();
        true
    }

    /// Tasks queued or running.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().pending
    }

    /// Block until every submitted task has finished.
    pub fn wait(&self) {
        let mut state = self.shared.state.lock();
        while state.pending > 0 {
            self.shared.idle.wait(&mut state);
        }
    }

    /// AND of every finished task's result since the last reset.
    pub fn all_succeeded(&self) -> bool {
        self.shared.state.lock().all_succeeded
    }

    pub fn reset(&self) {
        self.shared.state.lock().all_succeeded = true;
    }

    /// Stop the workers after the tasks already queued and join them.
    pub fn shutdown(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.stopped = true;
        }
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("Task worker panicked");
            }
        }
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            while state.tasks.is_empty() && !state.stopped {
                shared.not_empty.wait(&mut state);
            }
            match state.tasks.pop_front() {
                Some(task) => {
                    shared.not_full.notify_one();
                    task
                }
                None => return,
            }
        };

        let succeeded = std::panic::catch_unwind(AssertUnwindSafe(task)).unwrap_or_else(|_| {
            tracing::error!("Task panicked");
            false
        });

        let mut state = shared.state.lock();
        state.all_succeeded &= succeeded;
        state.pending -= 1;
        if state.pending == 0 {
            shared.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_runs_all_tasks() {
        let pool = TaskManager::new(2, 4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            assert!(pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }));
        }
        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 20);
        assert_eq!(pool.pending(), 0);
        assert!(pool.all_succeeded());
    }

    #[test]
    fn test_single_failure_clears_flag() {
        let pool = TaskManager::new(1, 100);
        pool.submit(|| true);
        pool.submit(|| false);
        pool.submit(|| true);
        pool.wait();
        assert!(!pool.all_succeeded());

        pool.reset();
        pool.submit(|| true);
        pool.wait();
        assert!(pool.all_succeeded());
    }

    #[test]
    fn test_panicking_task_counts_as_failure() {
        let pool = TaskManager::new(1, 4);
        pool.submit(|| panic!("boom"));
        pool.submit(|| true);
        pool.wait();
        assert!(!pool.all_succeeded());
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn test_pending_counts_running_tasks() {
        let pool = TaskManager::new(1, 4);
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        pool.submit(move || rx.recv_timeout(Duration::from_secs(5)).is_ok());
        pool.submit(|| true);
        assert_eq!(pool.pending(), 2);
        tx.send(()).unwrap();
        pool.wait();
        assert_eq!(pool.pending(), 0);
        assert!(pool.all_succeeded());
    }

    #[test]
    fn test_submit_after_shutdown_rejected() {
        let mut pool = TaskManager::new(1, 4);
        pool.shutdown();
        assert!(!pool.submit(|| true));
    }
}
