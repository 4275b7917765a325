//! FoilPics - Worker Pool
//!
//! A bounded pool of background workers running discrete, cancellable
//! tasks. All heavy work (crypto, image decoding, file I/O) goes through
//! here; the engine thread never blocks on any of it. Completion is
//! reported by the task bodies themselves over the engine's event channel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

/// Identifies one submission. Allocated by the engine so completions can be
/// matched against the handle the engine still holds.
pub type TaskId = u64;

/// Per-task lifecycle flags. All transitions are monotonic.
pub struct TaskState {
    submitted: AtomicBool,
    started: AtomicBool,
    released: AtomicBool,
    done: AtomicBool,
    quit: Arc<AtomicBool>,
}

impl TaskState {
    fn new(quit: Arc<AtomicBool>) -> Self {
        Self {
            submitted: AtomicBool::new(false),
            started: AtomicBool::new(false),
            released: AtomicBool::new(false),
            done: AtomicBool::new(false),
            quit,
        }
    }

    /// A task is canceled once its owner released it or the pool is
    /// shutting down. Long task bodies poll this at cancellation points.
    pub fn is_canceled(&self) -> bool {
        self.released.load(Ordering::Acquire) || self.quit.load(Ordering::Acquire)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Owner-side handle. Dropping the handle does not cancel the task;
/// call `release` to signal that the result is no longer wanted.
pub struct TaskHandle {
    pub id: TaskId,
    state: Arc<TaskState>,
}

impl TaskHandle {
    /// Cancellation token: the body keeps running until its next
    /// cancellation point, but its result will be discarded.
    pub fn release(&self) {
        self.state.released.store(true, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        self.state.is_done()
    }
}

struct Job {
    state: Arc<TaskState>,
    body: Box<dyn FnOnce(&TaskState) + Send>,
}

struct Shared {
    queue: Mutex<VecDeque<Job>>,
    available: Condvar,
    quit: Arc<AtomicBool>,
}

/// Background execution context, at least one and at most two workers.
/// The ceiling is deliberate: tasks are CPU-bound on crypto and image
/// decoding and must not starve the engine thread.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        let ideal = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self::with_threads(ideal.saturating_sub(1).clamp(1, 2))
    }

    pub fn with_threads(count: usize) -> Self {
        let count = count.clamp(1, 2);
        log::debug!("Worker threads: {count}");
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            quit: Arc::new(AtomicBool::new(false)),
        });
        let workers = (0..count)
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("vault-worker-{i}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("failed to spawn worker")
            })
            .collect();
        Self { shared, workers }
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Queues `body` and returns the handle used for cancellation and
    /// completion matching.
    pub fn submit<F>(&self, id: TaskId, body: F) -> TaskHandle
    where
        F: FnOnce(&TaskState) + Send + 'static,
    {
        let state = Arc::new(TaskState::new(Arc::clone(&self.shared.quit)));
        state.submitted.store(true, Ordering::Release);
        let job = Job {
            state: Arc::clone(&state),
            body: Box::new(body),
        };
        self.shared.queue.lock().push_back(job);
        self.shared.available.notify_one();
        TaskHandle { id, state }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.quit.store(true, Ordering::Release);
        self.shared.available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if shared.quit.load(Ordering::Acquire) {
                    return;
                }
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                shared.available.wait(&mut queue);
            }
        };
        job.state.started.store(true, Ordering::Release);
        (job.body)(&job.state);
        job.state.done.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn thread_count_is_clamped() {
        assert_eq!(WorkerPool::with_threads(0).thread_count(), 1);
        assert_eq!(WorkerPool::with_threads(1).thread_count(), 1);
        assert_eq!(WorkerPool::with_threads(8).thread_count(), 2);
        let pool = WorkerPool::new();
        assert!((1..=2).contains(&pool.thread_count()));
    }

    #[test]
    fn tasks_run_and_report_done() {
        let pool = WorkerPool::with_threads(1);
        let (tx, rx) = mpsc::channel();
        let handle = pool.submit(1, move |_| {
            tx.send(42u32).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        while !handle.is_done() {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn single_worker_preserves_submission_order() {
        let pool = WorkerPool::with_threads(1);
        let (tx, rx) = mpsc::channel();
        for i in 0..16u32 {
            let tx = tx.clone();
            pool.submit(i as TaskId, move |_| {
                tx.send(i).unwrap();
            });
        }
        let got: Vec<u32> = (0..16).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(got, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn released_task_observes_cancellation() {
        let pool = WorkerPool::with_threads(1);
        let (started_tx, started_rx) = mpsc::channel();
        let (iters_tx, iters_rx) = mpsc::channel();
        let handle = pool.submit(7, move |state| {
            started_tx.send(()).unwrap();
            let mut iterations = 0u32;
            while !state.is_canceled() && iterations < 1_000_000 {
                iterations += 1;
                thread::sleep(Duration::from_millis(1));
            }
            iters_tx.send(iterations).unwrap();
        });
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.release();
        let iterations = iters_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(iterations < 1_000_000);
    }

    #[test]
    fn pool_drop_joins_running_task() {
        let pool = WorkerPool::with_threads(1);
        pool.submit(1, |state| {
            while !state.is_canceled() {
                thread::sleep(Duration::from_millis(1));
            }
        });
        drop(pool); // must not hang
    }
}
