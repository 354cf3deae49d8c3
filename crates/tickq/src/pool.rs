//! Fixed-size worker pool draining a shared FIFO job queue.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, trace};

use crate::async_result::{self, AsyncResult, Completer};
use crate::error::{TaskError, panic_message};
use crate::executor::{Executor, Job};

struct PoolEntry<T> {
    job: Job<T>,
    completer: Completer<T>,
}

struct PoolState<T> {
    running: bool,
    queue: VecDeque<PoolEntry<T>>,
}

struct PoolShared<T> {
    state: Mutex<PoolState<T>>,
    cond: Condvar,
}

/// A fixed-size set of worker threads executing jobs in FIFO order.
///
/// Every submission returns an [`AsyncResult`] resolving to the job's return
/// value or its captured panic. Workers never terminate because of a job
/// failure. Stopping the pool drops jobs that have not started; their result
/// channels resolve to [`TaskError::Abandoned`].
pub struct ThreadPool<T> {
    shared: Arc<PoolShared<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T> ThreadPool<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    running: false,
                    queue: VecDeque::new(),
                }),
                cond: Condvar::new(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().expect("pool mutex poisoned").running
    }

    /// Number of live worker threads.
    pub fn worker_count(&self) -> usize {
        self.workers.lock().expect("pool worker registry poisoned").len()
    }

    /// Jobs accepted but not yet started.
    pub fn queued_len(&self) -> usize {
        self.shared
            .state
            .lock()
            .expect("pool mutex poisoned")
            .queue
            .len()
    }

    /// Signals shutdown, wakes all workers and joins them. Idempotent.
    ///
    /// Jobs already running finish; jobs still queued are dropped and their
    /// result channels resolve as abandoned.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock().expect("pool mutex poisoned");
            if !state.running {
                return;
            }
            state.running = false;
        }
        self.shared.cond.notify_all();

        let mut workers = self.workers.lock().expect("pool worker registry poisoned");
        for handle in workers.drain(..) {
            let _ = handle.join();
        }

        let dropped = {
            let mut state = self.shared.state.lock().expect("pool mutex poisoned");
            std::mem::take(&mut state.queue)
        };
        if !dropped.is_empty() {
            debug!(dropped = dropped.len(), "dropped queued jobs at shutdown");
        }
        // Dropping the entries resolves their completers outside the lock.
        drop(dropped);
    }
}

impl<T: Send + 'static> ThreadPool<T> {
    /// Spawns `num_threads` workers. Idempotent while running.
    pub fn start(&self, num_threads: usize) {
        {
            let mut state = self.shared.state.lock().expect("pool mutex poisoned");
            if state.running {
                return;
            }
            state.running = true;
        }
        let mut workers = self.workers.lock().expect("pool worker registry poisoned");
        for index in 0..num_threads {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("tickq-worker-{index}"))
                .spawn(move || worker_loop(shared))
                .expect("failed to spawn pool worker");
            workers.push(handle);
        }
        info!(workers = num_threads, "pool started");
    }

    /// Appends a job to the FIFO and returns its result handle.
    ///
    /// Never blocks beyond the queue append.
    pub fn execute(&self, job: impl FnOnce() -> T + Send + 'static) -> AsyncResult<T> {
        self.execute_boxed(Box::new(job))
    }

    fn execute_boxed(&self, job: Job<T>) -> AsyncResult<T> {
        let (completer, result) = async_result::channel();
        {
            let mut state = self.shared.state.lock().expect("pool mutex poisoned");
            state.queue.push_back(PoolEntry { job, completer });
        }
        self.shared.cond.notify_one();
        result
    }
}

impl<T: Send + 'static> Executor<T> for ThreadPool<T> {
    fn execute(&self, job: Job<T>) -> AsyncResult<T> {
        self.execute_boxed(job)
    }
}

impl<T> Default for ThreadPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for ThreadPool<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop<T>(shared: Arc<PoolShared<T>>) {
    info!("worker started");
    loop {
        let entry = {
            let state = shared.state.lock().expect("pool mutex poisoned");
            let mut state = shared
                .cond
                .wait_while(state, |s| s.queue.is_empty() && s.running)
                .expect("pool condvar poisoned");
            // Shutdown wins over remaining work; queued entries are dropped
            // by `stop`.
            if !state.running {
                break;
            }
            state.queue.pop_front().expect("woken with an empty queue")
        };
        trace!("job start");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (entry.job)()))
            .map_err(|payload| TaskError::Panicked(panic_message(payload)));
        entry.completer.complete(outcome);
        trace!("job complete");
    }
    info!("worker stopped");
}

#[cfg(test)]
mod tests {
    use super::ThreadPool;
    use crate::error::TaskError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Condvar, Mutex};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn executes_jobs_and_returns_values() {
        let pool = ThreadPool::new();
        pool.start(2);
        let result = pool.execute(|| 6 * 7);
        assert_eq!(result.recv(), Ok(42));
        pool.stop();
    }

    #[test]
    fn captures_job_panics() {
        let pool = ThreadPool::<()>::new();
        pool.start(1);
        let result = pool.execute(|| panic!("exploded"));
        assert_eq!(
            result.recv(),
            Err(TaskError::Panicked("exploded".to_string()))
        );
        // The worker survives the panic.
        let result = pool.execute(|| ());
        assert_eq!(result.recv(), Ok(()));
        pool.stop();
    }

    #[test]
    fn start_is_idempotent() {
        let pool = ThreadPool::<u32>::new();
        pool.start(2);
        pool.start(8);
        assert_eq!(pool.worker_count(), 2);
        pool.stop();
        assert_eq!(pool.worker_count(), 0);
        pool.stop();
    }

    #[test]
    fn single_worker_preserves_fifo_order() {
        let pool = ThreadPool::new();
        pool.start(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..8)
            .map(|index| {
                let order = Arc::clone(&order);
                pool.execute(move || {
                    order.lock().unwrap().push(index);
                    index
                })
            })
            .collect();
        for (index, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.recv(), Ok(index));
        }
        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
        pool.stop();
    }

    #[test]
    fn stop_abandons_queued_jobs() {
        let pool = Arc::new(ThreadPool::new());
        pool.start(1);

        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let gate_in_job = Arc::clone(&gate);
        let blocked = pool.execute(move || {
            let (lock, cond) = &*gate_in_job;
            let opened = lock.lock().unwrap();
            let _opened = cond.wait_while(opened, |open| !*open).unwrap();
            1
        });
        let queued = pool.execute(|| 2);

        let stopper = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.stop())
        };
        // Wait for the shutdown flag to flip, then let the running job finish.
        while pool.is_running() {
            thread::sleep(Duration::from_millis(1));
        }
        {
            let (lock, cond) = &*gate;
            *lock.lock().unwrap() = true;
            cond.notify_all();
        }
        stopper.join().unwrap();

        assert_eq!(blocked.recv(), Ok(1));
        assert_eq!(queued.recv(), Err(TaskError::Abandoned));
    }

    #[test]
    fn workers_run_concurrently() {
        let pool = Arc::new(ThreadPool::new());
        pool.start(4);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                pool.execute(move || {
                    let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(current, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(30));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.recv(), Ok(()));
        }
        assert!(peak.load(Ordering::SeqCst) > 1);
        pool.stop();
    }
}
