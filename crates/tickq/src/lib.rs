//! Timer queue and worker pool with chainable result handles.
//!
//! A [`TimerQueue`] owns a single dispatcher thread that waits until the
//! earliest armed deadline and hands the expired job to an [`Executor`],
//! typically a [`ThreadPool`]. Every enqueue returns a [`TimerHandle`] whose
//! result channel resolves exactly once: with the job's return value, its
//! captured panic, or a cancellation.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::{Duration, Instant};
//! use tickq::{ThreadPool, TimerQueue};
//!
//! let pool = Arc::new(ThreadPool::new());
//! pool.start(4);
//!
//! let queue: TimerQueue<u32, ThreadPool<u32>> = TimerQueue::new(Arc::clone(&pool));
//! queue.start();
//!
//! let handle = queue.enqueue(Instant::now() + Duration::from_millis(100), || 42);
//! assert_eq!(handle.into_result().recv(), Ok(42));
//!
//! queue.stop();
//! pool.stop();
//! ```

pub mod async_result;
pub mod clock;
pub mod error;
pub mod executor;
pub mod pool;
pub mod queue;
pub mod sched;

pub use async_result::{AsyncResult, Completer};
pub use clock::{Clock, MonotonicClock, SystemClock};
pub use error::{TaskError, TaskResult};
pub use executor::{Executor, Job};
pub use pool::ThreadPool;
pub use queue::{TimerHandle, TimerQueue, TimerUid};
pub use sched::{SchedPolicy, SchedPriority};
