//! One-shot result channel with synchronous continuation support.
//!
//! A channel is a pair of a [`Completer`] (write-end) and an [`AsyncResult`]
//! (read-end). The channel resolves exactly once: with the value handed to
//! [`Completer::complete`], or with [`TaskError::Abandoned`] if the write-end
//! is dropped unresolved. The read-end either blocks ([`AsyncResult::recv`])
//! or registers a continuation ([`AsyncResult::on_ready`]) that runs in
//! whichever thread resolves the channel.

use std::fmt;
use std::mem;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{TaskError, TaskResult};

type Continuation<T> = Box<dyn FnOnce(TaskResult<T>) + Send>;

enum CellState<T> {
    /// Neither resolved nor chained.
    Pending,
    /// A continuation is registered and will consume the outcome.
    Chained(Continuation<T>),
    /// Resolved; the outcome awaits a `recv`/`try_recv`.
    Ready(TaskResult<T>),
    /// The outcome has been delivered.
    Done,
}

struct ResultCell<T> {
    state: Mutex<CellState<T>>,
    cond: Condvar,
}

impl<T> ResultCell<T> {
    fn resolve(&self, outcome: TaskResult<T>) {
        let continuation = {
            let mut state = self.state.lock().expect("result cell mutex poisoned");
            match mem::replace(&mut *state, CellState::Done) {
                CellState::Pending => {
                    *state = CellState::Ready(outcome);
                    self.cond.notify_all();
                    return;
                }
                CellState::Chained(continuation) => continuation,
                CellState::Ready(_) | CellState::Done => {
                    debug_assert!(false, "result cell resolved twice");
                    return;
                }
            }
        };
        // The continuation runs in the resolving thread, outside the cell lock.
        continuation(outcome);
    }
}

/// Creates a one-shot result channel.
pub fn channel<T>() -> (Completer<T>, AsyncResult<T>) {
    let cell = Arc::new(ResultCell {
        state: Mutex::new(CellState::Pending),
        cond: Condvar::new(),
    });
    (
        Completer {
            cell: Arc::clone(&cell),
            resolved: false,
        },
        AsyncResult { cell },
    )
}

/// Write-end of a result channel.
pub struct Completer<T> {
    cell: Arc<ResultCell<T>>,
    resolved: bool,
}

impl<T> Completer<T> {
    /// Resolves the channel. If a continuation is registered it runs on the
    /// calling thread before this returns.
    pub fn complete(mut self, outcome: TaskResult<T>) {
        self.resolved = true;
        self.cell.resolve(outcome);
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if !self.resolved {
            self.cell.resolve(Err(TaskError::Abandoned));
        }
    }
}

impl<T> fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("resolved", &self.resolved)
            .finish()
    }
}

/// Read-end of a result channel.
pub struct AsyncResult<T> {
    cell: Arc<ResultCell<T>>,
}

impl<T> AsyncResult<T> {
    /// Blocks until the channel resolves and returns the outcome.
    ///
    /// Panics if the outcome was already taken via [`try_recv`](Self::try_recv).
    pub fn recv(self) -> TaskResult<T> {
        let mut state = self.cell.state.lock().expect("result cell mutex poisoned");
        loop {
            match &*state {
                CellState::Ready(_) => match mem::replace(&mut *state, CellState::Done) {
                    CellState::Ready(outcome) => return outcome,
                    _ => unreachable!(),
                },
                CellState::Pending => {
                    state = self
                        .cell
                        .cond
                        .wait(state)
                        .expect("result cell condvar poisoned");
                }
                CellState::Done => panic!("result already taken"),
                CellState::Chained(_) => unreachable!("read end already consumed"),
            }
        }
    }

    /// Bounded [`recv`](Self::recv); hands the read-end back on timeout.
    pub fn recv_timeout(self, timeout: Duration) -> Result<TaskResult<T>, AsyncResult<T>> {
        let deadline = Instant::now() + timeout;
        {
            let mut state = self.cell.state.lock().expect("result cell mutex poisoned");
            loop {
                match &*state {
                    CellState::Ready(_) => match mem::replace(&mut *state, CellState::Done) {
                        CellState::Ready(outcome) => return Ok(outcome),
                        _ => unreachable!(),
                    },
                    CellState::Pending => {}
                    CellState::Done => panic!("result already taken"),
                    CellState::Chained(_) => unreachable!("read end already consumed"),
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (guard, _) = self
                    .cell
                    .cond
                    .wait_timeout(state, deadline - now)
                    .expect("result cell condvar poisoned");
                state = guard;
            }
        }
        Err(self)
    }

    /// Takes the outcome if the channel has already resolved.
    pub fn try_recv(&self) -> Option<TaskResult<T>> {
        let mut state = self.cell.state.lock().expect("result cell mutex poisoned");
        if matches!(*state, CellState::Ready(_)) {
            match mem::replace(&mut *state, CellState::Done) {
                CellState::Ready(outcome) => Some(outcome),
                _ => unreachable!(),
            }
        } else {
            None
        }
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        let state = self.cell.state.lock().expect("result cell mutex poisoned");
        matches!(*state, CellState::Ready(_))
    }

    /// Registers a synchronous continuation for the outcome.
    ///
    /// If the channel is already resolved, `f` runs immediately on the calling
    /// thread; otherwise it runs in the thread that resolves the channel. In
    /// either case the cell lock is released before `f` is invoked.
    pub fn on_ready(self, f: impl FnOnce(TaskResult<T>) + Send + 'static) {
        let mut state = self.cell.state.lock().expect("result cell mutex poisoned");
        match mem::replace(&mut *state, CellState::Done) {
            CellState::Pending => {
                *state = CellState::Chained(Box::new(f));
            }
            CellState::Ready(outcome) => {
                drop(state);
                f(outcome);
            }
            CellState::Done => panic!("result already taken"),
            CellState::Chained(_) => unreachable!("read end already consumed"),
        }
    }
}

impl<T> PartialEq for AsyncResult<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl<T> fmt::Debug for AsyncResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncResult")
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::channel;
    use crate::error::TaskError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn complete_then_recv() {
        let (completer, result) = channel::<u32>();
        completer.complete(Ok(7));
        assert_eq!(result.recv(), Ok(7));
    }

    #[test]
    fn recv_blocks_until_complete() {
        let (completer, result) = channel::<&'static str>();
        let resolver = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.complete(Ok("done"));
        });
        assert_eq!(result.recv(), Ok("done"));
        resolver.join().unwrap();
    }

    #[test]
    fn dropped_completer_abandons() {
        let (completer, result) = channel::<u32>();
        drop(completer);
        assert_eq!(result.recv(), Err(TaskError::Abandoned));
    }

    #[test]
    fn continuation_runs_in_resolving_thread() {
        let (completer, result) = channel::<u32>();
        let observed = Arc::new(AtomicUsize::new(0));
        let observed_in_cb = Arc::clone(&observed);
        result.on_ready(move |outcome| {
            assert_eq!(outcome, Ok(3));
            observed_in_cb.store(1, Ordering::Release);
        });
        assert_eq!(observed.load(Ordering::Acquire), 0);
        completer.complete(Ok(3));
        assert_eq!(observed.load(Ordering::Acquire), 1);
    }

    #[test]
    fn continuation_after_resolve_runs_immediately() {
        let (completer, result) = channel::<u32>();
        completer.complete(Err(TaskError::Cancelled));
        let observed = Arc::new(AtomicUsize::new(0));
        let observed_in_cb = Arc::clone(&observed);
        result.on_ready(move |outcome| {
            assert_eq!(outcome, Err(TaskError::Cancelled));
            observed_in_cb.store(1, Ordering::Release);
        });
        assert_eq!(observed.load(Ordering::Acquire), 1);
    }

    #[test]
    fn try_recv_reports_pending_then_ready() {
        let (completer, result) = channel::<u32>();
        assert!(result.try_recv().is_none());
        assert!(!result.is_ready());
        completer.complete(Ok(11));
        assert!(result.is_ready());
        assert_eq!(result.try_recv(), Some(Ok(11)));
        assert!(result.try_recv().is_none());
    }

    #[test]
    fn recv_timeout_expires_then_succeeds() {
        let (completer, result) = channel::<u32>();
        let result = match result.recv_timeout(Duration::from_millis(10)) {
            Err(result) => result,
            Ok(outcome) => panic!("resolved early: {outcome:?}"),
        };
        completer.complete(Ok(5));
        assert_eq!(result.recv_timeout(Duration::from_secs(1)), Ok(Ok(5)));
    }
}
