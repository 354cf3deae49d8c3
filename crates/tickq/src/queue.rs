//! Deadline-ordered timer queue with a single dispatcher thread.
//!
//! The queue owns a min-heap of `{uid, deadline}` slots plus a side table
//! mapping each live uid to its job and the write-end of the caller's result
//! channel. The dispatcher waits until the earliest live deadline, hands the
//! job to the executor, and chains the executor's result handle into the
//! caller's handle. Cancellation removes the table entry only; the heap slot
//! stays behind as a tombstone and is swept lazily (or eagerly by
//! [`TimerQueue::purge`]).

use std::cmp;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, trace, warn};

use crate::async_result::{self, AsyncResult, Completer};
use crate::clock::{Clock, MonotonicClock};
use crate::error::TaskError;
use crate::executor::{Executor, Job};
use crate::sched::{SchedPolicy, SchedPriority};

/// Dense timer identifier. Never reused within a queue instance.
pub type TimerUid = u32;

/// Handle returned by [`TimerQueue::enqueue`].
pub struct TimerHandle<T, I> {
    uid: TimerUid,
    deadline: I,
    result: AsyncResult<T>,
}

impl<T, I: Copy> TimerHandle<T, I> {
    /// Opaque timer uid, usable with `cancel` and `in_queue`.
    #[inline]
    pub fn uid(&self) -> TimerUid {
        self.uid
    }

    /// Scheduled execution timepoint.
    #[inline]
    pub fn deadline(&self) -> I {
        self.deadline
    }

    /// Takes the read-end of the result channel.
    pub fn into_result(self) -> AsyncResult<T> {
        self.result
    }
}

impl<T, I: fmt::Debug> fmt::Debug for TimerHandle<T, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("uid", &self.uid)
            .field("deadline", &self.deadline)
            .finish()
    }
}

struct TimerEntry<T> {
    job: Job<T>,
    completer: Completer<T>,
}

#[derive(Clone, Copy)]
struct HeapSlot<I> {
    uid: TimerUid,
    deadline: I,
}

impl<I: Ord> PartialEq for HeapSlot<I> {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid && self.deadline == other.deadline
    }
}

impl<I: Ord> Eq for HeapSlot<I> {}

impl<I: Ord> PartialOrd for HeapSlot<I> {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<I: Ord> Ord for HeapSlot<I> {
    // `BinaryHeap` is a max-heap; the comparison is reversed so the earliest
    // deadline sits at the root. Uid breaks ties deterministically.
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.uid.cmp(&self.uid))
    }
}

struct QueueState<T, I> {
    running: bool,
    next_uid: TimerUid,
    jobs: HashMap<TimerUid, TimerEntry<T>>,
    heap: BinaryHeap<HeapSlot<I>>,
}

struct Shared<T, C: Clock> {
    clock: C,
    state: Mutex<QueueState<T, C::Instant>>,
    cond: Condvar,
}

/// Timer queue dispatching jobs to an [`Executor`] at their deadlines.
///
/// One mutex guards the running flag, uid counter, job table and heap; one
/// condition variable wakes the dispatcher when the earliest deadline may
/// have changed. The executor is shared via `Arc` and is not stopped by the
/// queue.
pub struct TimerQueue<T, E, C: Clock = MonotonicClock> {
    shared: Arc<Shared<T, C>>,
    executor: Arc<E>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl<T, E, C: Clock + Default> TimerQueue<T, E, C> {
    /// Creates a stopped queue over the clock's default instance.
    pub fn new(executor: Arc<E>) -> Self {
        Self::with_clock(executor, C::default())
    }
}

impl<T, E, C: Clock> TimerQueue<T, E, C> {
    /// Creates a stopped queue scheduling against `clock`.
    pub fn with_clock(executor: Arc<E>, clock: C) -> Self {
        Self {
            shared: Arc::new(Shared {
                clock,
                state: Mutex::new(QueueState {
                    running: false,
                    next_uid: 0,
                    jobs: HashMap::new(),
                    heap: BinaryHeap::new(),
                }),
                cond: Condvar::new(),
            }),
            executor,
            dispatcher: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().running
    }

    /// Live timers (cancelled ones excluded).
    pub fn len(&self) -> usize {
        self.lock_state().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_state().jobs.is_empty()
    }

    /// Heap slots, tombstones included. Equals [`len`](Self::len) right
    /// after a [`purge`](Self::purge).
    pub fn heap_len(&self) -> usize {
        self.lock_state().heap.len()
    }

    /// Whether `uid` is still pending: enqueued, not yet dispatched, not
    /// cancelled.
    pub fn in_queue(&self, uid: TimerUid) -> bool {
        self.lock_state().jobs.contains_key(&uid)
    }

    /// Arms a timer firing at `deadline` and returns its handle.
    ///
    /// The queue may be stopped; the timer fires once the queue is started
    /// and the deadline has passed.
    pub fn enqueue(
        &self,
        deadline: C::Instant,
        job: impl FnOnce() -> T + Send + 'static,
    ) -> TimerHandle<T, C::Instant> {
        let (completer, result) = async_result::channel();
        let (uid, is_first) = {
            let mut state = self.lock_state();
            let uid = state.next_uid;
            state.next_uid += 1;
            state.jobs.insert(
                uid,
                TimerEntry {
                    job: Box::new(job),
                    completer,
                },
            );
            state.heap.push(HeapSlot { uid, deadline });
            let is_first = state.heap.peek().is_some_and(|slot| slot.uid == uid);
            (uid, is_first)
        };
        // Only a new earliest deadline can move the dispatcher's wait target.
        if is_first {
            self.shared.cond.notify_one();
        }
        debug!(uid, "armed timer");
        TimerHandle {
            uid,
            deadline,
            result,
        }
    }

    /// Cancels a pending timer.
    ///
    /// Returns `true` iff the uid was live; in that case the caller's result
    /// channel resolves to [`TaskError::Cancelled`] before this returns. The
    /// heap slot is left behind as a tombstone.
    pub fn cancel(&self, uid: TimerUid) -> bool {
        let (entry, was_first) = {
            let mut state = self.lock_state();
            match state.jobs.remove(&uid) {
                Some(entry) => {
                    debug_assert!(
                        !state.heap.is_empty(),
                        "job table entry without a heap slot"
                    );
                    let was_first = state.heap.peek().is_some_and(|slot| slot.uid == uid);
                    (entry, was_first)
                }
                None => return false,
            }
        };
        if was_first {
            self.shared.cond.notify_one();
        }
        debug!(uid, "cancelled timer");
        entry.completer.complete(Err(TaskError::Cancelled));
        true
    }

    /// Removes every pending timer and empties the heap.
    ///
    /// Each pending result channel resolves to [`TaskError::Cancelled`].
    pub fn clear(&self) {
        let (entries, slots) = {
            let mut state = self.lock_state();
            let entries: Vec<TimerEntry<T>> =
                state.jobs.drain().map(|(_, entry)| entry).collect();
            let slots = state.heap.len();
            state.heap.clear();
            (entries, slots)
        };
        if !entries.is_empty() {
            self.shared.cond.notify_one();
        }
        debug!(
            jobs = entries.len(),
            tombstones = slots - entries.len(),
            "cleared queue"
        );
        for entry in entries {
            entry.completer.complete(Err(TaskError::Cancelled));
        }
    }

    /// Eagerly removes tombstones from the heap. O(n).
    pub fn purge(&self) {
        let removed = {
            let mut state = self.lock_state();
            let before = state.heap.len();
            if before > state.jobs.len() {
                let QueueState { jobs, heap, .. } = &mut *state;
                heap.retain(|slot| jobs.contains_key(&slot.uid));
            }
            before - state.heap.len()
        };
        // The dispatcher never waits on a tombstone's deadline, so no
        // wake-up is needed.
        debug!(removed, "purged cancelled timers");
    }

    /// Signals the dispatcher, joins it, and resolves every still-pending
    /// result channel with [`TaskError::Cancelled`]. Idempotent.
    ///
    /// The executor is left running.
    pub fn stop(&self) {
        let handle = {
            let mut dispatcher = self.dispatcher.lock().expect("dispatcher slot poisoned");
            {
                let mut state = self.lock_state();
                if !state.running {
                    return;
                }
                state.running = false;
            }
            self.shared.cond.notify_one();
            dispatcher.take()
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        let entries = {
            let mut state = self.lock_state();
            let entries: Vec<TimerEntry<T>> =
                state.jobs.drain().map(|(_, entry)| entry).collect();
            state.heap.clear();
            entries
        };
        if !entries.is_empty() {
            warn!(pending = entries.len(), "stopped with unprocessed timers");
        }
        for entry in entries {
            entry.completer.complete(Err(TaskError::Cancelled));
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState<T, C::Instant>> {
        self.shared.state.lock().expect("timer queue mutex poisoned")
    }
}

impl<T, E, C> TimerQueue<T, E, C>
where
    T: Send + 'static,
    E: Executor<T>,
    C: Clock,
{
    /// Starts the dispatcher thread with default scheduling. Idempotent.
    pub fn start(&self) {
        let mut dispatcher = self.dispatcher.lock().expect("dispatcher slot poisoned");
        {
            let mut state = self.lock_state();
            if state.running {
                return;
            }
            state.running = true;
        }
        let shared = Arc::clone(&self.shared);
        let executor = Arc::clone(&self.executor);
        let handle = thread::Builder::new()
            .name("tickq-dispatch".into())
            .spawn(move || dispatch(shared, executor))
            .expect("failed to spawn dispatcher thread");
        dispatcher.replace(handle);
    }

    /// Starts the dispatcher and applies the given scheduling policy to it.
    ///
    /// Returns whether the parameters were applied; on failure the
    /// dispatcher keeps running with default scheduling.
    #[cfg(unix)]
    pub fn start_with_sched(&self, policy: SchedPolicy, priority: SchedPriority) -> bool {
        use std::os::unix::thread::JoinHandleExt;

        self.start();
        let dispatcher = self.dispatcher.lock().expect("dispatcher slot poisoned");
        match dispatcher.as_ref() {
            Some(handle) => crate::sched::set_thread_sched_params(
                handle.as_pthread_t(),
                policy,
                priority,
                "tickq-dispatch",
            ),
            None => false,
        }
    }

    #[cfg(not(unix))]
    pub fn start_with_sched(&self, policy: SchedPolicy, priority: SchedPriority) -> bool {
        self.start();
        let _ = (policy, priority);
        warn!("thread scheduling parameters are not supported on this platform");
        false
    }
}

impl<T, E, C: Clock> Drop for TimerQueue<T, E, C> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch<T, E, C>(shared: Arc<Shared<T, C>>, executor: Arc<E>)
where
    T: Send + 'static,
    E: Executor<T>,
    C: Clock,
{
    info!("dispatcher started");
    let mut state = shared.state.lock().expect("timer queue mutex poisoned");
    'running: while state.running {
        let mut deadline_expired = false;
        loop {
            if !state.running {
                break 'running;
            }
            let Some((root_uid, root_deadline)) =
                state.heap.peek().map(|slot| (slot.uid, slot.deadline))
            else {
                break;
            };
            if !state.jobs.contains_key(&root_uid) {
                trace!(uid = root_uid, "sweeping cancelled timer");
                state.heap.pop();
                deadline_expired = false;
                continue;
            }
            if !deadline_expired {
                // One sample serves the whole backlog of expired timers.
                let now = shared.clock.now();
                deadline_expired = root_deadline <= now;
            }
            if deadline_expired {
                debug!(uid = root_uid, "firing timer");
                let TimerEntry { job, completer } = state
                    .jobs
                    .remove(&root_uid)
                    .expect("heap root missing from job table");
                state.heap.pop();

                // Handoff and chaining both happen without the queue lock so
                // neither the executor nor a caller continuation can ever run
                // under it.
                drop(state);
                let pool_result = executor.execute(job);
                pool_result.on_ready(move |outcome| completer.complete(outcome));
                state = shared.state.lock().expect("timer queue mutex poisoned");
                deadline_expired = false;
            } else {
                let wait_for = shared.clock.until(root_deadline);
                trace!(uid = root_uid, ?wait_for, "waiting for deadline");
                let (guard, timeout) = shared
                    .cond
                    .wait_timeout_while(state, wait_for, |s| {
                        s.running
                            && s.jobs.contains_key(&root_uid)
                            && s.heap.peek().is_some_and(|slot| slot.uid == root_uid)
                    })
                    .expect("timer queue mutex poisoned");
                state = guard;
                if !state.running {
                    break 'running;
                }
                // Timeout means the root deadline elapsed; the root is
                // re-validated against the job table before it fires.
                if timeout.timed_out() {
                    deadline_expired = true;
                }
            }
        }
        trace!("idle");
        state = shared
            .cond
            .wait_while(state, |s| s.heap.is_empty() && s.running)
            .expect("timer queue mutex poisoned");
    }
    if !state.jobs.is_empty() {
        warn!(
            pending = state.jobs.len(),
            "dispatcher stopping with unprocessed timers"
        );
    }
    info!("dispatcher stopped");
}
