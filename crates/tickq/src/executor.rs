//! Executor capability consumed by the timer queue.

use crate::async_result::AsyncResult;

/// A movable unit of work producing a value of type `T`.
pub type Job<T> = Box<dyn FnOnce() -> T + Send + 'static>;

/// Bounded-concurrency job execution returning a chainable result handle.
///
/// The handle's [`on_ready`](AsyncResult::on_ready) continuation is how the
/// timer queue forwards pool outcomes into caller-facing handles; any
/// executor satisfying this trait can stand in for [`ThreadPool`].
///
/// [`ThreadPool`]: crate::pool::ThreadPool
pub trait Executor<T>: Send + Sync + 'static {
    fn execute(&self, job: Job<T>) -> AsyncResult<T>;
}
