use std::any::Any;

use thiserror::Error;

/// Result alias for job outcomes delivered through a result channel.
pub type TaskResult<T> = Result<T, TaskError>;

/// Failures surfaced through a timer or pool result handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The job was removed from the queue before it ran.
    #[error("job was cancelled before it ran")]
    Cancelled,

    /// The job panicked while executing; the payload message is preserved.
    #[error("job panicked: {0}")]
    Panicked(String),

    /// The write-end of the result channel was dropped without resolving.
    #[error("result channel was abandoned before resolving")]
    Abandoned,
}

/// Renders a `catch_unwind` payload as a message, keeping `&str`/`String`
/// panics verbatim.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "job panicked with a non-string payload".to_string()
    }
}
