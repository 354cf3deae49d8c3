//! Thread-scheduling adapter over the POSIX policy set.
//!
//! Failure to apply parameters is a soft failure: it is logged and reported
//! as a boolean, and the affected thread keeps its default scheduling.

use tracing::{info, warn};

/// POSIX scheduling policies recognized by the adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedPolicy {
    Other,
    Fifo,
    RoundRobin,
}

/// Priority selector: the policy's bounds, or an explicit value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedPriority {
    Min,
    Max,
    Explicit(i32),
}

#[cfg(unix)]
pub fn set_thread_sched_params(
    handle: libc::pthread_t,
    policy: SchedPolicy,
    priority: SchedPriority,
    thread_tag: &str,
) -> bool {
    let raw_policy = match policy {
        SchedPolicy::Other => libc::SCHED_OTHER,
        SchedPolicy::Fifo => libc::SCHED_FIFO,
        SchedPolicy::RoundRobin => libc::SCHED_RR,
    };
    let raw_priority = match priority {
        SchedPriority::Min => unsafe { libc::sched_get_priority_min(raw_policy) },
        SchedPriority::Max => unsafe { libc::sched_get_priority_max(raw_policy) },
        SchedPriority::Explicit(value) => value,
    };

    let mut previous_policy: libc::c_int = 0;
    let mut sched: libc::sched_param = unsafe { std::mem::zeroed() };
    unsafe { libc::pthread_getschedparam(handle, &mut previous_policy, &mut sched) };
    sched.sched_priority = raw_priority;

    let rc = unsafe { libc::pthread_setschedparam(handle, raw_policy, &sched) };
    if rc == 0 {
        info!(
            thread = thread_tag,
            ?policy,
            priority = raw_priority,
            "set sched params"
        );
        true
    } else {
        warn!(
            thread = thread_tag,
            ?policy,
            priority = raw_priority,
            error = %std::io::Error::from_raw_os_error(rc),
            "failed to set sched params"
        );
        false
    }
}

#[cfg(not(unix))]
pub fn set_thread_sched_params(
    _handle: usize,
    _policy: SchedPolicy,
    _priority: SchedPriority,
    thread_tag: &str,
) -> bool {
    warn!(
        thread = thread_tag,
        "thread scheduling parameters are not supported on this platform"
    );
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::{SchedPolicy, SchedPriority, set_thread_sched_params};

    #[test]
    fn default_policy_applies_to_current_thread() {
        let ok = set_thread_sched_params(
            unsafe { libc::pthread_self() },
            SchedPolicy::Other,
            SchedPriority::Min,
            "sched-test",
        );
        assert!(ok);
    }

    #[test]
    fn realtime_policy_reports_without_crashing() {
        // Succeeds only with the right privileges; either answer is valid.
        let _ = set_thread_sched_params(
            unsafe { libc::pthread_self() },
            SchedPolicy::Fifo,
            SchedPriority::Max,
            "sched-test",
        );
    }
}
