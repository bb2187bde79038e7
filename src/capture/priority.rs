// Realtime scheduling for the capture thread

/// Ask the OS to run the calling thread under FIFO realtime scheduling.
///
/// Returns false (after logging a warning) when the request is refused,
/// typically because the process lacks the privilege. Capture still runs,
/// it is just more exposed to missed frame deadlines.
#[cfg(unix)]
pub fn promote_current_thread() -> bool {
    // SAFETY: sched_param is plain data, and a zeroed value is a valid
    // starting point on every unix libc.
    let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
    // SAFETY: no preconditions
    let max = unsafe { libc::sched_get_priority_max(libc::SCHED_FIFO) };
    if max < 0 {
        log::warn!("Could not query SCHED_FIFO priority range");
        return false;
    }
    param.sched_priority = max;

    // SAFETY: pthread_self is always valid for the calling thread and param
    // outlives the call.
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if rc != 0 {
        log::warn!(
            "Realtime priority refused for capture thread ({}), continuing at normal priority",
            std::io::Error::from_raw_os_error(rc)
        );
        return false;
    }

    log::info!("Capture thread running with SCHED_FIFO priority {}", max);
    true
}

#[cfg(not(unix))]
pub fn promote_current_thread() -> bool {
    log::warn!("Realtime priority not supported on this platform");
    false
}
