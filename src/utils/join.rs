use log::{debug, warn};
use std::thread::JoinHandle;
use std::time::Duration;

/// Join a worker thread, giving up after `timeout`.
///
/// `JoinHandle::join` cannot time out, so the join happens on a helper thread and the
/// result comes back over a channel. A thread that misses the deadline is left detached
/// and exits with the process. Returns true only if the thread finished without panicking.
pub fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration, label: &str) -> bool {
    if handle.is_finished() {
        return report(label, handle.join().map_err(|e| format!("{:?}", e)));
    }

    let (tx, rx) = crossbeam_channel::bounded(1);
    let spawned = std::thread::Builder::new()
        .name(format!("{}-join", label))
        .spawn(move || {
            let _ = tx.send(handle.join().map_err(|e| format!("{:?}", e)));
        });
    if let Err(e) = spawned {
        warn!("Could not spawn joiner for {}: {}", label, e);
        return false;
    }

    match rx.recv_timeout(timeout) {
        Ok(result) => report(label, result),
        Err(_) => {
            warn!(
                "{} did not stop within {}ms, leaving it detached",
                label,
                timeout.as_millis()
            );
            false
        }
    }
}

fn report(label: &str, result: std::result::Result<(), String>) -> bool {
    match result {
        Ok(()) => {
            debug!("{} stopped", label);
            true
        }
        Err(e) => {
            warn!("{} panicked: {}", label, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn finished_thread_joins() {
        let handle = thread::spawn(|| {});
        assert!(join_with_timeout(handle, Duration::from_secs(1), "quick"));
    }

    #[test]
    fn stuck_thread_is_detached_after_timeout() {
        let handle = thread::spawn(|| thread::sleep(Duration::from_secs(2)));
        assert!(!join_with_timeout(handle, Duration::from_millis(50), "slow"));
    }

    #[test]
    fn panicking_thread_reports_failure() {
        let handle = thread::spawn(|| panic!("boom"));
        assert!(!join_with_timeout(handle, Duration::from_secs(1), "panicky"));
    }
}
