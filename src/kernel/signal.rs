/// Process-group signalling for spawned children
///
/// Every child is started as the leader of its own process group, so signals are
/// sent to the whole group and reach anything the scoring code forked.
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::time::{Duration, Instant};

const POLL_STEP: Duration = Duration::from_millis(10);

/// What a termination attempt did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KillReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    /// Exited inside the grace period after SIGTERM
    pub exited_gracefully: bool,
    /// Reaped at all by the end of the sequence
    pub reaped: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

/// Signal the process group led by `pid`, falling back to the single process when the
/// group is already gone.
pub fn signal_group(pid: u32, sig: Signal) -> Result<(), Errno> {
    let raw = Pid::from_raw(pid as i32);
    match signal::killpg(raw, sig) {
        Ok(()) => Ok(()),
        Err(_) => signal::kill(raw, sig),
    }
}

/// SIGKILL whatever is left in the group led by `pid` after the leader was reaped.
///
/// Only the group is targeted; the bare pid is never signalled since it may have been
/// reused. Returns whether any member was found.
pub fn sweep_group(pid: u32) -> bool {
    match signal::killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => {
            debug!("Killed stray members of process group {}", pid);
            true
        }
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!("Sweeping process group {} failed: {}", pid, e);
            false
        }
    }
}

/// Whether a process with this pid still exists (zombies included)
pub fn process_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Terminate the group led by `pid`.
///
/// With `graceful` set, SIGTERM goes first and SIGKILL only follows if the leader has
/// not been reaped within `grace`. Otherwise SIGKILL is sent straight away. `reaped`
/// is polled to learn whether the leader has exited; it must not block.
pub fn terminate_group<F>(pid: u32, graceful: bool, grace: Duration, mut reaped: F) -> KillReport
where
    F: FnMut() -> bool,
{
    let mut report = KillReport::default();
    let start = Instant::now();

    if graceful {
        match signal_group(pid, Signal::SIGTERM) {
            Ok(()) => report.term_sent = true,
            Err(e) => report.notes.push(format!("SIGTERM failed: {}", e)),
        }
        if wait_reaped(&mut reaped, grace) {
            report.exited_gracefully = true;
            report.reaped = true;
            report.waited_ms = start.elapsed().as_millis() as u64;
            return report;
        }
    }

    match signal_group(pid, Signal::SIGKILL) {
        Ok(()) => report.kill_sent = true,
        // ESRCH: already gone between the last poll and now
        Err(Errno::ESRCH) => report.notes.push("process exited before SIGKILL".to_string()),
        Err(e) => report.notes.push(format!("SIGKILL failed: {}", e)),
    }

    report.reaped = wait_reaped(&mut reaped, grace);
    if !report.reaped {
        report.notes.push(format!(
            "pid {} not reaped {}ms after SIGKILL",
            pid,
            grace.as_millis()
        ));
    }
    report.waited_ms = start.elapsed().as_millis() as u64;
    report
}

fn wait_reaped<F: FnMut() -> bool>(reaped: &mut F, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    loop {
        if reaped() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(POLL_STEP);
    }
}
