/// Live children owned by one executor
use crate::kernel::{terminate_group, KillReport};
use crate::observability::audit::{events, Correlation};
use log::warn;
use std::collections::HashMap;
use std::process::{Child, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One running child
#[derive(Debug)]
pub struct ActiveProcess {
    pid: u32,
    job_id: Option<String>,
    child: Mutex<Child>,
    killed: AtomicBool,
}

impl ActiveProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    /// Killed through the executor rather than finishing or timing out
    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Non-blocking reap; the child lock is held only for the syscall
    pub fn try_wait(&self) -> std::io::Result<Option<ExitStatus>> {
        match self.child.lock() {
            Ok(mut child) => child.try_wait(),
            Err(_) => Err(std::io::Error::other("child handle lock poisoned")),
        }
    }

    fn reaped(&self) -> bool {
        matches!(self.try_wait(), Ok(Some(_)) | Err(_))
    }

    /// Signal the process group; SIGTERM first when `graceful`, SIGKILL otherwise.
    ///
    /// Nothing is sent once the child has been reaped, since its pid may already belong
    /// to an unrelated process.
    pub fn terminate(&self, graceful: bool, grace: Duration) -> KillReport {
        if self.reaped() {
            return KillReport {
                reaped: true,
                notes: vec!["already reaped, no signal sent".to_string()],
                ..KillReport::default()
            };
        }
        let report = terminate_group(self.pid, graceful, grace, || self.reaped());
        let correlation = Correlation {
            job_id: self.job_id.clone(),
            parent_id: None,
            pid: Some(self.pid),
        };
        events::kill_escalation(correlation, report.kill_sent);
        for note in &report.notes {
            warn!("pid {}: {}", self.pid, note);
        }
        report
    }

    pub(crate) fn mark_killed(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }
}

/// Children keyed by pid
#[derive(Debug, Clone, Default)]
pub struct ActiveProcessSet {
    inner: Arc<Mutex<HashMap<u32, Arc<ActiveProcess>>>>,
}

impl ActiveProcessSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, child: Child, job_id: Option<&str>) -> Arc<ActiveProcess> {
        let pid = child.id();
        let entry = Arc::new(ActiveProcess {
            pid,
            job_id: job_id.map(str::to_string),
            child: Mutex::new(child),
            killed: AtomicBool::new(false),
        });
        if let Ok(mut map) = self.inner.lock() {
            map.insert(pid, Arc::clone(&entry));
        }
        entry
    }

    pub fn remove(&self, pid: u32) -> Option<Arc<ActiveProcess>> {
        self.inner.lock().ok().and_then(|mut map| map.remove(&pid))
    }

    pub fn get(&self, pid: u32) -> Option<Arc<ActiveProcess>> {
        self.inner.lock().ok().and_then(|map| map.get(&pid).cloned())
    }

    pub fn for_job(&self, job_id: &str) -> Vec<Arc<ActiveProcess>> {
        self.snapshot()
            .into_iter()
            .filter(|entry| entry.job_id() == Some(job_id))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Arc<ActiveProcess>> {
        self.inner
            .lock()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self
            .inner
            .lock()
            .map(|map| map.keys().copied().collect())
            .unwrap_or_default();
        pids.sort_unstable();
        pids
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes `pid` from the set when dropped
    pub fn guard(&self, pid: u32) -> ActiveGuard {
        ActiveGuard {
            set: self.clone(),
            pid,
        }
    }
}

pub struct ActiveGuard {
    set: ActiveProcessSet,
    pid: u32,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.set.remove(self.pid);
    }
}
