//! Per-job view of the cancellation monitor
use super::monitor::{CancelCallback, CancellationMonitor};
use crate::config::types::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Registers one job with a [`CancellationMonitor`] and unregisters it on drop.
pub struct CancellationHandle {
    monitor: Arc<CancellationMonitor>,
    job_id: String,
    cancelled: Arc<AtomicBool>,
    registered: bool,
}

impl CancellationHandle {
    pub fn new(monitor: Arc<CancellationMonitor>, job_id: impl Into<String>) -> Self {
        Self {
            monitor,
            job_id: job_id.into(),
            cancelled: Arc::new(AtomicBool::new(false)),
            registered: false,
        }
    }

    /// Handle bound to the shared monitor and already registered
    pub fn open(job_id: impl Into<String>, on_cancel: Option<CancelCallback>) -> Result<Self> {
        let mut handle = Self::new(CancellationMonitor::global()?, job_id);
        handle.register(on_cancel)?;
        Ok(handle)
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Start watching for this job's flag. `on_cancel` runs on the monitor's poll thread.
    pub fn register(&mut self, on_cancel: Option<CancelCallback>) -> Result<()> {
        let cancelled = Arc::clone(&self.cancelled);
        self.monitor.register(
            &self.job_id,
            Box::new(move |job_id: &str| {
                cancelled.store(true, Ordering::SeqCst);
                if let Some(callback) = on_cancel {
                    callback(job_id);
                }
            }),
        )?;
        self.registered = true;
        Ok(())
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// A clone of the flag for threads that outlive a borrow of the handle
    pub fn cancelled_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn unregister(&mut self) {
        if self.registered {
            self.monitor.unregister(&self.job_id);
            self.registered = false;
        }
    }
}

impl Drop for CancellationHandle {
    fn drop(&mut self) {
        self.unregister();
    }
}
