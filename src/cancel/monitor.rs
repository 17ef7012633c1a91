/// Process-wide cancellation monitor
///
/// Jobs register a callback under their id. While at least one job is registered a single
/// poll thread checks every registered job's flag key with one batched read per tick. A
/// present flag is consumed: the job is unregistered, the key deleted and the callback
/// run exactly once.
use crate::config::types::{MonitorConfig, Result, SandboxError};
use crate::config::validator::validate_monitor;
use crate::config::Settings;
use crate::exec::executor::panic_message;
use crate::observability::audit::events;
use crate::store::{open_store, KeyValueStore};
use crossbeam_channel::{RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Invoked with the job id when its cancellation flag is seen
pub type CancelCallback = Box<dyn FnOnce(&str) + Send>;

static GLOBAL: Lazy<Mutex<Option<Arc<CancellationMonitor>>>> = Lazy::new(|| Mutex::new(None));

struct Poller {
    generation: u64,
    shutdown: Sender<()>,
}

struct Inner {
    store: Arc<dyn KeyValueStore>,
    config: MonitorConfig,
    registry: Mutex<HashMap<String, CancelCallback>>,
    /// Present iff a poll thread is meant to be running. Lock order: poller, then registry.
    poller: Mutex<Option<Poller>>,
    generations: AtomicU64,
    live_threads: AtomicUsize,
}

pub struct CancellationMonitor {
    inner: Arc<Inner>,
}

impl CancellationMonitor {
    pub fn new(store: Arc<dyn KeyValueStore>, config: MonitorConfig) -> Result<Self> {
        validate_monitor(&config)?;
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                config,
                registry: Mutex::new(HashMap::new()),
                poller: Mutex::new(None),
                generations: AtomicU64::new(0),
                live_threads: AtomicUsize::new(0),
            }),
        })
    }

    /// The shared instance, built on first use from `SCOREBOX_*` settings
    pub fn global() -> Result<Arc<CancellationMonitor>> {
        let mut slot = lock(&GLOBAL, "global monitor")?;
        if let Some(monitor) = slot.as_ref() {
            return Ok(Arc::clone(monitor));
        }
        let settings = Settings::from_env()?;
        let store = open_store(&settings.store)?;
        let monitor = Arc::new(CancellationMonitor::new(store, settings.monitor)?);
        if !monitor.watches_shared_store() {
            warn!(
                "Cancellation monitor is backed by a process-local store; \
                 flags set by other processes will not cancel jobs here"
            );
        }
        *slot = Some(Arc::clone(&monitor));
        Ok(monitor)
    }

    /// Replace the shared instance, returning the previous one
    pub fn install_global(monitor: Arc<CancellationMonitor>) -> Option<Arc<CancellationMonitor>> {
        match GLOBAL.lock() {
            Ok(mut slot) => slot.replace(monitor),
            Err(_) => None,
        }
    }

    /// Drop the shared instance so the next `global()` builds a fresh one
    #[doc(hidden)]
    pub fn reset_global() {
        let previous = GLOBAL.lock().ok().and_then(|mut slot| slot.take());
        if let Some(monitor) = previous {
            monitor.inner.stop_poller();
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// False when flags can only be set from inside this process
    pub fn watches_shared_store(&self) -> bool {
        self.inner.store.is_shared()
    }

    /// Register `callback` for `job_id`, replacing any earlier one, and make sure the
    /// poll thread is running.
    pub fn register(&self, job_id: &str, callback: CancelCallback) -> Result<()> {
        let replaced = lock(&self.inner.registry, "cancellation registry")?
            .insert(job_id.to_string(), callback)
            .is_some();
        if replaced {
            debug!("Replaced cancellation callback for job {}", job_id);
        }
        Inner::ensure_poller(&self.inner)
    }

    /// Forget `job_id`; the poll thread stops once nothing is registered
    pub fn unregister(&self, job_id: &str) -> bool {
        let removed = match self.inner.registry.lock() {
            Ok(mut registry) => registry.remove(job_id).is_some(),
            Err(_) => false,
        };
        if removed {
            self.inner.stop_if_idle();
        }
        removed
    }

    /// Controller side: raise the flag for `job_id`
    pub fn request_cancellation(&self, job_id: &str) -> Result<()> {
        self.inner
            .store
            .set(&self.inner.config.flag_key(job_id), "1")
    }

    pub fn registered_count(&self) -> usize {
        self.inner.registry.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_registered(&self, job_id: &str) -> bool {
        self.inner
            .registry
            .lock()
            .map(|r| r.contains_key(job_id))
            .unwrap_or(false)
    }

    /// Whether a poll thread is currently assigned
    pub fn is_running(&self) -> bool {
        self.inner.poller.lock().map(|p| p.is_some()).unwrap_or(false)
    }

    /// Poll threads that have not exited yet (0 or 1 outside brief hand-overs)
    pub fn live_poll_threads(&self) -> usize {
        self.inner.live_threads.load(Ordering::SeqCst)
    }
}

impl Drop for CancellationMonitor {
    fn drop(&mut self) {
        self.inner.stop_poller();
    }
}

impl Inner {
    fn ensure_poller(inner: &Arc<Inner>) -> Result<()> {
        let mut poller = lock(&inner.poller, "poller slot")?;
        if poller.is_some() {
            return Ok(());
        }

        let generation = inner.generations.fetch_add(1, Ordering::SeqCst);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
        let thread_inner = Arc::clone(inner);
        inner.live_threads.fetch_add(1, Ordering::SeqCst);
        let spawned = std::thread::Builder::new()
            .name("scorebox-cancel-poll".to_string())
            .spawn(move || {
                let interval = thread_inner.config.poll_interval();
                loop {
                    match shutdown_rx.recv_timeout(interval) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    thread_inner.poll_once();
                    if thread_inner.retire_if_idle(generation) {
                        break;
                    }
                }
                thread_inner.live_threads.fetch_sub(1, Ordering::SeqCst);
                debug!("Cancellation poll thread stopped");
            });

        match spawned {
            Ok(_) => {
                *poller = Some(Poller {
                    generation,
                    shutdown: shutdown_tx,
                });
                info!(
                    "Cancellation poll thread started ({}ms interval)",
                    inner.config.poll_interval_ms
                );
                Ok(())
            }
            Err(e) => {
                inner.live_threads.fetch_sub(1, Ordering::SeqCst);
                Err(SandboxError::Io(e))
            }
        }
    }

    /// One tick: a single batched read over every registered job's flag
    fn poll_once(&self) {
        let job_ids: Vec<String> = match self.registry.lock() {
            Ok(registry) => registry.keys().cloned().collect(),
            Err(_) => return,
        };
        if job_ids.is_empty() {
            return;
        }

        let keys: Vec<String> = job_ids.iter().map(|id| self.config.flag_key(id)).collect();
        let flags = match self.store.get_many(&keys) {
            Ok(flags) => flags,
            Err(e) => {
                warn!("Cancellation flag lookup failed, retrying next tick: {}", e);
                events::flag_lookup_failed(job_ids.len(), &e.to_string());
                return;
            }
        };

        for ((job_id, key), flag) in job_ids.iter().zip(&keys).zip(flags) {
            if flag.is_none() {
                continue;
            }
            self.fire(job_id, key);
        }
    }

    fn fire(&self, job_id: &str, key: &str) {
        // Taking the callback out of the registry makes it run at most once
        let callback = match self.registry.lock() {
            Ok(mut registry) => registry.remove(job_id),
            Err(_) => None,
        };
        let Some(callback) = callback else {
            return;
        };

        if let Err(e) = self.store.delete(key) {
            warn!("Could not delete cancellation flag {}: {}", key, e);
        }
        events::cancellation_fired(job_id);
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(job_id))) {
            error!(
                "Cancellation callback for job {} panicked: {}",
                job_id,
                panic_message(panic.as_ref())
            );
        }
    }

    /// Called by the poll thread after each tick; true means the thread should exit.
    /// A thread no longer owning the slot always exits. The owner clears the slot when
    /// nothing is registered, checked under the slot lock so a concurrent `register`
    /// either sees the slot empty or is seen here.
    fn retire_if_idle(&self, generation: u64) -> bool {
        let Ok(mut poller) = self.poller.lock() else {
            return true;
        };
        if poller.as_ref().map(|p| p.generation) != Some(generation) {
            return true;
        }
        let idle = self.registry.lock().map(|r| r.is_empty()).unwrap_or(true);
        if idle {
            *poller = None;
        }
        idle
    }

    fn stop_if_idle(&self) {
        let Ok(mut poller) = self.poller.lock() else {
            return;
        };
        let idle = self.registry.lock().map(|r| r.is_empty()).unwrap_or(true);
        if idle {
            if let Some(current) = poller.take() {
                let _ = current.shutdown.try_send(());
            }
        }
    }

    fn stop_poller(&self) {
        let current = self.poller.lock().ok().and_then(|mut p| p.take());
        if let Some(current) = current {
            let _ = current.shutdown.try_send(());
        }
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| SandboxError::Process(format!("{} lock poisoned", what)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::{Duration, Instant};

    fn monitor(store: &Arc<MemoryStore>, interval_ms: u64) -> CancellationMonitor {
        let config = MonitorConfig {
            poll_interval_ms: interval_ms,
            flag_prefix: "cancel".to_string(),
        };
        CancellationMonitor::new(Arc::clone(store) as Arc<dyn KeyValueStore>, config).unwrap()
    }

    fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    fn counting_callback(hits: &Arc<AtomicUsize>) -> CancelCallback {
        let hits = Arc::clone(hits);
        Box::new(move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn register_starts_and_last_unregister_stops_poller() {
        let store = Arc::new(MemoryStore::new());
        let monitor = monitor(&store, 20);
        assert!(!monitor.is_running());

        monitor.register("a", Box::new(|_| {})).unwrap();
        monitor.register("b", Box::new(|_| {})).unwrap();
        assert!(monitor.is_running());
        assert_eq!(monitor.live_poll_threads(), 1);

        monitor.unregister("a");
        assert!(monitor.is_running());
        monitor.unregister("b");
        assert!(!monitor.is_running());
        assert!(wait_until(Duration::from_millis(40), || monitor.live_poll_threads() == 0));
    }

    #[test]
    fn flag_fires_once_and_is_consumed() {
        let store = Arc::new(MemoryStore::new());
        let monitor = monitor(&store, 10);
        let hits = Arc::new(AtomicUsize::new(0));
        monitor.register("job", counting_callback(&hits)).unwrap();

        monitor.request_cancellation("job").unwrap();
        assert!(wait_until(Duration::from_secs(2), || hits.load(Ordering::SeqCst) == 1));
        assert!(!store.contains("cancel:job"));
        assert!(!monitor.is_registered("job"));

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(wait_until(Duration::from_secs(1), || monitor.live_poll_threads() == 0));
    }

    #[test]
    fn one_batched_lookup_per_tick() {
        let store = Arc::new(MemoryStore::new());
        let monitor = monitor(&store, 50);
        for i in 0..20 {
            monitor.register(&format!("job-{}", i), Box::new(|_| {})).unwrap();
        }
        std::thread::sleep(Duration::from_millis(275));
        // Twenty jobs, yet at most one lookup per 50ms tick
        let calls = store.get_many_calls();
        assert!((1..=6).contains(&calls), "unexpected lookup count {}", calls);
    }

    #[test]
    fn panicking_callback_does_not_stop_others() {
        let store = Arc::new(MemoryStore::new());
        let monitor = monitor(&store, 10);
        let hits = Arc::new(AtomicUsize::new(0));
        monitor.register("bad", Box::new(|_| panic!("callback blew up"))).unwrap();
        monitor.register("good", counting_callback(&hits)).unwrap();

        store.set("cancel:bad", "1").unwrap();
        store.set("cancel:good", "1").unwrap();
        assert!(wait_until(Duration::from_secs(2), || hits.load(Ordering::SeqCst) == 1));
        assert_eq!(monitor.registered_count(), 0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let config = MonitorConfig {
            poll_interval_ms: 0,
            ..MonitorConfig::default()
        };
        assert!(CancellationMonitor::new(store, config).is_err());
    }

    #[test]
    fn in_memory_store_is_reported_as_local() {
        let store = Arc::new(MemoryStore::new());
        assert!(!monitor(&store, 20).watches_shared_store());
    }
}
