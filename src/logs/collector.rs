/// Buffered log collection with periodic and threshold-triggered flushing
use super::reader::StreamReader;
use super::record::{LogBuffer, LogRecord, StreamKind};
use super::LogSink;
use crate::config::types::{CollectorConfig, Result, SandboxError};
use crate::config::validator::validate_collector;
use crate::observability::audit::events;
use crate::utils::join_with_timeout;
use crossbeam_channel::{select, Receiver, Sender};
use log::{debug, warn};
use std::io::Read;
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// State shared between the collector, its readers and its flush thread
struct Shared {
    sink: Box<dyn LogSink>,
    threshold_bytes: usize,
    max_bytes: usize,
    buffer: Mutex<LogBuffer>,
    /// Serializes deliveries; never held while appending
    flush_lock: Mutex<()>,
    /// Set once readers are drained; later records are dropped
    closed: AtomicBool,
    /// Set after a failed delivery; threshold triggers wait for the next tick
    backoff: AtomicBool,
    trigger: Sender<()>,
}

impl Shared {
    fn buffer(&self) -> Result<MutexGuard<'_, LogBuffer>> {
        self.buffer
            .lock()
            .map_err(|_| SandboxError::Process("log buffer lock poisoned".to_string()))
    }

    fn emit(&self, record: LogRecord) {
        if self.closed.load(Ordering::SeqCst) {
            debug!("Dropping record emitted after close: {}", record.message);
            return;
        }
        let (size, shed) = match self.buffer() {
            Ok(mut buffer) => {
                buffer.push(record);
                let shed = buffer.shed_oldest(self.max_bytes);
                (buffer.bytes(), shed)
            }
            Err(e) => {
                warn!("{}", e);
                return;
            }
        };
        self.report_shed(shed);
        if size >= self.threshold_bytes && !self.backoff.load(Ordering::SeqCst) {
            // A pending trigger already covers this record
            let _ = self.trigger.try_send(());
        }
    }

    fn report_shed(&self, shed: usize) {
        if shed == 0 {
            return;
        }
        warn!(
            "{} sink buffer over {} bytes, dropped {} oldest records",
            self.sink.name(),
            self.max_bytes,
            shed
        );
        events::flush_failed(
            self.sink.correlation(),
            self.sink.name(),
            shed,
            "buffer limit reached, oldest records dropped",
        );
    }

    fn flush(&self) -> Result<usize> {
        let _serial = self
            .flush_lock
            .lock()
            .map_err(|_| SandboxError::Process("flush lock poisoned".to_string()))?;

        let batch = self.buffer()?.take();
        if batch.is_empty() {
            return Ok(0);
        }

        match self.sink.deliver(&batch) {
            Ok(()) => {
                let delivered = batch.len();
                self.backoff.store(false, Ordering::SeqCst);
                self.buffer()?.mark_flushed();
                debug!("{} sink accepted {} records", self.sink.name(), delivered);
                Ok(delivered)
            }
            Err(e) => {
                self.backoff.store(true, Ordering::SeqCst);
                warn!(
                    "{} sink failed, keeping {} records for the next cycle: {}",
                    self.sink.name(),
                    batch.len(),
                    e
                );
                events::flush_failed(
                    self.sink.correlation(),
                    self.sink.name(),
                    batch.len(),
                    &e.to_string(),
                );
                let shed = {
                    let mut buffer = self.buffer()?;
                    buffer.restore_front(batch);
                    buffer.shed_oldest(self.max_bytes)
                };
                self.report_shed(shed);
                Err(e)
            }
        }
    }
}

/// Streams a child's output to a [`LogSink`].
///
/// Records from each stream keep their order; ordering across stdout and stderr is
/// whatever the reader threads observe.
pub struct LogCollector {
    shared: Arc<Shared>,
    config: CollectorConfig,
    shutdown_tx: Sender<()>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    readers: Mutex<Vec<StreamReader>>,
    closing: AtomicBool,
}

impl LogCollector {
    /// Create a collector and start its flush thread
    pub fn new(sink: Box<dyn LogSink>, config: CollectorConfig) -> Result<Self> {
        validate_collector(&config)?;
        let (trigger_tx, trigger_rx) = crossbeam_channel::bounded(1);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);

        let shared = Arc::new(Shared {
            sink,
            threshold_bytes: config.flush_threshold_bytes.max(1),
            max_bytes: config.max_buffered_bytes.max(config.flush_threshold_bytes),
            buffer: Mutex::new(LogBuffer::new()),
            flush_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            backoff: AtomicBool::new(false),
            trigger: trigger_tx,
        });

        let flusher = spawn_flusher(
            Arc::clone(&shared),
            config.flush_interval(),
            trigger_rx,
            shutdown_rx,
        )?;

        Ok(Self {
            shared,
            config,
            shutdown_tx,
            flusher: Mutex::new(Some(flusher)),
            readers: Mutex::new(Vec::new()),
            closing: AtomicBool::new(false),
        })
    }

    /// Take the child's stdout and stderr pipes and start a reader on each
    pub fn start_stream_from_process(&self, child: &mut Child) -> Result<()> {
        if let Some(stdout) = child.stdout.take() {
            self.attach_reader(StreamKind::Stdout, stdout)?;
        }
        if let Some(stderr) = child.stderr.take() {
            self.attach_reader(StreamKind::Stderr, stderr)?;
        }
        Ok(())
    }

    /// Start a reader thread feeding this collector from any byte source
    pub fn attach_reader<R>(&self, stream: StreamKind, source: R) -> Result<()>
    where
        R: Read + Send + 'static,
    {
        if self.closing.load(Ordering::SeqCst) {
            return Err(SandboxError::Process(
                "log collector is already closed".to_string(),
            ));
        }
        let shared = Arc::clone(&self.shared);
        let reader = StreamReader::spawn(stream, source, move |record| shared.emit(record))?;
        self.lock_readers()?.push(reader);
        Ok(())
    }

    /// Append one record directly
    pub fn emit(&self, record: LogRecord) {
        self.shared.emit(record);
    }

    /// Deliver everything buffered now. Returns how many records the sink accepted.
    pub fn flush(&self) -> Result<usize> {
        self.shared.flush()
    }

    /// Wait for every reader to reach EOF within one shared deadline
    pub fn wait_for_reader_threads(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let readers = match self.lock_readers() {
            Ok(readers) => readers,
            Err(e) => {
                warn!("{}", e);
                return false;
            }
        };
        readers
            .iter()
            .all(|reader| reader.wait(deadline.saturating_duration_since(Instant::now())))
    }

    /// Last non-blank line read from `stream`
    pub fn last_line(&self, stream: StreamKind) -> Option<String> {
        let readers = self.lock_readers().ok()?;
        readers
            .iter()
            .rev()
            .find(|reader| reader.stream() == stream)
            .and_then(StreamReader::last_line)
    }

    /// Records buffered but not yet delivered
    pub fn pending_records(&self) -> usize {
        self.shared.buffer().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Stop periodic flushing, drain the readers and deliver what is left.
    /// Later calls do nothing.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.shutdown_tx.try_send(());
        let flusher = self.flusher.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = flusher {
            join_with_timeout(handle, self.config.reader_join_timeout(), "log-flusher");
        }

        let join_timeout = self.config.reader_join_timeout();
        if let Ok(mut readers) = self.lock_readers() {
            let deadline = Instant::now() + join_timeout;
            for reader in readers.iter_mut() {
                if !reader.join(deadline.saturating_duration_since(Instant::now())) {
                    warn!(
                        "{} reader still running after {}ms, detaching",
                        reader.stream(),
                        join_timeout.as_millis()
                    );
                }
            }
        }

        self.shared.closed.store(true, Ordering::SeqCst);
        if let Err(e) = self.shared.flush() {
            warn!("Final flush failed, {} records undelivered: {}", self.pending_records(), e);
        }
    }

    fn lock_readers(&self) -> Result<MutexGuard<'_, Vec<StreamReader>>> {
        self.readers
            .lock()
            .map_err(|_| SandboxError::Process("reader list lock poisoned".to_string()))
    }
}

impl Drop for LogCollector {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_flusher(
    shared: Arc<Shared>,
    interval: Duration,
    trigger_rx: Receiver<()>,
    shutdown_rx: Receiver<()>,
) -> Result<JoinHandle<()>> {
    let ticker = crossbeam_channel::tick(interval);
    let handle = std::thread::Builder::new()
        .name("scorebox-log-flusher".to_string())
        .spawn(move || loop {
            select! {
                recv(shutdown_rx) -> _ => break,
                recv(trigger_rx) -> _ => {
                    if !shared.backoff.load(Ordering::SeqCst) {
                        let _ = shared.flush();
                    }
                }
                recv(ticker) -> _ => {
                    let _ = shared.flush();
                }
            }
        })?;
    Ok(handle)
}
