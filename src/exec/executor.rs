/// Process executor for scoring code
///
/// Each run gets a fresh interpreter process leading its own process group, with only
/// the stack size limited. Output is either captured directly or streamed through a
/// [`LogCollector`]. Every failure ends up in the returned [`ExecutionResult`].
use super::harness::{self, HarnessFile};
use super::preexec::{install_stack_limit, stack_limit_support, StackLimitSupport};
use super::process_set::{ActiveProcess, ActiveProcessSet};
use super::types::{
    ExecutionRequest, ExecutionResult, Failure, FAILURE_INTERNAL, FAILURE_KILLED, FAILURE_TIMEOUT,
    FAILURE_USER,
};
use crate::config::types::{ExecutorConfig, Result, SandboxError};
use crate::config::validator::validate_executor;
use crate::kernel::{sweep_group, KillReport};
use crate::logs::{LogCollector, StreamKind};
use crate::observability::audit::{events, Correlation};
use crossbeam_channel::Receiver;
use log::{debug, error, info, warn};
use std::io::{Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Environment forced on every child, after request overrides
pub const FORCED_ENV: [(&str, &str); 4] = [
    ("PYTHONUNBUFFERED", "1"),
    ("PYTHONDONTWRITEBYTECODE", "1"),
    ("PYTHONIOENCODING", "utf-8"),
    ("SCOREBOX_LOG_FORMAT", "json"),
];

const WAIT_POLL: Duration = Duration::from_millis(10);

pub type TeardownCallback = Box<dyn FnOnce() -> Result<()> + Send>;

enum Wait {
    Exited(ExitStatus),
    TimedOut,
}

/// Output seen by the time the child finished
struct Observed {
    last_stdout: Option<String>,
    stderr: String,
    partial_stdout: Option<String>,
}

/// Cloneable handle that kills children of one executor, usable from callbacks
#[derive(Debug, Clone)]
pub struct KillSwitch {
    active: ActiveProcessSet,
    grace: Duration,
}

impl KillSwitch {
    /// SIGTERM the child's group, SIGKILL after the grace period
    pub fn kill_process(&self, pid: u32) -> Option<KillReport> {
        let entry = self.active.remove(pid)?;
        Some(Self::kill_entry(&entry, self.grace))
    }

    /// Kill every child running for `job_id`; returns how many were signalled
    pub fn kill_job(&self, job_id: &str) -> usize {
        let entries = self.active.for_job(job_id);
        for entry in &entries {
            self.active.remove(entry.pid());
            info!("Killing pid {} for job {}", entry.pid(), job_id);
            Self::kill_entry(entry, self.grace);
        }
        entries.len()
    }

    /// Kill everything tracked. Safe to call repeatedly.
    pub fn kill_all(&self) -> usize {
        let entries = self.active.snapshot();
        for entry in &entries {
            self.active.remove(entry.pid());
            Self::kill_entry(entry, self.grace);
        }
        entries.len()
    }

    fn kill_entry(entry: &ActiveProcess, grace: Duration) -> KillReport {
        entry.mark_killed();
        entry.terminate(true, grace)
    }
}

pub struct ProcessExecutor {
    config: ExecutorConfig,
    active: ActiveProcessSet,
    stack_support: Option<StackLimitSupport>,
    teardown_callbacks: Mutex<Vec<TeardownCallback>>,
}

impl ProcessExecutor {
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        validate_executor(&config)?;
        let stack_support = config.stack_limit.map(stack_limit_support);
        if let Some(StackLimitSupport::Unsupported(reason)) = &stack_support {
            warn!(
                "Stack limit unavailable ({}), runs will {}",
                reason,
                if config.strict_mode { "fail" } else { "proceed unconstrained" }
            );
        }
        Ok(Self {
            config,
            active: ActiveProcessSet::new(),
            stack_support,
            teardown_callbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Whether the configured stack limit can be applied on this host
    pub fn supports_stack_limit(&self) -> bool {
        matches!(self.stack_support, Some(StackLimitSupport::Supported { .. }))
    }

    /// Run one request to completion.
    ///
    /// With a collector, both output pipes are streamed through it and it is closed
    /// before this returns.
    pub fn execute(
        &self,
        request: &ExecutionRequest,
        collector: Option<&LogCollector>,
    ) -> ExecutionResult {
        let started = Instant::now();
        let result = match self.run(request, collector) {
            Ok(result) => result,
            Err(e) => {
                error!("Execution failed before a result was produced: {}", e);
                ExecutionResult::failure(FAILURE_INTERNAL, e.to_string())
            }
        };
        if let Some(collector) = collector {
            collector.close();
        }
        events::execution_end(
            request.correlation(),
            &result.outcome(),
            started.elapsed().as_millis() as u64,
        );
        result
    }

    fn run(
        &self,
        request: &ExecutionRequest,
        collector: Option<&LogCollector>,
    ) -> Result<ExecutionResult> {
        let code = match request.code().resolve() {
            Ok(code) => code,
            Err(e) => {
                return Ok(ExecutionResult::failure(
                    FAILURE_USER,
                    format!("could not load scoring code: {}", e),
                ))
            }
        };
        let stack = match self.stack_limit_plan(request.correlation()) {
            Ok(stack) => stack,
            Err(failure) => return Ok(failure.into()),
        };
        let input = harness::encode_input(request)?;
        let harness = HarnessFile::write(&self.config.runtime_dir, &code)?;

        let mut child = self.command(request, harness.path(), stack).spawn().map_err(|e| {
            SandboxError::Process(format!(
                "failed to start {}: {}",
                self.config.interpreter.display(),
                e
            ))
        })?;
        let pid = child.id();
        let correlation = request.correlation().with_pid(pid);
        let stdin = child.stdin.take();

        // Output must be attached before any input is written
        let capture = match collector {
            Some(collector) => collector.start_stream_from_process(&mut child).map(|_| None),
            None => Capture::start(&mut child, self.config.capture_limit_bytes).map(Some),
        };
        let capture = match capture {
            Ok(capture) => capture,
            Err(e) => {
                abandon(child);
                return Err(e);
            }
        };

        let process = self.active.insert(child, request.job_id());
        let _tracked = self.active.guard(pid);
        events::execution_start(correlation.clone(), collector.is_some());

        if let Err(e) = spawn_stdin_writer(stdin, input) {
            process.terminate(false, self.config.kill_grace());
            return Err(e);
        }

        let timeout = request.timeout().unwrap_or_else(|| self.config.default_timeout());
        let wait = match wait_for_exit(&process, timeout) {
            Ok(wait) => wait,
            Err(e) => {
                process.terminate(false, self.config.kill_grace());
                return Err(e.into());
            }
        };

        let result = match wait {
            Wait::Exited(status) => {
                // The leader is reaped: stop kill_* from signalling its pid, then clear out
                // anything it left running that could keep the pipes open
                self.active.remove(pid);
                sweep_group(pid);
                let observed = self.observe(capture, collector);
                if process.was_killed() {
                    Failure::new(FAILURE_KILLED, "execution was killed before it finished")
                        .with_partial_stdout(observed.partial_stdout)
                        .into()
                } else if status.success() {
                    harness::parse_result(observed.last_stdout.as_deref())
                } else {
                    harness::parse_failed_exit(
                        &describe_exit(&status),
                        observed.last_stdout.as_deref(),
                        &observed.stderr,
                        observed.partial_stdout,
                    )
                }
            }
            Wait::TimedOut => {
                let timeout_ms = timeout.as_millis() as u64;
                events::execution_timeout(correlation, timeout_ms);
                process.terminate(false, self.config.kill_grace());
                let observed = self.observe(capture, collector);
                Failure::new(
                    FAILURE_TIMEOUT,
                    format!("execution timed out after {}ms", timeout_ms),
                )
                .with_partial_stdout(observed.partial_stdout)
                .into()
            }
        };
        debug!("pid {} finished: {}", pid, result.outcome());
        Ok(result)
    }

    fn stack_limit_plan(
        &self,
        correlation: Correlation,
    ) -> std::result::Result<Option<(u64, u64)>, Failure> {
        let Some(bytes) = self.config.stack_limit else {
            return Ok(None);
        };
        match &self.stack_support {
            Some(StackLimitSupport::Supported { hard }) => Ok(Some((bytes, *hard))),
            Some(StackLimitSupport::Unsupported(reason)) => {
                if self.config.strict_mode {
                    return Err(Failure::new(
                        FAILURE_INTERNAL,
                        format!("stack limit could not be applied: {}", reason),
                    ));
                }
                events::stack_limit_degraded(correlation, reason);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn command(
        &self,
        request: &ExecutionRequest,
        harness: &Path,
        stack: Option<(u64, u64)>,
    ) -> Command {
        let mut command = Command::new(&self.config.interpreter);
        command
            .args(&self.config.interpreter_args)
            .arg(harness)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .envs(request.env())
            .envs(FORCED_ENV)
            .process_group(0);
        if let Some(dir) = &self.config.workdir {
            command.current_dir(dir);
        }
        if let Some((bytes, hard)) = stack {
            install_stack_limit(&mut command, bytes, hard);
        }
        command
    }

    fn observe(&self, capture: Option<Capture>, collector: Option<&LogCollector>) -> Observed {
        let grace = self.config.reader_drain_grace();
        if let Some(capture) = capture {
            let (stdout, stderr) = capture.finish(grace);
            return Observed {
                last_stdout: harness::last_non_empty_line(&stdout).map(str::to_string),
                stderr,
                partial_stdout: Some(stdout),
            };
        }
        let Some(collector) = collector else {
            return Observed {
                last_stdout: None,
                stderr: String::new(),
                partial_stdout: None,
            };
        };
        if !collector.wait_for_reader_threads(grace) {
            warn!(
                "Log readers still busy {}ms after exit, using output seen so far",
                grace.as_millis()
            );
        }
        let last_stdout = collector.last_line(StreamKind::Stdout);
        Observed {
            partial_stdout: last_stdout.clone(),
            last_stdout,
            stderr: collector.last_line(StreamKind::Stderr).unwrap_or_default(),
        }
    }

    /// Handle for killing this executor's children from other threads
    pub fn kill_switch(&self) -> KillSwitch {
        KillSwitch {
            active: self.active.clone(),
            grace: self.config.kill_grace(),
        }
    }

    pub fn kill_process(&self, pid: u32) -> Option<KillReport> {
        self.kill_switch().kill_process(pid)
    }

    pub fn kill_job(&self, job_id: &str) -> usize {
        self.kill_switch().kill_job(job_id)
    }

    pub fn kill_all(&self) -> usize {
        self.kill_switch().kill_all()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_pids(&self) -> Vec<u32> {
        self.active.pids()
    }

    /// Run `callback` during [`teardown`](Self::teardown)
    pub fn register_teardown<F>(&self, callback: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        match self.teardown_callbacks.lock() {
            Ok(mut callbacks) => callbacks.push(Box::new(callback)),
            Err(_) => warn!("Teardown callback list poisoned, callback dropped"),
        }
    }

    /// Kill every child, then run teardown callbacks in registration order. A failing
    /// or panicking callback does not stop the others. Returns how many failed.
    pub fn teardown(&self) -> usize {
        let killed = self.kill_all();
        if killed > 0 {
            info!("Teardown killed {} running children", killed);
        }

        let callbacks: Vec<TeardownCallback> = match self.teardown_callbacks.lock() {
            Ok(mut callbacks) => callbacks.drain(..).collect(),
            Err(_) => Vec::new(),
        };

        let mut failures = 0;
        for (index, callback) in callbacks.into_iter().enumerate() {
            let reason = match catch_unwind(AssertUnwindSafe(callback)) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic_message(panic.as_ref()),
            };
            failures += 1;
            warn!("Teardown callback #{} failed: {}", index, reason);
            events::teardown_callback_failed(index, &reason);
        }
        failures
    }
}

impl Drop for ProcessExecutor {
    fn drop(&mut self) {
        self.teardown();
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

fn wait_for_exit(process: &ActiveProcess, timeout: Duration) -> std::io::Result<Wait> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = process.try_wait()? {
            return Ok(Wait::Exited(status));
        }
        if Instant::now() >= deadline {
            return Ok(Wait::TimedOut);
        }
        thread::sleep(WAIT_POLL);
    }
}

fn describe_exit(status: &ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exited with status {}", code),
        (None, Some(signal)) => format!("terminated by signal {}", signal),
        (None, None) => "exited abnormally".to_string(),
    }
}

/// Kill a child that never made it into the active set
fn abandon(mut child: Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Write the input document and close stdin. The writer is detached: a child that never
/// reads stdin cannot block the executor, and its pipe breaks once the child is gone.
fn spawn_stdin_writer(stdin: Option<ChildStdin>, input: Vec<u8>) -> Result<()> {
    let Some(mut stdin) = stdin else {
        return Ok(());
    };
    thread::Builder::new()
        .name("scorebox-stdin".to_string())
        .spawn(move || {
            if let Err(e) = stdin.write_all(&input) {
                debug!("Child stopped reading stdin: {}", e);
            }
        })?;
    Ok(())
}

/// Direct capture of both pipes for runs without a collector
struct Capture {
    stdout: Option<CapturedStream>,
    stderr: Option<CapturedStream>,
}

/// Bytes kept so far for one pipe, plus a signal that the reader hit EOF
struct CapturedStream {
    kept: Arc<Mutex<Vec<u8>>>,
    done: Receiver<()>,
}

impl CapturedStream {
    /// Whatever was read, waiting for EOF until `deadline` at most
    fn collect(self, deadline: Instant, grace: Duration) -> String {
        if self
            .done
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .is_err()
        {
            warn!(
                "Output pipe still open {}ms after exit, using output read so far",
                grace.as_millis()
            );
        }
        match self.kept.lock() {
            Ok(kept) => String::from_utf8_lossy(&kept).into_owned(),
            Err(_) => String::new(),
        }
    }
}

impl Capture {
    fn start(child: &mut Child, limit: usize) -> Result<Self> {
        let stdout = match child.stdout.take() {
            Some(pipe) => Some(capture_stream(pipe, limit, "stdout")?),
            None => None,
        };
        let stderr = match child.stderr.take() {
            Some(pipe) => Some(capture_stream(pipe, limit, "stderr")?),
            None => None,
        };
        Ok(Self { stdout, stderr })
    }

    /// `(stdout, stderr)` as far as they were read within `grace`
    fn finish(self, grace: Duration) -> (String, String) {
        let deadline = Instant::now() + grace;
        let stdout = self
            .stdout
            .map(|stream| stream.collect(deadline, grace))
            .unwrap_or_default();
        let stderr = self
            .stderr
            .map(|stream| stream.collect(deadline, grace))
            .unwrap_or_default();
        (stdout, stderr)
    }
}

fn capture_stream<R>(mut stream: R, limit: usize, name: &str) -> Result<CapturedStream>
where
    R: Read + Send + 'static,
{
    let kept = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    let sink = Arc::clone(&kept);
    thread::Builder::new()
        .name(format!("scorebox-{}-capture", name))
        .spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match stream.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        // Keep draining past the cap so the child never blocks on a full pipe
                        if let Ok(mut kept) = sink.lock() {
                            let room = limit.saturating_sub(kept.len());
                            kept.extend_from_slice(&chunk[..n.min(room)]);
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            let _ = done_tx.send(());
        })?;
    Ok(CapturedStream {
        kept,
        done: done_rx,
    })
}
