//! Shared helpers for integration tests

#![allow(dead_code)]

use scorebox::config::types::ExecutorConfig;
use scorebox::logs::{LogRecord, LogSink};
use scorebox::{ProcessExecutor, Result};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub fn python3_available() -> bool {
    Command::new("python3")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Tests spawning Python bail out early with a note when it is missing
pub fn skip_without_python() -> bool {
    if python3_available() {
        return false;
    }
    eprintln!("python3 not available, skipping");
    true
}

pub fn executor_config(runtime: &tempfile::TempDir) -> ExecutorConfig {
    ExecutorConfig {
        runtime_dir: runtime.path().to_path_buf(),
        kill_grace_ms: 500,
        reader_drain_grace_ms: 1_000,
        ..ExecutorConfig::default()
    }
}

pub fn executor(runtime: &tempfile::TempDir) -> ProcessExecutor {
    ProcessExecutor::new(executor_config(runtime)).unwrap()
}

pub fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

/// Sink that keeps every delivered record
#[derive(Clone, Default)]
pub struct RecordingSink {
    pub records: Arc<Mutex<Vec<LogRecord>>>,
}

impl RecordingSink {
    pub fn messages(&self) -> Vec<String> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.message.clone())
            .collect()
    }
}

impl LogSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn deliver(&self, records: &[LogRecord]) -> Result<()> {
        self.records.lock().unwrap().extend_from_slice(records);
        Ok(())
    }
}
