/// Append-to-remote-list sink
///
/// Raw lines go to the list `<namespace>:<workspace>:<job-id>`. The companion hash
/// `<list-key>:meta` holds `last_write` (epoch ms), and both keys get their TTL
/// refreshed on every flush.
use super::record::{now_millis, LogRecord};
use super::LogSink;
use crate::config::types::{ListSinkConfig, Result, SandboxError};
use crate::config::validator::validate_list_sink;
use crate::observability::audit::Correlation;
use crate::store::KeyValueStore;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// CSI sequences, OSC sequences (BEL or ST terminated) and two-byte escapes
static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .expect("ANSI escape pattern is valid")
});

pub const META_FIELD: &str = "last_write";

pub struct RemoteListSink {
    store: Arc<dyn KeyValueStore>,
    config: ListSinkConfig,
    job_id: String,
    list_key: String,
    meta_key: String,
    /// Dedup key of the last delivered line; only advanced after a successful write
    last_frame: Mutex<Option<String>>,
}

impl RemoteListSink {
    pub fn new(store: Arc<dyn KeyValueStore>, config: ListSinkConfig, job_id: &str) -> Result<Self> {
        validate_list_sink(&config)?;
        if job_id.trim().is_empty() {
            return Err(SandboxError::Config("list sink needs a job id".to_string()));
        }
        let list_key = format!("{}:{}:{}", config.namespace, config.workspace, job_id);
        let meta_key = format!("{}:meta", list_key);
        Ok(Self {
            store,
            config,
            job_id: job_id.to_string(),
            list_key,
            meta_key,
            last_frame: Mutex::new(None),
        })
    }

    pub fn list_key(&self) -> &str {
        &self.list_key
    }

    pub fn meta_key(&self) -> &str {
        &self.meta_key
    }

    /// Lines to append for this batch and the dedup state after it
    fn prepare(&self, records: &[LogRecord], previous: Option<String>) -> (Vec<String>, Option<String>) {
        let mut last = previous;
        let mut lines = Vec::with_capacity(records.len());
        for record in records {
            let line = record.raw_text();
            if !self.config.dedup_spinner_frames {
                lines.push(line.to_string());
                continue;
            }
            let frame = spinner_frame(line);
            if frame.is_some() && frame == last {
                continue;
            }
            last = frame;
            lines.push(line.to_string());
        }
        (lines, last)
    }
}

impl LogSink for RemoteListSink {
    fn name(&self) -> &'static str {
        "list"
    }

    fn deliver(&self, records: &[LogRecord]) -> Result<()> {
        let mut last_frame = self
            .last_frame
            .lock()
            .map_err(|_| SandboxError::Process("dedup state lock poisoned".to_string()))?;
        let (lines, next_frame) = self.prepare(records, last_frame.clone());

        self.store.append_with_meta(
            &self.list_key,
            &lines,
            &self.meta_key,
            META_FIELD,
            &now_millis().to_string(),
            Duration::from_secs(self.config.ttl_secs),
        )?;
        *last_frame = next_frame;
        Ok(())
    }

    fn correlation(&self) -> Correlation {
        Correlation::job(&self.job_id)
    }
}

/// Remove terminal escape sequences and carriage returns
pub fn strip_ansi(line: &str) -> String {
    ANSI_ESCAPE.replace_all(line, "").replace('\r', "")
}

/// For progress-indicator lines (first visible glyph is not alphanumeric) the text
/// after that glyph, used to recognise repeated frames. `None` for ordinary lines.
pub fn spinner_frame(line: &str) -> Option<String> {
    let visible = strip_ansi(line);
    let visible = visible.trim();
    let mut chars = visible.chars();
    let glyph = chars.next()?;
    if glyph.is_alphanumeric() {
        return None;
    }
    let rest = chars.as_str().trim();
    if rest.is_empty() {
        return None;
    }
    Some(rest.to_string())
}
