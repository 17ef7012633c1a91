/// Log records produced from child output and the buffer they accumulate in
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Instant;

/// Log level for structured logging
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Parse the level names emitted by common logging libraries
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "trace" | "debug" => Some(LogLevel::Debug),
            "info" | "notice" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warning),
            "error" | "err" => Some(LogLevel::Error),
            "critical" | "fatal" => Some(LogLevel::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARNING"),
            LogLevel::Error => write!(f, "ERROR"),
            LogLevel::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Stream type (stdout or stderr)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    /// Level given to unstructured lines from this stream
    pub fn default_level(self) -> LogLevel {
        match self {
            StreamKind::Stdout => LogLevel::Info,
            StreamKind::Stderr => LogLevel::Error,
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// One log line from a child process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Epoch milliseconds
    pub timestamp: i64,
    pub level: LogLevel,
    #[serde(rename = "logger_name")]
    pub source: String,
    pub message: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    /// Line exactly as the child wrote it (escape sequences included)
    #[serde(skip)]
    pub raw: Option<String>,
    #[serde(skip)]
    pub stream: Option<StreamKind>,
}

const MESSAGE_KEYS: [&str; 3] = ["message", "msg", "event"];
const LEVEL_KEYS: [&str; 3] = ["level", "levelname", "severity"];
const SOURCE_KEYS: [&str; 3] = ["logger_name", "logger", "name"];
const TIMESTAMP_KEYS: [&str; 3] = ["timestamp", "time", "ts"];

impl LogRecord {
    pub fn new(level: LogLevel, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: now_millis(),
            level,
            source: source.into(),
            message: message.into(),
            attributes: Map::new(),
            raw: None,
            stream: None,
        }
    }

    /// Build a record from one output line: structured JSON logs keep their level, logger
    /// and extra fields; anything else becomes a plain record for the stream.
    pub fn from_line(stream: StreamKind, line: &str) -> Self {
        let mut record = Self::parse_structured(line).unwrap_or_else(|| {
            Self::new(stream.default_level(), stream.to_string(), line.trim_end())
        });
        record.raw = Some(line.to_string());
        record.stream = Some(stream);
        record
    }

    fn parse_structured(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        let Value::Object(mut fields) = serde_json::from_str::<Value>(trimmed).ok()? else {
            return None;
        };

        let message = take_first(&mut fields, &MESSAGE_KEYS)?;
        let message = match message {
            Value::String(text) => text,
            other => other.to_string(),
        };
        let level = take_first(&mut fields, &LEVEL_KEYS)
            .and_then(|v| v.as_str().and_then(LogLevel::parse))
            .unwrap_or(LogLevel::Info);
        let source = take_first(&mut fields, &SOURCE_KEYS)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "root".to_string());
        let timestamp = take_first(&mut fields, &TIMESTAMP_KEYS)
            .and_then(|v| v.as_f64())
            .map(normalize_timestamp)
            .unwrap_or_else(now_millis);

        Some(Self {
            timestamp,
            level,
            source,
            message,
            attributes: fields,
            raw: None,
            stream: None,
        })
    }

    /// Text delivered to raw-line sinks
    pub fn raw_text(&self) -> &str {
        self.raw.as_deref().unwrap_or(&self.message)
    }

    /// Bytes this record contributes to the buffer threshold
    pub fn size_bytes(&self) -> usize {
        self.raw_text().len().max(self.message.len())
    }
}

fn take_first(fields: &mut Map<String, Value>, keys: &[&str]) -> Option<Value> {
    keys.iter().find_map(|key| fields.remove(*key))
}

/// Accept epoch seconds (possibly fractional) or epoch milliseconds
fn normalize_timestamp(value: f64) -> i64 {
    if value < 1e11 {
        (value * 1000.0) as i64
    } else {
        value as i64
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Ordered records awaiting delivery, owned by one collector
#[derive(Debug)]
pub struct LogBuffer {
    records: Vec<LogRecord>,
    bytes: usize,
    last_flush: Instant,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LogBuffer {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            bytes: 0,
            last_flush: Instant::now(),
        }
    }

    /// Append and return the new byte size
    pub fn push(&mut self, record: LogRecord) -> usize {
        self.bytes += record.size_bytes();
        self.records.push(record);
        self.bytes
    }

    /// Swap out everything buffered so far
    pub fn take(&mut self) -> Vec<LogRecord> {
        self.bytes = 0;
        std::mem::take(&mut self.records)
    }

    /// Put an undelivered batch back ahead of anything buffered since
    pub fn restore_front(&mut self, mut batch: Vec<LogRecord>) {
        self.bytes += batch.iter().map(LogRecord::size_bytes).sum::<usize>();
        batch.append(&mut self.records);
        self.records = batch;
    }

    /// Drop the oldest records until at most `max_bytes` remain.
    /// Returns how many records were dropped.
    pub fn shed_oldest(&mut self, max_bytes: usize) -> usize {
        if self.bytes <= max_bytes {
            return 0;
        }
        let mut dropped = 0;
        while self.bytes > max_bytes && dropped < self.records.len() {
            self.bytes -= self.records[dropped].size_bytes();
            dropped += 1;
        }
        self.records.drain(..dropped);
        dropped
    }

    pub fn mark_flushed(&mut self) {
        self.last_flush = Instant::now();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn last_flush(&self) -> Instant {
        self.last_flush
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_line_keeps_level_logger_and_attributes() {
        let line = r#"{"level": "warning", "logger_name": "scorer", "message": "slow", "timestamp": 1700000000.5, "step": 3}"#;
        let record = LogRecord::from_line(StreamKind::Stderr, line);
        assert_eq!(record.level, LogLevel::Warning);
        assert_eq!(record.source, "scorer");
        assert_eq!(record.message, "slow");
        assert_eq!(record.timestamp, 1_700_000_000_500);
        assert_eq!(record.attributes["step"], 3);
        assert!(!record.attributes.contains_key("message"));
        assert_eq!(record.raw.as_deref(), Some(line));
    }

    #[test]
    fn plain_line_is_synthesized_per_stream() {
        let record = LogRecord::from_line(StreamKind::Stderr, "Traceback (most recent call last):");
        assert_eq!(record.level, LogLevel::Error);
        assert_eq!(record.source, "stderr");
        assert_eq!(record.message, "Traceback (most recent call last):");

        let record = LogRecord::from_line(StreamKind::Stdout, "hello");
        assert_eq!(record.level, LogLevel::Info);
        assert_eq!(record.stream, Some(StreamKind::Stdout));
    }

    #[test]
    fn json_without_message_is_not_a_log() {
        let record = LogRecord::from_line(StreamKind::Stdout, r#"{"scores": [1]}"#);
        assert_eq!(record.source, "stdout");
        assert_eq!(record.message, r#"{"scores": [1]}"#);
        assert!(record.attributes.is_empty());
    }

    #[test]
    fn serialized_record_uses_wire_names() {
        let mut record = LogRecord::new(LogLevel::Info, "scorer", "done");
        record.raw = Some("ignored".to_string());
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["logger_name"], "scorer");
        assert_eq!(value["level"], "INFO");
        assert!(value.get("raw").is_none());
        assert!(value["attributes"].is_object());
    }

    #[test]
    fn buffer_restore_keeps_order_and_size() {
        let mut buffer = LogBuffer::new();
        buffer.push(LogRecord::new(LogLevel::Info, "a", "first"));
        let batch = buffer.take();
        assert_eq!(buffer.bytes(), 0);

        buffer.push(LogRecord::new(LogLevel::Info, "a", "third"));
        buffer.restore_front(batch);
        let messages: Vec<_> = buffer.take().into_iter().map(|r| r.message).collect();
        assert_eq!(messages, vec!["first", "third"]);
    }

    #[test]
    fn shedding_drops_oldest_first() {
        let mut buffer = LogBuffer::new();
        for message in ["aaaa", "bbbb", "cccc"] {
            buffer.push(LogRecord::new(LogLevel::Info, "a", message));
        }
        assert_eq!(buffer.shed_oldest(100), 0);
        assert_eq!(buffer.shed_oldest(8), 1);
        assert_eq!(buffer.bytes(), 8);
        let messages: Vec<_> = buffer.take().into_iter().map(|r| r.message).collect();
        assert_eq!(messages, vec!["bbbb", "cccc"]);
    }

    #[test]
    fn level_aliases_parse() {
        assert_eq!(LogLevel::parse("WARN"), Some(LogLevel::Warning));
        assert_eq!(LogLevel::parse("fatal"), Some(LogLevel::Critical));
        assert_eq!(LogLevel::parse("loud"), None);
    }
}
