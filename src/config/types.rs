/// Core configuration and error types for the scorebox system
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Child process execution configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Interpreter used to run the generated harness
    pub interpreter: PathBuf,
    /// Extra interpreter arguments placed before the harness path
    pub interpreter_args: Vec<String>,
    /// Stack size limit in bytes (RLIMIT_STACK), applied before user code runs
    pub stack_limit: Option<u64>,
    /// Strict mode: fail the run when the stack limit cannot be applied
    pub strict_mode: bool,
    /// Timeout used when a request does not carry its own
    pub default_timeout_ms: u64,
    /// Grace period between the first kill signal and the forced kill
    pub kill_grace_ms: u64,
    /// How long to wait for log readers to drain after the child exits
    pub reader_drain_grace_ms: u64,
    /// Per-stream cap on output kept in simple (non-streaming) mode; the rest is discarded
    pub capture_limit_bytes: usize,
    /// Working directory for the child (inherits the parent's when unset)
    pub workdir: Option<PathBuf>,
    /// Directory holding generated harness files
    pub runtime_dir: PathBuf,
}

impl ExecutorConfig {
    /// Runtime directory scoped by effective UID so concurrent users do not collide.
    pub fn runtime_root_dir() -> PathBuf {
        let euid = unsafe { libc::geteuid() };
        std::env::temp_dir().join(format!("scorebox-uid-{}", euid))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn reader_drain_grace(&self) -> Duration {
        Duration::from_millis(self.reader_drain_grace_ms)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            interpreter: PathBuf::from("python3"),
            interpreter_args: vec!["-u".to_string(), "-B".to_string()],
            stack_limit: Some(64 * 1024 * 1024), // 64MB, deep recursion in scorers
            strict_mode: false,
            default_timeout_ms: 30_000,
            kill_grace_ms: 2_000,
            reader_drain_grace_ms: 2_000,
            capture_limit_bytes: 8 * 1024 * 1024,
            workdir: None,
            runtime_dir: Self::runtime_root_dir(),
        }
    }
}

/// Log batching configuration shared by every sink variant
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Periodic flush interval
    pub flush_interval_ms: u64,
    /// Buffered byte size that triggers an immediate flush
    pub flush_threshold_bytes: usize,
    /// Upper bound on joining reader threads during close()
    pub reader_join_timeout_ms: u64,
    /// Buffer cap while the sink is failing; the oldest records are dropped past it
    pub max_buffered_bytes: usize,
}

impl CollectorConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn reader_join_timeout(&self) -> Duration {
        Duration::from_millis(self.reader_join_timeout_ms)
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 1_000,
            flush_threshold_bytes: 64 * 1024,
            reader_join_timeout_ms: 2_000,
            max_buffered_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Batch-HTTP sink destination
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSinkConfig {
    /// Endpoint receiving one POST per flush
    pub url: String,
    /// Value sent verbatim in the Authorization header
    pub api_key: Option<String>,
    /// Workspace name sent in `workspace_header`
    pub workspace: Option<String>,
    pub workspace_header: String,
    /// Body key carrying the parent (job scope) id
    pub scope_key: String,
    pub request_timeout_ms: u64,
}

impl Default for HttpSinkConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: None,
            workspace: None,
            workspace_header: "X-Workspace".to_string(),
            scope_key: "parent_id".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

/// Append-to-remote-list sink destination
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ListSinkConfig {
    /// Key namespace; keys are `<namespace>:<workspace>:<job-id>`
    pub namespace: String,
    pub workspace: String,
    /// TTL refreshed on both keys after every flush
    pub ttl_secs: u64,
    /// Collapse consecutive spinner frames
    pub dedup_spinner_frames: bool,
}

impl Default for ListSinkConfig {
    fn default() -> Self {
        Self {
            namespace: "scorebox:logs".to_string(),
            workspace: "default".to_string(),
            ttl_secs: 3_600,
            dedup_spinner_frames: true,
        }
    }
}

/// Cancellation monitor configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_ms: u64,
    /// Flag keys are `<flag_prefix>:<job-id>`
    pub flag_prefix: String,
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn flag_key(&self, job_id: &str) -> String {
        format!("{}:{}", self.flag_prefix, job_id)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            flag_prefix: "scorebox:cancel".to_string(),
        }
    }
}

/// Remote key-value store connection
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `redis://` URL; an in-memory store is used when unset
    pub redis_url: Option<String>,
}

/// Custom error types for scorebox
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Resource limit error: {0}")]
    ResourceLimit(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<nix::errno::Errno> for SandboxError {
    fn from(err: nix::errno::Errno) -> Self {
        SandboxError::Process(err.to_string())
    }
}

impl From<reqwest::Error> for SandboxError {
    fn from(err: reqwest::Error) -> Self {
        SandboxError::Transport(err.to_string())
    }
}

impl From<redis::RedisError> for SandboxError {
    fn from(err: redis::RedisError) -> Self {
        SandboxError::Store(err.to_string())
    }
}

/// Result type alias for scorebox operations
pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_defaults_never_limit_heap() {
        let config = ExecutorConfig::default();
        assert_eq!(config.stack_limit, Some(64 * 1024 * 1024));
        assert!(!config.strict_mode);
        assert_eq!(config.default_timeout(), Duration::from_secs(30));
        assert!(config
            .runtime_dir
            .to_string_lossy()
            .contains("scorebox-uid-"));
    }

    #[test]
    fn monitor_flag_key_uses_prefix() {
        let config = MonitorConfig {
            flag_prefix: "cancel".to_string(),
            ..MonitorConfig::default()
        };
        assert_eq!(config.flag_key("job-1"), "cancel:job-1");
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: CollectorConfig =
            serde_json::from_str(r#"{"flush_interval_ms": 250}"#).unwrap();
        assert_eq!(config.flush_interval(), Duration::from_millis(250));
        assert_eq!(config.flush_threshold_bytes, 64 * 1024);
    }

    #[test]
    fn error_display_is_prefixed() {
        let err = SandboxError::Config("missing url".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing url");
    }
}
