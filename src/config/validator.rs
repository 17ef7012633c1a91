// Config Validation
// Every section is validated before the component using it is constructed.
// Errors are fatal; warnings are returned for the caller to log.

use crate::config::types::{
    CollectorConfig, ExecutorConfig, HttpSinkConfig, ListSinkConfig, MonitorConfig, Result,
    SandboxError,
};

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    fn finish(self, section: &str) -> Result<Self> {
        if self.is_valid() {
            return Ok(self);
        }
        Err(SandboxError::Config(format!(
            "{} validation failed:\n{}",
            section,
            self.errors.join("\n")
        )))
    }
}

pub fn validate_executor(config: &ExecutorConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    if config.interpreter.as_os_str().is_empty() {
        result.add_error("interpreter cannot be empty".to_string());
    }

    if let Some(stack_limit) = config.stack_limit {
        if stack_limit == 0 {
            result.add_error("stack_limit cannot be zero (use None to disable)".to_string());
        } else if stack_limit < 1024 * 1024 {
            result.add_warning(format!(
                "stack_limit {} is very low (< 1MB), interpreter may crash on start",
                stack_limit
            ));
        }
    }

    if config.default_timeout_ms == 0 {
        result.add_error("default_timeout_ms cannot be zero".to_string());
    }

    if config.kill_grace_ms == 0 {
        result.add_warning("kill_grace_ms is zero, children are force-killed at once".to_string());
    }

    if let Some(ref workdir) = config.workdir {
        if !workdir.is_dir() {
            result.add_error(format!("workdir is not a directory: {:?}", workdir));
        }
    }

    if config.strict_mode && config.stack_limit.is_none() {
        result.add_warning("strict_mode has no effect without a stack_limit".to_string());
    }

    result.finish("executor")
}

pub fn validate_collector(config: &CollectorConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    if config.flush_interval_ms == 0 {
        result.add_error("flush_interval_ms cannot be zero".to_string());
    }
    if config.flush_threshold_bytes == 0 {
        result.add_error("flush_threshold_bytes cannot be zero".to_string());
    }
    if config.max_buffered_bytes < config.flush_threshold_bytes {
        result.add_error(format!(
            "max_buffered_bytes ({}) must be at least flush_threshold_bytes ({})",
            config.max_buffered_bytes, config.flush_threshold_bytes
        ));
    }
    if config.reader_join_timeout_ms == 0 {
        result.add_warning(
            "reader_join_timeout_ms is zero, close() will not wait for readers".to_string(),
        );
    }

    result.finish("collector")
}

pub fn validate_http_sink(config: &HttpSinkConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    let url = config.url.trim();
    if url.is_empty() {
        result.add_error("http sink url is required".to_string());
    } else if !(url.starts_with("http://") || url.starts_with("https://")) {
        result.add_error(format!("http sink url must be http(s): {}", url));
    }

    if config.scope_key.trim().is_empty() {
        result.add_error("scope_key cannot be empty".to_string());
    }
    if config.workspace.is_some() && config.workspace_header.trim().is_empty() {
        result.add_error("workspace_header is required when workspace is set".to_string());
    }
    if config.api_key.is_none() {
        result.add_warning("http sink has no api_key, requests are unauthenticated".to_string());
    }

    result.finish("http sink")
}

pub fn validate_list_sink(config: &ListSinkConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    if config.namespace.trim().is_empty() {
        result.add_error("list sink namespace is required".to_string());
    }
    if config.workspace.trim().is_empty() {
        result.add_error("list sink workspace is required".to_string());
    }
    if config.ttl_secs == 0 {
        result.add_error("ttl_secs cannot be zero, list keys must expire".to_string());
    }

    result.finish("list sink")
}

pub fn validate_monitor(config: &MonitorConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    if config.poll_interval_ms == 0 {
        result.add_error("poll_interval_ms cannot be zero".to_string());
    } else if config.poll_interval_ms < 10 {
        result.add_warning(format!(
            "poll_interval_ms {} is very low, flag store will be hammered",
            config.poll_interval_ms
        ));
    }
    if config.flag_prefix.trim().is_empty() {
        result.add_error("flag_prefix cannot be empty".to_string());
    }

    result.finish("monitor")
}
