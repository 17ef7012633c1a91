/// Settings loading from a JSON file or the process environment
use crate::config::types::{
    CollectorConfig, ExecutorConfig, HttpSinkConfig, ListSinkConfig, MonitorConfig, Result,
    SandboxError, StoreConfig,
};
use crate::config::validator;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Full settings document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub executor: ExecutorConfig,
    pub collector: CollectorConfig,
    pub http_sink: Option<HttpSinkConfig>,
    pub list_sink: Option<ListSinkConfig>,
    pub monitor: MonitorConfig,
    pub store: StoreConfig,
}

impl Settings {
    /// Load settings from a JSON file and validate every section
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let settings: Settings = serde_json::from_str(&content).map_err(|e| {
            SandboxError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Build settings from `SCOREBOX_*` environment variables over the defaults
    pub fn from_env() -> Result<Self> {
        let settings = Self::from_lookup(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |key: &str| parse_var(&lookup, key);
        let mut settings = Settings::default();

        let executor = &mut settings.executor;
        if let Some(interpreter) = lookup("SCOREBOX_INTERPRETER") {
            executor.interpreter = PathBuf::from(interpreter);
        }
        if let Some(stack) = parsed("SCOREBOX_STACK_LIMIT_BYTES") {
            executor.stack_limit = if stack == 0 { None } else { Some(stack) };
        }
        if let Some(strict) = lookup("SCOREBOX_STRICT_MODE") {
            executor.strict_mode = is_truthy(&strict);
        }
        if let Some(timeout) = parsed("SCOREBOX_DEFAULT_TIMEOUT_MS") {
            executor.default_timeout_ms = timeout;
        }
        if let Some(grace) = parsed("SCOREBOX_KILL_GRACE_MS") {
            executor.kill_grace_ms = grace;
        }
        if let Some(dir) = lookup("SCOREBOX_RUNTIME_DIR") {
            executor.runtime_dir = PathBuf::from(dir);
        }

        if let Some(interval) = parsed("SCOREBOX_FLUSH_INTERVAL_MS") {
            settings.collector.flush_interval_ms = interval;
        }
        if let Some(threshold) = parsed("SCOREBOX_FLUSH_THRESHOLD_BYTES") {
            settings.collector.flush_threshold_bytes = threshold as usize;
        }

        if let Some(url) = lookup("SCOREBOX_LOG_URL") {
            settings.http_sink = Some(HttpSinkConfig {
                url,
                api_key: lookup("SCOREBOX_API_KEY"),
                workspace: lookup("SCOREBOX_WORKSPACE"),
                ..HttpSinkConfig::default()
            });
        }

        if let Some(namespace) = lookup("SCOREBOX_LOG_NAMESPACE") {
            let mut list = ListSinkConfig {
                namespace,
                ..ListSinkConfig::default()
            };
            if let Some(workspace) = lookup("SCOREBOX_WORKSPACE") {
                list.workspace = workspace;
            }
            if let Some(ttl) = parsed("SCOREBOX_LOG_TTL_SECS") {
                list.ttl_secs = ttl;
            }
            settings.list_sink = Some(list);
        }

        if let Some(interval) = parsed("SCOREBOX_CANCEL_POLL_INTERVAL_MS") {
            settings.monitor.poll_interval_ms = interval;
        }
        if let Some(prefix) = lookup("SCOREBOX_CANCEL_PREFIX") {
            settings.monitor.flag_prefix = prefix;
        }

        settings.store.redis_url = lookup("SCOREBOX_REDIS_URL");
        settings
    }

    /// Validate every section, logging warnings and failing on errors
    pub fn validate(&self) -> Result<()> {
        let mut reports = vec![
            validator::validate_executor(&self.executor)?,
            validator::validate_collector(&self.collector)?,
            validator::validate_monitor(&self.monitor)?,
        ];
        if let Some(http) = &self.http_sink {
            reports.push(validator::validate_http_sink(http)?);
        }
        if let Some(list) = &self.list_sink {
            reports.push(validator::validate_list_sink(list)?);
        }
        for warning in reports.into_iter().flat_map(|r| r.warnings) {
            log::warn!("Configuration warning: {}", warning);
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring unparsable value for {}: {:?}", key, raw);
            None
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
