/// Structured audit events for executions, log delivery and cancellation
///
/// Every event carries correlation identifiers (job id, parent id, pid) and is emitted as a
/// single JSON document through the `log` facade under the `scorebox::events` target, so the
/// installed logger decides where it lands.
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub const EVENT_TARGET: &str = "scorebox::events";

/// Event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
    Low,
}

/// Types of lifecycle events we track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ExecutionStart,
    ExecutionEnd,
    ExecutionTimeout,
    StackLimitDegraded,
    GracefulKill,
    ForcedKill,
    TeardownCallbackFailed,
    FlushFailed,
    CancellationFired,
    FlagLookupFailed,
}

impl EventType {
    pub fn default_severity(&self) -> Severity {
        match self {
            EventType::ExecutionStart | EventType::ExecutionEnd => Severity::Low,
            EventType::GracefulKill | EventType::CancellationFired => Severity::Low,
            EventType::ExecutionTimeout | EventType::FlushFailed => Severity::Medium,
            EventType::FlagLookupFailed | EventType::StackLimitDegraded => Severity::Medium,
            EventType::ForcedKill | EventType::TeardownCallbackFailed => Severity::High,
        }
    }
}

/// Correlation identifiers for event tracking
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    pub job_id: Option<String>,
    pub parent_id: Option<String>,
    pub pid: Option<u32>,
}

impl Correlation {
    pub fn job(job_id: &str) -> Self {
        Self {
            job_id: Some(job_id.to_string()),
            ..Self::default()
        }
    }

    pub fn with_parent(mut self, parent_id: Option<&str>) -> Self {
        self.parent_id = parent_id.map(str::to_string);
        self
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }
}

/// Individual lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub severity: Severity,
    /// Epoch milliseconds
    pub timestamp: u64,
    pub details: String,
    #[serde(flatten)]
    pub correlation: Correlation,
}

impl Event {
    pub fn new(event_type: EventType, details: impl Into<String>) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            details: details.into(),
            correlation: Correlation::default(),
        }
    }

    pub fn with_correlation(mut self, correlation: Correlation) -> Self {
        self.correlation = correlation;
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }

    /// Emit through the log facade at a level derived from severity
    pub fn emit(self) {
        let line = self.to_json();
        match self.severity {
            Severity::High => log::error!(target: EVENT_TARGET, "{}", line),
            Severity::Medium => log::warn!(target: EVENT_TARGET, "{}", line),
            Severity::Low => log::info!(target: EVENT_TARGET, "{}", line),
        }
    }
}

/// Convenience functions for common events
pub mod events {
    use super::*;

    pub fn execution_start(correlation: Correlation, streaming: bool) {
        Event::new(
            EventType::ExecutionStart,
            format!(
                "child started ({} mode)",
                if streaming { "streaming" } else { "simple" }
            ),
        )
        .with_correlation(correlation)
        .emit();
    }

    pub fn execution_end(correlation: Correlation, outcome: &str, elapsed_ms: u64) {
        Event::new(
            EventType::ExecutionEnd,
            format!("child finished: {} in {}ms", outcome, elapsed_ms),
        )
        .with_correlation(correlation)
        .emit();
    }

    pub fn execution_timeout(correlation: Correlation, timeout_ms: u64) {
        Event::new(
            EventType::ExecutionTimeout,
            format!("execution exceeded {}ms timeout", timeout_ms),
        )
        .with_correlation(correlation)
        .emit();
    }

    pub fn stack_limit_degraded(correlation: Correlation, reason: &str) {
        Event::new(
            EventType::StackLimitDegraded,
            format!("stack limit not applied, running unconstrained: {}", reason),
        )
        .with_correlation(correlation)
        .emit();
    }

    pub fn kill_escalation(correlation: Correlation, forced: bool) {
        let (event_type, details) = if forced {
            (EventType::ForcedKill, "SIGKILL sent to process group")
        } else {
            (EventType::GracefulKill, "process group exited after SIGTERM")
        };
        Event::new(event_type, details)
            .with_correlation(correlation)
            .emit();
    }

    pub fn teardown_callback_failed(index: usize, reason: &str) {
        Event::new(
            EventType::TeardownCallbackFailed,
            format!("teardown callback #{} failed: {}", index, reason),
        )
        .emit();
    }

    pub fn flush_failed(correlation: Correlation, sink: &str, records: usize, reason: &str) {
        Event::new(
            EventType::FlushFailed,
            format!(
                "{} sink rejected {} records, retained for retry: {}",
                sink, records, reason
            ),
        )
        .with_correlation(correlation)
        .emit();
    }

    pub fn cancellation_fired(job_id: &str) {
        Event::new(EventType::CancellationFired, "cancellation flag consumed")
            .with_correlation(Correlation::job(job_id))
            .emit();
    }

    pub fn flag_lookup_failed(jobs: usize, reason: &str) {
        Event::new(
            EventType::FlagLookupFailed,
            format!("batched flag lookup for {} jobs failed: {}", jobs, reason),
        )
        .emit();
    }
}
