/// Execution requests and results
use crate::observability::audit::Correlation;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Scoring code raised, printed an error document, or produced an unusable result
pub const FAILURE_USER: u16 = 400;
/// Timeout elapsed and the process group was killed
pub const FAILURE_TIMEOUT: u16 = 408;
/// Killed on request (cancellation or teardown) before it finished
pub const FAILURE_KILLED: u16 = 499;
/// Spawn, I/O or strict-mode resource limit failure on our side
pub const FAILURE_INTERNAL: u16 = 500;

/// Where the scoring code comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeSource {
    Inline(String),
    FromFile(PathBuf),
}

impl CodeSource {
    pub fn inline(code: impl Into<String>) -> Self {
        CodeSource::Inline(code.into())
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        CodeSource::FromFile(path.into())
    }

    /// Load the code text
    pub fn resolve(&self) -> std::io::Result<String> {
        match self {
            CodeSource::Inline(code) => Ok(code.clone()),
            CodeSource::FromFile(path) => std::fs::read_to_string(path),
        }
    }
}

/// One execution, immutable once built
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    code: CodeSource,
    data: Value,
    payload_type: Option<String>,
    env: BTreeMap<String, String>,
    timeout: Option<Duration>,
    job_id: Option<String>,
    parent_id: Option<String>,
}

impl ExecutionRequest {
    pub fn new(code: CodeSource) -> Self {
        Self {
            code,
            data: Value::Null,
            payload_type: None,
            env: BTreeMap::new(),
            timeout: None,
            job_id: None,
            parent_id: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_payload_type(mut self, payload_type: impl Into<String>) -> Self {
        self.payload_type = Some(payload_type.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn code(&self) -> &CodeSource {
        &self.code
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn payload_type(&self) -> Option<&str> {
        self.payload_type.as_deref()
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn correlation(&self) -> Correlation {
        Correlation {
            job_id: self.job_id.clone(),
            parent_id: self.parent_id.clone(),
            pid: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub code: u16,
    pub message: String,
    pub traceback: Option<String>,
    pub partial_stdout: Option<String>,
}

impl Failure {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            traceback: None,
            partial_stdout: None,
        }
    }

    pub fn with_traceback(mut self, traceback: Option<String>) -> Self {
        self.traceback = traceback;
        self
    }

    pub fn with_partial_stdout(mut self, stdout: Option<String>) -> Self {
        self.partial_stdout = stdout.filter(|s| !s.is_empty());
        self
    }
}

/// Outcome of one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success { scores: Vec<Value> },
    Failure(Failure),
}

impl ExecutionResult {
    pub fn failure(code: u16, message: impl Into<String>) -> Self {
        ExecutionResult::Failure(Failure::new(code, message))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success { .. })
    }

    pub fn scores(&self) -> Option<&[Value]> {
        match self {
            ExecutionResult::Success { scores } => Some(scores),
            ExecutionResult::Failure(_) => None,
        }
    }

    pub fn as_failure(&self) -> Option<&Failure> {
        match self {
            ExecutionResult::Failure(failure) => Some(failure),
            ExecutionResult::Success { .. } => None,
        }
    }

    /// Short label for logs and events
    pub fn outcome(&self) -> String {
        match self {
            ExecutionResult::Success { scores } => format!("success ({} scores)", scores.len()),
            ExecutionResult::Failure(failure) => format!("failure {}", failure.code),
        }
    }
}

impl From<Failure> for ExecutionResult {
    fn from(failure: Failure) -> Self {
        ExecutionResult::Failure(failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_keeps_every_field() {
        let request = ExecutionRequest::new(CodeSource::inline("print(1)"))
            .with_data(json!({"output": "x"}))
            .with_payload_type("trace_thread")
            .with_env("SEED", "7")
            .with_timeout(Duration::from_secs(3))
            .with_job_id("job-1")
            .with_parent_id("exp-9");

        assert_eq!(request.data()["output"], "x");
        assert_eq!(request.payload_type(), Some("trace_thread"));
        assert_eq!(request.env().get("SEED").map(String::as_str), Some("7"));
        assert_eq!(request.timeout(), Some(Duration::from_secs(3)));
        let correlation = request.correlation();
        assert_eq!(correlation.job_id.as_deref(), Some("job-1"));
        assert_eq!(correlation.parent_id.as_deref(), Some("exp-9"));
    }

    #[test]
    fn missing_code_file_is_an_io_error() {
        let source = CodeSource::from_file("/definitely/not/here.py");
        assert!(source.resolve().is_err());
    }

    #[test]
    fn result_serializes_with_status_tag() {
        let ok = ExecutionResult::Success { scores: vec![json!(1)] };
        assert_eq!(serde_json::to_value(&ok).unwrap(), json!({"status": "success", "scores": [1]}));

        let failed: ExecutionResult = Failure::new(FAILURE_TIMEOUT, "timed out")
            .with_partial_stdout(Some(String::new()))
            .into();
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["status"], "failure");
        assert_eq!(value["code"], 408);
        assert!(value["partial_stdout"].is_null());
        assert_eq!(failed.outcome(), "failure 408");
    }
}
