/// Generated Python harness and the result protocol around it
///
/// The child reads `{"data": ..., "payload_type": ...}` from stdin, runs the scoring code
/// with `data`, `payload_type` and `json` in scope, and the last non-blank stdout line is
/// the result document.
use super::types::{ExecutionRequest, ExecutionResult, Failure, FAILURE_USER};
use crate::config::types::Result;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};

const HARNESS_TEMPLATE: &str = r#"import json
import logging
import os
import sys
import traceback

_SCOREBOX_CODE = __SCOREBOX_CODE__


class _ScoreboxJsonHandler(logging.Handler):
    def emit(self, record):
        try:
            entry = {
                "timestamp": record.created,
                "level": record.levelname,
                "logger_name": record.name,
                "message": record.getMessage(),
            }
            if record.exc_info:
                entry["traceback"] = "".join(traceback.format_exception(*record.exc_info))
            sys.stderr.write(json.dumps(entry, default=str) + "\n")
            sys.stderr.flush()
        except Exception:
            self.handleError(record)


def _scorebox_install_logging():
    if os.environ.get("SCOREBOX_LOG_FORMAT") != "json":
        return
    root = logging.getLogger()
    for handler in list(root.handlers):
        root.removeHandler(handler)
    root.addHandler(_ScoreboxJsonHandler())
    root.setLevel(logging.INFO)


def _scorebox_report(message, trace):
    sys.stdout.flush()
    sys.stdout.write(json.dumps({"error": message, "traceback": trace}) + "\n")
    sys.stdout.flush()


def _scorebox_main():
    _scorebox_install_logging()
    raw = sys.stdin.read()
    try:
        request = json.loads(raw) if raw.strip() else {}
    except ValueError as exc:
        _scorebox_report("invalid input document: %s" % exc, None)
        return 1
    scope = {
        "__name__": "__main__",
        "__builtins__": __builtins__,
        "json": json,
        "data": request.get("data"),
        "payload_type": request.get("payload_type"),
    }
    try:
        exec(compile(_SCOREBOX_CODE, "<scoring>", "exec"), scope)
    except SystemExit as exc:
        if exc.code is None or exc.code == 0:
            return 0
        _scorebox_report("scoring code exited with status %s" % exc.code, None)
        return exc.code if isinstance(exc.code, int) else 1
    except BaseException as exc:
        trace = traceback.format_exc()
        sys.stderr.write(trace)
        sys.stderr.flush()
        _scorebox_report("%s: %s" % (type(exc).__name__, exc), trace)
        return 1
    return 0


if __name__ == "__main__":
    sys.exit(_scorebox_main())
"#;

/// Python source of the harness with `code` embedded as a string literal
pub fn harness_source(code: &str) -> Result<String> {
    // A JSON string is also a valid Python string literal
    let literal = serde_json::to_string(code)?;
    Ok(HARNESS_TEMPLATE.replace("__SCOREBOX_CODE__", &literal))
}

/// Bytes written to the child's stdin
pub fn encode_input(request: &ExecutionRequest) -> Result<Vec<u8>> {
    let document = json!({
        "data": request.data(),
        "payload_type": request.payload_type(),
    });
    Ok(serde_json::to_vec(&document)?)
}

/// Harness file under the runtime directory, removed on drop
#[derive(Debug)]
pub struct HarnessFile {
    path: PathBuf,
}

impl HarnessFile {
    pub fn write(runtime_dir: &Path, code: &str) -> Result<Self> {
        fs::create_dir_all(runtime_dir)?;
        let path = runtime_dir.join(format!("harness-{}.py", uuid::Uuid::new_v4()));
        fs::write(&path, harness_source(code)?)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for HarnessFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::debug!("Could not remove harness {:?}: {}", self.path, e);
        }
    }
}

pub fn last_non_empty_line(text: &str) -> Option<&str> {
    text.lines().rev().map(str::trim).find(|line| !line.is_empty())
}

/// Error document printed by the harness: `(message, traceback)`
fn error_document(line: &str) -> Option<(String, Option<String>)> {
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(line.trim()) else {
        return None;
    };
    let message = match map.get("error")? {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    let traceback = map.get("traceback").and_then(Value::as_str).map(str::to_string);
    Some((message, traceback))
}

/// Interpret the last stdout line of a run that exited cleanly
pub fn parse_result(last_line: Option<&str>) -> ExecutionResult {
    let Some(line) = last_line.map(str::trim).filter(|l| !l.is_empty()) else {
        return ExecutionResult::failure(FAILURE_USER, "scoring code printed no result");
    };

    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(mut map)) => {
            if let Some(Value::Array(scores)) = map.remove("scores") {
                return ExecutionResult::Success { scores };
            }
            if let Some((message, traceback)) = error_document(line) {
                return Failure::new(FAILURE_USER, message)
                    .with_traceback(traceback)
                    .into();
            }
            Failure::new(FAILURE_USER, format!("result has no \"scores\" list: {}", line))
                .with_partial_stdout(Some(line.to_string()))
                .into()
        }
        Ok(_) => Failure::new(FAILURE_USER, format!("result is not a JSON object: {}", line))
            .with_partial_stdout(Some(line.to_string()))
            .into(),
        Err(e) => Failure::new(FAILURE_USER, format!("could not parse result {:?}: {}", line, e))
            .with_partial_stdout(Some(line.to_string()))
            .into(),
    }
}

/// Interpret a run that exited unsuccessfully
pub fn parse_failed_exit(
    status: &str,
    last_stdout: Option<&str>,
    stderr: &str,
    partial_stdout: Option<String>,
) -> ExecutionResult {
    if let Some((message, traceback)) = last_stdout.and_then(error_document) {
        return Failure::new(FAILURE_USER, message)
            .with_traceback(traceback)
            .with_partial_stdout(partial_stdout)
            .into();
    }

    let stderr = stderr.trim();
    let message = if stderr.is_empty() {
        format!("scoring process {}", status)
    } else {
        stderr.to_string()
    };
    Failure::new(FAILURE_USER, message)
        .with_partial_stdout(partial_stdout)
        .into()
}
