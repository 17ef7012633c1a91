//! Integration tests for ProcessExecutor
//!
//! These spawn a real python3; each test returns early when it is not installed.

mod common;

use scorebox::exec::{
    CodeSource, ExecutionRequest, ProcessExecutor, FAILURE_KILLED, FAILURE_TIMEOUT, FAILURE_USER,
};
use scorebox::kernel::process_alive;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn inline(code: &str) -> ExecutionRequest {
    ExecutionRequest::new(CodeSource::inline(code))
}

#[test]
fn test_scores_after_log_noise_is_success() {
    if common::skip_without_python() {
        return;
    }
    let runtime = tempfile::tempdir().unwrap();
    let executor = common::executor(&runtime);

    let code = r#"
import logging
logging.basicConfig(level=logging.INFO)
logging.getLogger("scorer").info("starting")
print("some progress")
print(json.dumps({"scores": [1]}))
"#;
    let result = executor.execute(&inline(code), None);
    assert_eq!(result.scores().unwrap(), &[json!(1)]);
}

#[test]
fn test_data_and_payload_type_are_in_scope() {
    if common::skip_without_python() {
        return;
    }
    let runtime = tempfile::tempdir().unwrap();
    let executor = common::executor(&runtime);

    let request = inline(
        "print(json.dumps({'scores': [{'name': payload_type, 'value': len(data['output'])}]}))",
    )
    .with_data(json!({"output": "four"}))
    .with_payload_type("trace");
    let result = executor.execute(&request, None);
    assert_eq!(
        result.scores().unwrap(),
        &[json!({"name": "trace", "value": 4})]
    );
}

#[test]
fn test_exception_becomes_failure_with_traceback() {
    if common::skip_without_python() {
        return;
    }
    let runtime = tempfile::tempdir().unwrap();
    let executor = common::executor(&runtime);

    let result = executor.execute(&inline("print('before')\n1 / 0"), None);
    let failure = result.as_failure().expect("division by zero must fail");
    assert_eq!(failure.code, FAILURE_USER);
    assert!(failure.message.contains("ZeroDivisionError"), "{}", failure.message);
    assert!(failure.traceback.as_deref().unwrap_or("").contains("Traceback"));
    assert!(failure.partial_stdout.as_deref().unwrap_or("").contains("before"));
}

#[test]
fn test_unparseable_output_is_failure_with_raw_text() {
    if common::skip_without_python() {
        return;
    }
    let runtime = tempfile::tempdir().unwrap();
    let executor = common::executor(&runtime);

    let result = executor.execute(&inline("print('just text')"), None);
    let failure = result.as_failure().unwrap();
    assert_eq!(failure.code, FAILURE_USER);
    assert_eq!(failure.partial_stdout.as_deref(), Some("just text"));

    let result = executor.execute(&inline("pass"), None);
    assert!(!result.is_success());
}

#[test]
fn test_timeout_kills_the_process_group() {
    if common::skip_without_python() {
        return;
    }
    let runtime = tempfile::tempdir().unwrap();
    let executor = Arc::new(common::executor(&runtime));

    let observer = Arc::clone(&executor);
    let watcher = std::thread::spawn(move || {
        let mut seen = Vec::new();
        common::wait_until(Duration::from_secs(5), || {
            seen = observer.active_pids();
            !seen.is_empty()
        });
        seen
    });

    let started = Instant::now();
    let request = inline("import time\nprint('tick', flush=True)\ntime.sleep(60)")
        .with_timeout(Duration::from_millis(1_000));
    let result = executor.execute(&request, None);
    let pids = watcher.join().unwrap();

    let failure = result.as_failure().unwrap();
    assert_eq!(failure.code, FAILURE_TIMEOUT);
    assert!(failure.message.contains("timed out"));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(executor.active_count(), 0);
    for pid in pids {
        assert!(!process_alive(pid), "pid {} survived the timeout", pid);
    }
}

#[test]
fn test_background_child_does_not_hold_up_the_result() {
    if common::skip_without_python() {
        return;
    }
    let runtime = tempfile::tempdir().unwrap();
    let executor = common::executor(&runtime);

    let code = r#"
import subprocess
subprocess.Popen(["sleep", "4"])
print(json.dumps({"scores": [1]}))
"#;
    let started = Instant::now();
    let result = executor.execute(&inline(code), None);
    assert_eq!(result.scores().unwrap(), &[json!(1)]);
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "took {:?}",
        started.elapsed()
    );
    assert_eq!(executor.active_count(), 0);
}

#[test]
fn test_forced_env_wins_over_overrides() {
    if common::skip_without_python() {
        return;
    }
    let runtime = tempfile::tempdir().unwrap();
    let executor = common::executor(&runtime);

    let code = r#"
import os
print(json.dumps({"scores": [os.environ.get("PYTHONUNBUFFERED"), os.environ.get("CUSTOM")]}))
"#;
    let request = inline(code)
        .with_env("PYTHONUNBUFFERED", "0")
        .with_env("CUSTOM", "yes");
    let result = executor.execute(&request, None);
    assert_eq!(result.scores().unwrap(), &[json!("1"), json!("yes")]);
}

#[test]
fn test_code_from_file() {
    if common::skip_without_python() {
        return;
    }
    let runtime = tempfile::tempdir().unwrap();
    let executor = common::executor(&runtime);

    let script = runtime.path().join("scorer.py");
    std::fs::write(&script, "print(json.dumps({'scores': [0.5]}))\n").unwrap();
    let result = executor.execute(&ExecutionRequest::new(CodeSource::from_file(&script)), None);
    assert_eq!(result.scores().unwrap(), &[json!(0.5)]);

    let missing = ExecutionRequest::new(CodeSource::from_file(runtime.path().join("nope.py")));
    assert_eq!(
        executor.execute(&missing, None).as_failure().unwrap().code,
        FAILURE_USER
    );
}

#[test]
fn test_harness_files_are_cleaned_up() {
    if common::skip_without_python() {
        return;
    }
    let runtime = tempfile::tempdir().unwrap();
    let executor = common::executor(&runtime);

    executor.execute(&inline("print(json.dumps({'scores': []}))"), None);
    let leftovers: Vec<_> = std::fs::read_dir(runtime.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("harness-"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_kill_job_interrupts_running_execution() {
    if common::skip_without_python() {
        return;
    }
    let runtime = tempfile::tempdir().unwrap();
    let executor = Arc::new(common::executor(&runtime));
    let switch = executor.kill_switch();

    let runner = {
        let executor = Arc::clone(&executor);
        std::thread::spawn(move || {
            let request = inline("import time\ntime.sleep(60)")
                .with_job_id("job-kill")
                .with_timeout(Duration::from_secs(30));
            executor.execute(&request, None)
        })
    };

    assert!(common::wait_until(Duration::from_secs(5), || executor.active_count() == 1));
    assert_eq!(switch.kill_job("job-kill"), 1);
    let result = runner.join().unwrap();
    assert_eq!(result.as_failure().unwrap().code, FAILURE_KILLED);
    assert_eq!(executor.kill_all(), 0);
}

#[test]
fn test_teardown_runs_callbacks_after_killing_children() {
    if common::skip_without_python() {
        return;
    }
    let runtime = tempfile::tempdir().unwrap();
    let executor = Arc::new(common::executor(&runtime));
    let cleaned = Arc::new(std::sync::atomic::AtomicBool::new(false));
    {
        let cleaned = Arc::clone(&cleaned);
        executor.register_teardown(move || {
            cleaned.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });
    }

    let runner = {
        let executor = Arc::clone(&executor);
        std::thread::spawn(move || executor.execute(&inline("import time\ntime.sleep(60)"), None))
    };
    assert!(common::wait_until(Duration::from_secs(5), || executor.active_count() == 1));

    assert_eq!(executor.teardown(), 0);
    assert!(cleaned.load(std::sync::atomic::Ordering::SeqCst));
    assert!(!runner.join().unwrap().is_success());
}

#[test]
fn test_stack_limit_capability_is_reported() {
    let runtime = tempfile::tempdir().unwrap();
    let executor: ProcessExecutor = common::executor(&runtime);
    // 64MB fits under any sane hard limit; the query itself must not fail.
    let _ = executor.supports_stack_limit();
    assert!(executor.config().stack_limit.is_some());
}
