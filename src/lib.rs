//! scorebox: sandboxed execution of scoring code
//!
//! Runs caller-supplied scoring code in a child interpreter, streams its logs to a remote
//! sink while it runs, and lets an external controller cancel it through a flag store.
//!
//! # Architecture
//!
//! ## Execution ([`exec`])
//! - [`exec::executor`]: `ProcessExecutor`, spawn/wait/timeout/teardown
//! - [`exec::harness`]: generated harness and the result document protocol
//! - [`exec::preexec`]: stack limit applied between fork and exec
//! - [`exec::process_set`]: live children keyed by pid
//!
//! ## Log streaming ([`logs`])
//! - [`logs::collector`]: buffering, threshold and interval flushing
//! - [`logs::reader`]: one line reader per output pipe
//! - [`logs::http_sink`]: batch JSON POST sink
//! - [`logs::list_sink`]: remote list sink with spinner-frame dedup
//!
//! ## Cancellation ([`cancel`])
//! - [`cancel::monitor`]: process-wide flag poller
//! - [`cancel::handle`]: per-job registration released on drop
//!
//! ## Support
//! - [`kernel::signal`]: process-group termination
//! - [`store`]: remote key-value store (Redis, in-memory)
//! - [`config`]: settings, env/file loading and validation
//! - [`observability`]: logger setup and lifecycle events
//!
//! # Example
//!
//! ```no_run
//! use scorebox::exec::{CodeSource, ExecutionRequest, ProcessExecutor};
//! use scorebox::config::types::ExecutorConfig;
//!
//! scorebox::observability::logging::init();
//! let executor = ProcessExecutor::new(ExecutorConfig::default())?;
//! let request = ExecutionRequest::new(CodeSource::inline(
//!     "print(json.dumps({'scores': [len(data['output'])]}))",
//! ))
//! .with_data(serde_json::json!({"output": "hello"}));
//! let result = executor.execute(&request, None);
//! assert_eq!(result.scores().map(|s| s.len()), Some(1));
//! # Ok::<(), scorebox::SandboxError>(())
//! ```

// Execution
pub mod exec;

// Log streaming
pub mod logs;

// Cancellation
pub mod cancel;

// Process control
pub mod kernel;

// Remote store
pub mod store;

// Configuration
pub mod config;

// Observability
pub mod observability;

// Utilities
pub mod utils;

pub use cancel::{CancellationHandle, CancellationMonitor};
pub use config::types::{Result, SandboxError};
pub use config::Settings;
pub use exec::{CodeSource, ExecutionRequest, ExecutionResult, ProcessExecutor};
pub use logs::{BatchHttpSink, LogCollector, LogSink, RemoteListSink};
