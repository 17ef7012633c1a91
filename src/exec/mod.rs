//! Execution control
//!
//! Spawns scoring code in a child interpreter, feeds it input, enforces the timeout and
//! turns whatever happened into an [`ExecutionResult`].

pub mod executor;
pub mod harness;
pub mod preexec;
pub mod process_set;
pub mod types;

pub use executor::{KillSwitch, ProcessExecutor, FORCED_ENV};
pub use process_set::{ActiveProcess, ActiveProcessSet};
pub use types::{
    CodeSource, ExecutionRequest, ExecutionResult, Failure, FAILURE_INTERNAL, FAILURE_KILLED,
    FAILURE_TIMEOUT, FAILURE_USER,
};
