//! Out-of-band cancellation
//!
//! A controller raises a flag key in the remote store; the [`CancellationMonitor`]
//! notices it on its next tick and runs the job's callback, typically
//! [`KillSwitch::kill_job`](crate::exec::KillSwitch::kill_job).

pub mod handle;
pub mod monitor;

pub use handle::CancellationHandle;
pub use monitor::{CancelCallback, CancellationMonitor};
