//! Kernel-facing process control

pub mod signal;

pub use signal::{process_alive, signal_group, sweep_group, terminate_group, KillReport};
