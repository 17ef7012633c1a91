//! Observability
//!
//! Logger setup and structured lifecycle events.

pub mod audit;
pub mod logging;
