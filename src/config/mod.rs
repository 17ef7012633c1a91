//! Configuration
//!
//! Typed settings for the executor, log collector, sinks, store and cancellation monitor,
//! loaded from a JSON file or `SCOREBOX_*` environment variables and validated up front.

pub mod settings;
pub mod types;
pub mod validator;

pub use settings::Settings;
