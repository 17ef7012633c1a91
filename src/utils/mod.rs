//! Utilities

pub mod join;

pub use join::join_with_timeout;
