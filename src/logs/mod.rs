//! Child output streaming
//!
//! A [`LogCollector`] owns one reader thread per child stream plus a flush thread.
//! Records are buffered and handed to a [`LogSink`] in batches, either on a timer or
//! as soon as the buffer grows past its byte threshold.

pub mod collector;
pub mod http_sink;
pub mod list_sink;
pub mod reader;
pub mod record;

pub use collector::LogCollector;
pub use http_sink::BatchHttpSink;
pub use list_sink::RemoteListSink;
pub use reader::StreamReader;
pub use record::{LogBuffer, LogLevel, LogRecord, StreamKind};

use crate::config::types::Result;
use crate::observability::audit::Correlation;

/// Destination for flushed batches.
///
/// `deliver` is only ever called by one thread at a time per collector. An `Err` keeps
/// the batch in the collector's buffer for the next flush.
pub trait LogSink: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    fn deliver(&self, records: &[LogRecord]) -> Result<()>;

    /// Identifiers attached to delivery failure events
    fn correlation(&self) -> Correlation {
        Correlation::default()
    }
}
