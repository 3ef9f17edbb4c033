//! Event sinks for run observability.
//!
//! The scheduler, retry engine and artifact store report progress as
//! [`RunEvent`](crate::core::RunEvent)s through an [`EventSink`]. Sinks are
//! passed explicitly; there is no process-wide sink.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use std::sync::Arc;

/// A shared, type-erased event sink.
pub type SharedEventSink = Arc<dyn EventSink>;

/// Returns a sink that discards everything.
#[must_use]
pub fn noop_sink() -> SharedEventSink {
    Arc::new(NoOpEventSink)
}
