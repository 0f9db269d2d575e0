//! Event transports.
//!
//! A worker talks to exactly one transport, chosen once at startup from the
//! scheduling mode. The dispatcher is generic over [`MessageTransport`], so
//! the per-event path has no dynamic dispatch.

pub mod interrupt;
pub mod mapped_queue;
pub mod region;

use std::time::Duration;

use crate::error::{DrvError, DrvResult};
use crate::types::{Event, Response};

pub use interrupt::InterruptTransport;
pub use mapped_queue::MappedQueueTransport;
pub use region::RegisterRegion;

/// Result of one wait on a transport.
#[derive(Debug)]
pub enum WaitOutcome {
    /// An event for the dispatcher.
    Event(Event),
    /// The bounded wait elapsed.
    Timeout,
    /// Nothing pending (polling transports).
    NoEvent,
    /// Rescue message: answer with a canned response, run no handler.
    Rescue(Event),
    /// Driver failure while waiting.
    Fatal(DrvError),
}

/// Source of events and sink of responses for one worker thread.
pub trait MessageTransport: Send {
    /// Stable label for logs and metrics.
    fn name(&self) -> &'static str;

    /// Wait for at most `timeout` for the next event. Polling transports
    /// ignore the timeout and return immediately.
    fn wait_once(&mut self, timeout: Duration) -> WaitOutcome;

    /// Report completion of an event received through this transport.
    fn respond(&mut self, response: &Response) -> DrvResult<()>;
}
