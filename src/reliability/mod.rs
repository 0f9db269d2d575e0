//! Observability and lifecycle support: logging, counters and shutdown.

pub mod metrics;
pub mod shutdown;
pub mod tracing;

pub use shutdown::*;
