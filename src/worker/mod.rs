//! Worker threads and their CPU placement.

pub mod affinity;
pub mod pool;

pub use affinity::{pin_current, AffinityBinder};
pub use pool::{WorkerPool, WorkerStatus};
