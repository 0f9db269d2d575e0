//! Resource primitives shared across worker threads.
//!
//! These are the only structures mutated by more than one worker; each
//! keeps its critical sections short and never blocks on another worker's
//! event.

pub mod buffer;
pub mod stream_registry;
pub mod table_lock;
pub mod wait_list;

pub use buffer::{BatchMode, BufferTracker};
pub use stream_registry::StreamRegistry;
pub use table_lock::{Released, TableLockManager};
pub use wait_list::{Wake, WaitList, WaitManagers};
