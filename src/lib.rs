//! The `aicpu_sched` core library.
//!
//! A device-resident scheduler for accelerator AI-CPU cores. One worker
//! thread per AI-CPU waits on an interrupt or memory-mapped queue transport,
//! dispatches each task-scheduler event to its handler and sends exactly one
//! response back through the same transport.
//!
//! Hardware access goes through [`driver::DeviceDriver`] and kernel bodies
//! through [`dispatch::KernelExecutor`]; [`sim`] provides in-process
//! implementations of both.

pub mod coalescer;
pub mod config;
pub mod constants;
pub mod context;
pub mod dispatch;
pub mod driver;
pub mod errlog;
pub mod error;
pub mod reliability;
pub mod resources;
pub mod scheduler;
pub mod sim;
pub mod topology;
pub mod transport;
pub mod types;
pub mod worker;
