//! Event dispatch: kernel and control-message codecs, the model lifecycle
//! and the per-thread dispatch loop.

pub mod control;
pub mod engine;
pub mod kernel;
pub mod model;

pub use control::{ControlMsg, ModelOp};
pub use engine::{AicpuMsgKind, Cycle, Dispatcher, EventStats, KindTotals};
pub use kernel::{ControlForward, HwtsTask, KernelEnv, KernelExecutor, KernelTask, KernelType};
pub use model::{LoadSpec, Model, ModelManager, ModelStatus, StreamSpec};
