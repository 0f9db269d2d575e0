//! Driver capability boundary.
//!
//! Everything that touches hardware goes through [`DeviceDriver`]. The
//! scheduler never interprets driver wire formats; it only sees typed
//! results and the [`DrvError`](crate::error::DrvError) classification.

use std::sync::Arc;
use std::time::Duration;

use crate::error::DrvResult;
use crate::transport::region::RegisterRegion;
use crate::types::{Event, Response, RunMode};

/// Core groups reported per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuModule {
    /// AI-CPU cores running kernels.
    Aicpu,
    /// Control CPU.
    Ccpu,
    /// Data CPU.
    Dcpu,
    /// Task-scheduler CPU.
    Tscpu,
}

impl CpuModule {
    pub const ALL: [CpuModule; 4] = [
        CpuModule::Aicpu,
        CpuModule::Ccpu,
        CpuModule::Dcpu,
        CpuModule::Tscpu,
    ];
}

/// Per-module core report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreInfo {
    pub num: u32,
    /// Whether these cores are scheduled by the device OS (and thus count
    /// towards the per-device core span).
    pub os_sched: bool,
    /// Bit `i` set when core `i` of the module is usable.
    pub occupy_bitmap: u64,
}

/// SoC feature flags derived from the hardware version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocFeatures {
    /// AI-CPU cores are managed by an AOS core layout.
    pub aos_core: bool,
    /// VF partitions are addressed by device id rather than vf id.
    pub vf_by_device_id: bool,
    /// All devices share one AI-CPU id space.
    pub bind_cpu_only_one_device: bool,
}

/// Scheduler group flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    /// Bound to the control plane (host deploy or no AI-CPUs).
    BindCp,
    /// Data-plane group on AI-CPU cores.
    DataPlane,
}

/// Queue transitions that can be subscribed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueEvent {
    NotEmpty,
    NotFull,
}

/// Why the scheduler asks its supervisor to be terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    /// An event was delivered to a core outside the scheduler's set.
    IllegalCpu,
    /// Buffer exhaustion in a chained allocation.
    ResourceExhausted,
}

/// Opaque driver buffer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufHandle(pub u64);

/// Hardware capability interface consumed by the scheduler.
pub trait DeviceDriver: Send + Sync {
    // Topology queries.
    fn soc_features(&self, device: u32) -> DrvResult<SocFeatures>;
    fn core_info(&self, device: u32, module: CpuModule) -> DrvResult<CoreInfo>;
    /// Physical die device backing a VF-split device.
    fn physical_device(&self, device: u32) -> DrvResult<u32>;
    fn max_vf_num(&self, device: u32) -> DrvResult<u32>;

    // Event scheduling.
    fn attach_device(&self, device: u32) -> DrvResult<()>;
    fn detach_device(&self, device: u32) -> DrvResult<()>;
    fn create_group(&self, device: u32, group: u32, kind: GroupKind, threads: u32) -> DrvResult<()>;
    fn set_event_priority(&self, device: u32, kind: u32, priority: u32) -> DrvResult<()>;
    fn subscribe(&self, device: u32, group: u32, thread_index: usize, mask: u64) -> DrvResult<()>;
    fn wait_event(
        &self,
        device: u32,
        group: u32,
        thread_index: usize,
        timeout: Duration,
    ) -> DrvResult<Event>;
    fn ack_event(&self, device: u32, response: &Response) -> DrvResult<()>;
    /// Submit an event to this device's own scheduler.
    fn submit_event(&self, device: u32, event: Event) -> DrvResult<()>;
    fn subscribe_queue(&self, device: u32, queue_id: u32, event: QueueEvent) -> DrvResult<()>;
    fn unsubscribe_queue(&self, device: u32, queue_id: u32, event: QueueEvent) -> DrvResult<()>;

    // Buffers.
    fn buf_alloc(&self, size: u64, align: u32, flags: u64) -> DrvResult<BufHandle>;
    fn buf_free(&self, buf: BufHandle) -> DrvResult<()>;
    fn buf_chain_append(&self, head: BufHandle, buf: BufHandle) -> DrvResult<()>;

    // Mapped queue.
    fn map_queue_region(&self, device: u32) -> DrvResult<Arc<RegisterRegion>>;

    // TS messaging.
    fn send_ts_msg(&self, device: u32, payload: &[u8]) -> DrvResult<()>;

    // Process binding and supervision.
    fn bind_host_pid(&self, host_pid: u32, vf_id: u32, mode: RunMode) -> DrvResult<()>;
    fn query_host_pid_bound(&self, host_pid: u32) -> DrvResult<bool>;
    fn bind_cgroup(&self, tid: i32) -> DrvResult<()>;
    fn bind_by_process_manager(&self, device: u32, tid: i32, thread_index: usize) -> DrvResult<()>;
    fn request_kill(&self, device: u32, reason: KillReason) -> DrvResult<()>;
}
