//! Domain constants for the AI-CPU scheduler.
//!
//! Compile-time values shared across subsystems. Runtime-tunable values live
//! in [`crate::config`].

/// Result codes carried in responses to TS.
pub mod codes {
    pub const OK: u16 = 0;
    pub const PARAMETER_INVALID: u16 = 0x0101;
    pub const INIT_FAILED: u16 = 0x0102;
    pub const DRV_ERR: u16 = 0x0103;
    pub const NOT_FOUND_EVENT: u16 = 0x0104;
    pub const NOT_FOUND_CMD_TYPE: u16 = 0x0105;
    pub const NOT_FOUND_VERSION: u16 = 0x0106;
    pub const MODEL_NOT_FOUND: u16 = 0x0107;
    pub const STREAM_NOT_FOUND: u16 = 0x0108;
    pub const INVALID_MAGIC_NUM: u16 = 0x0109;
    pub const RESOURCE_EXHAUSTED: u16 = 0x010A;
    pub const KERNEL_FAILED: u16 = 0x010B;
    pub const INNER_ERROR: u16 = 0x01FF;
}

/// Event-kind space and per-thread statistics bounds.
pub mod events {
    /// Raw event ids are `0..EVENT_MAX_NUM`.
    pub const EVENT_MAX_NUM: u32 = 64;

    /// First id of the user-defined range.
    pub const EVENT_USR_START: u32 = 48;

    /// Rows in the per-thread statistics table.
    pub const MAX_AICPU_THREAD_NUM: usize = 32;

    /// Kernel type marking a non-HWTS payload in the mapped queue.
    pub const DEFAULT_KERNEL_TYPE: u8 = 127;

    /// Bytes of user data copied from a generic mapped-queue message.
    pub const USER_DATA_PAYLOAD_LEN: usize = 40;

    /// Subscription mask for scheduler threads: every event kind.
    pub const CP_EVENT_MASK: u64 = u64::MAX;
}

/// Task status values in responses.
pub mod status {
    pub const TASK_SUCC: u16 = 0;
    pub const TASK_FAIL: u16 = 1;
}

/// Protocol negotiation.
pub mod protocol {
    /// Magic number a version negotiation message must carry.
    pub const VALID_MAGIC_NUM: u16 = 0x5A5A;

    /// Sentinel stream id when the layout carries none.
    pub const INVALID_STREAM_ID: u32 = u32::MAX;

    /// Name of the kernel that terminates a call-mode loop.
    pub const END_GRAPH_KERNEL: &str = "endGraph";

    /// Bit of the L2 control word enabling data dump.
    pub const DATADUMP_ENABLE_BIT: u32 = 49;
}

/// Topology bounds.
pub mod topology {
    /// Device ids must be below this.
    pub const DEVICE_NUM: u32 = 64;

    /// Maximum VF partitions per device.
    pub const DEVICE_MAX_SPLIT_NUM: u32 = 16;

    /// Bits of the AI-CPU occupy bitmap that are inspected.
    pub const DEVICE_MAX_CPU_NUM: u32 = 16;

    /// Physical index meaning "do not pin".
    pub const INVALID_AICPU_ID: u32 = u32::MAX;

    /// Log cadence while polling the host-pid bind.
    pub const BIND_LOG_EVERY: u64 = 1000;
}

/// Resource-manager bounds.
pub mod resources {
    /// Buffer tracker and model ids must be below this.
    pub const MAX_MODEL_COUNT: u32 = 1024;

    /// Alignment requested for tracked buffers.
    pub const BUF_ALIGN: u32 = 64;

    /// Huge-page flag bit for buffer allocations.
    pub const BUF_HUGEPAGE_FLAG: u64 = 1;

    /// Default wait-list capacity.
    pub const WAIT_LIST_CAPACITY: usize = 4096;
}

/// Error-log region geometry.
pub mod errlog {
    /// Bytes per slot.
    pub const SLOT_SIZE: usize = 256;

    /// Slots per TS context.
    pub const SLOT_COUNT: usize = 16;

    /// Total region size per context.
    pub const REGION_SIZE: usize = SLOT_SIZE * SLOT_COUNT;
}

/// Mapped-queue register layout.
pub mod mapped {
    /// Size of the mapped region per device.
    pub const REGION_SIZE: usize = 4096;

    /// Number of inbound message slots; threads pick one by index parity.
    pub const SLOT_NUM: usize = 2;

    /// Bytes per inbound slot.
    pub const SLOT_STRIDE: usize = 128;

    pub const OFF_STATUS: usize = 0;
    pub const OFF_SIZE: usize = 4;
    pub const OFF_TOPIC: usize = 8;
    pub const OFF_SUBTOPIC: usize = 12;
    pub const OFF_PID: usize = 16;
    pub const OFF_GROUP: usize = 20;
    pub const OFF_KERNEL_TYPE: usize = 24;
    pub const OFF_USER_DATA: usize = 32;

    /// Status value of a slot holding a message.
    pub const STATUS_VALID: u32 = 1;

    /// Status of a slot a poller has claimed but not yet released.
    pub const STATUS_CLAIMED: u32 = 2;

    /// Start of the per-core completion word array.
    pub const CQE_BASE: usize = 0x400;

    /// Cores addressable by the completion array.
    pub const CQE_MAX_CORES: usize = 64;
}

/// Outbound send policy.
pub mod coalescer {
    /// Default attempts for a TS-directed async message.
    pub const TS_SEND_RETRIES: u32 = 10;

    /// Default pause between attempts, in milliseconds.
    pub const TS_SEND_RETRY_INTERVAL_MS: u64 = 1;
}

/// Process-manager affinity retry policy.
pub mod affinity {
    pub const PROCMGR_RETRIES: u32 = 2;
    pub const PROCMGR_RETRY_INTERVAL_MS: u64 = 50;

    /// Environment switch selecting process-manager affinity.
    pub const PROCMGR_ENV: &str = "PROCMGR_AICPU_CPUSET";
}
