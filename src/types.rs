//! Core domain types shared by the transports and the dispatch engine.
//!
//! An [`Event`] is produced by a transport and consumed exactly once by the
//! thread that received it; a [`Response`] travels back through the same
//! transport.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::constants::{events, mapped, status};
use crate::dispatch::kernel::HwtsTask;

/// How events reach the worker threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedMode {
    /// Driver event queue with bounded blocking waits.
    Interrupt,
    /// Memory-mapped register queue, polled.
    Msgq,
}

impl fmt::Display for SchedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedMode::Interrupt => write!(f, "interrupt"),
            SchedMode::Msgq => write!(f, "msgq"),
        }
    }
}

/// Whether the scheduler owns the process or runs as threads of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Process,
    Thread,
}

/// Where the scheduler binary is deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployContext {
    /// On the accelerator's own AI-CPU cores.
    Device,
    /// On the host, emulating device cores.
    Host,
    /// On host CPUs reserved for AI-CPU work.
    HostCpu,
}

impl DeployContext {
    /// Whether workers pin themselves to physical cores.
    pub fn pins_threads(&self) -> bool {
        matches!(self, DeployContext::Device | DeployContext::HostCpu)
    }
}

/// Who establishes worker CPU affinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffinityMode {
    /// The worker pins itself.
    SelfManaged,
    /// A supervisor process pins the worker on request.
    ProcessManager,
}

/// Event kinds with a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventKind {
    RandomKernel = 0,
    DvppMsg = 1,
    FrMsg = 2,
    TsHwtsKernel = 3,
    AicpuMsg = 4,
    TsCtrlMsg = 5,
    QueueEnqueue = 6,
    QueueFullToNotFull = 7,
    QueueEmptyToNotEmpty = 8,
    TdtEnqueue = 9,
    AcpuMsgType1 = 17,
    SplitKernel = 20,
    DvppMpiMsg = 21,
    CdqMsg = 22,
    DrvMsg = 24,
    QsMsg = 25,
    ProxyMsg = events::EVENT_USR_START + 8,
}

impl EventKind {
    /// Every kind with a handler.
    pub const ALL: [EventKind; 17] = [
        EventKind::RandomKernel,
        EventKind::DvppMsg,
        EventKind::FrMsg,
        EventKind::TsHwtsKernel,
        EventKind::AicpuMsg,
        EventKind::TsCtrlMsg,
        EventKind::QueueEnqueue,
        EventKind::QueueFullToNotFull,
        EventKind::QueueEmptyToNotEmpty,
        EventKind::TdtEnqueue,
        EventKind::AcpuMsgType1,
        EventKind::SplitKernel,
        EventKind::DvppMpiMsg,
        EventKind::CdqMsg,
        EventKind::DrvMsg,
        EventKind::QsMsg,
        EventKind::ProxyMsg,
    ];

    /// Resolve a raw driver id. `None` for ids without a handler.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| *k as u32 == raw)
    }

    /// Raw driver id.
    pub fn raw(self) -> u32 {
        self as u32
    }

    /// Stable name for logs and metric labels.
    pub fn name(self) -> &'static str {
        match self {
            EventKind::RandomKernel => "random_kernel",
            EventKind::DvppMsg => "dvpp_msg",
            EventKind::FrMsg => "fr_msg",
            EventKind::TsHwtsKernel => "ts_hwts_kernel",
            EventKind::AicpuMsg => "aicpu_msg",
            EventKind::TsCtrlMsg => "ts_ctrl_msg",
            EventKind::QueueEnqueue => "queue_enqueue",
            EventKind::QueueFullToNotFull => "queue_full_to_not_full",
            EventKind::QueueEmptyToNotEmpty => "queue_empty_to_not_empty",
            EventKind::TdtEnqueue => "tdt_enqueue",
            EventKind::AcpuMsgType1 => "acpu_msg_type1",
            EventKind::SplitKernel => "split_kernel",
            EventKind::DvppMpiMsg => "dvpp_mpi_msg",
            EventKind::CdqMsg => "cdq_msg",
            EventKind::DrvMsg => "drv_msg",
            EventKind::QsMsg => "qs_msg",
            EventKind::ProxyMsg => "proxy_msg",
        }
    }
}

/// Event body as delivered by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Undecoded bytes; layout depends on the kind.
    Raw(Bytes),
    /// Kernel task already extracted from hardware registers.
    Kernel(HwtsTask),
}

impl Payload {
    /// Raw bytes, empty for pre-decoded payloads.
    pub fn bytes(&self) -> Bytes {
        match self {
            Payload::Raw(b) => b.clone(),
            Payload::Kernel(_) => Bytes::new(),
        }
    }
}

/// One inbound event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Raw kind id as reported by the source.
    pub kind: u32,
    pub sub_kind: u32,
    pub pid: u32,
    pub group: u32,
    pub payload: Payload,
    /// Submission timestamp in microseconds.
    pub submit_tick: u64,
    /// Scheduling timestamp in microseconds.
    pub sched_tick: u64,
}

impl Event {
    /// Event with raw payload stamped with the current time.
    pub fn new(kind: u32, sub_kind: u32, payload: impl Into<Bytes>) -> Self {
        let now = now_micros();
        Self {
            kind,
            sub_kind,
            pid: std::process::id(),
            group: 0,
            payload: Payload::Raw(payload.into()),
            submit_tick: now,
            sched_tick: now,
        }
    }

    /// Resolve the kind; `None` if no handler exists.
    pub fn event_kind(&self) -> Option<EventKind> {
        EventKind::from_raw(self.kind)
    }
}

/// Completion report sent back through the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub kind: u32,
    pub sub_event: u32,
    pub mailbox_id: u16,
    pub serial_no: u64,
    /// `TASK_SUCC` or `TASK_FAIL`.
    pub status: u16,
    /// Result code, `0` on success.
    pub result: u16,
}

impl Response {
    /// Response for an event, derived from its handler result code.
    pub fn for_event(event: &Event, result: u16) -> Self {
        Self {
            kind: event.kind,
            sub_event: event.sub_kind,
            mailbox_id: 0,
            serial_no: 0,
            status: if result == 0 {
                status::TASK_SUCC
            } else {
                status::TASK_FAIL
            },
            result,
        }
    }

    /// Zero-status reply for a rescue message.
    pub fn canned(event: &Event) -> Self {
        Self {
            kind: event.kind,
            sub_event: event.sub_kind,
            mailbox_id: 0,
            serial_no: 0,
            status: 0,
            result: 0,
        }
    }

    /// Hardware completion word: `[31:16]` error code, `[15:0]` status.
    pub fn cqe_word(&self) -> u32 {
        (u32::from(self.result) << 16) | u32::from(self.status)
    }

    /// Serialized ack body for the interrupt backend.
    pub fn to_bytes(&self) -> Bytes {
        use bytes::BufMut;
        let mut buf = bytes::BytesMut::with_capacity(16);
        buf.put_u16_le(self.mailbox_id);
        buf.put_u64_le(self.serial_no);
        buf.put_u16_le(self.status);
        buf.put_u16_le(self.result);
        buf.freeze()
    }
}

/// Thread execution context recorded at worker start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadContext {
    pub index: usize,
    pub device_id: u32,
    pub host_pid: u32,
    pub vf_id: u32,
    pub unique_vf_id: u32,
}

impl ThreadContext {
    /// Completion slot used by this thread in the mapped queue.
    pub fn cqe_index(&self) -> usize {
        self.index % mapped::CQE_MAX_CORES
    }
}

/// Microseconds since the Unix epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
