//! Memory-mapped message-queue transport.
//!
//! Each device exposes one register region with two inbound message slots
//! and a per-core completion word array. A worker owns the slot matching the
//! parity of its thread index and polls it; nothing here ever blocks.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::constants::events::{DEFAULT_KERNEL_TYPE, USER_DATA_PAYLOAD_LEN};
use crate::constants::mapped::*;
use crate::constants::status;
use crate::dispatch::kernel::HwtsTask;
use crate::error::{DrvError, DrvResult, SchedError};
use crate::transport::{MessageTransport, RegisterRegion, WaitOutcome};
use crate::types::{now_micros, Event, EventKind, Payload, Response, ThreadContext};

/// Serial numbers for HWTS tasks received over mapped queues.
static HWTS_SERIAL: AtomicU64 = AtomicU64::new(0);

/// Fields of one inbound slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotMessage {
    pub size: u32,
    pub topic: u32,
    pub sub_topic: u32,
    pub pid: u32,
    pub group: u32,
    pub kernel_type: u32,
    pub user_data: [u8; USER_DATA_PAYLOAD_LEN],
}

/// Byte offset of inbound slot `slot`.
pub fn slot_base(slot: usize) -> usize {
    (slot % SLOT_NUM) * SLOT_STRIDE
}

/// Byte offset of the completion word of `core`.
pub fn cqe_offset(core: usize) -> usize {
    CQE_BASE + (core % CQE_MAX_CORES) * 4
}

/// Publish a message into `slot`, status last. Used by the producer side.
pub fn post_message(region: &RegisterRegion, slot: usize, msg: &SlotMessage) -> DrvResult<()> {
    let base = slot_base(slot);
    region.write_u32(base + OFF_SIZE, msg.size)?;
    region.write_u32(base + OFF_TOPIC, msg.topic)?;
    region.write_u32(base + OFF_SUBTOPIC, msg.sub_topic)?;
    region.write_u32(base + OFF_PID, msg.pid)?;
    region.write_u32(base + OFF_GROUP, msg.group)?;
    region.write_u32(base + OFF_KERNEL_TYPE, msg.kernel_type)?;
    region.write_bytes(base + OFF_USER_DATA, &msg.user_data)?;
    region.write_u32_fenced(base + OFF_STATUS, STATUS_VALID)
}

/// Polling transport over a shared register region.
pub struct MappedQueueTransport {
    region: Arc<RegisterRegion>,
    slot: usize,
    core: usize,
    thread_index: usize,
}

impl MappedQueueTransport {
    pub fn new(region: Arc<RegisterRegion>, thread: &ThreadContext) -> Self {
        let slot = thread.index % SLOT_NUM;
        debug!(
            "Thread {} polls mapped slot {} on device {}",
            thread.index, slot, thread.device_id
        );
        Self {
            region,
            slot,
            core: thread.cqe_index(),
            thread_index: thread.index,
        }
    }

    fn read_slot(&self) -> DrvResult<Option<SlotMessage>> {
        let base = slot_base(self.slot);
        // Threads of the same parity share a slot; only one may claim it.
        if self
            .region
            .compare_exchange_u32(base + OFF_STATUS, STATUS_VALID, STATUS_CLAIMED)?
            .is_err()
        {
            return Ok(None);
        }
        let mut user_data = [0u8; USER_DATA_PAYLOAD_LEN];
        let fields = self
            .region
            .read_bytes(base + OFF_USER_DATA, &mut user_data)
            .and_then(|()| {
                Ok(SlotMessage {
                    size: self.region.read_u32(base + OFF_SIZE)?,
                    topic: self.region.read_u32(base + OFF_TOPIC)?,
                    sub_topic: self.region.read_u32(base + OFF_SUBTOPIC)?,
                    pid: self.region.read_u32(base + OFF_PID)?,
                    group: self.region.read_u32(base + OFF_GROUP)?,
                    kernel_type: self.region.read_u32(base + OFF_KERNEL_TYPE)?,
                    user_data,
                })
            });
        // Hand the slot back before dispatching.
        self.region.write_u32_fenced(base + OFF_STATUS, 0)?;
        fields.map(Some)
    }

    fn to_event(&self, msg: SlotMessage) -> DrvResult<Event> {
        let hwts = msg.topic == EventKind::TsHwtsKernel.raw()
            && msg.kernel_type != u32::from(DEFAULT_KERNEL_TYPE);
        let payload = if hwts {
            let kernel_type = u8::try_from(msg.kernel_type).map_err(|_| DrvError::ParaError)?;
            let serial = HWTS_SERIAL.fetch_add(1, Ordering::Relaxed);
            Payload::Kernel(HwtsTask::from_user_data(kernel_type, &msg.user_data, serial)?)
        } else {
            let len = (msg.size as usize).min(USER_DATA_PAYLOAD_LEN);
            Payload::Raw(Bytes::copy_from_slice(&msg.user_data[..len]))
        };
        let now = now_micros();
        Ok(Event {
            kind: msg.topic,
            sub_kind: msg.sub_topic,
            pid: msg.pid,
            group: msg.group,
            payload,
            submit_tick: now,
            sched_tick: now,
        })
    }

    /// Fail a consumed message that never reaches a handler.
    fn reject(&self, err: DrvError) -> DrvResult<()> {
        let word = (u32::from(SchedError::from(err).code()) << 16) | u32::from(status::TASK_FAIL);
        self.region.write_u32_fenced(cqe_offset(self.core), word)
    }
}

impl MessageTransport for MappedQueueTransport {
    fn name(&self) -> &'static str {
        "msgq"
    }

    fn wait_once(&mut self, _timeout: Duration) -> WaitOutcome {
        let msg = match self.read_slot() {
            Ok(Some(msg)) => msg,
            Ok(None) => return WaitOutcome::NoEvent,
            Err(e) => return WaitOutcome::Fatal(e),
        };
        trace!("Thread {} slot {} <- {:?}", self.thread_index, self.slot, msg);
        // Only HWTS submissions carry the rescue marker.
        let rescue = msg.pid == 0 && msg.topic == EventKind::TsHwtsKernel.raw();
        match self.to_event(msg) {
            Ok(event) if rescue => WaitOutcome::Rescue(event),
            Ok(event) => WaitOutcome::Event(event),
            Err(e) => {
                warn!("Thread {} rejected undecodable slot message: {}", self.thread_index, e);
                match self.reject(e) {
                    Ok(()) => WaitOutcome::NoEvent,
                    Err(e) => WaitOutcome::Fatal(e),
                }
            }
        }
    }

    fn respond(&mut self, response: &Response) -> DrvResult<()> {
        self.region
            .write_u32_fenced(cqe_offset(self.core), response.cqe_word())
    }
}
