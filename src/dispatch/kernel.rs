//! Kernel task descriptors and the kernel-execution boundary.
//!
//! HWTS payload layout (little endian):
//!
//! ```text
//! 0   u16 mailbox_id
//! 2   u8  kernel_type
//! 3   u8  reserved
//! 4   u32 stream_id        (version 0 only)
//! 8   u32 task_id
//! 12  u64 serial_no
//! 20  u64 so_addr
//! 28  u64 name_addr
//! 36  u64 param_base
//! 44  u64 l2_ctrl
//! 52  u32 extra
//! 56  u16 so_name_len, so_name bytes
//!     u16 kernel_name_len, kernel_name bytes
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::protocol::{DATADUMP_ENABLE_BIT, INVALID_STREAM_ID};
use crate::context::SchedulerContext;
use crate::driver::BufHandle;
use crate::error::{DrvError, DrvResult, Result, SchedError};
use crate::resources::{BatchMode, BufferTracker, Released, WaitList, WaitManagers};
use crate::types::{EventKind, ThreadContext};

const HWTS_HEADER_LEN: usize = 56;

/// Bytes of kernel data carried in a mapped-queue slot.
pub const MAPPED_USER_DATA_LEN: usize = 40;

/// Kernel types understood by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KernelType {
    Cce = 0,
    Fwk = 1,
    Aicpu = 2,
    AicpuCustom = 4,
    /// Collective-communication kernels: no timeout monitoring, no dump.
    Kfc = 5,
}

impl KernelType {
    pub fn from_raw(raw: u8) -> DrvResult<Self> {
        match raw {
            0 => Ok(KernelType::Cce),
            1 => Ok(KernelType::Fwk),
            2 => Ok(KernelType::Aicpu),
            4 => Ok(KernelType::AicpuCustom),
            5 => Ok(KernelType::Kfc),
            _ => Err(DrvError::ParaError),
        }
    }
}

/// Kernel descriptor fields shared by every source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelDesc {
    pub so_name: String,
    pub kernel_name: String,
    pub so_addr: u64,
    pub name_addr: u64,
    pub param_base: u64,
    pub l2_ctrl: u64,
    pub extra: u32,
}

/// A kernel ready for execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelTask {
    pub kernel_type: KernelType,
    pub desc: KernelDesc,
}

impl KernelTask {
    /// AICPU-type kernel built for fixed-function forwarding.
    pub fn synthetic(kernel_name: &str, param_base: u64) -> Self {
        Self {
            kernel_type: KernelType::Aicpu,
            desc: KernelDesc {
                kernel_name: kernel_name.to_string(),
                param_base,
                ..KernelDesc::default()
            },
        }
    }

    pub fn dump_enabled(&self) -> bool {
        self.kernel_type != KernelType::Kfc && self.desc.l2_ctrl & (1u64 << DATADUMP_ENABLE_BIT) != 0
    }

    pub fn name(&self) -> &str {
        &self.desc.kernel_name
    }
}

/// Kernel submission from the hardware task scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwtsTask {
    pub mailbox_id: u16,
    pub serial_no: u64,
    /// Raw type; resolved by [`HwtsTask::kernel_task`].
    pub kernel_type: u8,
    pub stream_id: u32,
    pub task_id: u32,
    pub desc: KernelDesc,
}

fn get_string(buf: &mut &[u8]) -> DrvResult<String> {
    if buf.remaining() < 2 {
        return Err(DrvError::ParaError);
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(DrvError::ParaError);
    }
    let s = String::from_utf8_lossy(&buf[..len]).into_owned();
    buf.advance(len);
    Ok(s)
}

impl HwtsTask {
    /// Decode an HWTS payload. The stream id is only carried by version 0.
    pub fn decode(mut buf: &[u8], version: u16) -> DrvResult<Self> {
        if buf.len() < HWTS_HEADER_LEN {
            return Err(DrvError::ParaError);
        }
        let mailbox_id = buf.get_u16_le();
        let kernel_type = buf.get_u8();
        buf.advance(1);
        let stream_id = buf.get_u32_le();
        let task_id = buf.get_u32_le();
        let serial_no = buf.get_u64_le();
        let so_addr = buf.get_u64_le();
        let name_addr = buf.get_u64_le();
        let param_base = buf.get_u64_le();
        let l2_ctrl = buf.get_u64_le();
        let extra = buf.get_u32_le();
        let so_name = get_string(&mut buf)?;
        let kernel_name = get_string(&mut buf)?;
        Ok(Self {
            mailbox_id,
            serial_no,
            kernel_type,
            stream_id: if version == 0 { stream_id } else { INVALID_STREAM_ID },
            task_id,
            desc: KernelDesc {
                so_name,
                kernel_name,
                so_addr,
                name_addr,
                param_base,
                l2_ctrl,
                extra,
            },
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            HWTS_HEADER_LEN + 4 + self.desc.so_name.len() + self.desc.kernel_name.len(),
        );
        buf.put_u16_le(self.mailbox_id);
        buf.put_u8(self.kernel_type);
        buf.put_u8(0);
        buf.put_u32_le(self.stream_id);
        buf.put_u32_le(self.task_id);
        buf.put_u64_le(self.serial_no);
        buf.put_u64_le(self.desc.so_addr);
        buf.put_u64_le(self.desc.name_addr);
        buf.put_u64_le(self.desc.param_base);
        buf.put_u64_le(self.desc.l2_ctrl);
        buf.put_u32_le(self.desc.extra);
        for s in [&self.desc.so_name, &self.desc.kernel_name] {
            buf.put_u16_le(s.len() as u16);
            buf.put_slice(s.as_bytes());
        }
        buf.freeze()
    }

    /// Mailbox id and serial number of a payload that may not fully decode,
    /// so a failure response can still be addressed.
    pub fn peek_ids(buf: &[u8]) -> Option<(u16, u64)> {
        if buf.len() < 20 {
            return None;
        }
        let mailbox_id = (&buf[0..2]).get_u16_le();
        let serial_no = (&buf[12..20]).get_u64_le();
        Some((mailbox_id, serial_no))
    }

    /// Decode the kernel data of a mapped-queue slot:
    /// `u16 mailbox_id, u16 reserved, u32 task_id, u64 so_addr,
    /// u64 name_addr, u64 param_base, u64 l2_ctrl`.
    pub fn from_user_data(kernel_type: u8, mut data: &[u8], serial_no: u64) -> DrvResult<Self> {
        if data.len() < MAPPED_USER_DATA_LEN {
            return Err(DrvError::ParaError);
        }
        let mailbox_id = data.get_u16_le();
        data.advance(2);
        let task_id = data.get_u32_le();
        let so_addr = data.get_u64_le();
        let name_addr = data.get_u64_le();
        let param_base = data.get_u64_le();
        let l2_ctrl = data.get_u64_le();
        Ok(Self {
            mailbox_id,
            serial_no,
            kernel_type,
            stream_id: INVALID_STREAM_ID,
            task_id,
            desc: KernelDesc {
                so_addr,
                name_addr,
                param_base,
                l2_ctrl,
                ..KernelDesc::default()
            },
        })
    }

    pub fn to_user_data(&self) -> [u8; MAPPED_USER_DATA_LEN] {
        let mut out = [0u8; MAPPED_USER_DATA_LEN];
        let mut buf = &mut out[..];
        buf.put_u16_le(self.mailbox_id);
        buf.put_u16_le(0);
        buf.put_u32_le(self.task_id);
        buf.put_u64_le(self.desc.so_addr);
        buf.put_u64_le(self.desc.name_addr);
        buf.put_u64_le(self.desc.param_base);
        buf.put_u64_le(self.desc.l2_ctrl);
        out
    }

    /// Resolve the kernel type. Unknown types fail with a driver error.
    pub fn kernel_task(&self) -> DrvResult<KernelTask> {
        Ok(KernelTask {
            kernel_type: KernelType::from_raw(self.kernel_type)?,
            desc: self.desc.clone(),
        })
    }
}

/// Opaque bodies handed to the executor by control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlForward {
    DumpData,
    DumpDataDebug,
    DumpMappingInfo,
    PlatformInfoLoad,
}

/// Scheduler services a running kernel may use on behalf of the stream
/// that submitted it.
pub struct KernelEnv<'a> {
    ctx: &'a SchedulerContext,
    thread: &'a ThreadContext,
    stream_id: u32,
}

impl<'a> KernelEnv<'a> {
    pub fn new(ctx: &'a SchedulerContext, thread: &'a ThreadContext, stream_id: u32) -> Self {
        Self {
            ctx,
            thread,
            stream_id,
        }
    }

    pub fn thread(&self) -> &ThreadContext {
        self.thread
    }

    /// Submitting stream, [`INVALID_STREAM_ID`] for synthetic kernels.
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Model owning the submitting stream.
    pub fn model_id(&self) -> Result<u32> {
        if self.stream_id == INVALID_STREAM_ID {
            return Err(SchedError::StreamNotFound(self.stream_id));
        }
        self.ctx.streams.model_of(self.stream_id)
    }

    pub fn waits(&self) -> &WaitManagers {
        &self.ctx.waits
    }

    /// Consume an arrival on `list[id]` or suspend the submitting stream on
    /// it. Returns whether the stream must wait for a later resume.
    pub fn wait_on(&self, list: &WaitList, id: usize) -> Result<bool> {
        if self.stream_id == INVALID_STREAM_ID {
            return Err(SchedError::StreamNotFound(self.stream_id));
        }
        list.wait_event(id, self.stream_id)
    }

    /// Take a table lock. A refused lock parks the stream on the
    /// TableUnlock list for `table_id` and returns `false`.
    pub fn lock_table(&self, table_id: u32, write: bool) -> Result<bool> {
        let locks = &self.ctx.table_locks;
        let acquired = if write {
            locks.wr_lock(table_id)
        } else {
            locks.rd_lock(table_id)
        };
        if acquired {
            return Ok(true);
        }
        self.wait_on(&self.ctx.waits.table_unlock, table_id as usize)?;
        Ok(false)
    }

    pub fn unlock_table(&self, table_id: u32) -> Released {
        self.ctx.table_locks.unlock(table_id)
    }

    fn buffers(&self) -> Result<&BufferTracker> {
        self.ctx.buffers(self.thread.device_id).ok_or_else(|| {
            SchedError::ParameterInvalid(format!("no buffer tracker for device {}", self.thread.device_id))
        })
    }

    /// Allocate a buffer released when the owning model is destroyed.
    pub fn malloc(&self, size: u64) -> Result<BufHandle> {
        self.buffers()?.malloc_and_guard(self.model_id()?, size)
    }

    pub fn malloc_batch(&self, sizes: &[u64], mode: BatchMode) -> Result<Vec<BufHandle>> {
        self.buffers()?.malloc_batch(self.model_id()?, sizes, mode)
    }
}

/// Synchronous kernel-execution boundary. Return values are driver-style
/// result codes: `0` on success.
pub trait KernelExecutor: Send + Sync {
    fn execute(&self, task: &KernelTask, env: &KernelEnv<'_>) -> i32;

    /// Asynchronous, CDQ and notification traffic the scheduler only relays.
    fn forward(&self, _kind: EventKind, _sub_kind: u32, _payload: &[u8]) -> i32 {
        0
    }

    /// Resume a stream whose wait condition fired.
    fn resume_stream(&self, _model_id: u32, _stream_id: u32) -> i32 {
        0
    }

    /// Dump inputs and outputs of an executed kernel.
    fn dump(&self, _task: &KernelTask) -> i32 {
        0
    }

    fn control(&self, _op: ControlForward, _body: &[u8]) -> i32 {
        0
    }
}
