//! Per-TS-context error-log slots.
//!
//! Each context owns a 4 KiB region split into sixteen 256-byte slots. A slot
//! is occupied while its tag word is non-zero. Handlers claim the first free
//! slot, TS reads it by offset, and the slot is cleared on acknowledgement or
//! when the report could not be delivered.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::constants::errlog::{REGION_SIZE, SLOT_COUNT, SLOT_SIZE};
use crate::error::{Result, SchedError};

const TAG_EMPTY: u32 = 0;
const TAG_AICORE: u32 = 1;
const TAG_AICPU: u32 = 2;

/// Fixed header: tag, model, stream, task, result.
const HEADER_LEN: usize = 20;

/// Longest kernel name stored in an AI-CPU record (NUL-terminated).
pub const MAX_KERNEL_NAME: usize = SLOT_SIZE - HEADER_LEN - 1;

/// One error-log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrRecord {
    AiCore {
        model_id: u32,
        stream_id: u32,
        task_id: u32,
        result: u32,
    },
    AiCpu {
        model_id: u32,
        stream_id: u32,
        task_id: u32,
        result: u32,
        kernel_name: String,
    },
}

impl ErrRecord {
    fn encode(&self, slot: &mut [u8]) {
        slot.fill(0);
        let mut out = &mut slot[..];
        match self {
            ErrRecord::AiCore { model_id, stream_id, task_id, result } => {
                out.put_u32_le(TAG_AICORE);
                out.put_u32_le(*model_id);
                out.put_u32_le(*stream_id);
                out.put_u32_le(*task_id);
                out.put_u32_le(*result);
            }
            ErrRecord::AiCpu { model_id, stream_id, task_id, result, kernel_name } => {
                out.put_u32_le(TAG_AICPU);
                out.put_u32_le(*model_id);
                out.put_u32_le(*stream_id);
                out.put_u32_le(*task_id);
                out.put_u32_le(*result);
                let name = kernel_name.as_bytes();
                out.put_slice(&name[..name.len().min(MAX_KERNEL_NAME)]);
            }
        }
    }

    fn decode(slot: &[u8]) -> Option<Self> {
        let mut buf = slot;
        let tag = buf.get_u32_le();
        let model_id = buf.get_u32_le();
        let stream_id = buf.get_u32_le();
        let task_id = buf.get_u32_le();
        let result = buf.get_u32_le();
        match tag {
            TAG_AICORE => Some(ErrRecord::AiCore { model_id, stream_id, task_id, result }),
            TAG_AICPU => {
                let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
                Some(ErrRecord::AiCpu {
                    model_id,
                    stream_id,
                    task_id,
                    result,
                    kernel_name: String::from_utf8_lossy(&buf[..end]).into_owned(),
                })
            }
            _ => None,
        }
    }
}

/// Body of the TS notification announcing an occupied slot:
/// `u32 ts_context, u32 offset`.
pub fn report_payload(ctx: u32, offset: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32_le(ctx);
    buf.put_u32_le(offset as u32);
    buf.freeze()
}

struct ContextLog {
    region: Box<[u8]>,
}

impl ContextLog {
    fn new() -> Self {
        Self {
            region: vec![0u8; REGION_SIZE].into_boxed_slice(),
        }
    }

    fn slot(&self, index: usize) -> &[u8] {
        &self.region[index * SLOT_SIZE..(index + 1) * SLOT_SIZE]
    }

    fn slot_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.region[index * SLOT_SIZE..(index + 1) * SLOT_SIZE]
    }

    fn occupied(&self, index: usize) -> bool {
        (&self.slot(index)[..4]).get_u32_le() != TAG_EMPTY
    }
}

/// Error-log regions keyed by TS context id.
#[derive(Default)]
pub struct ErrLogTable {
    contexts: DashMap<u32, Arc<Mutex<ContextLog>>>,
}

impl ErrLogTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn context(&self, ctx: u32) -> Arc<Mutex<ContextLog>> {
        Arc::clone(
            self.contexts
                .entry(ctx)
                .or_insert_with(|| Arc::new(Mutex::new(ContextLog::new())))
                .value(),
        )
    }

    /// Write `record` into the first free slot of `ctx` and return its byte
    /// offset inside the context region.
    pub fn add_err_log(&self, ctx: u32, record: &ErrRecord) -> Result<usize> {
        let log = self.context(ctx);
        let mut log = log.lock();
        let Some(index) = (0..SLOT_COUNT).find(|i| !log.occupied(*i)) else {
            error!("Error log of context {} is full, dropping {:?}", ctx, record);
            return Err(SchedError::ResourceExhausted(format!(
                "error log of context {} full",
                ctx
            )));
        };
        record.encode(log.slot_mut(index));
        let offset = index * SLOT_SIZE;
        debug!("Context {} error log slot {} <- {:?}", ctx, index, record);
        Ok(offset)
    }

    /// Clear the slot at `offset`.
    pub fn set_unit_empty(&self, ctx: u32, offset: usize) -> Result<()> {
        if offset % SLOT_SIZE != 0 || offset >= REGION_SIZE {
            return Err(SchedError::ParameterInvalid(format!(
                "error log offset {:#x} is not a slot boundary",
                offset
            )));
        }
        let Some(log) = self.contexts.get(&ctx).map(|l| Arc::clone(l.value())) else {
            warn!("Clearing error log of unknown context {}", ctx);
            return Ok(());
        };
        log.lock().slot_mut(offset / SLOT_SIZE).fill(0);
        Ok(())
    }

    /// Decode the record at `offset`, if the slot is occupied.
    pub fn read(&self, ctx: u32, offset: usize) -> Option<ErrRecord> {
        if offset % SLOT_SIZE != 0 || offset >= REGION_SIZE {
            return None;
        }
        let log = self.contexts.get(&ctx).map(|l| Arc::clone(l.value()))?;
        let log = log.lock();
        ErrRecord::decode(log.slot(offset / SLOT_SIZE))
    }

    /// Number of occupied slots of `ctx`.
    pub fn occupied(&self, ctx: u32) -> usize {
        self.contexts
            .get(&ctx)
            .map(|l| {
                let log = l.lock();
                (0..SLOT_COUNT).filter(|i| log.occupied(*i)).count()
            })
            .unwrap_or(0)
    }
}
