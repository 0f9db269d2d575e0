//! Per-thread event dispatch.
//!
//! One [`Dispatcher`] runs on each worker. A cycle waits once on the
//! transport, runs the handler for the event kind, sends exactly one
//! response through the same transport and finally flushes the outbound
//! slot. Handlers never block on another worker.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crossbeam::utils::CachePadded;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::coalescer::{OutboundMsg, Outbox};
use crate::constants::events::{EVENT_MAX_NUM, MAX_AICPU_THREAD_NUM};
use crate::constants::protocol::{END_GRAPH_KERNEL, INVALID_STREAM_ID, VALID_MAGIC_NUM};
use crate::context::SchedulerContext;
use crate::dispatch::control::{ControlMsg, ModelOp, MSG_VERSION_1};
use crate::dispatch::kernel::{ControlForward, HwtsTask, KernelEnv, KernelTask, KernelType};
use crate::driver::KillReason;
use crate::errlog::{self, ErrRecord};
use crate::error::{DrvError, Result, SchedError};
use crate::reliability::metrics;
use crate::resources::WaitList;
use crate::transport::{MessageTransport, WaitOutcome};
use crate::types::{Event, EventKind, Payload, Response, ThreadContext};

const KIND_SLOTS: usize = EVENT_MAX_NUM as usize;

type KindCounters = CachePadded<[AtomicU64; KIND_SLOTS]>;

fn counters() -> Vec<KindCounters> {
    (0..MAX_AICPU_THREAD_NUM)
        .map(|_| CachePadded::new(std::array::from_fn(|_| AtomicU64::new(0))))
        .collect()
}

/// Received/processed counters per thread and event kind.
pub struct EventStats {
    received: Vec<KindCounters>,
    processed: Vec<KindCounters>,
}

/// Totals for one event kind.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct KindTotals {
    pub kind: u32,
    pub name: &'static str,
    pub received: u64,
    pub processed: u64,
}

impl EventStats {
    pub fn new() -> Self {
        Self {
            received: counters(),
            processed: counters(),
        }
    }

    /// Rows beyond the table share row 0.
    fn row(thread: usize) -> usize {
        if thread < MAX_AICPU_THREAD_NUM {
            thread
        } else {
            0
        }
    }

    fn bump(table: &[KindCounters], thread: usize, kind: u32) {
        if let Some(slot) = table[Self::row(thread)].get(kind as usize) {
            slot.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_received(&self, thread: usize, kind: u32) {
        Self::bump(&self.received, thread, kind);
    }

    pub fn record_processed(&self, thread: usize, kind: u32) {
        Self::bump(&self.processed, thread, kind);
    }

    pub fn received(&self, thread: usize, kind: u32) -> u64 {
        self.received[Self::row(thread)]
            .get(kind as usize)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn processed(&self, thread: usize, kind: u32) -> u64 {
        self.processed[Self::row(thread)]
            .get(kind as usize)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Totals across threads for every kind with a handler.
    pub fn totals(&self) -> Vec<KindTotals> {
        EventKind::ALL
            .iter()
            .map(|kind| {
                let k = kind.raw() as usize;
                KindTotals {
                    kind: kind.raw(),
                    name: kind.name(),
                    received: self.received.iter().map(|r| r[k].load(Ordering::Relaxed)).sum(),
                    processed: self.processed.iter().map(|r| r[k].load(Ordering::Relaxed)).sum(),
                }
            })
            .collect()
    }

    /// Log the non-zero totals and return them as JSON.
    pub fn lastword(&self) -> String {
        let totals: Vec<KindTotals> = self
            .totals()
            .into_iter()
            .filter(|t| t.received > 0 || t.processed > 0)
            .collect();
        for t in &totals {
            info!(
                "lastword: {}({}) received={} processed={}",
                t.name, t.kind, t.received, t.processed
            );
        }
        serde_json::to_string(&totals).unwrap_or_else(|e| {
            warn!("Failed to render lastword stats: {}", e);
            String::from("[]")
        })
    }
}

impl Default for EventStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Sub-kinds of [`EventKind::AicpuMsg`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AicpuMsgKind {
    ExecuteModel = 0,
    RepeatModel = 1,
    EndGraph = 2,
    Notify = 3,
    TableUnlock = 4,
}

impl AicpuMsgKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(AicpuMsgKind::ExecuteModel),
            1 => Some(AicpuMsgKind::RepeatModel),
            2 => Some(AicpuMsgKind::EndGraph),
            3 => Some(AicpuMsgKind::Notify),
            4 => Some(AicpuMsgKind::TableUnlock),
            _ => None,
        }
    }

    /// Event carrying `id` (model, notify or table id).
    pub fn event(self, id: u32) -> Event {
        Event::new(EventKind::AicpuMsg.raw(), self as u32, id_payload(id))
    }
}

/// Little-endian `u32` body shared by id-only events.
pub fn id_payload(id: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32_le(id);
    buf.freeze()
}

fn read_id(event: &Event) -> Result<u32> {
    let bytes = event.payload.bytes();
    if bytes.len() < 4 {
        return Err(SchedError::ParameterInvalid(format!(
            "event kind {} needs a 4-byte id, got {} bytes",
            event.kind,
            bytes.len()
        )));
    }
    Ok((&bytes[..4]).get_u32_le())
}

/// Response addressed back to the submitter of `event`.
pub fn response_for(event: &Event, code: u16) -> Response {
    let mut resp = Response::for_event(event, code);
    let ids = match &event.payload {
        Payload::Kernel(task) => Some((task.mailbox_id, task.serial_no)),
        Payload::Raw(bytes) if is_kernel_kind(event.kind) => HwtsTask::peek_ids(bytes),
        Payload::Raw(_) => None,
    };
    if let Some((mailbox_id, serial_no)) = ids {
        resp.mailbox_id = mailbox_id;
        resp.serial_no = serial_no;
    }
    resp
}

fn is_kernel_kind(kind: u32) -> bool {
    matches!(
        EventKind::from_raw(kind),
        Some(EventKind::TsHwtsKernel | EventKind::RandomKernel | EventKind::SplitKernel)
    )
}

/// What to send once a handler returns successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    Respond,
    /// The protocol forbids a response (call-mode abort, endGraph).
    Suppress,
}

/// Outcome of one [`Dispatcher::do_once`] cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    Handled,
    Timeout,
    /// Nothing to do; polling transports spin on this.
    Idle,
    /// A fatal driver condition cleared the running flag.
    Stopped(DrvError),
}

/// Dispatch loop of one worker.
pub struct Dispatcher<T: MessageTransport> {
    ctx: Arc<SchedulerContext>,
    transport: T,
    thread: ThreadContext,
    outbox: Outbox,
    call_mode: bool,
    call_exit: bool,
}

impl<T: MessageTransport> Dispatcher<T> {
    pub fn new(ctx: Arc<SchedulerContext>, transport: T, thread: ThreadContext) -> Self {
        let outbox = ctx.outbox();
        Self {
            ctx,
            transport,
            thread,
            outbox,
            call_mode: false,
            call_exit: false,
        }
    }

    pub fn thread(&self) -> &ThreadContext {
        &self.thread
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Ask a call-mode loop to return after the current cycle.
    pub fn request_exit(&mut self) {
        self.call_exit = true;
    }

    /// Run until the scheduler's running flag is cleared.
    pub fn run_loop(&mut self) {
        info!(
            "Thread {} dispatching on device {} via {}",
            self.thread.index,
            self.thread.device_id,
            self.transport.name()
        );
        while self.ctx.is_running() {
            if self.do_once() == Cycle::Idle {
                std::hint::spin_loop();
            }
        }
        info!("Thread {} left dispatch loop", self.thread.index);
    }

    /// Dispatch on the calling thread until an exit is requested, the
    /// running flag is cleared or the configured number of consecutive
    /// timeouts elapses.
    ///
    /// Only blocking transports report timeouts. A polling transport such
    /// as the mapped queue returns no event instead, so over it this loop
    /// ends only on an exit request or a cleared running flag.
    pub fn run_call_mode(&mut self) -> Result<()> {
        self.call_mode = true;
        self.call_exit = false;
        let max_timeouts = self.ctx.config.call_mode_max_timeouts;
        let mut timeouts = 0u32;
        debug!("Thread {} entering call mode", self.thread.index);
        loop {
            if self.call_exit || !self.ctx.is_running() {
                debug!("Thread {} leaving call mode", self.thread.index);
                return Ok(());
            }
            match self.do_once() {
                Cycle::Handled => timeouts = 0,
                Cycle::Idle => std::hint::spin_loop(),
                Cycle::Timeout => {
                    timeouts += 1;
                    if timeouts >= max_timeouts {
                        warn!(
                            "Thread {} call mode gave up after {} timeouts",
                            self.thread.index, timeouts
                        );
                        return Err(DrvError::Timeout.into());
                    }
                }
                Cycle::Stopped(e) => return Err(e.into()),
            }
        }
    }

    /// Wait for, handle and answer at most one event.
    pub fn do_once(&mut self) -> Cycle {
        let cycle = match self.transport.wait_once(self.ctx.config.event_wait_timeout) {
            WaitOutcome::Event(event) => {
                self.dispatch(event);
                Cycle::Handled
            }
            WaitOutcome::Rescue(event) => {
                debug!(
                    "Thread {} rescue message kind {}, canned reply",
                    self.thread.index, event.kind
                );
                self.send(Response::canned(&event));
                Cycle::Handled
            }
            WaitOutcome::Timeout => Cycle::Timeout,
            WaitOutcome::NoEvent => Cycle::Idle,
            WaitOutcome::Fatal(e) => self.on_wait_error(e),
        };
        if let Err(e) = self.outbox.flush() {
            warn!("Thread {} outbound flush failed: {}", self.thread.index, e);
        }
        cycle
    }

    fn on_wait_error(&mut self, err: DrvError) -> Cycle {
        match err {
            DrvError::IllegalCpu => {
                error!(
                    "Thread {} received an event on an illegal CPU, requesting kill",
                    self.thread.index
                );
                if let Err(e) = self
                    .ctx
                    .driver
                    .request_kill(self.thread.device_id, KillReason::IllegalCpu)
                {
                    error!("Kill request failed: {}", e);
                }
                self.ctx.set_running(false);
                Cycle::Stopped(err)
            }
            DrvError::ProcessExit | DrvError::ParaError => {
                info!("Thread {} stops on wait error: {}", self.thread.index, err);
                self.ctx.set_running(false);
                Cycle::Stopped(err)
            }
            other => {
                warn!("Thread {} wait failed: {}", self.thread.index, other);
                Cycle::Idle
            }
        }
    }

    fn send(&mut self, response: Response) {
        match self.transport.respond(&response) {
            Ok(()) => metrics::record_response(self.transport.name()),
            Err(e) => error!(
                "Thread {} response for kind {} sub {} failed: {}",
                self.thread.index, response.kind, response.sub_event, e
            ),
        }
    }

    fn dispatch(&mut self, event: Event) {
        let index = self.thread.index;
        self.ctx.stats.record_received(index, event.kind);

        let Some(kind) = event.event_kind() else {
            metrics::record_unknown_event();
            let err = SchedError::NotFoundEvent(event.kind);
            error!("Thread {}: {} (sub {}, pid {})", index, err, event.sub_kind, event.pid);
            self.send(response_for(&event, err.code()));
            return;
        };
        metrics::record_event_received(kind);

        let result = self.handle(kind, &event);
        self.ctx.stats.record_processed(index, event.kind);
        metrics::record_event_processed(kind);

        match result {
            Ok(Reply::Respond) => self.send(response_for(&event, 0)),
            Ok(Reply::Suppress) => debug!("Thread {} {} handled without response", index, kind.name()),
            Err(e) => {
                warn!("Thread {} {} sub {} failed: {}", index, kind.name(), event.sub_kind, e);
                self.send(response_for(&event, e.code()));
            }
        }
    }

    fn handle(&mut self, kind: EventKind, event: &Event) -> Result<Reply> {
        match kind {
            EventKind::TsHwtsKernel | EventKind::RandomKernel | EventKind::SplitKernel => {
                self.handle_kernel(event)
            }
            EventKind::DvppMsg => self.handle_fixed_function(event, "DvppHandleEvent"),
            EventKind::DvppMpiMsg => self.handle_fixed_function(event, "ProcessDvppMpiEvent"),
            EventKind::FrMsg => self.handle_fixed_function(event, "RetrEventKernel"),
            EventKind::AicpuMsg => self.handle_aicpu_msg(event),
            EventKind::TsCtrlMsg => self.handle_control(event),
            EventKind::QueueEmptyToNotEmpty => self.handle_queue_not_empty(kind, event),
            EventKind::QueueFullToNotFull => self.handle_queue_not_full(kind, event),
            EventKind::QueueEnqueue | EventKind::TdtEnqueue => {
                if self.ctx.config.skip_enqueue_notify {
                    debug!("Enqueue notification {} skipped", kind.name());
                    return Ok(Reply::Respond);
                }
                self.forward(kind, event)
            }
            EventKind::AcpuMsgType1
            | EventKind::CdqMsg
            | EventKind::DrvMsg
            | EventKind::QsMsg
            | EventKind::ProxyMsg => self.forward(kind, event),
        }
    }

    fn forward(&self, kind: EventKind, event: &Event) -> Result<Reply> {
        let rc = self
            .ctx
            .executor
            .forward(kind, event.sub_kind, &event.payload.bytes());
        if rc != 0 {
            return Err(SchedError::KernelFailed(rc));
        }
        Ok(Reply::Respond)
    }

    fn handle_kernel(&mut self, event: &Event) -> Result<Reply> {
        let decoded;
        let task = match &event.payload {
            Payload::Kernel(task) => task,
            Payload::Raw(bytes) => {
                decoded = HwtsTask::decode(bytes, self.ctx.msg_version())?;
                &decoded
            }
        };
        let kernel = task.kernel_task().map_err(|e| {
            error!("Task {} has unknown kernel type {}", task.task_id, task.kernel_type);
            SchedError::from(e)
        })?;

        if self.call_mode && kernel.name() == END_GRAPH_KERNEL {
            info!("Thread {} reached {}, leaving call mode", self.thread.index, END_GRAPH_KERNEL);
            self.call_exit = true;
            return Ok(Reply::Suppress);
        }

        let env = KernelEnv::new(&self.ctx, &self.thread, task.stream_id);
        let rc = if kernel.kernel_type == KernelType::Kfc {
            self.ctx.executor.execute(&kernel, &env)
        } else {
            self.execute_timed(&kernel, &env)
        };
        if rc != 0 {
            self.report_kernel_failure(task, &kernel, rc);
            return Err(SchedError::KernelFailed(rc));
        }

        if kernel.dump_enabled() {
            let dump_rc = self.ctx.executor.dump(&kernel);
            if dump_rc != 0 {
                warn!("Dump of kernel {} failed: {}", kernel.name(), dump_rc);
            }
        }
        Ok(Reply::Respond)
    }

    fn execute_timed(&self, kernel: &KernelTask, env: &KernelEnv<'_>) -> i32 {
        let start = Instant::now();
        let rc = self.ctx.executor.execute(kernel, env);
        let limit = self.ctx.op_execute_timeout();
        if self.ctx.op_timer_enabled() && limit > 0 {
            let elapsed = start.elapsed();
            if elapsed > Duration::from_secs(u64::from(limit)) {
                warn!(
                    "Kernel {} ran {:?}, over the {}s execute timeout",
                    kernel.name(),
                    elapsed,
                    limit
                );
            }
        }
        rc
    }

    /// Record an AI-CPU error for the model owning the task's stream and
    /// queue the report to TS.
    fn report_kernel_failure(&mut self, task: &HwtsTask, kernel: &KernelTask, rc: i32) {
        if task.stream_id == INVALID_STREAM_ID {
            return;
        }
        let Ok(model_id) = self.ctx.streams.model_of(task.stream_id) else {
            return;
        };
        let model = match self.ctx.models.get(model_id) {
            Ok(model) => model,
            Err(e) => {
                warn!("Kernel failure on stream {}: {}", task.stream_id, e);
                return;
            }
        };
        let record = ErrRecord::AiCpu {
            model_id,
            stream_id: task.stream_id,
            task_id: task.task_id,
            result: rc as u32,
            kernel_name: kernel.name().to_string(),
        };
        let offset = match self.ctx.errlog.add_err_log(model.ts_context, &record) {
            Ok(offset) => offset,
            Err(e) => {
                warn!("Model {} error log not written: {}", model_id, e);
                return;
            }
        };
        let msg = OutboundMsg::TsAsync {
            device: model.device,
            payload: errlog::report_payload(model.ts_context, offset),
            errlog: Some((model.ts_context, offset)),
        };
        if let Err(e) = self.outbox.set(msg) {
            warn!("Previous outbound message failed: {}", e);
        }
    }

    fn handle_fixed_function(&self, event: &Event, kernel_name: &str) -> Result<Reply> {
        let mut kernel = KernelTask::synthetic(kernel_name, 0);
        kernel.desc.extra = event.sub_kind;
        let env = KernelEnv::new(&self.ctx, &self.thread, INVALID_STREAM_ID);
        let rc = self.ctx.executor.execute(&kernel, &env);
        if rc != 0 {
            return Err(SchedError::KernelFailed(rc));
        }
        Ok(Reply::Respond)
    }

    /// Fire `list[id]` and resume the stream it woke, if any.
    fn fire(&self, list: &WaitList, id: u32) -> Result<bool> {
        let wake = list.event(id as usize)?;
        if let Some(stream) = wake.wait_stream {
            self.resume(stream)?;
        }
        Ok(wake.has_wait)
    }

    fn resume(&self, stream_id: u32) -> Result<()> {
        let model_id = self.ctx.streams.model_of(stream_id)?;
        debug!("Resuming stream {} of model {}", stream_id, model_id);
        let rc = self.ctx.executor.resume_stream(model_id, stream_id);
        if rc != 0 {
            return Err(SchedError::KernelFailed(rc));
        }
        Ok(())
    }

    fn handle_aicpu_msg(&mut self, event: &Event) -> Result<Reply> {
        let Some(sub) = AicpuMsgKind::from_raw(event.sub_kind) else {
            error!("AICPU message sub-kind {} has no handler", event.sub_kind);
            return Err(SchedError::NotFoundEvent(event.kind));
        };
        let id = read_id(event)?;
        let ctx = Arc::clone(&self.ctx);
        match sub {
            AicpuMsgKind::ExecuteModel | AicpuMsgKind::RepeatModel => ctx.models.execute(id)?,
            AicpuMsgKind::EndGraph => {
                ctx.models.end_graph(id)?;
                self.fire(&ctx.waits.end_graph, id)?;
            }
            AicpuMsgKind::Notify => {
                self.fire(&ctx.waits.notify, id)?;
            }
            AicpuMsgKind::TableUnlock => {
                self.fire(&ctx.waits.table_unlock, id)?;
            }
        }
        Ok(Reply::Respond)
    }

    fn handle_queue_not_empty(&self, kind: EventKind, event: &Event) -> Result<Reply> {
        let queue = read_id(event)?;
        if self.fire(&self.ctx.waits.queue_not_empty, queue)? {
            return Ok(Reply::Respond);
        }
        if let Some(model) = self.ctx.models.model_of_queue(queue) {
            if self.fire(&self.ctx.waits.any_queue_not_empty, model)? {
                return Ok(Reply::Respond);
            }
        }
        self.forward(kind, event)
    }

    fn handle_queue_not_full(&self, kind: EventKind, event: &Event) -> Result<Reply> {
        let queue = read_id(event)?;
        if self.fire(&self.ctx.waits.queue_not_full, queue)? {
            return Ok(Reply::Respond);
        }
        self.forward(kind, event)
    }

    fn handle_control(&mut self, event: &Event) -> Result<Reply> {
        let bytes = event.payload.bytes();
        let msg = ControlMsg::decode(&bytes, self.ctx.msg_version())?;
        debug!("Thread {} control {:?}", self.thread.index, msg);
        match msg {
            ControlMsg::MsgVersion { magic, version } => {
                if magic != VALID_MAGIC_NUM {
                    return Err(SchedError::InvalidMagic(magic));
                }
                if version > MSG_VERSION_1 {
                    return Err(SchedError::Inner(format!("unsupported message version {}", version)));
                }
                self.ctx.set_msg_version(version);
                Ok(Reply::Respond)
            }
            ControlMsg::ModelOperate { model_id, op } => self.model_operate(model_id, op),
            ControlMsg::TaskReport {
                model_id,
                stream_id,
                task_id,
                result_code,
            } => self.task_report(model_id, stream_id, task_id, result_code),
            ControlMsg::NotifyRecord { notify_id } => {
                debug!("Notify record {}", notify_id);
                Ok(Reply::Respond)
            }
            ControlMsg::DumpData { debug, body } => {
                let op = if debug {
                    ControlForward::DumpDataDebug
                } else {
                    ControlForward::DumpData
                };
                self.forward_control(op, &body)
            }
            ControlMsg::DumpMappingInfo { body } => {
                self.forward_control(ControlForward::DumpMappingInfo, &body)
            }
            ControlMsg::PlatformInfoLoad { body } => {
                self.forward_control(ControlForward::PlatformInfoLoad, &body)
            }
            ControlMsg::TimeoutConfig {
                op_execute_timeout,
                op_wait_timeout,
            } => {
                if op_execute_timeout == 0 {
                    return Err(SchedError::ParameterInvalid(
                        "op execute timeout must be positive".to_string(),
                    ));
                }
                let default_wait = self.ctx.config.event_wait_timeout.as_millis();
                let timer_enabled = u128::from(op_wait_timeout) >= default_wait;
                self.ctx.set_op_timeouts(op_execute_timeout, timer_enabled);
                info!(
                    "Op execute timeout {}s, wait timeout {}ms, op timer {}",
                    op_execute_timeout,
                    op_wait_timeout,
                    if timer_enabled { "enabled" } else { "disabled" }
                );
                Ok(Reply::Respond)
            }
            ControlMsg::AicErrorReport {
                model_id,
                stream_id,
                task_id,
                result_code,
                core_bitmaps,
            } => {
                if let Some((aic, aiv)) = core_bitmaps {
                    warn!("AI-core error on model {}: aic={:#x} aiv={:#x}", model_id, aic, aiv);
                }
                let model = self.ctx.models.get(model_id)?;
                self.ctx.errlog.add_err_log(
                    model.ts_context,
                    &ErrRecord::AiCore {
                        model_id,
                        stream_id,
                        task_id,
                        result: result_code,
                    },
                )?;
                Ok(Reply::Respond)
            }
        }
    }

    fn forward_control(&self, op: ControlForward, body: &[u8]) -> Result<Reply> {
        let rc = self.ctx.executor.control(op, body);
        if rc != 0 {
            return Err(SchedError::KernelFailed(rc));
        }
        Ok(Reply::Respond)
    }

    fn model_operate(&mut self, model_id: u32, op: ModelOp) -> Result<Reply> {
        let ctx = Arc::clone(&self.ctx);
        let device = self.thread.device_id;
        match op {
            ModelOp::Load(spec) => ctx.models.load(&ctx.model_deps(device), model_id, device, spec)?,
            ModelOp::Execute => ctx.models.execute(model_id)?,
            ModelOp::Abort => {
                ctx.models.abort(model_id)?;
                self.check_call_exit();
                if self.call_mode {
                    return Ok(Reply::Suppress);
                }
            }
            ModelOp::Destroy => {
                let owner = ctx.models.get(model_id)?.device;
                ctx.models.destroy(&ctx.model_deps(owner), model_id)?;
                self.check_call_exit();
            }
        }
        Ok(Reply::Respond)
    }

    fn task_report(&mut self, model_id: u32, stream_id: u32, task_id: u32, result_code: u32) -> Result<Reply> {
        let ctx = Arc::clone(&self.ctx);
        let model = ctx.models.get(model_id)?;
        let pending = if result_code != 0 {
            ctx.models.set_return_code(model_id, result_code)?;
            let record = ErrRecord::AiCore {
                model_id,
                stream_id,
                task_id,
                result: result_code,
            };
            match ctx.errlog.add_err_log(model.ts_context, &record) {
                Ok(offset) => Some(OutboundMsg::TsAsync {
                    device: model.device,
                    payload: errlog::report_payload(model.ts_context, offset),
                    errlog: Some((model.ts_context, offset)),
                }),
                Err(e) => {
                    warn!("Model {} task {} error not logged: {}", model_id, task_id, e);
                    None
                }
            }
        } else if model.repeat {
            Some(OutboundMsg::SchedulerSubmit {
                device: model.device,
                event: AicpuMsgKind::RepeatModel.event(model_id),
            })
        } else {
            None
        };
        if let Some(msg) = pending {
            if let Err(e) = self.outbox.set(msg) {
                warn!("Previous outbound message failed: {}", e);
            }
        }
        self.check_call_exit();
        Ok(Reply::Respond)
    }

    fn check_call_exit(&mut self) {
        if self.call_mode && !self.ctx.models.any_running() {
            debug!("No model running, call mode will exit");
            self.call_exit = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::constants::{codes, status};
    use crate::dispatch::kernel::KernelDesc;
    use crate::dispatch::model::{LoadSpec, ModelStatus, StreamSpec};
    use crate::resources::Released;
    use crate::sim::{DeviceSpec, EchoExecutor, SimDriver};
    use crate::types::DeployContext;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct ScriptedTransport {
        inbox: VecDeque<WaitOutcome>,
        sent: Vec<Response>,
    }

    impl MessageTransport for ScriptedTransport {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn wait_once(&mut self, _timeout: Duration) -> WaitOutcome {
            self.inbox.pop_front().unwrap_or(WaitOutcome::Timeout)
        }

        fn respond(&mut self, response: &Response) -> crate::error::DrvResult<()> {
            self.sent.push(*response);
            Ok(())
        }
    }

    struct Fixture {
        driver: Arc<SimDriver>,
        executor: Arc<EchoExecutor>,
        ctx: Arc<SchedulerContext>,
    }

    fn fixture_with(config: Config) -> Fixture {
        let driver = Arc::new(SimDriver::new(DeviceSpec::with_aicpus(2)));
        let executor = Arc::new(EchoExecutor::new());
        let ctx = Arc::new(SchedulerContext::new(config, driver.clone(), executor.clone()).unwrap());
        ctx.set_running(true);
        Fixture { driver, executor, ctx }
    }

    fn fixture() -> Fixture {
        fixture_with(Config {
            deploy: DeployContext::Device,
            ts_send_retries: 2,
            call_mode_max_timeouts: 3,
            ..Config::default()
        })
    }

    fn thread(index: usize) -> ThreadContext {
        ThreadContext {
            index,
            device_id: 0,
            host_pid: 1,
            vf_id: 0,
            unique_vf_id: 0,
        }
    }

    fn dispatcher(fx: &Fixture) -> Dispatcher<ScriptedTransport> {
        Dispatcher::new(fx.ctx.clone(), ScriptedTransport::default(), thread(0))
    }

    /// Push `events`, run one cycle per event and return the responses.
    fn run(d: &mut Dispatcher<ScriptedTransport>, events: Vec<Event>) -> Vec<Response> {
        let n = events.len();
        d.transport
            .inbox
            .extend(events.into_iter().map(WaitOutcome::Event));
        for _ in 0..n {
            d.do_once();
        }
        std::mem::take(&mut d.transport.sent)
    }

    fn hwts(kernel_type: u8, kernel_name: &str, stream_id: u32) -> Event {
        let task = HwtsTask {
            mailbox_id: 11,
            serial_no: 77,
            kernel_type,
            stream_id,
            task_id: 4,
            desc: KernelDesc {
                kernel_name: kernel_name.to_string(),
                ..KernelDesc::default()
            },
        };
        Event::new(EventKind::TsHwtsKernel.raw(), 0, task.encode())
    }

    fn control(msg: &ControlMsg, version: u16) -> Event {
        Event::new(EventKind::TsCtrlMsg.raw(), 0, msg.encode(version))
    }

    fn load(model_id: u32, repeat: bool) -> ControlMsg {
        ControlMsg::ModelOperate {
            model_id,
            op: ModelOp::Load(LoadSpec {
                ts_context: 6,
                streams: vec![StreamSpec { stream_id: 20 + model_id, flag: 0 }],
                queues: vec![100 + model_id],
                repeat,
            }),
        }
    }

    fn sample_event(kind: EventKind) -> Event {
        match kind {
            EventKind::TsHwtsKernel | EventKind::RandomKernel | EventKind::SplitKernel => {
                let mut e = hwts(2, "Add", INVALID_STREAM_ID);
                e.kind = kind.raw();
                e
            }
            EventKind::TsCtrlMsg => control(&ControlMsg::version(0), 0),
            EventKind::AicpuMsg => AicpuMsgKind::Notify.event(1),
            _ => Event::new(kind.raw(), 0, id_payload(3)),
        }
    }

    #[test]
    fn test_every_kind_has_a_handler() {
        let fx = fixture();
        let mut d = dispatcher(&fx);
        for kind in EventKind::ALL {
            let responses = run(&mut d, vec![sample_event(kind)]);
            assert_eq!(responses.len(), 1, "{:?}", kind);
            assert_ne!(responses[0].result, codes::NOT_FOUND_EVENT, "{:?}", kind);
            assert_eq!(responses[0].status, status::TASK_SUCC, "{:?}", kind);
        }
    }

    #[test]
    fn test_unknown_kind_reports_not_found() {
        let fx = fixture();
        let mut d = dispatcher(&fx);
        for raw in [10, 63, 64, 1000] {
            let responses = run(&mut d, vec![Event::new(raw, 0, Bytes::new())]);
            assert_eq!(responses.len(), 1);
            assert_eq!(responses[0].result, codes::NOT_FOUND_EVENT);
            assert_eq!(responses[0].status, status::TASK_FAIL);
        }
        assert!(fx.ctx.is_running());
        assert_eq!(fx.ctx.stats.received(0, 10), 1);
    }

    #[test]
    fn test_unknown_kernel_type_still_answers() {
        let fx = fixture();
        let mut d = dispatcher(&fx);
        let responses = run(&mut d, vec![hwts(3, "Add", INVALID_STREAM_ID)]);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status, status::TASK_FAIL);
        assert_eq!(responses[0].result, codes::DRV_ERR);
        assert_eq!(responses[0].mailbox_id, 11);
        assert_eq!(responses[0].serial_no, 77);
        assert!(fx.executor.executed().is_empty());
    }

    #[test]
    fn test_rescue_skips_handlers() {
        let fx = fixture();
        let mut d = dispatcher(&fx);
        let mut event = hwts(2, "Add", INVALID_STREAM_ID);
        event.pid = 0;
        d.transport.inbox.push_back(WaitOutcome::Rescue(event.clone()));
        assert_eq!(d.do_once(), Cycle::Handled);
        assert_eq!(d.transport.sent, vec![Response::canned(&event)]);
        assert!(fx.executor.executed().is_empty());
        assert_eq!(fx.ctx.stats.received(0, event.kind), 0);
    }

    #[test]
    fn test_kernel_success_and_dump() {
        let fx = fixture();
        let mut d = dispatcher(&fx);
        let mut event = hwts(2, "Add", INVALID_STREAM_ID);
        let mut task = HwtsTask::decode(&event.payload.bytes(), 0).unwrap();
        task.desc.l2_ctrl = 1 << 49;
        event.payload = Payload::Kernel(task);
        let responses = run(&mut d, vec![event, sample_event(EventKind::DvppMsg)]);
        assert!(responses.iter().all(|r| r.status == status::TASK_SUCC));
        assert_eq!(responses[0].mailbox_id, 11);
        assert_eq!(fx.executor.executed(), vec!["Add".to_string(), "DvppHandleEvent".to_string()]);
        assert_eq!(fx.executor.dumps(), 1);
    }

    #[test]
    fn test_kernel_failure_writes_errlog_and_reports() {
        let fx = fixture();
        let mut d = dispatcher(&fx);
        run(&mut d, vec![control(&load(1, false), 0)]);
        fx.executor.fail_kernel("Bad", 9);

        let responses = run(&mut d, vec![hwts(2, "Bad", 21)]);
        assert_eq!(responses[0].status, status::TASK_FAIL);
        assert_eq!(responses[0].result, codes::KERNEL_FAILED);
        assert_eq!(fx.ctx.errlog.occupied(6), 1);
        assert_eq!(fx.driver.ts_messages(), vec![(0, errlog::report_payload(6, 0).to_vec())]);
    }

    #[test]
    fn test_version_negotiation() {
        let fx = fixture();
        let mut d = dispatcher(&fx);
        let bad = ControlMsg::MsgVersion { magic: 0x1234, version: 1 };
        let responses = run(&mut d, vec![control(&bad, 0), control(&ControlMsg::version(4), 0)]);
        assert_eq!(responses[0].result, codes::INVALID_MAGIC_NUM);
        assert_eq!(responses[1].result, codes::INNER_ERROR);
        assert_eq!(fx.ctx.msg_version(), 0);

        let responses = run(
            &mut d,
            vec![control(&ControlMsg::version(1), 0), control(&load(2, false), 1)],
        );
        assert!(responses.iter().all(|r| r.result == 0));
        assert_eq!(fx.ctx.msg_version(), 1);
        assert_eq!(fx.ctx.models.status(2), Some(ModelStatus::Loaded));
    }

    #[test]
    fn test_unknown_stored_version() {
        let fx = fixture_with(Config {
            initial_msg_version: 5,
            ..Config::default()
        });
        let mut d = dispatcher(&fx);
        let responses = run(&mut d, vec![control(&ControlMsg::NotifyRecord { notify_id: 1 }, 0)]);
        assert_eq!(responses[0].result, codes::NOT_FOUND_VERSION);
        let responses = run(&mut d, vec![control(&ControlMsg::version(0), 0)]);
        assert_eq!(responses[0].result, 0);
    }

    #[test]
    fn test_model_lifecycle_over_control() {
        let fx = fixture();
        let mut d = dispatcher(&fx);
        let execute = ControlMsg::ModelOperate { model_id: 3, op: ModelOp::Execute };
        let report = ControlMsg::TaskReport { model_id: 3, stream_id: 23, task_id: 1, result_code: 0 };
        let responses = run(
            &mut d,
            vec![control(&load(3, true), 0), control(&execute, 0), control(&report, 0)],
        );
        assert!(responses.iter().all(|r| r.result == 0));
        let submitted = fx.driver.submitted(0);
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].kind, EventKind::AicpuMsg.raw());
        assert_eq!(submitted[0].sub_kind, AicpuMsgKind::RepeatModel as u32);
        assert_eq!(submitted[0].payload, Payload::Raw(id_payload(3)));

        let failed = ControlMsg::TaskReport { model_id: 3, stream_id: 23, task_id: 2, result_code: 0x55 };
        run(&mut d, vec![control(&failed, 0)]);
        assert_eq!(fx.ctx.models.get(3).unwrap().return_code, 0x55);
        assert_eq!(fx.ctx.errlog.occupied(6), 1);

        let destroy = ControlMsg::ModelOperate { model_id: 3, op: ModelOp::Destroy };
        let responses = run(&mut d, vec![control(&destroy, 0), control(&execute, 0)]);
        assert_eq!(responses[0].result, 0);
        assert_eq!(responses[1].result, codes::MODEL_NOT_FOUND);
    }

    #[test]
    fn test_queue_not_empty_resumes_waiter() {
        let fx = fixture();
        let mut d = dispatcher(&fx);
        run(&mut d, vec![control(&load(1, false), 0)]);
        fx.ctx.waits.queue_not_empty.wait_event(101, 21).unwrap();

        let not_empty = Event::new(EventKind::QueueEmptyToNotEmpty.raw(), 0, id_payload(101));
        let responses = run(&mut d, vec![not_empty.clone()]);
        assert_eq!(responses[0].result, 0);
        assert_eq!(fx.executor.resumed(), vec![(1, 21)]);
        assert!(fx.executor.forwarded().is_empty());

        // Nobody waits on the queue: the model-level wait list is tried next.
        fx.ctx.waits.any_queue_not_empty.wait_event(1, 21).unwrap();
        run(&mut d, vec![not_empty.clone()]);
        assert_eq!(fx.executor.resumed(), vec![(1, 21), (1, 21)]);

        // Then the notification is forwarded.
        run(&mut d, vec![not_empty]);
        assert_eq!(fx.executor.forwarded(), vec![(EventKind::QueueEmptyToNotEmpty, 0)]);
    }

    #[test]
    fn test_kernel_parks_on_notify_until_resumed() {
        let fx = fixture();
        let mut d = dispatcher(&fx);
        run(&mut d, vec![control(&load(2, false), 0)]);
        fx.executor.on_kernel("WaitNotify", |env| {
            match env.wait_on(&env.waits().notify, 9) {
                Ok(_) => 0,
                Err(e) => i32::from(e.code()),
            }
        });

        let responses = run(&mut d, vec![hwts(2, "WaitNotify", 22)]);
        assert_eq!(responses[0].result, 0);
        assert_eq!(fx.ctx.waits.notify.waiting_stream(9).unwrap(), Some(22));
        assert!(fx.executor.resumed().is_empty());

        let responses = run(&mut d, vec![AicpuMsgKind::Notify.event(9)]);
        assert_eq!(responses[0].result, 0);
        assert_eq!(fx.executor.resumed(), vec![(2, 22)]);
        assert_eq!(fx.ctx.waits.notify.waiting_stream(9).unwrap(), None);
    }

    #[test]
    fn test_kernel_without_stream_cannot_wait() {
        let fx = fixture();
        let mut d = dispatcher(&fx);
        fx.executor.on_kernel("WaitNotify", |env| {
            match env.wait_on(&env.waits().notify, 9) {
                Ok(_) => 0,
                Err(e) => i32::from(e.code()),
            }
        });
        let responses = run(&mut d, vec![hwts(2, "WaitNotify", INVALID_STREAM_ID)]);
        assert_eq!(responses[0].result, codes::KERNEL_FAILED);
        assert_eq!(fx.ctx.waits.notify.wait_count(), 0);
    }

    #[test]
    fn test_kernel_table_lock_and_buffers() {
        let fx = fixture();
        let mut d = dispatcher(&fx);
        run(&mut d, vec![control(&load(3, false), 0)]);
        fx.executor.on_kernel("Lookup", |env| {
            if env.malloc(256).is_err() {
                return 1;
            }
            match env.lock_table(5, false) {
                Ok(true) => {
                    env.unlock_table(5);
                    0
                }
                Ok(false) => 0,
                Err(e) => i32::from(e.code()),
            }
        });

        assert!(fx.ctx.table_locks.wr_lock(5));
        run(&mut d, vec![hwts(2, "Lookup", 23)]);
        assert_eq!(fx.ctx.waits.table_unlock.waiting_stream(5).unwrap(), Some(23));
        let buffers = fx.ctx.buffers(0).unwrap();
        assert_eq!(buffers.guarded(3), 1);

        fx.ctx.table_locks.unlock(5);
        run(&mut d, vec![AicpuMsgKind::TableUnlock.event(5)]);
        assert_eq!(fx.executor.resumed(), vec![(3, 23)]);

        // The resumed stream runs the kernel again and gets the lock.
        run(&mut d, vec![hwts(2, "Lookup", 23)]);
        assert_eq!(fx.ctx.waits.table_unlock.wait_count(), 0);
        assert_eq!(fx.ctx.table_locks.unlock(5), Released::Nothing);

        let destroy = ControlMsg::ModelOperate { model_id: 3, op: ModelOp::Destroy };
        run(&mut d, vec![control(&destroy, 0)]);
        assert_eq!(buffers.guarded(3), 0);
        assert_eq!(fx.driver.live_buffers(), 0);
    }

    #[test]
    fn test_mapped_queue_end_to_end() {
        use crate::constants::events::DEFAULT_KERNEL_TYPE;
        use crate::constants::mapped::{OFF_STATUS, REGION_SIZE};
        use crate::transport::mapped_queue::{cqe_offset, post_message, slot_base, SlotMessage};
        use crate::transport::{MappedQueueTransport, RegisterRegion};

        let fx = fixture();
        let region = Arc::new(RegisterRegion::zeroed(REGION_SIZE));
        let worker = thread(1);
        let transport = MappedQueueTransport::new(region.clone(), &worker);
        let mut d = Dispatcher::new(fx.ctx.clone(), transport, worker);
        let cqe = cqe_offset(worker.cqe_index());

        let task = HwtsTask {
            mailbox_id: 5,
            serial_no: 0,
            kernel_type: 2,
            stream_id: 0,
            task_id: 2,
            desc: KernelDesc::default(),
        };
        let hwts_msg = |pid: u32, kernel_type: u32| SlotMessage {
            size: 40,
            topic: EventKind::TsHwtsKernel.raw(),
            sub_topic: 0,
            pid,
            group: 0,
            kernel_type,
            user_data: task.to_user_data(),
        };

        assert_eq!(d.do_once(), Cycle::Idle);

        region.write_u32(cqe, 0xffff_ffff).unwrap();
        post_message(&region, 1, &hwts_msg(42, 2)).unwrap();
        assert_eq!(d.do_once(), Cycle::Handled);
        assert_eq!(region.read_u32(cqe).unwrap(), u32::from(status::TASK_SUCC));
        assert_eq!(region.read_u32(slot_base(1) + OFF_STATUS).unwrap(), 0);
        assert_eq!(fx.executor.executed().len(), 1);

        let unknown = SlotMessage {
            size: 0,
            topic: 40,
            sub_topic: 0,
            pid: 42,
            group: 0,
            kernel_type: u32::from(DEFAULT_KERNEL_TYPE),
            user_data: [0; 40],
        };
        post_message(&region, 1, &unknown).unwrap();
        assert_eq!(d.do_once(), Cycle::Handled);
        assert_eq!(
            region.read_u32(cqe).unwrap(),
            (u32::from(codes::NOT_FOUND_EVENT) << 16) | u32::from(status::TASK_FAIL)
        );

        region.write_u32(cqe, 0xffff_ffff).unwrap();
        post_message(&region, 1, &hwts_msg(0, 2)).unwrap();
        assert_eq!(d.do_once(), Cycle::Handled);
        assert_eq!(region.read_u32(cqe).unwrap(), 0);
        assert_eq!(fx.executor.executed().len(), 1);

        post_message(&region, 1, &hwts_msg(42, 300)).unwrap();
        assert_eq!(d.do_once(), Cycle::Idle);
        assert_eq!(
            region.read_u32(cqe).unwrap(),
            (u32::from(codes::DRV_ERR) << 16) | u32::from(status::TASK_FAIL)
        );
    }

    #[test]
    fn test_aicpu_msg_sub_kinds() {
        let fx = fixture();
        let mut d = dispatcher(&fx);
        run(&mut d, vec![control(&load(4, false), 0)]);
        fx.ctx.waits.end_graph.wait_event(4, 24).unwrap();
        let responses = run(
            &mut d,
            vec![
                AicpuMsgKind::ExecuteModel.event(4),
                AicpuMsgKind::EndGraph.event(4),
                Event::new(EventKind::AicpuMsg.raw(), 99, id_payload(4)),
            ],
        );
        assert_eq!(responses[0].result, 0);
        assert_eq!(responses[1].result, 0);
        assert_eq!(responses[2].result, codes::NOT_FOUND_EVENT);
        assert_eq!(fx.ctx.models.status(4), Some(ModelStatus::Loaded));
        assert_eq!(fx.executor.resumed(), vec![(4, 24)]);
    }

    #[test]
    fn test_timeout_config() {
        let fx = fixture();
        let mut d = dispatcher(&fx);
        let invalid = ControlMsg::TimeoutConfig { op_execute_timeout: 0, op_wait_timeout: 10_000 };
        let low_wait = ControlMsg::TimeoutConfig { op_execute_timeout: 30, op_wait_timeout: 1 };
        let responses = run(&mut d, vec![control(&invalid, 0), control(&low_wait, 0)]);
        assert_eq!(responses[0].result, codes::PARAMETER_INVALID);
        assert_eq!(responses[1].result, 0);
        assert_eq!(fx.ctx.op_execute_timeout(), 30);
        assert!(!fx.ctx.op_timer_enabled());

        let high_wait = ControlMsg::TimeoutConfig { op_execute_timeout: 30, op_wait_timeout: 10_000 };
        run(&mut d, vec![control(&high_wait, 0)]);
        assert!(fx.ctx.op_timer_enabled());
    }

    #[test]
    fn test_control_forwarding() {
        let fx = fixture();
        let mut d = dispatcher(&fx);
        let dump = ControlMsg::DumpData { debug: false, body: Bytes::from_static(b"d") };
        let platform = ControlMsg::PlatformInfoLoad { body: Bytes::from_static(b"p") };
        run(&mut d, vec![control(&dump, 0), control(&platform, 0)]);
        assert_eq!(
            fx.executor.controls(),
            vec![ControlForward::DumpData, ControlForward::PlatformInfoLoad]
        );
    }

    #[test]
    fn test_call_mode_abort_is_silent_and_exits() {
        let fx = fixture();
        let mut d = dispatcher(&fx);
        run(&mut d, vec![control(&load(5, false), 0), AicpuMsgKind::ExecuteModel.event(5)]);

        let abort = ControlMsg::ModelOperate { model_id: 5, op: ModelOp::Abort };
        d.transport.inbox.push_back(WaitOutcome::Event(control(&abort, 0)));
        d.run_call_mode().unwrap();
        assert!(d.transport.sent.is_empty());
        assert_eq!(fx.ctx.models.status(5), Some(ModelStatus::Aborted));
    }

    #[test]
    fn test_call_mode_end_graph_kernel() {
        let fx = fixture();
        let mut d = dispatcher(&fx);
        d.transport
            .inbox
            .push_back(WaitOutcome::Event(hwts(2, END_GRAPH_KERNEL, INVALID_STREAM_ID)));
        d.run_call_mode().unwrap();
        assert!(d.transport.sent.is_empty());
        assert!(fx.executor.executed().is_empty());
    }

    #[test]
    fn test_call_mode_gives_up_after_timeouts() {
        let fx = fixture();
        let mut d = dispatcher(&fx);
        assert!(matches!(
            d.run_call_mode(),
            Err(SchedError::Drv(DrvError::Timeout))
        ));
    }

    #[test]
    fn test_illegal_cpu_stops_and_requests_kill() {
        let fx = fixture();
        let mut d = dispatcher(&fx);
        d.transport.inbox.push_back(WaitOutcome::Fatal(DrvError::Fatal(-5)));
        assert_eq!(d.do_once(), Cycle::Idle);
        assert!(fx.ctx.is_running());

        d.transport.inbox.push_back(WaitOutcome::Fatal(DrvError::IllegalCpu));
        assert_eq!(d.do_once(), Cycle::Stopped(DrvError::IllegalCpu));
        assert!(!fx.ctx.is_running());
        assert_eq!(fx.driver.kill_requests(), vec![(0, KillReason::IllegalCpu)]);
        d.run_loop();
    }

    #[test]
    fn test_param_error_stops_loop() {
        let fx = fixture();
        let mut d = dispatcher(&fx);
        d.transport.inbox.push_back(WaitOutcome::Fatal(DrvError::ParaError));
        assert_eq!(d.do_once(), Cycle::Stopped(DrvError::ParaError));
        assert!(!fx.ctx.is_running());
        assert!(fx.driver.kill_requests().is_empty());
    }

    #[test]
    fn test_stats_clamp_and_lastword() {
        let stats = EventStats::new();
        stats.record_received(40, EventKind::TsHwtsKernel.raw());
        stats.record_processed(1, EventKind::TsHwtsKernel.raw());
        stats.record_received(1, 64);
        assert_eq!(stats.received(0, EventKind::TsHwtsKernel.raw()), 1);
        assert_eq!(stats.received(40, EventKind::TsHwtsKernel.raw()), 1);
        let totals: Vec<serde_json::Value> = serde_json::from_str(&stats.lastword()).unwrap();
        assert_eq!(totals.len(), 1);
        assert_eq!(totals[0]["name"], "ts_hwts_kernel");
        assert_eq!(totals[0]["received"], 1);
        assert_eq!(totals[0]["processed"], 1);
    }
}
