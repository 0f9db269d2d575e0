//! In-process simulated device.
//!
//! [`SimDriver`] implements [`DeviceDriver`] on plain memory and channels so
//! the scheduler can run without hardware: the binary uses it as its default
//! backend and every test drives the scheduler through it. Failure switches
//! and inspectors make driver-side conditions reproducible.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::constants::mapped;
use crate::dispatch::kernel::{ControlForward, KernelEnv, KernelExecutor, KernelTask};
use crate::driver::{
    BufHandle, CoreInfo, CpuModule, DeviceDriver, GroupKind, KillReason, QueueEvent, SocFeatures,
};
use crate::error::{DrvError, DrvResult};
use crate::transport::region::RegisterRegion;
use crate::types::{Event, EventKind, Response, RunMode};

/// Static description of a simulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSpec {
    pub features: SocFeatures,
    pub aicpu: CoreInfo,
    pub ccpu: CoreInfo,
    pub dcpu: CoreInfo,
    pub tscpu: CoreInfo,
    pub max_vf: u32,
}

impl DeviceSpec {
    /// One control CPU on core 0 followed by `n` AI-CPUs.
    pub fn with_aicpus(n: u32) -> Self {
        Self {
            features: SocFeatures::default(),
            ccpu: CoreInfo {
                num: 1,
                os_sched: true,
                occupy_bitmap: 0b1,
            },
            aicpu: CoreInfo {
                num: n,
                os_sched: true,
                occupy_bitmap: ((1u64 << n) - 1) << 1,
            },
            dcpu: CoreInfo::default(),
            tscpu: CoreInfo::default(),
            max_vf: 4,
        }
    }
}

#[derive(Default)]
struct Buffers {
    next: u64,
    /// Live heads and chain members, each with the members appended to it.
    live: BTreeMap<BufHandle, Vec<BufHandle>>,
    last_flags: Option<u64>,
    fail_after: Option<usize>,
    fail_free: bool,
}

#[derive(Default)]
struct SimState {
    fail_core_queries: bool,
    fail_group_creation: bool,
    attached: BTreeSet<u32>,
    subscriptions: Vec<(u32, u32, usize, u64)>,
    queue_subscriptions: Vec<(u32, u32, QueueEvent)>,
    next_wait_error: Option<DrvError>,
    acks: Vec<(u32, Response)>,
    submitted: Vec<(u32, Event)>,
    ts_messages: Vec<(u32, Vec<u8>)>,
    ts_fail_always: bool,
    ts_fail_remaining: usize,
    bind_delay_polls: usize,
    bound: HashMap<u32, usize>,
    cgroup_tids: Vec<i32>,
    procmgr_binds: Vec<(u32, i32, usize)>,
    procmgr_fail_remaining: usize,
    kills: Vec<(u32, KillReason)>,
    buffers: Buffers,
}

type EventChannel = (Sender<Event>, Receiver<Event>);

/// Simulated [`DeviceDriver`].
pub struct SimDriver {
    spec: DeviceSpec,
    state: Mutex<SimState>,
    channels: Mutex<HashMap<u32, EventChannel>>,
    regions: Mutex<HashMap<u32, Arc<RegisterRegion>>>,
    ts_send_attempts: AtomicUsize,
}

impl SimDriver {
    pub fn new(spec: DeviceSpec) -> Self {
        Self {
            spec,
            state: Mutex::new(SimState::default()),
            channels: Mutex::new(HashMap::new()),
            regions: Mutex::new(HashMap::new()),
            ts_send_attempts: AtomicUsize::new(0),
        }
    }

    pub fn spec(&self) -> DeviceSpec {
        self.spec
    }

    fn channel(&self, device: u32) -> EventChannel {
        self.channels
            .lock()
            .entry(device)
            .or_insert_with(channel::unbounded)
            .clone()
    }

    // Failure switches.

    pub fn fail_core_queries(&self, fail: bool) {
        self.state.lock().fail_core_queries = fail;
    }

    pub fn fail_group_creation(&self, fail: bool) {
        self.state.lock().fail_group_creation = fail;
    }

    /// The next `wait_event` on any device fails with `err`.
    pub fn fail_next_wait(&self, err: DrvError) {
        self.state.lock().next_wait_error = Some(err);
    }

    pub fn fail_ts_send(&self, fail: bool) {
        self.state.lock().ts_fail_always = fail;
    }

    /// Fail the next `n` TS sends.
    pub fn fail_ts_send_times(&self, n: usize) {
        self.state.lock().ts_fail_remaining = n;
    }

    pub fn fail_buffer_free(&self, fail: bool) {
        self.state.lock().buffers.fail_free = fail;
    }

    /// Let `n` more allocations succeed, then fail every allocation.
    pub fn fail_alloc_after(&self, n: usize) {
        self.state.lock().buffers.fail_after = Some(n);
    }

    /// Fail the next `n` process-manager bind requests.
    pub fn fail_procmgr_binds(&self, n: usize) {
        self.state.lock().procmgr_fail_remaining = n;
    }

    /// Bound queries report `false` this many times after a bind.
    pub fn set_bind_delay_polls(&self, polls: usize) {
        self.state.lock().bind_delay_polls = polls;
    }

    // Event injection.

    /// Queue `event` for the scheduler threads of `device`.
    pub fn inject(&self, device: u32, event: Event) {
        let (tx, _) = self.channel(device);
        let _ = tx.send(event);
    }

    /// Mapped register region of `device`, created on first use.
    pub fn region(&self, device: u32) -> Arc<RegisterRegion> {
        Arc::clone(
            self.regions
                .lock()
                .entry(device)
                .or_insert_with(|| Arc::new(RegisterRegion::zeroed(mapped::REGION_SIZE))),
        )
    }

    // Inspectors.

    pub fn attached_devices(&self) -> Vec<u32> {
        self.state.lock().attached.iter().copied().collect()
    }

    /// `(group, thread, mask)` subscriptions of `device`.
    pub fn subscriptions(&self, device: u32) -> Vec<(u32, usize, u64)> {
        self.state
            .lock()
            .subscriptions
            .iter()
            .filter(|s| s.0 == device)
            .map(|s| (s.1, s.2, s.3))
            .collect()
    }

    pub fn queue_subscriptions(&self, device: u32) -> Vec<(u32, QueueEvent)> {
        self.state
            .lock()
            .queue_subscriptions
            .iter()
            .filter(|s| s.0 == device)
            .map(|s| (s.1, s.2))
            .collect()
    }

    pub fn acks(&self) -> Vec<(u32, Response)> {
        self.state.lock().acks.clone()
    }

    /// Events submitted to `device` through [`DeviceDriver::submit_event`].
    pub fn submitted(&self, device: u32) -> Vec<Event> {
        self.state
            .lock()
            .submitted
            .iter()
            .filter(|(d, _)| *d == device)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Successfully sent TS messages.
    pub fn ts_messages(&self) -> Vec<(u32, Vec<u8>)> {
        self.state.lock().ts_messages.clone()
    }

    /// Every TS send attempt, failed or not.
    pub fn ts_send_attempts(&self) -> usize {
        self.ts_send_attempts.load(Ordering::Relaxed)
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.live.len()
    }

    pub fn last_alloc_flags(&self) -> Option<u64> {
        self.state.lock().buffers.last_flags
    }

    /// Members appended to the chain headed by `head`.
    pub fn chain_len(&self, head: BufHandle) -> usize {
        self.state
            .lock()
            .buffers
            .live
            .get(&head)
            .map_or(0, |members| members.len())
    }

    pub fn kill_requests(&self) -> Vec<(u32, KillReason)> {
        self.state.lock().kills.clone()
    }

    pub fn cgroup_tids(&self) -> Vec<i32> {
        self.state.lock().cgroup_tids.clone()
    }

    /// `(device, tid, thread index)` process-manager bind requests that
    /// succeeded.
    pub fn procmgr_binds(&self) -> Vec<(u32, i32, usize)> {
        self.state.lock().procmgr_binds.clone()
    }
}

impl DeviceDriver for SimDriver {
    fn soc_features(&self, _device: u32) -> DrvResult<SocFeatures> {
        if self.state.lock().fail_core_queries {
            return Err(DrvError::Fatal(-1));
        }
        Ok(self.spec.features)
    }

    fn core_info(&self, _device: u32, module: CpuModule) -> DrvResult<CoreInfo> {
        if self.state.lock().fail_core_queries {
            return Err(DrvError::Fatal(-1));
        }
        Ok(match module {
            CpuModule::Aicpu => self.spec.aicpu,
            CpuModule::Ccpu => self.spec.ccpu,
            CpuModule::Dcpu => self.spec.dcpu,
            CpuModule::Tscpu => self.spec.tscpu,
        })
    }

    fn physical_device(&self, _device: u32) -> DrvResult<u32> {
        Ok(0)
    }

    fn max_vf_num(&self, _device: u32) -> DrvResult<u32> {
        Ok(self.spec.max_vf)
    }

    fn attach_device(&self, device: u32) -> DrvResult<()> {
        if !self.state.lock().attached.insert(device) {
            return Err(DrvError::Repeated);
        }
        Ok(())
    }

    fn detach_device(&self, device: u32) -> DrvResult<()> {
        self.state.lock().attached.remove(&device);
        Ok(())
    }

    fn create_group(&self, device: u32, group: u32, kind: GroupKind, threads: u32) -> DrvResult<()> {
        if self.state.lock().fail_group_creation {
            return Err(DrvError::Fatal(-2));
        }
        debug!("sim: group {} {:?} with {} threads on device {}", group, kind, threads, device);
        Ok(())
    }

    fn set_event_priority(&self, _device: u32, _kind: u32, _priority: u32) -> DrvResult<()> {
        Ok(())
    }

    fn subscribe(&self, device: u32, group: u32, thread_index: usize, mask: u64) -> DrvResult<()> {
        self.state
            .lock()
            .subscriptions
            .push((device, group, thread_index, mask));
        Ok(())
    }

    fn wait_event(
        &self,
        device: u32,
        _group: u32,
        _thread_index: usize,
        timeout: Duration,
    ) -> DrvResult<Event> {
        if let Some(err) = self.state.lock().next_wait_error.take() {
            return Err(err);
        }
        let (_, rx) = self.channel(device);
        if timeout.is_zero() {
            return rx.try_recv().map_err(|e| match e {
                TryRecvError::Empty => DrvError::Timeout,
                TryRecvError::Disconnected => DrvError::ProcessExit,
            });
        }
        rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => DrvError::Timeout,
            RecvTimeoutError::Disconnected => DrvError::ProcessExit,
        })
    }

    fn ack_event(&self, device: u32, response: &Response) -> DrvResult<()> {
        self.state.lock().acks.push((device, *response));
        Ok(())
    }

    fn submit_event(&self, device: u32, event: Event) -> DrvResult<()> {
        self.state.lock().submitted.push((device, event.clone()));
        self.inject(device, event);
        Ok(())
    }

    fn subscribe_queue(&self, device: u32, queue_id: u32, event: QueueEvent) -> DrvResult<()> {
        let mut state = self.state.lock();
        let entry = (device, queue_id, event);
        if state.queue_subscriptions.contains(&entry) {
            return Err(DrvError::Repeated);
        }
        state.queue_subscriptions.push(entry);
        Ok(())
    }

    fn unsubscribe_queue(&self, device: u32, queue_id: u32, event: QueueEvent) -> DrvResult<()> {
        self.state
            .lock()
            .queue_subscriptions
            .retain(|s| *s != (device, queue_id, event));
        Ok(())
    }

    fn buf_alloc(&self, _size: u64, _align: u32, flags: u64) -> DrvResult<BufHandle> {
        let mut state = self.state.lock();
        let bufs = &mut state.buffers;
        if let Some(left) = bufs.fail_after.as_mut() {
            if *left == 0 {
                return Err(DrvError::Fatal(-12));
            }
            *left -= 1;
        }
        bufs.next += 1;
        let handle = BufHandle(bufs.next);
        bufs.live.insert(handle, Vec::new());
        bufs.last_flags = Some(flags);
        Ok(handle)
    }

    fn buf_free(&self, buf: BufHandle) -> DrvResult<()> {
        let mut state = self.state.lock();
        let bufs = &mut state.buffers;
        if bufs.fail_free {
            return Err(DrvError::Fatal(-5));
        }
        let members = bufs.live.remove(&buf).ok_or(DrvError::ParaError)?;
        for member in members {
            bufs.live.remove(&member);
        }
        Ok(())
    }

    fn buf_chain_append(&self, head: BufHandle, buf: BufHandle) -> DrvResult<()> {
        let mut state = self.state.lock();
        let bufs = &mut state.buffers;
        if !bufs.live.contains_key(&buf) {
            return Err(DrvError::ParaError);
        }
        bufs.live
            .get_mut(&head)
            .ok_or(DrvError::ParaError)?
            .push(buf);
        Ok(())
    }

    fn map_queue_region(&self, device: u32) -> DrvResult<Arc<RegisterRegion>> {
        Ok(self.region(device))
    }

    fn send_ts_msg(&self, device: u32, payload: &[u8]) -> DrvResult<()> {
        self.ts_send_attempts.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        if state.ts_fail_always {
            return Err(DrvError::Retryable);
        }
        if state.ts_fail_remaining > 0 {
            state.ts_fail_remaining -= 1;
            return Err(DrvError::Retryable);
        }
        state.ts_messages.push((device, payload.to_vec()));
        Ok(())
    }

    fn bind_host_pid(&self, host_pid: u32, vf_id: u32, mode: RunMode) -> DrvResult<()> {
        let mut state = self.state.lock();
        let delay = state.bind_delay_polls;
        state.bound.insert(host_pid, delay);
        debug!("sim: bind host pid {} vf {} {:?}", host_pid, vf_id, mode);
        Ok(())
    }

    fn query_host_pid_bound(&self, host_pid: u32) -> DrvResult<bool> {
        let mut state = self.state.lock();
        match state.bound.get_mut(&host_pid) {
            Some(0) => Ok(true),
            Some(left) => {
                *left -= 1;
                Ok(false)
            }
            None => Ok(false),
        }
    }

    fn bind_cgroup(&self, tid: i32) -> DrvResult<()> {
        self.state.lock().cgroup_tids.push(tid);
        Ok(())
    }

    fn bind_by_process_manager(&self, device: u32, tid: i32, thread_index: usize) -> DrvResult<()> {
        let mut state = self.state.lock();
        if state.procmgr_fail_remaining > 0 {
            state.procmgr_fail_remaining -= 1;
            return Err(DrvError::Retryable);
        }
        state.procmgr_binds.push((device, tid, thread_index));
        Ok(())
    }

    fn request_kill(&self, device: u32, reason: KillReason) -> DrvResult<()> {
        self.state.lock().kills.push((device, reason));
        Ok(())
    }
}

/// Custom body run for a named kernel.
pub type KernelBody = Arc<dyn Fn(&KernelEnv<'_>) -> i32 + Send + Sync>;

#[derive(Default)]
struct EchoState {
    failures: HashMap<String, i32>,
    bodies: HashMap<String, KernelBody>,
    executed: Vec<String>,
    forwarded: Vec<(EventKind, u32)>,
    resumed: Vec<(u32, u32)>,
    controls: Vec<ControlForward>,
    dumps: usize,
}

/// Kernel executor that records every call and succeeds unless told
/// otherwise.
#[derive(Default)]
pub struct EchoExecutor {
    state: Mutex<EchoState>,
}

impl EchoExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make kernels named `name` return `code`.
    pub fn fail_kernel(&self, name: &str, code: i32) {
        self.state.lock().failures.insert(name.to_string(), code);
    }

    /// Run `body` whenever a kernel named `name` executes.
    pub fn on_kernel(&self, name: &str, body: impl Fn(&KernelEnv<'_>) -> i32 + Send + Sync + 'static) {
        self.state.lock().bodies.insert(name.to_string(), Arc::new(body));
    }

    /// Names of executed kernels, in order.
    pub fn executed(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    pub fn forwarded(&self) -> Vec<(EventKind, u32)> {
        self.state.lock().forwarded.clone()
    }

    /// `(model, stream)` pairs resumed after a wait fired.
    pub fn resumed(&self) -> Vec<(u32, u32)> {
        self.state.lock().resumed.clone()
    }

    pub fn controls(&self) -> Vec<ControlForward> {
        self.state.lock().controls.clone()
    }

    pub fn dumps(&self) -> usize {
        self.state.lock().dumps
    }
}

impl KernelExecutor for EchoExecutor {
    fn execute(&self, task: &KernelTask, env: &KernelEnv<'_>) -> i32 {
        let body = {
            let mut state = self.state.lock();
            state.executed.push(task.name().to_string());
            if let Some(&code) = state.failures.get(task.name()) {
                return code;
            }
            state.bodies.get(task.name()).cloned()
        };
        body.map_or(0, |body| body(env))
    }

    fn forward(&self, kind: EventKind, sub_kind: u32, _payload: &[u8]) -> i32 {
        self.state.lock().forwarded.push((kind, sub_kind));
        0
    }

    fn resume_stream(&self, model_id: u32, stream_id: u32) -> i32 {
        self.state.lock().resumed.push((model_id, stream_id));
        0
    }

    fn dump(&self, _task: &KernelTask) -> i32 {
        self.state.lock().dumps += 1;
        0
    }

    fn control(&self, op: ControlForward, _body: &[u8]) -> i32 {
        self.state.lock().controls.push(op);
        0
    }
}
