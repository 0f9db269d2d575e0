//! Scheduler lifecycle.
//!
//! [`Scheduler::start`] wires the context, binds the host process, prepares
//! the driver's scheduling module and launches the worker pool.
//! [`Scheduler::stop`] clears the running flag, joins the workers, releases
//! tracked buffers and emits the last-word statistics.
//!
//! Hosts that have no dedicated worker threads use [`run_call_mode`]
//! instead, dispatching on their own thread until the work they submitted
//! is done.

use std::sync::Arc;
use tracing::{error, info};

use crate::config::Config;
use crate::context::SchedulerContext;
use crate::dispatch::{Dispatcher, KernelExecutor};
use crate::driver::DeviceDriver;
use crate::error::{Result, SchedError};
use crate::topology::HostBinder;
use crate::transport::{InterruptTransport, MappedQueueTransport};
use crate::types::{SchedMode, ThreadContext};
use crate::worker::WorkerPool;

/// A running scheduler instance.
pub struct Scheduler {
    ctx: Arc<SchedulerContext>,
    pool: Option<WorkerPool>,
}

impl Scheduler {
    pub fn start(
        config: Config,
        driver: Arc<dyn DeviceDriver>,
        executor: Arc<dyn KernelExecutor>,
    ) -> Result<Self> {
        let ctx = Arc::new(SchedulerContext::new(config, driver, executor)?);
        prepare(&ctx)?;

        ctx.set_running(true);
        let pool = WorkerPool::create(Arc::clone(&ctx)).map_err(|e| {
            ctx.set_running(false);
            error!("Worker pool creation failed: {}", e);
            e
        })?;
        info!(
            "Scheduler started: {} workers, {} transport, devices {:?}",
            pool.len(),
            ctx.config.sched_mode,
            ctx.topology.device_ids()
        );
        Ok(Self {
            ctx,
            pool: Some(pool),
        })
    }

    pub fn context(&self) -> &Arc<SchedulerContext> {
        &self.ctx
    }

    pub fn workers(&self) -> usize {
        self.pool.as_ref().map_or(0, WorkerPool::len)
    }

    /// Stop and join every worker, release buffers and return the last-word
    /// statistics as JSON. Later calls return `None`.
    pub fn stop(&mut self) -> Option<String> {
        let mut pool = self.pool.take()?;
        info!("Stopping scheduler");
        pool.stop();
        self.ctx.free_all_buffers();
        Some(self.ctx.stats.lastword())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Host binding and scheduling-module setup shared by both run styles.
fn prepare(ctx: &SchedulerContext) -> Result<()> {
    let host_pid = ctx.config.host_pid;
    if host_pid != 0 {
        let binder = HostBinder::new(
            ctx.driver.as_ref(),
            ctx.config.bind_poll_interval,
            ctx.config.bind_timeout,
        );
        binder.bind(host_pid, ctx.config.vf_id, ctx.config.run_mode)?;
        binder.wait_bound(host_pid)?;
    }
    if ctx.config.sched_mode == SchedMode::Interrupt {
        ctx.topology
            .init_sched_module(ctx.driver.as_ref(), ctx.config.group_id)?;
    }
    Ok(())
}

/// Build a context for call-mode use: host bound and scheduling module
/// ready, running flag set, no worker threads.
pub fn prepare_call_mode(
    config: Config,
    driver: Arc<dyn DeviceDriver>,
    executor: Arc<dyn KernelExecutor>,
) -> Result<Arc<SchedulerContext>> {
    let ctx = Arc::new(SchedulerContext::new(config, driver, executor)?);
    prepare(&ctx)?;
    ctx.set_running(true);
    Ok(ctx)
}

/// Dispatch on the calling thread as logical worker `thread_index` until
/// no model is running, an `endGraph` kernel arrives, the running flag is
/// cleared or too many consecutive waits time out.
pub fn run_call_mode(ctx: &Arc<SchedulerContext>, thread_index: usize) -> Result<()> {
    if !ctx.is_running() {
        return Err(SchedError::InitFailed("scheduler is not running".to_string()));
    }
    let thread = ThreadContext {
        index: thread_index,
        device_id: ctx.topology.device_for_thread(thread_index),
        host_pid: ctx.topology.host_pid(),
        vf_id: ctx.topology.vf_id(),
        unique_vf_id: ctx.topology.unique_vf_id(),
    };
    match ctx.config.sched_mode {
        SchedMode::Interrupt => {
            let transport =
                InterruptTransport::init(Arc::clone(&ctx.driver), &thread, ctx.config.group_id)?;
            Dispatcher::new(Arc::clone(ctx), transport, thread).run_call_mode()
        }
        SchedMode::Msgq => {
            let transport = MappedQueueTransport::new(ctx.mapped_region(thread.device_id)?, &thread);
            Dispatcher::new(Arc::clone(ctx), transport, thread).run_call_mode()
        }
    }
}
