//! CPU-pinned worker threads.
//!
//! One thread per logical AI-CPU. Each thread pins itself, builds the
//! transport selected by the scheduling mode and reports back over a
//! rendezvous channel before entering its dispatch loop. Pool creation
//! fails unless every thread reached `Running`.

use crossbeam::channel::{self, Sender};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::context::SchedulerContext;
use crate::dispatch::Dispatcher;
use crate::error::{Result, SchedError};
use crate::reliability::metrics;
use crate::transport::{InterruptTransport, MappedQueueTransport, MessageTransport};
use crate::types::{RunMode, SchedMode, ThreadContext};
use crate::worker::affinity::AffinityBinder;

/// Lifecycle of one worker thread. Written only by the worker itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerStatus {
    Init = 0,
    Running = 1,
    Exited = 2,
}

impl WorkerStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => WorkerStatus::Init,
            1 => WorkerStatus::Running,
            _ => WorkerStatus::Exited,
        }
    }
}

#[derive(Debug, Default)]
struct StatusCell(AtomicU8);

impl StatusCell {
    fn set(&self, status: WorkerStatus) {
        self.0.store(status as u8, Ordering::Release);
    }

    fn get(&self) -> WorkerStatus {
        WorkerStatus::from_u8(self.0.load(Ordering::Acquire))
    }
}

struct Worker {
    index: usize,
    phys_index: u32,
    status: Arc<StatusCell>,
    handle: Option<JoinHandle<()>>,
}

/// Restores the previous SIGCHLD disposition on drop.
#[cfg(unix)]
struct SigchldDefault {
    previous: libc::sigaction,
}

#[cfg(unix)]
impl SigchldDefault {
    fn install() -> Option<Self> {
        // SAFETY: both sigaction structs are fully initialized before use and
        // SIG_DFL is a valid disposition for SIGCHLD.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = libc::SIG_DFL;
            libc::sigemptyset(&mut action.sa_mask);
            let mut previous: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(libc::SIGCHLD, &action, &mut previous) != 0 {
                warn!("Could not default SIGCHLD during worker startup");
                return None;
            }
            Some(Self { previous })
        }
    }
}

#[cfg(unix)]
impl Drop for SigchldDefault {
    fn drop(&mut self) {
        // SAFETY: `previous` was filled in by a successful sigaction call.
        unsafe {
            libc::sigaction(libc::SIGCHLD, &self.previous, std::ptr::null_mut());
        }
    }
}

/// The scheduler's worker threads.
pub struct WorkerPool {
    ctx: Arc<SchedulerContext>,
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Spawn one worker per AI-CPU and wait until all of them run.
    pub fn create(ctx: Arc<SchedulerContext>) -> Result<Self> {
        let count = match ctx.topology.aicpu_num() {
            0 if ctx.config.run_mode == RunMode::Thread => {
                warn!("No AI-CPUs reported, running a single worker");
                1
            }
            0 => {
                error!("No AI-CPUs reported in process mode");
                return Err(SchedError::InitFailed("no AI-CPU cores available".to_string()));
            }
            n => n as usize,
        };

        let mut pool = Self {
            ctx: Arc::clone(&ctx),
            workers: Vec::with_capacity(count),
        };
        let (ready_tx, ready_rx) = channel::bounded::<usize>(count);

        #[cfg(unix)]
        let sigchld = SigchldDefault::install();

        for index in 0..count {
            let thread_ctx = ThreadContext {
                index,
                device_id: ctx.topology.device_for_thread(index),
                host_pid: ctx.topology.host_pid(),
                vf_id: ctx.topology.vf_id(),
                unique_vf_id: ctx.topology.unique_vf_id(),
            };
            let phys_index = ctx.topology.phys_index_for_thread(index);
            let status = Arc::new(StatusCell::default());

            let spawned = thread::Builder::new()
                .name(format!("aicpu-worker-{}", index))
                .spawn({
                    let ctx = Arc::clone(&ctx);
                    let status = Arc::clone(&status);
                    let ready = ready_tx.clone();
                    move || worker_main(ctx, thread_ctx, phys_index, status, ready)
                });
            match spawned {
                Ok(handle) => pool.workers.push(Worker {
                    index,
                    phys_index,
                    status,
                    handle: Some(handle),
                }),
                Err(e) => {
                    error!("Spawning worker {} failed: {}", index, e);
                    metrics::record_worker_startup_failure();
                    pool.stop();
                    return Err(SchedError::InitFailed(format!("spawn worker {}: {}", index, e)));
                }
            }
        }
        drop(ready_tx);

        for _ in 0..count {
            if ready_rx.recv().is_err() {
                warn!("Worker rendezvous closed early");
                break;
            }
        }
        #[cfg(unix)]
        drop(sigchld);

        let failed: Vec<usize> = pool
            .workers
            .iter()
            .filter(|w| w.status.get() != WorkerStatus::Running)
            .map(|w| w.index)
            .collect();
        if !failed.is_empty() {
            error!("Workers {:?} failed to start", failed);
            for _ in &failed {
                metrics::record_worker_startup_failure();
            }
            pool.stop();
            return Err(SchedError::InitFailed(format!("workers {:?} failed to start", failed)));
        }

        info!(
            "{} workers running in {} mode",
            pool.workers.len(),
            ctx.config.sched_mode
        );
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Status of every worker, by logical index.
    pub fn statuses(&self) -> Vec<WorkerStatus> {
        self.workers.iter().map(|w| w.status.get()).collect()
    }

    /// Physical cores assigned to the workers, by logical index.
    pub fn phys_indices(&self) -> Vec<u32> {
        self.workers.iter().map(|w| w.phys_index).collect()
    }

    /// Clear the running flag and join every worker.
    pub fn stop(&mut self) {
        self.ctx.set_running(false);
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    error!("Worker {} panicked", worker.index);
                    worker.status.set(WorkerStatus::Exited);
                }
            }
        }
        debug!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_main(
    ctx: Arc<SchedulerContext>,
    thread: ThreadContext,
    phys_index: u32,
    status: Arc<StatusCell>,
    ready: Sender<usize>,
) {
    status.set(WorkerStatus::Init);

    if ctx.topology.deploy().pins_threads() {
        let binder = AffinityBinder::new(
            ctx.driver.as_ref(),
            ctx.config.affinity,
            ctx.config.cgroup_tasks_file.as_deref(),
        );
        if let Err(e) = binder.bind_current(&thread, phys_index) {
            error!("Worker {} affinity setup failed: {}", thread.index, e);
            status.set(WorkerStatus::Exited);
            let _ = ready.send(thread.index);
            return;
        }
    }

    match ctx.config.sched_mode {
        SchedMode::Interrupt => {
            match InterruptTransport::init(Arc::clone(&ctx.driver), &thread, ctx.config.group_id) {
                Ok(transport) => serve(ctx, transport, thread, &status, ready),
                Err(e) => startup_failed(&thread, e, &status, ready),
            }
        }
        SchedMode::Msgq => match ctx.mapped_region(thread.device_id) {
            Ok(region) => {
                let transport = MappedQueueTransport::new(region, &thread);
                serve(ctx, transport, thread, &status, ready)
            }
            Err(e) => startup_failed(&thread, e, &status, ready),
        },
    }
}

fn startup_failed(thread: &ThreadContext, err: SchedError, status: &StatusCell, ready: Sender<usize>) {
    error!("Worker {} transport init failed: {}", thread.index, err);
    status.set(WorkerStatus::Exited);
    let _ = ready.send(thread.index);
}

fn serve<T: MessageTransport>(
    ctx: Arc<SchedulerContext>,
    transport: T,
    thread: ThreadContext,
    status: &StatusCell,
    ready: Sender<usize>,
) {
    status.set(WorkerStatus::Running);
    let _ = ready.send(thread.index);
    drop(ready);

    Dispatcher::new(ctx, transport, thread).run_loop();
    status.set(WorkerStatus::Exited);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::sim::{DeviceSpec, EchoExecutor, SimDriver};
    use crate::types::{AffinityMode, DeployContext};
    use std::time::Duration;

    fn context(aicpus: u32, config: Config) -> (Arc<SimDriver>, Arc<SchedulerContext>) {
        let driver = Arc::new(SimDriver::new(DeviceSpec::with_aicpus(aicpus)));
        let ctx = Arc::new(
            SchedulerContext::new(config, driver.clone(), Arc::new(EchoExecutor::new())).unwrap(),
        );
        ctx.set_running(true);
        (driver, ctx)
    }

    fn host_config() -> Config {
        Config {
            deploy: DeployContext::Host,
            event_wait_timeout: Duration::from_millis(10),
            ..Config::default()
        }
    }

    #[test]
    fn test_interrupt_workers_start_and_stop() {
        let (driver, ctx) = context(2, Config {
            device_ids: vec![0, 1],
            ..host_config()
        });
        let mut pool = WorkerPool::create(ctx.clone()).unwrap();
        assert_eq!(pool.len(), 4);
        assert!(pool.statuses().iter().all(|s| *s == WorkerStatus::Running));
        assert_eq!(driver.subscriptions(0).len(), 2);
        assert_eq!(driver.subscriptions(1).len(), 2);

        pool.stop();
        assert!(!ctx.is_running());
        assert!(pool.statuses().iter().all(|s| *s == WorkerStatus::Exited));
    }

    #[test]
    fn test_msgq_workers_share_region() {
        let (driver, ctx) = context(2, Config {
            sched_mode: SchedMode::Msgq,
            ..host_config()
        });
        let pool = WorkerPool::create(ctx.clone()).unwrap();
        assert_eq!(pool.len(), 2);
        assert!(Arc::ptr_eq(&ctx.mapped_region(0).unwrap(), &driver.region(0)));
        drop(pool);
        assert!(!ctx.is_running());
    }

    #[test]
    fn test_zero_aicpus() {
        let (_, ctx) = context(0, host_config());
        assert!(matches!(
            WorkerPool::create(ctx),
            Err(SchedError::InitFailed(_))
        ));

        let (_, ctx) = context(0, Config {
            run_mode: RunMode::Thread,
            ..host_config()
        });
        let pool = WorkerPool::create(ctx).unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_affinity_failure_fails_pool() {
        let (driver, ctx) = context(2, Config {
            deploy: DeployContext::Device,
            affinity: AffinityMode::ProcessManager,
            ..host_config()
        });
        driver.fail_procmgr_binds(100);
        assert!(matches!(
            WorkerPool::create(ctx.clone()),
            Err(SchedError::InitFailed(_))
        ));
        assert!(!ctx.is_running());
    }

    #[test]
    fn test_process_manager_binds_each_worker() {
        let (driver, ctx) = context(2, Config {
            deploy: DeployContext::Device,
            affinity: AffinityMode::ProcessManager,
            ..host_config()
        });
        let pool = WorkerPool::create(ctx).unwrap();
        let mut indices: Vec<usize> = driver.procmgr_binds().iter().map(|b| b.2).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(pool.phys_indices(), vec![1, 2]);
    }
}
