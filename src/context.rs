//! Scheduler-wide services.
//!
//! [`SchedulerContext`] owns every shared service and is handed to each
//! worker as an `Arc`. There are no process globals: tests build as many
//! independent contexts as they like.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::coalescer::{Outbox, SendPolicy};
use crate::config::Config;
use crate::dispatch::engine::EventStats;
use crate::dispatch::kernel::KernelExecutor;
use crate::dispatch::model::{ModelDeps, ModelManager};
use crate::driver::DeviceDriver;
use crate::errlog::ErrLogTable;
use crate::error::Result;
use crate::resources::{BufferTracker, StreamRegistry, TableLockManager, WaitManagers};
use crate::topology::{DeviceTopology, TopologyParams};
use crate::transport::RegisterRegion;

/// Shared state of one scheduler instance.
pub struct SchedulerContext {
    pub config: Config,
    pub driver: Arc<dyn DeviceDriver>,
    pub executor: Arc<dyn KernelExecutor>,
    pub topology: DeviceTopology,
    pub waits: WaitManagers,
    pub table_locks: TableLockManager,
    pub streams: StreamRegistry,
    pub models: ModelManager,
    pub errlog: Arc<ErrLogTable>,
    pub stats: EventStats,
    buffers: HashMap<u32, BufferTracker>,
    regions: DashMap<u32, Arc<RegisterRegion>>,
    running: AtomicBool,
    msg_version: AtomicU16,
    op_execute_timeout: AtomicU32,
    op_timer_enabled: AtomicBool,
}

impl SchedulerContext {
    /// Discover the topology and build every service. Nothing is started.
    pub fn new(
        config: Config,
        driver: Arc<dyn DeviceDriver>,
        executor: Arc<dyn KernelExecutor>,
    ) -> Result<Self> {
        let topology = DeviceTopology::init(
            driver.as_ref(),
            &TopologyParams {
                device_ids: config.device_ids.clone(),
                host_pid: config.host_pid,
                vf_id: config.vf_id,
                run_mode: config.run_mode,
                deploy: config.deploy,
            },
        )?;
        info!("{}", topology);

        let buffers = config
            .device_ids
            .iter()
            .map(|&dev| (dev, BufferTracker::new(Arc::clone(&driver), dev)))
            .collect();

        Ok(Self {
            msg_version: AtomicU16::new(config.initial_msg_version),
            config,
            driver,
            executor,
            topology,
            waits: WaitManagers::new(),
            table_locks: TableLockManager::new(),
            streams: StreamRegistry::new(),
            models: ModelManager::new(),
            errlog: Arc::new(ErrLogTable::new()),
            stats: EventStats::new(),
            buffers,
            regions: DashMap::new(),
            running: AtomicBool::new(false),
            op_execute_timeout: AtomicU32::new(0),
            op_timer_enabled: AtomicBool::new(true),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// Negotiated control-message layout version.
    pub fn msg_version(&self) -> u16 {
        self.msg_version.load(Ordering::Acquire)
    }

    pub fn set_msg_version(&self, version: u16) {
        let old = self.msg_version.swap(version, Ordering::AcqRel);
        if old != version {
            info!("Control message version {} -> {}", old, version);
        }
    }

    pub fn op_execute_timeout(&self) -> u32 {
        self.op_execute_timeout.load(Ordering::Acquire)
    }

    pub fn op_timer_enabled(&self) -> bool {
        self.op_timer_enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_op_timeouts(&self, execute: u32, timer_enabled: bool) {
        self.op_execute_timeout.store(execute, Ordering::Release);
        self.op_timer_enabled.store(timer_enabled, Ordering::Release);
    }

    /// Buffer tracker of `device`, if the device is configured.
    pub fn buffers(&self, device: u32) -> Option<&BufferTracker> {
        self.buffers.get(&device)
    }

    /// Release every tracked buffer on every device.
    pub fn free_all_buffers(&self) {
        for tracker in self.buffers.values() {
            tracker.free_all_models();
        }
    }

    /// Mapped register region of `device`, mapped on first use and shared
    /// by every worker of the device afterwards.
    pub fn mapped_region(&self, device: u32) -> Result<Arc<RegisterRegion>> {
        if let Some(region) = self.regions.get(&device) {
            return Ok(Arc::clone(region.value()));
        }
        let region = self.driver.map_queue_region(device).map_err(|e| {
            warn!("Mapping queue region of device {} failed: {}", device, e);
            e
        })?;
        Ok(Arc::clone(self.regions.entry(device).or_insert(region).value()))
    }

    /// Services touched by model lifecycle transitions on `device`.
    pub fn model_deps(&self, device: u32) -> ModelDeps<'_> {
        ModelDeps {
            driver: self.driver.as_ref(),
            topology: &self.topology,
            streams: &self.streams,
            waits: &self.waits,
            buffers: self.buffers(device),
        }
    }

    /// A fresh outbound slot for one worker.
    pub fn outbox(&self) -> Outbox {
        Outbox::new(
            Arc::clone(&self.driver),
            Arc::clone(&self.errlog),
            SendPolicy {
                retries: self.config.ts_send_retries,
                interval: self.config.ts_send_retry_interval,
            },
        )
    }
}
