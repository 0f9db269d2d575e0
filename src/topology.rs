//! Device topology discovery.
//!
//! Queries per-module core counts from the driver once at startup and
//! derives the logical → physical AI-CPU index map. The resulting
//! [`DeviceTopology`] is immutable and shared by every worker.

use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::constants::{events, topology as limits};
use crate::driver::{CoreInfo, CpuModule, DeviceDriver, GroupKind, QueueEvent, SocFeatures};
use crate::error::{DrvError, Result, SchedError};
use crate::types::{DeployContext, EventKind, RunMode};

/// Inputs to topology discovery.
#[derive(Debug, Clone)]
pub struct TopologyParams {
    pub device_ids: Vec<u32>,
    pub host_pid: u32,
    pub vf_id: u32,
    pub run_mode: RunMode,
    pub deploy: DeployContext,
}

/// Immutable device topology.
#[derive(Debug, Clone)]
pub struct DeviceTopology {
    device_ids: Vec<u32>,
    host_pid: u32,
    vf_id: u32,
    unique_vf_id: u32,
    deploy: DeployContext,
    features: SocFeatures,
    aicpu_num_per_dev: u32,
    aicpu_ids: Vec<u32>,
    ccpu_ids: Vec<u32>,
    aicpu_base_id: u32,
    core_num_per_dev: u32,
    ccpu_num: u32,
    dcpu_num: u32,
    tscpu_num: u32,
    phys_indices: Vec<u32>,
}

/// Bit positions set in `bitmap`, limited to the inspected core range.
fn bitmap_ids(bitmap: u64) -> Vec<u32> {
    (0..limits::DEVICE_MAX_CPU_NUM)
        .filter(|bit| bitmap & (1u64 << bit) != 0)
        .collect()
}

fn drv(context: &str, device: u32, err: DrvError) -> SchedError {
    error!("{} failed on device {}: {}", context, device, err);
    SchedError::InitFailed(format!("{} on device {}: {}", context, device, err))
}

impl DeviceTopology {
    /// Discover the topology. Any driver failure is fatal.
    pub fn init(driver: &dyn DeviceDriver, params: &TopologyParams) -> Result<Self> {
        let Some(&dev0) = params.device_ids.first() else {
            error!("Device list is empty");
            return Err(SchedError::InitFailed("device list is empty".to_string()));
        };
        if let Some(bad) = params.device_ids.iter().find(|d| **d >= limits::DEVICE_NUM) {
            error!("Device id {} out of range", bad);
            return Err(SchedError::InitFailed(format!(
                "device id {} must be below {}",
                bad,
                limits::DEVICE_NUM
            )));
        }

        let features = driver
            .soc_features(dev0)
            .map_err(|e| drv("soc feature query", dev0, e))?;
        debug!("SoC features of device {}: {:?}", dev0, features);

        let mut aicpu_ids = Vec::new();
        let mut ccpu_ids = Vec::new();
        if !features.aos_core {
            let aicpu = driver
                .core_info(dev0, CpuModule::Aicpu)
                .map_err(|e| drv("aicpu info query", dev0, e))?;
            aicpu_ids = if params.deploy == DeployContext::Host {
                (0..aicpu.num).collect()
            } else {
                let ids = bitmap_ids(aicpu.occupy_bitmap);
                if ids.len() != aicpu.num as usize {
                    error!(
                        "AI-CPU bitmap {:#x} has {} cores, driver reports {}",
                        aicpu.occupy_bitmap,
                        ids.len(),
                        aicpu.num
                    );
                    return Err(SchedError::InitFailed(
                        "aicpu occupy bitmap does not match core count".to_string(),
                    ));
                }
                ids
            };
            let ccpu = driver
                .core_info(dev0, CpuModule::Ccpu)
                .map_err(|e| drv("ccpu info query", dev0, e))?;
            ccpu_ids = bitmap_ids(ccpu.occupy_bitmap);
        }

        // Under VF splitting the module layout is that of the physical die.
        let query_dev = if params.vf_id > 0 && !features.vf_by_device_id {
            let phys = driver
                .physical_device(dev0)
                .map_err(|e| drv("physical device query", dev0, e))?;
            debug!("Device {} is VF {}, querying die {}", dev0, params.vf_id, phys);
            phys
        } else {
            dev0
        };

        let mut modules = [CoreInfo::default(); 4];
        for (slot, module) in modules.iter_mut().zip(CpuModule::ALL) {
            *slot = driver
                .core_info(query_dev, module)
                .map_err(|e| drv("core info query", query_dev, e))?;
        }
        let [aicpu, ccpu, dcpu, tscpu] = modules;

        let (aicpu_num_per_dev, aicpu_base_id) = if features.aos_core {
            let mut base = 0;
            if ccpu.os_sched {
                base += ccpu.num;
            }
            if dcpu.os_sched {
                base += dcpu.num;
            }
            (aicpu.num, base)
        } else {
            (aicpu_ids.len() as u32, 0)
        };

        let core_num_per_dev: u32 = modules
            .iter()
            .filter(|m| m.os_sched)
            .map(|m| m.num)
            .sum();

        let unique_vf_id = Self::compute_unique_vf_id(driver, params, &features, dev0)?;

        let mut topology = Self {
            device_ids: params.device_ids.clone(),
            host_pid: params.host_pid,
            vf_id: params.vf_id,
            unique_vf_id,
            deploy: params.deploy,
            features,
            aicpu_num_per_dev,
            aicpu_ids,
            ccpu_ids,
            aicpu_base_id,
            core_num_per_dev,
            ccpu_num: ccpu.num,
            dcpu_num: dcpu.num,
            tscpu_num: tscpu.num,
            phys_indices: Vec::new(),
        };
        topology.phys_indices = topology.compute_phys_indices();

        info!("{}", topology);
        Ok(topology)
    }

    fn compute_unique_vf_id(
        driver: &dyn DeviceDriver,
        params: &TopologyParams,
        features: &SocFeatures,
        dev0: u32,
    ) -> Result<u32> {
        if features.vf_by_device_id {
            return Ok(dev0);
        }
        if features.aos_core || dev0 == 0 || params.vf_id == 0 {
            return Ok(params.vf_id);
        }
        let max_vf = driver
            .max_vf_num(dev0)
            .map_err(|e| drv("max vf query", dev0, e))?;
        if max_vf > limits::DEVICE_MAX_SPLIT_NUM {
            error!("Max vf num {} exceeds {}", max_vf, limits::DEVICE_MAX_SPLIT_NUM);
            return Err(SchedError::InitFailed(format!("max vf num {} too large", max_vf)));
        }
        Ok(max_vf * dev0 + params.vf_id)
    }

    fn compute_phys_indices(&self) -> Vec<u32> {
        self.device_ids
            .iter()
            .flat_map(|&dev| (0..self.aicpu_num_per_dev).map(move |i| (i, dev)))
            .map(|(i, dev)| self.aicpu_phys_index(i, dev))
            .collect()
    }

    /// Physical core of logical AI-CPU `index` on `device`.
    pub fn aicpu_phys_index(&self, index: u32, device: u32) -> u32 {
        if self.features.aos_core {
            return (self.aicpu_base_id + self.aicpu_num_per_dev) * device + self.aicpu_base_id + index;
        }
        let Some(&id) = self.aicpu_ids.get(index as usize) else {
            warn!("AI-CPU index {} out of range on device {}", index, device);
            return limits::INVALID_AICPU_ID;
        };
        if self.features.bind_cpu_only_one_device {
            id
        } else {
            self.core_num_per_dev * device + id
        }
    }

    /// Physical core for a control-CPU thread (no AI-CPUs available).
    pub fn ccpu_phys_index(&self, index: u32, device: u32) -> u32 {
        match self.ccpu_ids.get(index as usize) {
            Some(&id) => self.core_num_per_dev * device + id,
            None => limits::INVALID_AICPU_ID,
        }
    }

    /// First data-CPU core of `device`.
    pub fn dcpu_base(&self, device: u32) -> u32 {
        device * self.core_num_per_dev + self.ccpu_num
    }

    /// Cached physical indices of every configured AI-CPU, device-major.
    pub fn aicpu_phys_indices(&self) -> &[u32] {
        &self.phys_indices
    }

    /// Total AI-CPU workers across configured devices.
    pub fn aicpu_num(&self) -> u32 {
        self.aicpu_num_per_dev * self.device_ids.len() as u32
    }

    pub fn aicpu_num_per_dev(&self) -> u32 {
        self.aicpu_num_per_dev
    }

    pub fn core_num_per_dev(&self) -> u32 {
        self.core_num_per_dev
    }

    pub fn device_ids(&self) -> &[u32] {
        &self.device_ids
    }

    pub fn host_pid(&self) -> u32 {
        self.host_pid
    }

    pub fn vf_id(&self) -> u32 {
        self.vf_id
    }

    pub fn unique_vf_id(&self) -> u32 {
        self.unique_vf_id
    }

    pub fn deploy(&self) -> DeployContext {
        self.deploy
    }

    pub fn features(&self) -> SocFeatures {
        self.features
    }

    pub fn dcpu_num(&self) -> u32 {
        self.dcpu_num
    }

    pub fn tscpu_num(&self) -> u32 {
        self.tscpu_num
    }

    /// Device served by logical worker `thread_index`.
    pub fn device_for_thread(&self, thread_index: usize) -> u32 {
        let per_dev = self.aicpu_num_per_dev.max(1) as usize;
        let slot = (thread_index / per_dev).min(self.device_ids.len().saturating_sub(1));
        self.device_ids[slot]
    }

    /// Physical core for logical worker `thread_index`, falling back to the
    /// control CPU when the device has no AI-CPUs.
    pub fn phys_index_for_thread(&self, thread_index: usize) -> u32 {
        let device = self.device_for_thread(thread_index);
        if self.aicpu_num_per_dev == 0 {
            return self.ccpu_phys_index(0, device);
        }
        let local = (thread_index % self.aicpu_num_per_dev as usize) as u32;
        self.aicpu_phys_index(local, device)
    }

    /// Attach every device, create the scheduler group and set event
    /// priorities. Detaches everything on failure.
    pub fn init_sched_module(&self, driver: &dyn DeviceDriver, group: u32) -> Result<()> {
        let kind = if self.deploy == DeployContext::Host || self.aicpu_num_per_dev == 0 {
            GroupKind::BindCp
        } else {
            GroupKind::DataPlane
        };
        let threads = self.aicpu_num_per_dev.max(1);

        let result = self.device_ids.iter().try_for_each(|&dev| {
            match driver.attach_device(dev) {
                Ok(()) | Err(DrvError::Repeated) => {}
                Err(e) => return Err(drv("attach device", dev, e)),
            }
            driver
                .create_group(dev, group, kind, threads)
                .map_err(|e| drv("create group", dev, e))?;
            for (kind, priority) in [(EventKind::TsHwtsKernel, 0), (EventKind::TsCtrlMsg, 0)] {
                driver
                    .set_event_priority(dev, kind.raw(), priority)
                    .map_err(|e| drv("set event priority", dev, e))?;
            }
            Ok(())
        });

        if result.is_err() {
            for &dev in &self.device_ids {
                if let Err(e) = driver.detach_device(dev) {
                    warn!("Detach device {} after failed init: {}", dev, e);
                }
            }
        } else {
            info!(
                "Scheduler group {} ({:?}) ready on {} devices, event max {}",
                group,
                kind,
                self.device_ids.len(),
                events::EVENT_MAX_NUM
            );
        }
        result
    }

    /// Subscribe a queue transition notification on every device.
    pub fn subscribe_queue(&self, driver: &dyn DeviceDriver, queue_id: u32, event: QueueEvent) -> Result<()> {
        for &dev in &self.device_ids {
            match driver.subscribe_queue(dev, queue_id, event) {
                Ok(()) | Err(DrvError::Repeated) => {}
                Err(e) => {
                    error!("Subscribe queue {} {:?} on device {}: {}", queue_id, event, dev, e);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    pub fn unsubscribe_queue(&self, driver: &dyn DeviceDriver, queue_id: u32, event: QueueEvent) -> Result<()> {
        for &dev in &self.device_ids {
            driver.unsubscribe_queue(dev, queue_id, event).map_err(|e| {
                error!("Unsubscribe queue {} {:?} on device {}: {}", queue_id, event, dev, e);
                SchedError::from(e)
            })?;
        }
        Ok(())
    }
}

impl fmt::Display for DeviceTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Topology: devices={:?} aicpu_per_dev={} base={} cores_per_dev={} ccpu={} dcpu={} tscpu={} vf={} unique_vf={} phys={:?}",
            self.device_ids,
            self.aicpu_num_per_dev,
            self.aicpu_base_id,
            self.core_num_per_dev,
            self.ccpu_num,
            self.dcpu_num,
            self.tscpu_num,
            self.vf_id,
            self.unique_vf_id,
            self.phys_indices
        )
    }
}

/// Binds the scheduler to its host process.
pub struct HostBinder<'a> {
    driver: &'a dyn DeviceDriver,
    poll_interval: Duration,
    timeout: Duration,
}

impl<'a> HostBinder<'a> {
    pub fn new(driver: &'a dyn DeviceDriver, poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            driver,
            poll_interval,
            timeout,
        }
    }

    /// Validate and request the bind.
    pub fn bind(&self, host_pid: u32, vf_id: u32, mode: RunMode) -> Result<()> {
        if host_pid == 0 {
            return Err(SchedError::ParameterInvalid("host pid must be non-zero".to_string()));
        }
        self.driver.bind_host_pid(host_pid, vf_id, mode).map_err(|e| {
            error!("Bind host pid {} failed: {}", host_pid, e);
            SchedError::from(e)
        })?;
        info!("Bound to host pid {} (vf {}, {:?})", host_pid, vf_id, mode);
        Ok(())
    }

    /// Poll until the driver reports the bind complete.
    pub fn wait_bound(&self, host_pid: u32) -> Result<()> {
        let start = Instant::now();
        let mut tries: u64 = 0;
        loop {
            match self.driver.query_host_pid_bound(host_pid) {
                Ok(true) => {
                    info!("Host pid {} bound after {} tries", host_pid, tries + 1);
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) if e.is_retryable() => {}
                Err(e) => {
                    error!("Query host pid {} bind failed: {}", host_pid, e);
                    return Err(e.into());
                }
            }
            tries += 1;
            if tries % limits::BIND_LOG_EVERY == 0 {
                info!("Still waiting for host pid {} bind, tries={}", host_pid, tries);
            }
            if start.elapsed() >= self.timeout {
                error!("Host pid {} bind timed out after {:?}", host_pid, self.timeout);
                return Err(SchedError::InitFailed(format!(
                    "host pid {} bind timed out",
                    host_pid
                )));
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{DeviceSpec, SimDriver};

    fn params(devices: Vec<u32>) -> TopologyParams {
        TopologyParams {
            device_ids: devices,
            host_pid: 100,
            vf_id: 0,
            run_mode: RunMode::Process,
            deploy: DeployContext::Device,
        }
    }

    #[test]
    fn test_two_devices_distinct_phys_indices() {
        let driver = SimDriver::new(DeviceSpec::with_aicpus(1));
        let topo = DeviceTopology::init(&driver, &params(vec![0, 1])).unwrap();
        assert_ne!(topo.aicpu_phys_index(0, 0), topo.aicpu_phys_index(0, 1));
        assert_eq!(topo.aicpu_num(), 2);
    }

    #[test]
    fn test_phys_indices_injective_and_bounded() {
        for aicpus in 1..=6 {
            let driver = SimDriver::new(DeviceSpec::with_aicpus(aicpus));
            let devices = vec![0, 1, 2];
            let topo = DeviceTopology::init(&driver, &params(devices.clone())).unwrap();
            let total = topo.core_num_per_dev() * devices.len() as u32;
            for &dev in &devices {
                let mut seen: Vec<u32> =
                    (0..aicpus).map(|i| topo.aicpu_phys_index(i, dev)).collect();
                seen.sort_unstable();
                seen.dedup();
                assert_eq!(seen.len(), aicpus as usize);
            }
            let mut all = topo.aicpu_phys_indices().to_vec();
            assert!(all.iter().all(|p| *p < total));
            all.sort_unstable();
            all.dedup();
            assert_eq!(all.len(), topo.aicpu_num() as usize);
        }
    }

    #[test]
    fn test_aos_formula() {
        let mut spec = DeviceSpec::with_aicpus(4);
        spec.features.aos_core = true;
        spec.ccpu = CoreInfo { num: 2, os_sched: true, occupy_bitmap: 0b11 };
        spec.dcpu = CoreInfo { num: 1, os_sched: true, occupy_bitmap: 0b1 };
        let driver = SimDriver::new(spec);
        let topo = DeviceTopology::init(&driver, &params(vec![0, 1])).unwrap();
        // base = 2 + 1; per device span = base + 4
        assert_eq!(topo.aicpu_phys_index(0, 0), 3);
        assert_eq!(topo.aicpu_phys_index(3, 1), 7 + 3 + 3);
    }

    #[test]
    fn test_rejects_empty_and_out_of_range() {
        let driver = SimDriver::new(DeviceSpec::with_aicpus(2));
        assert!(matches!(
            DeviceTopology::init(&driver, &params(vec![])),
            Err(SchedError::InitFailed(_))
        ));
        assert!(matches!(
            DeviceTopology::init(&driver, &params(vec![64])),
            Err(SchedError::InitFailed(_))
        ));
    }

    #[test]
    fn test_bitmap_mismatch_fails() {
        let mut spec = DeviceSpec::with_aicpus(2);
        spec.aicpu.occupy_bitmap = 0b1;
        let driver = SimDriver::new(spec);
        assert!(DeviceTopology::init(&driver, &params(vec![0])).is_err());
    }

    #[test]
    fn test_driver_failure_is_init_failed() {
        let driver = SimDriver::new(DeviceSpec::with_aicpus(2));
        driver.fail_core_queries(true);
        assert!(matches!(
            DeviceTopology::init(&driver, &params(vec![0])),
            Err(SchedError::InitFailed(_))
        ));
    }

    #[test]
    fn test_bind_cpu_only_one_device_keeps_local_ids() {
        let mut spec = DeviceSpec::with_aicpus(2);
        spec.features.bind_cpu_only_one_device = true;
        let driver = SimDriver::new(spec);
        let topo = DeviceTopology::init(&driver, &params(vec![0, 1])).unwrap();
        // AI-CPUs sit at bits 1 and 2 on every device.
        assert_eq!(topo.aicpu_phys_index(0, 0), 1);
        assert_eq!(topo.aicpu_phys_index(0, 1), 1);
        assert_eq!(topo.aicpu_phys_index(1, 1), 2);
        assert_eq!(topo.aicpu_phys_indices(), &[1, 2, 1, 2]);
    }

    #[test]
    fn test_unique_vf_id() {
        let driver = SimDriver::new(DeviceSpec::with_aicpus(2));
        let mut p = params(vec![2]);
        p.vf_id = 3;
        let topo = DeviceTopology::init(&driver, &p).unwrap();
        assert_eq!(topo.unique_vf_id(), driver.spec().max_vf * 2 + 3);

        let mut spec = DeviceSpec::with_aicpus(2);
        spec.features.vf_by_device_id = true;
        let driver = SimDriver::new(spec);
        let topo = DeviceTopology::init(&driver, &p).unwrap();
        assert_eq!(topo.unique_vf_id(), 2);
    }

    #[test]
    fn test_host_deploy_uses_sequential_ids() {
        let mut spec = DeviceSpec::with_aicpus(3);
        spec.aicpu.occupy_bitmap = 0b1110_0000;
        let driver = SimDriver::new(spec);
        let mut p = params(vec![0]);
        p.deploy = DeployContext::Host;
        let topo = DeviceTopology::init(&driver, &p).unwrap();
        assert_eq!(topo.aicpu_phys_index(2, 0), 2);
    }

    #[test]
    fn test_device_for_thread() {
        let driver = SimDriver::new(DeviceSpec::with_aicpus(2));
        let topo = DeviceTopology::init(&driver, &params(vec![4, 5])).unwrap();
        assert_eq!(topo.device_for_thread(0), 4);
        assert_eq!(topo.device_for_thread(1), 4);
        assert_eq!(topo.device_for_thread(2), 5);
        assert_eq!(topo.phys_index_for_thread(3), topo.aicpu_phys_index(1, 5));
    }

    #[test]
    fn test_sched_module_detaches_on_failure() {
        let driver = SimDriver::new(DeviceSpec::with_aicpus(2));
        let topo = DeviceTopology::init(&driver, &params(vec![0, 1])).unwrap();
        driver.fail_group_creation(true);
        assert!(topo.init_sched_module(&driver, 0).is_err());
        assert!(driver.attached_devices().is_empty());

        driver.fail_group_creation(false);
        topo.init_sched_module(&driver, 0).unwrap();
        // Second attach reports Repeated, which is fine.
        topo.init_sched_module(&driver, 0).unwrap();
        assert_eq!(driver.attached_devices(), vec![0, 1]);
    }

    #[test]
    fn test_host_bind_polls_until_bound() {
        let driver = SimDriver::new(DeviceSpec::with_aicpus(1));
        driver.set_bind_delay_polls(3);
        let binder = HostBinder::new(&driver, Duration::from_millis(1), Duration::from_secs(1));
        assert!(binder.bind(0, 0, RunMode::Process).is_err());
        binder.bind(42, 0, RunMode::Process).unwrap();
        binder.wait_bound(42).unwrap();
    }

    #[test]
    fn test_host_bind_times_out() {
        let driver = SimDriver::new(DeviceSpec::with_aicpus(1));
        let binder = HostBinder::new(&driver, Duration::from_millis(1), Duration::from_millis(20));
        assert!(matches!(binder.wait_bound(7), Err(SchedError::InitFailed(_))));
    }
}
