//! CPU affinity for worker threads.
//!
//! A worker either pins itself to its physical core (optionally after
//! joining a cgroup) or asks the process manager to do it. Either way the
//! call happens on the worker thread itself, before its transport is
//! initialized.

use core_affinity::CoreId;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::constants::affinity::{PROCMGR_RETRIES, PROCMGR_RETRY_INTERVAL_MS};
use crate::constants::topology::INVALID_AICPU_ID;
use crate::driver::DeviceDriver;
use crate::error::{Result, SchedError};
use crate::types::{AffinityMode, ThreadContext};

/// Kernel thread id of the caller.
#[cfg(target_os = "linux")]
pub fn current_tid() -> i32 {
    // SAFETY: gettid has no preconditions and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

#[cfg(not(target_os = "linux"))]
pub fn current_tid() -> i32 {
    std::process::id() as i32
}

/// Binds the calling worker thread to its core.
pub struct AffinityBinder<'a> {
    driver: &'a dyn DeviceDriver,
    mode: AffinityMode,
    cgroup_tasks_file: Option<&'a Path>,
}

impl<'a> AffinityBinder<'a> {
    pub fn new(driver: &'a dyn DeviceDriver, mode: AffinityMode, cgroup_tasks_file: Option<&'a Path>) -> Self {
        Self {
            driver,
            mode,
            cgroup_tasks_file,
        }
    }

    /// Bind the current thread, which serves `thread`, to `phys_index`.
    pub fn bind_current(&self, thread: &ThreadContext, phys_index: u32) -> Result<()> {
        let tid = current_tid();
        match self.mode {
            AffinityMode::ProcessManager => self.bind_by_process_manager(thread, tid),
            AffinityMode::SelfManaged => {
                self.join_cgroup(tid)?;
                pin_current(thread.index, phys_index)
            }
        }
    }

    fn bind_by_process_manager(&self, thread: &ThreadContext, tid: i32) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self
                .driver
                .bind_by_process_manager(thread.device_id, tid, thread.index)
            {
                Ok(()) => {
                    info!(
                        "Thread {} (tid {}) bound by process manager on device {}",
                        thread.index, tid, thread.device_id
                    );
                    return Ok(());
                }
                Err(e) if attempt < PROCMGR_RETRIES => {
                    attempt += 1;
                    warn!(
                        "Process manager bind of thread {} failed ({}), retry {}/{}",
                        thread.index, e, attempt, PROCMGR_RETRIES
                    );
                    thread::sleep(Duration::from_millis(PROCMGR_RETRY_INTERVAL_MS));
                }
                Err(e) => {
                    return Err(SchedError::InitFailed(format!(
                        "process manager bind of thread {} failed: {}",
                        thread.index, e
                    )));
                }
            }
        }
    }

    fn join_cgroup(&self, tid: i32) -> Result<()> {
        match self.cgroup_tasks_file {
            Some(path) if path.exists() => {
                let mut file = OpenOptions::new().append(true).open(path).map_err(|e| {
                    SchedError::InitFailed(format!("open cgroup file {}: {}", path.display(), e))
                })?;
                writeln!(file, "{}", tid).map_err(|e| {
                    SchedError::InitFailed(format!("write tid {} to {}: {}", tid, path.display(), e))
                })?;
                debug!("Tid {} written to {}", tid, path.display());
                Ok(())
            }
            _ => self.driver.bind_cgroup(tid).map_err(|e| {
                SchedError::InitFailed(format!("driver cgroup bind of tid {}: {}", tid, e))
            }),
        }
    }
}

/// Pin the current thread to `phys_index`. Invalid or out-of-range indices
/// leave the thread unpinned.
pub fn pin_current(thread_index: usize, phys_index: u32) -> Result<()> {
    if phys_index == INVALID_AICPU_ID {
        debug!("Thread {} has no physical core, not pinning", thread_index);
        return Ok(());
    }
    let cpus = num_cpus::get();
    if phys_index as usize >= cpus {
        warn!(
            "Thread {} physical core {} beyond the {} visible CPUs, not pinning",
            thread_index, phys_index, cpus
        );
        return Ok(());
    }
    if core_affinity::set_for_current(CoreId {
        id: phys_index as usize,
    }) {
        info!("Thread {} pinned to core {}", thread_index, phys_index);
        Ok(())
    } else {
        Err(SchedError::InitFailed(format!(
            "failed to pin thread {} to core {}",
            thread_index, phys_index
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{DeviceSpec, SimDriver};

    fn thread() -> ThreadContext {
        ThreadContext {
            index: 1,
            device_id: 0,
            host_pid: 1,
            vf_id: 0,
            unique_vf_id: 0,
        }
    }

    #[test]
    fn test_process_manager_retries() {
        let driver = SimDriver::new(DeviceSpec::with_aicpus(2));
        driver.fail_procmgr_binds(2);
        let binder = AffinityBinder::new(&driver, AffinityMode::ProcessManager, None);
        binder.bind_current(&thread(), 2).unwrap();
        let binds = driver.procmgr_binds();
        assert_eq!(binds.len(), 1);
        assert_eq!(binds[0].0, 0);
        assert_eq!(binds[0].2, 1);
    }

    #[test]
    fn test_process_manager_gives_up() {
        let driver = SimDriver::new(DeviceSpec::with_aicpus(2));
        driver.fail_procmgr_binds(3);
        let binder = AffinityBinder::new(&driver, AffinityMode::ProcessManager, None);
        assert!(matches!(
            binder.bind_current(&thread(), 2),
            Err(SchedError::InitFailed(_))
        ));
        assert!(driver.procmgr_binds().is_empty());
    }

    #[test]
    fn test_self_managed_uses_cgroup_file() {
        let driver = SimDriver::new(DeviceSpec::with_aicpus(2));
        let file = tempfile::NamedTempFile::new().unwrap();
        let binder = AffinityBinder::new(&driver, AffinityMode::SelfManaged, Some(file.path()));
        binder.bind_current(&thread(), INVALID_AICPU_ID).unwrap();
        let written = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(written.trim(), current_tid().to_string());
        assert!(driver.cgroup_tids().is_empty());
    }

    #[test]
    fn test_self_managed_falls_back_to_driver() {
        let driver = SimDriver::new(DeviceSpec::with_aicpus(2));
        let missing = Path::new("/nonexistent/aicpu/tasks");
        let binder = AffinityBinder::new(&driver, AffinityMode::SelfManaged, Some(missing));
        binder.bind_current(&thread(), INVALID_AICPU_ID).unwrap();
        assert_eq!(driver.cgroup_tids(), vec![current_tid()]);
    }

    #[test]
    fn test_out_of_range_core_is_skipped() {
        pin_current(0, INVALID_AICPU_ID - 1).unwrap();
    }
}
