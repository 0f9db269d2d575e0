//! Per-model buffer lifecycle tracking.
//!
//! Every driver buffer allocated on behalf of a model is appended to that
//! model's list under a per-model lock, so teardown can release everything
//! the model ever allocated with one [`BufferTracker::free_all`] call.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::constants::resources::{BUF_ALIGN, BUF_HUGEPAGE_FLAG, MAX_MODEL_COUNT};
use crate::driver::{BufHandle, DeviceDriver, KillReason};
use crate::error::{Result, SchedError};

/// How a batch of buffers relates at the driver level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Each buffer is tracked on its own.
    Independent,
    /// The first buffer is the chain head; the rest are appended to it and
    /// released with it.
    Chain,
}

/// Frees a buffer on drop unless disarmed.
struct InFlight<'a> {
    driver: &'a dyn DeviceDriver,
    buf: BufHandle,
    armed: bool,
}

impl<'a> InFlight<'a> {
    fn new(driver: &'a dyn DeviceDriver, buf: BufHandle) -> Self {
        Self {
            driver,
            buf,
            armed: true,
        }
    }

    fn disarm(mut self) -> BufHandle {
        self.armed = false;
        self.buf
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.driver.buf_free(self.buf) {
                warn!("Failed to free in-flight buffer {:?}: {}", self.buf, e);
            }
        }
    }
}

/// Buffer tracker keyed by model id.
pub struct BufferTracker {
    driver: Arc<dyn DeviceDriver>,
    device_id: u32,
    lists: Vec<Mutex<Vec<BufHandle>>>,
}

impl BufferTracker {
    pub fn new(driver: Arc<dyn DeviceDriver>, device_id: u32) -> Self {
        Self {
            driver,
            device_id,
            lists: (0..MAX_MODEL_COUNT).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    fn list(&self, model_id: u32) -> Result<&Mutex<Vec<BufHandle>>> {
        self.lists.get(model_id as usize).ok_or_else(|| {
            error!("Model id {} out of range [0, {})", model_id, MAX_MODEL_COUNT);
            SchedError::Inner(format!("model id {} out of range", model_id))
        })
    }

    fn alloc_flags(&self) -> u64 {
        (u64::from(self.device_id) << 32) | BUF_HUGEPAGE_FLAG
    }

    fn alloc(&self, size: u64) -> Result<BufHandle> {
        self.driver
            .buf_alloc(size, BUF_ALIGN, self.alloc_flags())
            .map_err(|e| {
                error!("Buffer alloc of {} bytes failed: {}", size, e);
                SchedError::ResourceExhausted(format!("buffer alloc of {} bytes: {}", size, e))
            })
    }

    /// Track an existing buffer for `model_id`.
    pub fn guard(&self, model_id: u32, buf: BufHandle) -> Result<()> {
        self.list(model_id)?.lock().push(buf);
        Ok(())
    }

    /// Stop tracking a buffer (ownership moved elsewhere). Returns whether it
    /// was tracked.
    pub fn un_guard(&self, model_id: u32, buf: BufHandle) -> Result<bool> {
        let mut list = self.list(model_id)?.lock();
        match list.iter().position(|b| *b == buf) {
            Some(pos) => {
                list.swap_remove(pos);
                Ok(true)
            }
            None => {
                debug!("Buffer {:?} not tracked by model {}", buf, model_id);
                Ok(false)
            }
        }
    }

    /// Allocate a buffer and track it for `model_id`.
    pub fn malloc_and_guard(&self, model_id: u32, size: u64) -> Result<BufHandle> {
        let list = self.list(model_id)?;
        let buf = InFlight::new(self.driver.as_ref(), self.alloc(size)?);
        list.lock().push(buf.buf);
        Ok(buf.disarm())
    }

    /// Allocate several buffers for `model_id`. On any failure, everything
    /// allocated by this call is released and nothing stays tracked.
    pub fn malloc_batch(&self, model_id: u32, sizes: &[u64], mode: BatchMode) -> Result<Vec<BufHandle>> {
        self.list(model_id)?;
        match mode {
            BatchMode::Independent => self.malloc_independent(model_id, sizes),
            BatchMode::Chain => self.malloc_chain(model_id, sizes),
        }
    }

    fn malloc_independent(&self, model_id: u32, sizes: &[u64]) -> Result<Vec<BufHandle>> {
        let mut done = Vec::with_capacity(sizes.len());
        for &size in sizes {
            match self.malloc_and_guard(model_id, size) {
                Ok(buf) => done.push(buf),
                Err(e) => {
                    self.release(model_id, &done);
                    return Err(e);
                }
            }
        }
        Ok(done)
    }

    fn malloc_chain(&self, model_id: u32, sizes: &[u64]) -> Result<Vec<BufHandle>> {
        let Some((&first, rest)) = sizes.split_first() else {
            return Ok(Vec::new());
        };
        let head = match self.malloc_and_guard(model_id, first) {
            Ok(head) => head,
            Err(e) => {
                self.request_kill();
                return Err(e);
            }
        };
        let mut chain = vec![head];

        for &size in rest {
            let buf = match self.alloc(size) {
                Ok(buf) => InFlight::new(self.driver.as_ref(), buf),
                Err(e) => {
                    self.request_kill();
                    self.release(model_id, &[head]);
                    return Err(e);
                }
            };
            let handle = buf.buf;
            if let Err(e) = self.driver.buf_chain_append(head, handle) {
                error!("Chain append of {:?} to {:?} failed: {}", handle, head, e);
                drop(buf);
                self.release(model_id, &[head]);
                return Err(e.into());
            }
            // Owned by the chain head from here on.
            chain.push(buf.disarm());
        }
        Ok(chain)
    }

    fn release(&self, model_id: u32, bufs: &[BufHandle]) {
        for &buf in bufs {
            if let Ok(true) = self.un_guard(model_id, buf) {
                if let Err(e) = self.driver.buf_free(buf) {
                    warn!("Failed to free buffer {:?} of model {}: {}", buf, model_id, e);
                }
            }
        }
    }

    fn request_kill(&self) {
        warn!("Buffer exhaustion on device {}, requesting supervisor kill", self.device_id);
        if let Err(e) = self.driver.request_kill(self.device_id, KillReason::ResourceExhausted) {
            error!("Kill request failed: {}", e);
        }
    }

    /// Free every buffer tracked for `model_id`. Idempotent; driver
    /// failures are logged and the list is cleared regardless.
    pub fn free_all(&self, model_id: u32) -> Result<()> {
        let bufs: Vec<BufHandle> = std::mem::take(&mut *self.list(model_id)?.lock());
        if bufs.is_empty() {
            return Ok(());
        }
        for buf in &bufs {
            if let Err(e) = self.driver.buf_free(*buf) {
                warn!("Failed to free buffer {:?} of model {}: {}", buf, model_id, e);
            }
        }
        info!("Freed {} buffers of model {}", bufs.len(), model_id);
        Ok(())
    }

    /// Free buffers of every model.
    pub fn free_all_models(&self) {
        for model_id in 0..MAX_MODEL_COUNT {
            let _ = self.free_all(model_id);
        }
    }

    /// Number of buffers tracked for `model_id`.
    pub fn guarded(&self, model_id: u32) -> usize {
        self.list(model_id).map(|l| l.lock().len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{DeviceSpec, SimDriver};

    fn tracker() -> (Arc<SimDriver>, BufferTracker) {
        let driver = Arc::new(SimDriver::new(DeviceSpec::with_aicpus(1)));
        let tracker = BufferTracker::new(driver.clone(), 1);
        (driver, tracker)
    }

    #[test]
    fn test_free_all_empties_and_is_idempotent() {
        let (driver, tracker) = tracker();
        tracker.malloc_and_guard(3, 128).unwrap();
        tracker.malloc_and_guard(3, 256).unwrap();
        assert_eq!(tracker.guarded(3), 2);
        assert_eq!(driver.live_buffers(), 2);

        tracker.free_all(3).unwrap();
        assert_eq!(tracker.guarded(3), 0);
        assert_eq!(driver.live_buffers(), 0);

        tracker.free_all(3).unwrap();
        assert_eq!(tracker.guarded(3), 0);
    }

    #[test]
    fn test_free_all_clears_even_when_driver_fails() {
        let (driver, tracker) = tracker();
        tracker.malloc_and_guard(1, 64).unwrap();
        driver.fail_buffer_free(true);
        tracker.free_all(1).unwrap();
        assert_eq!(tracker.guarded(1), 0);
    }

    #[test]
    fn test_model_out_of_range() {
        let (_, tracker) = tracker();
        assert!(matches!(
            tracker.malloc_and_guard(MAX_MODEL_COUNT, 64),
            Err(SchedError::Inner(_))
        ));
    }

    #[test]
    fn test_alloc_flags_carry_device() {
        let (driver, tracker) = tracker();
        tracker.malloc_and_guard(0, 64).unwrap();
        assert_eq!(driver.last_alloc_flags(), Some((1u64 << 32) | BUF_HUGEPAGE_FLAG));
    }

    #[test]
    fn test_un_guard() {
        let (driver, tracker) = tracker();
        let buf = tracker.malloc_and_guard(2, 64).unwrap();
        assert!(tracker.un_guard(2, buf).unwrap());
        assert!(!tracker.un_guard(2, buf).unwrap());
        tracker.free_all(2).unwrap();
        // Un-guarded buffer is no longer ours to free.
        assert_eq!(driver.live_buffers(), 1);
    }

    #[test]
    fn test_independent_batch_rolls_back() {
        let (driver, tracker) = tracker();
        driver.fail_alloc_after(2);
        let res = tracker.malloc_batch(5, &[8, 8, 8, 8], BatchMode::Independent);
        assert!(res.is_err());
        assert_eq!(tracker.guarded(5), 0);
        assert_eq!(driver.live_buffers(), 0);
        assert_eq!(driver.kill_requests().len(), 0);
    }

    #[test]
    fn test_chain_batch() {
        let (driver, tracker) = tracker();
        let bufs = tracker.malloc_batch(6, &[8, 16, 32], BatchMode::Chain).unwrap();
        assert_eq!(bufs.len(), 3);
        // Only the head is tracked.
        assert_eq!(tracker.guarded(6), 1);
        assert_eq!(driver.chain_len(bufs[0]), 2);
    }

    #[test]
    fn test_chain_batch_failure_kills_and_releases() {
        let (driver, tracker) = tracker();
        driver.fail_alloc_after(2);
        let res = tracker.malloc_batch(7, &[8, 8, 8, 8], BatchMode::Chain);
        assert!(matches!(res, Err(SchedError::ResourceExhausted(_))));
        assert_eq!(tracker.guarded(7), 0);
        assert_eq!(driver.live_buffers(), 0);
        assert_eq!(driver.kill_requests(), vec![(1, KillReason::ResourceExhausted)]);
    }
}
