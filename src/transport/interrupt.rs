//! Driver event-queue transport.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::constants::events::CP_EVENT_MASK;
use crate::driver::DeviceDriver;
use crate::error::{DrvError, DrvResult, Result, SchedError};
use crate::transport::{MessageTransport, WaitOutcome};
use crate::types::{Response, ThreadContext};

/// Bounded-timeout waits on the driver's per-group event queue.
pub struct InterruptTransport {
    driver: Arc<dyn DeviceDriver>,
    device: u32,
    group: u32,
    thread_index: usize,
}

impl InterruptTransport {
    /// Subscribe the calling worker to every event kind of `group` and drain
    /// anything left over from a previous owner of the queue.
    pub fn init(driver: Arc<dyn DeviceDriver>, thread: &ThreadContext, group: u32) -> Result<Self> {
        driver
            .subscribe(thread.device_id, group, thread.index, CP_EVENT_MASK)
            .map_err(|e| {
                SchedError::InitFailed(format!(
                    "subscribe thread {} on device {} group {}: {}",
                    thread.index, thread.device_id, group, e
                ))
            })?;

        match driver.wait_event(thread.device_id, group, thread.index, Duration::ZERO) {
            Ok(stale) => warn!(
                "Thread {} dropped stale event kind {} sub {}",
                thread.index, stale.kind, stale.sub_kind
            ),
            Err(DrvError::Timeout) | Err(DrvError::NoEvent) => {}
            Err(e) => debug!("Thread {} initial drain: {}", thread.index, e),
        }

        info!(
            "Thread {} subscribed to device {} group {}",
            thread.index, thread.device_id, group
        );
        Ok(Self {
            driver,
            device: thread.device_id,
            group,
            thread_index: thread.index,
        })
    }
}

impl MessageTransport for InterruptTransport {
    fn name(&self) -> &'static str {
        "interrupt"
    }

    fn wait_once(&mut self, timeout: Duration) -> WaitOutcome {
        match self
            .driver
            .wait_event(self.device, self.group, self.thread_index, timeout)
        {
            Ok(event) => WaitOutcome::Event(event),
            Err(DrvError::Timeout) => WaitOutcome::Timeout,
            Err(DrvError::NoEvent) => WaitOutcome::NoEvent,
            Err(e) => WaitOutcome::Fatal(e),
        }
    }

    fn respond(&mut self, response: &Response) -> DrvResult<()> {
        self.driver.ack_event(self.device, response)
    }
}
