//! Single-slot outbound message coalescer.
//!
//! Every worker owns one [`Outbox`]. Handlers park at most one outbound
//! message in it; parking a new one first sends the pending one. The
//! dispatch loop flushes the slot at the end of every cycle, after the
//! response for the current event has gone out.

use bytes::Bytes;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::driver::DeviceDriver;
use crate::errlog::ErrLogTable;
use crate::error::{DrvError, Result};
use crate::reliability::metrics;
use crate::types::Event;

/// A deferred outbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMsg {
    /// Event submitted back to this device's own scheduler.
    SchedulerSubmit { device: u32, event: Event },
    /// Asynchronous message to TS, optionally reporting an error-log slot
    /// `(ts_context, offset)` that must be cleared if delivery fails.
    TsAsync {
        device: u32,
        payload: Bytes,
        errlog: Option<(u32, usize)>,
    },
}

/// Retry policy for TS-directed sends.
#[derive(Debug, Clone, Copy)]
pub struct SendPolicy {
    pub retries: u32,
    pub interval: Duration,
}

/// Per-worker pending-send slot.
pub struct Outbox {
    driver: Arc<dyn DeviceDriver>,
    errlog: Arc<ErrLogTable>,
    policy: SendPolicy,
    pending: Option<OutboundMsg>,
}

impl Outbox {
    pub fn new(driver: Arc<dyn DeviceDriver>, errlog: Arc<ErrLogTable>, policy: SendPolicy) -> Self {
        Self {
            driver,
            errlog,
            policy,
            pending: None,
        }
    }

    /// Park `msg`, sending any message already pending.
    pub fn set(&mut self, msg: OutboundMsg) -> Result<()> {
        let flushed = self.flush();
        self.pending = Some(msg);
        flushed
    }

    /// Send the pending message, if any.
    pub fn flush(&mut self) -> Result<()> {
        match self.pending.take() {
            Some(msg) => self.send(msg),
            None => Ok(()),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn send(&self, msg: OutboundMsg) -> Result<()> {
        match msg {
            OutboundMsg::SchedulerSubmit { device, event } => {
                debug!("Submitting event kind {} sub {} to device {}", event.kind, event.sub_kind, device);
                self.driver.submit_event(device, event).map_err(|e| {
                    error!("Scheduler submit to device {} failed: {}", device, e);
                    e.into()
                })
            }
            OutboundMsg::TsAsync { device, payload, errlog } => {
                match self.send_ts_with_retry(device, &payload) {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        metrics::record_ts_send_failure();
                        if let Some((ctx, offset)) = errlog {
                            if let Err(clear) = self.errlog.set_unit_empty(ctx, offset) {
                                warn!("Failed to clear error log {}@{:#x}: {}", ctx, offset, clear);
                            }
                        }
                        Err(e.into())
                    }
                }
            }
        }
    }

    fn send_ts_with_retry(&self, device: u32, payload: &[u8]) -> std::result::Result<(), DrvError> {
        let mut last = DrvError::Retryable;
        for attempt in 0..self.policy.retries {
            match self.driver.send_ts_msg(device, payload) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("TS send attempt {} on device {} failed: {}", attempt + 1, device, e);
                    last = e;
                }
            }
            if attempt + 1 < self.policy.retries {
                thread::sleep(self.policy.interval);
            }
        }
        error!(
            "TS send on device {} failed after {} attempts: {}",
            device, self.policy.retries, last
        );
        Err(last)
    }
}

impl Drop for Outbox {
    fn drop(&mut self) {
        if self.pending.is_some() {
            let _ = self.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errlog::ErrRecord;
    use crate::sim::{DeviceSpec, SimDriver};
    use crate::types::EventKind;

    fn outbox(driver: &Arc<SimDriver>, errlog: &Arc<ErrLogTable>) -> Outbox {
        Outbox::new(
            driver.clone(),
            errlog.clone(),
            SendPolicy {
                retries: 3,
                interval: Duration::from_millis(1),
            },
        )
    }

    fn ts_msg(tag: u8, errlog: Option<(u32, usize)>) -> OutboundMsg {
        OutboundMsg::TsAsync {
            device: 0,
            payload: Bytes::from(vec![tag]),
            errlog,
        }
    }

    #[test]
    fn test_set_flushes_previous() {
        let driver = Arc::new(SimDriver::new(DeviceSpec::with_aicpus(1)));
        let errlog = Arc::new(ErrLogTable::new());
        let mut out = outbox(&driver, &errlog);

        out.set(ts_msg(1, None)).unwrap();
        assert!(driver.ts_messages().is_empty());
        out.set(ts_msg(2, None)).unwrap();
        assert_eq!(driver.ts_messages(), vec![(0, vec![1])]);
        out.flush().unwrap();
        assert!(!out.is_pending());
        assert_eq!(driver.ts_messages().len(), 2);
        out.flush().unwrap();
        assert_eq!(driver.ts_messages().len(), 2);
    }

    #[test]
    fn test_scheduler_submit() {
        let driver = Arc::new(SimDriver::new(DeviceSpec::with_aicpus(1)));
        let errlog = Arc::new(ErrLogTable::new());
        let mut out = outbox(&driver, &errlog);
        let event = Event::new(EventKind::AicpuMsg.raw(), 1, Bytes::new());
        out.set(OutboundMsg::SchedulerSubmit { device: 0, event: event.clone() })
            .unwrap();
        out.flush().unwrap();
        assert_eq!(driver.submitted(0), vec![event]);
    }

    #[test]
    fn test_failed_send_retries_then_clears_errlog() {
        let driver = Arc::new(SimDriver::new(DeviceSpec::with_aicpus(1)));
        let errlog = Arc::new(ErrLogTable::new());
        let offset = errlog
            .add_err_log(4, &ErrRecord::AiCore { model_id: 0, stream_id: 0, task_id: 0, result: 1 })
            .unwrap();
        driver.fail_ts_send(true);
        let mut out = outbox(&driver, &errlog);
        out.set(ts_msg(9, Some((4, offset)))).unwrap();
        assert!(out.flush().is_err());
        assert_eq!(driver.ts_send_attempts(), 3);
        assert_eq!(errlog.occupied(4), 0);
    }

    #[test]
    fn test_transient_failure_recovers() {
        let driver = Arc::new(SimDriver::new(DeviceSpec::with_aicpus(1)));
        let errlog = Arc::new(ErrLogTable::new());
        driver.fail_ts_send_times(2);
        let mut out = outbox(&driver, &errlog);
        out.set(ts_msg(5, None)).unwrap();
        out.flush().unwrap();
        assert_eq!(driver.ts_messages(), vec![(0, vec![5])]);
    }
}
