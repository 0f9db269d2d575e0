//! Shutdown signal handling.
//!
//! The scheduler threads never see signals directly: the main thread blocks
//! here until SIGINT or SIGTERM arrives, then stops the worker pool, which
//! clears the running flag and joins every worker.

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::Result;

/// Blocks the calling thread until a termination signal arrives.
pub struct ShutdownSignal {
    signals: Signals,
    requested: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// Install handlers for SIGINT and SIGTERM.
    pub fn install() -> Result<Self> {
        let signals = Signals::new([SIGINT, SIGTERM])?;
        let requested = Arc::new(AtomicBool::new(false));
        // Also latch a flag so that non-blocking callers can poll.
        signal_hook::flag::register(SIGTERM, Arc::clone(&requested))?;
        signal_hook::flag::register(SIGINT, Arc::clone(&requested))?;
        Ok(Self { signals, requested })
    }

    /// Whether a termination signal has been received.
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Wait for the first termination signal and return its number.
    pub fn wait(&mut self) -> i32 {
        match self.signals.forever().next() {
            Some(sig) => {
                info!("Received signal {}, shutting down", sig);
                sig
            }
            None => {
                warn!("Signal iterator closed without a signal");
                SIGTERM
            }
        }
    }

    /// Handle that wakes [`ShutdownSignal::wait`] from another thread.
    pub fn handle(&self) -> signal_hook::iterator::Handle {
        self.signals.handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_handle_close_unblocks_wait() {
        let mut shutdown = ShutdownSignal::install().unwrap();
        let handle = shutdown.handle();
        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            handle.close();
        });
        assert_eq!(shutdown.wait(), SIGTERM);
        assert!(!shutdown.is_requested());
        closer.join().unwrap();
    }
}
