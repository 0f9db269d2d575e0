//! Structured logging setup.
//!
//! Worker threads are named after their logical core, so the thread-name
//! field identifies which AI-CPU emitted each line.

use tracing::info;
use tracing_subscriber::{
    filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, Registry,
};

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name reported at startup.
    pub service_name: String,
    /// Level filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit JSON lines instead of the compact format.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "aicpu-sched".to_string(),
            log_level: "info".to_string(),
            json: false,
        }
    }
}

/// Install the global subscriber.
///
/// Fails if a subscriber is already installed; callers that may run twice
/// (tests, embedded call mode) can ignore the error.
pub fn init_tracing(config: &LogConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = Registry::default().with(env_filter);

    if config.json {
        subscriber
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .json(),
            )
            .try_init()?;
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .compact(),
            )
            .try_init()?;
    }

    info!("Logging initialized for {}", config.service_name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_an_error_not_a_panic() {
        let config = LogConfig::default();
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }
}
