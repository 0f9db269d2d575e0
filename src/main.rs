//! AI-CPU scheduler binary.
//!
//! Loads the configuration, starts one worker per AI-CPU against the
//! simulated device and runs until SIGINT or SIGTERM.

use anyhow::{anyhow, Context};
use std::sync::Arc;
use tracing::info;

use aicpu_sched::{
    config::Config,
    reliability::{metrics, tracing::init_tracing, ShutdownSignal},
    scheduler::Scheduler,
    sim::{DeviceSpec, EchoExecutor, SimDriver},
};

/// AI-CPUs per simulated device.
const SIM_AICPUS: u32 = 4;

fn main() -> anyhow::Result<()> {
    let config = Config::load().context("loading configuration")?;
    init_tracing(&config.log_config()).map_err(|e| anyhow!("initializing tracing: {}", e))?;
    metrics::register_metrics();

    info!(
        "Starting on devices {:?}: {} transport, {:?} run mode, {:?} deploy",
        config.device_ids, config.sched_mode, config.run_mode, config.deploy
    );

    let mut shutdown = ShutdownSignal::install().context("installing signal handlers")?;

    let driver = Arc::new(SimDriver::new(DeviceSpec::with_aicpus(SIM_AICPUS)));
    let executor = Arc::new(EchoExecutor::new());
    let mut scheduler =
        Scheduler::start(config, driver, executor).context("starting scheduler")?;

    shutdown.wait();
    if let Some(lastword) = scheduler.stop() {
        info!("Final event totals: {}", lastword);
    }
    Ok(())
}
