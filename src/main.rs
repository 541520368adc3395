use anyhow::Result;
use homestead_energy_controller::{config, controller, telemetry};
use config::Config;
use controller::{MonotonicClock, SystemController};
use std::sync::Arc;
use std::time::Duration;
use telemetry::init_tracing;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = Config::load()?;
    let tick = Duration::from_secs(cfg.controller.tick_seconds.max(1));

    let mut controller = SystemController::new(&cfg, Arc::new(MonotonicClock))?;
    info!(
        chemistry = %cfg.battery.chemistry,
        banks = cfg.battery.banks.len(),
        loads = cfg.loads.definitions.len(),
        "starting Homestead Energy Controller"
    );

    run(&cfg, &mut controller, tick).await?;

    controller.log_status();
    warn!("shutdown complete");
    Ok(())
}

#[cfg(feature = "sim")]
async fn run(cfg: &Config, controller: &mut SystemController, tick: Duration) -> Result<()> {
    let (plant, poller) = homestead_energy_controller::hardware::SimulatedPlant::spawn(cfg)?;

    tokio::select! {
        res = controller.run(&plant, tick) => {
            if let Err(e) = res {
                warn!(error = %e, "control loop stopped");
            }
        }
        _ = telemetry::shutdown_signal() => {}
    }
    poller.abort();
    Ok(())
}

#[cfg(not(feature = "sim"))]
async fn run(_cfg: &Config, _controller: &mut SystemController, _tick: Duration) -> Result<()> {
    anyhow::bail!("no measurement source: build with the `sim` feature or link a hardware driver")
}
