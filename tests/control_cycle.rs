//! Whole-system cycles and the async tick loop.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use homestead_energy_controller::config::Config;
use homestead_energy_controller::controller::{ManualClock, SystemController};
use homestead_energy_controller::domain::{
    Chemistry, ControlCommands, LoadDefinition, LoadPriority, Measurement, PvMeasurement,
    SystemMeasurement, SystemMode,
};
use homestead_energy_controller::hardware::MeasurementSource;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn snapshot(grid_available: bool, pv_amps: f64) -> SystemMeasurement {
    SystemMeasurement {
        battery: Measurement {
            battery_voltage: Chemistry::Lfp.soc_to_ocv(60.0) * 16.0,
            battery_soc: Some(60.0),
            ..Default::default()
        },
        pv: PvMeasurement {
            string_voltage: vec![400.0, 400.0],
            string_current: vec![pv_amps, pv_amps],
        },
        grid_available,
        ..Default::default()
    }
}

fn homestead() -> (SystemController, ManualClock) {
    let mut config = Config::default();
    config.loads.definitions = vec![
        LoadDefinition::new("fridge", 300.0, LoadPriority::Critical),
        LoadDefinition::new("hvac", 2_000.0, LoadPriority::Medium),
        LoadDefinition::new("workshop", 4_000.0, LoadPriority::NonEssential),
    ];
    let clock = ManualClock::new();
    let ctl = SystemController::new(&config, Arc::new(clock.clone())).unwrap();
    (ctl, clock)
}

#[test]
fn shipped_config_file_loads() {
    let config = Config::load().unwrap();
    assert_eq!(config.loads.definitions.len(), 5);
    assert_eq!(config.battery.chemistry, Chemistry::Lfp);
    assert_eq!(config.battery.tuning.max_operating_soc, 98.0);
}

#[test]
fn outage_sheds_then_grid_return_restores() {
    let (mut ctl, clock) = homestead();

    let cmds = ctl.run_cycle(&snapshot(true, 0.0));
    assert_eq!(ctl.mode(), SystemMode::Normal);
    assert_eq!(cmds.load_shed, vec![false, false, false]);

    clock.advance_secs(1.0);
    let cmds = ctl.run_cycle(&snapshot(false, 0.0));
    assert_eq!(ctl.mode(), SystemMode::Island);
    assert!(cmds.island);
    assert_eq!(cmds.load_shed, vec![false, false, true]);
    assert!(cmds.battery_setpoint_w > 0.0);

    clock.advance_secs(1.0);
    let cmds = ctl.run_cycle(&snapshot(true, 0.0));
    assert_eq!(ctl.mode(), SystemMode::Normal);
    assert_eq!(cmds.load_shed, vec![false, false, false]);
    assert!(!ctl.loads().shedding_active());
}

#[test]
fn sunny_island_keeps_everything_on() {
    let (mut ctl, clock) = homestead();
    clock.advance_secs(1.0);
    // 8 kW of sun against 6.3 kW of load
    let cmds = ctl.run_cycle(&snapshot(false, 10.0));

    assert_eq!(cmds.load_shed, vec![false, false, false]);
    assert!(cmds.battery_charge_power_w > 0.0);
    assert_eq!(cmds.battery_discharge_power_w, 0.0);
}

#[test]
fn pv_string_fault_is_reported_and_cleared() {
    let (mut ctl, _clock) = homestead();
    let mut m = snapshot(true, 5.0);
    m.pv.string_voltage[1] = 700.0;

    ctl.run_cycle(&m);
    assert_eq!(ctl.pv().fault_count(), 1);
    assert_eq!(ctl.pv().last_fault_reason(), Some("Overvoltage fault"));

    assert_eq!(ctl.clear_faults(), Ok(true));
    assert!(ctl.pv().strings().iter().all(|s| s.fault.is_none()));
}

/// Serves a fixed snapshot and stops the loop after `limit` commands.
struct ScriptedSource {
    measurement: SystemMeasurement,
    failed_reads: Mutex<u32>,
    applied: Mutex<Vec<ControlCommands>>,
    limit: usize,
}

impl ScriptedSource {
    fn new(measurement: SystemMeasurement, failed_reads: u32, limit: usize) -> Self {
        Self {
            measurement,
            failed_reads: Mutex::new(failed_reads),
            applied: Mutex::new(Vec::new()),
            limit,
        }
    }
}

#[async_trait]
impl MeasurementSource for ScriptedSource {
    async fn read(&self) -> Result<SystemMeasurement> {
        let mut failed = self.failed_reads.lock();
        if *failed > 0 {
            *failed -= 1;
            return Err(anyhow!("bus timeout"));
        }
        Ok(self.measurement.clone())
    }

    async fn apply(&self, commands: &ControlCommands) -> Result<()> {
        let mut applied = self.applied.lock();
        applied.push(commands.clone());
        if applied.len() >= self.limit {
            bail!("script finished");
        }
        Ok(())
    }
}

#[tokio::test]
async fn run_loop_applies_commands_every_tick() {
    let (mut ctl, _clock) = homestead();
    let source = ScriptedSource::new(snapshot(false, 0.0), 0, 3);

    let err = ctl
        .run(&source, Duration::from_millis(10))
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "script finished");
    assert_eq!(ctl.cycle_count(), 3);
    let applied = source.applied.lock();
    assert_eq!(applied.len(), 3);
    assert!(applied.iter().all(|c| c.island));
}

#[tokio::test]
async fn run_loop_skips_failed_reads() {
    let (mut ctl, _clock) = homestead();
    let source = ScriptedSource::new(snapshot(true, 0.0), 2, 1);

    assert!(ctl.run(&source, Duration::from_millis(10)).await.is_err());
    assert_eq!(ctl.cycle_count(), 1);
}
