pub mod battery_system;
pub mod charge_control;
pub mod clock;
pub mod load_shedding;
pub mod mppt;
pub mod safety;
pub mod soc_estimator;
pub mod thermal;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{Config, ControllerConfig};
use crate::domain::{BatteryError, BatteryState, ControlCommands, SystemMeasurement, SystemMode};
use crate::hardware::MeasurementSource;

pub use battery_system::BatterySystem;
pub use charge_control::{charge_temperature_factor, discharge_temperature_factor};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use load_shedding::LoadManager;
pub use mppt::PvController;
pub use safety::{SafetyEvent, SafetyRecord, SafetyThresholds};

/// Islanded operation below this SOC is treated as critical
const CRITICAL_SOC: f64 = 20.0;

/// Owns the battery, PV and load controllers and runs them once per tick.
pub struct SystemController {
    battery: BatterySystem,
    pv: PvController,
    loads: LoadManager,
    config: ControllerConfig,
    mode: SystemMode,
    cycle_count: u64,
}

impl SystemController {
    pub fn new(config: &Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut battery_config = config.battery.clone();
        battery_config.tuning.control_interval_s = config.controller.tick_seconds as f64;

        let battery = BatterySystem::new(&battery_config, clock.clone())?;
        let mut pv = PvController::new(&config.pv, clock.clone())?;
        pv.start();
        let loads = LoadManager::new(&config.loads, clock)?;

        info!(
            chemistry = %battery.chemistry(),
            capacity_wh = battery.capacity_nominal_wh(),
            pv_capacity_w = pv.total_capacity_w(),
            tick_seconds = config.controller.tick_seconds,
            "system controller initialised"
        );

        Ok(Self {
            battery,
            pv,
            loads,
            config: config.controller.clone(),
            mode: SystemMode::Normal,
            cycle_count: 0,
        })
    }

    /// One synchronous control cycle: estimate, protect, balance power, shed.
    pub fn run_cycle(&mut self, measurement: &SystemMeasurement) -> ControlCommands {
        self.cycle_count += 1;

        self.battery.update_measurements(&measurement.battery);
        self.battery.calculate_soc();
        self.battery.check_limits();
        self.battery.thermal_management();
        self.battery.try_auto_clear();

        let generation = self.pv.update_measurements(&measurement.pv);
        self.pv.detect_faults(&measurement.pv);
        self.pv.run_mppt(&measurement.pv);

        let summary = self.loads.update_measurements();
        let consumption = summary.total_w + measurement.other_load_w.max(0.0);
        let grid_available = measurement.grid_available;

        self.update_mode(grid_available);

        let excess = generation - consumption;
        if excess > 0.0 {
            self.battery.manage_charging(generation, consumption);

            let surplus = excess - self.battery.charge_power_w();
            let started = self.loads.prioritize_deferrable(surplus);
            if started > 0 {
                info!(started, surplus_w = surplus, "deferred loads started on surplus");
            }

            let unabsorbed = if grid_available {
                surplus - self.config.max_grid_export_w
            } else {
                surplus
            };
            let percent = self.pv.curtailment_for(self.battery.soc(), unabsorbed);
            self.pv.apply_curtailment(percent);
        } else {
            self.pv.apply_curtailment(0.0);
            self.battery.manage_discharging(-excess, grid_available);

            if grid_available {
                let import_w = -excess - self.battery.discharge_power_w();
                if import_w > self.config.max_grid_import_w {
                    warn!(
                        import_w,
                        limit_w = self.config.max_grid_import_w,
                        "grid import above limit"
                    );
                }
            }
        }

        let available = generation + self.battery.calculate_max_discharge();
        self.loads
            .manage_shedding(available, consumption, grid_available);

        let charge = self.battery.charge_power_w();
        let discharge = self.battery.discharge_power_w();
        let curtail_percent = self.pv.curtail_percent();

        ControlCommands {
            battery_charge_power_w: charge,
            battery_discharge_power_w: discharge,
            battery_setpoint_w: discharge - charge,
            pv_curtail: curtail_percent > 0.0,
            pv_curtail_percent: curtail_percent,
            pv_voltage_ref: self.pv.voltage_ref(),
            load_shed: self.loads.shed_flags(),
            grid_connect: grid_available,
            island: !grid_available,
        }
    }

    fn update_mode(&mut self, grid_available: bool) {
        let next = match self.battery.state() {
            BatteryState::Fault => SystemMode::Emergency,
            BatteryState::Maintenance => SystemMode::Maintenance,
            _ if !grid_available && self.battery.soc() < CRITICAL_SOC => SystemMode::Critical,
            _ if !grid_available => SystemMode::Island,
            _ => SystemMode::Normal,
        };
        if next == self.mode {
            return;
        }
        match next {
            SystemMode::Emergency | SystemMode::Critical => {
                warn!(from = %self.mode, to = %next, soc_percent = self.battery.soc(), "system mode changed")
            }
            _ => info!(from = %self.mode, to = %next, "system mode changed"),
        }
        self.mode = next;
    }

    /// Put battery and PV into service mode
    pub fn enter_maintenance(&mut self) {
        self.battery.enter_maintenance();
        self.pv.enter_maintenance();
    }

    pub fn exit_maintenance(&mut self) -> Result<(), BatteryError> {
        self.battery.exit_maintenance()?;
        self.pv.exit_maintenance();
        Ok(())
    }

    /// Operator fault reset. Returns whether the battery left Fault.
    pub fn clear_faults(&mut self) -> Result<bool, BatteryError> {
        self.pv.clear_faults();
        if self.battery.state() == BatteryState::Fault {
            self.battery.clear_faults()
        } else {
            Ok(true)
        }
    }

    pub fn mode(&self) -> SystemMode {
        self.mode
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    pub fn battery(&self) -> &BatterySystem {
        &self.battery
    }

    pub fn battery_mut(&mut self) -> &mut BatterySystem {
        &mut self.battery
    }

    pub fn pv(&self) -> &PvController {
        &self.pv
    }

    pub fn pv_mut(&mut self) -> &mut PvController {
        &mut self.pv
    }

    pub fn loads(&self) -> &LoadManager {
        &self.loads
    }

    pub fn loads_mut(&mut self) -> &mut LoadManager {
        &mut self.loads
    }

    pub fn log_status(&self) {
        info!(mode = %self.mode, cycles = self.cycle_count, "system status");
        self.battery.log_status();
        self.pv.log_status();
        self.loads.log_status();
    }

    /// Tick loop: read a snapshot, run one cycle, hand the commands back.
    pub async fn run<S>(&mut self, source: &S, tick: Duration) -> Result<()>
    where
        S: MeasurementSource + ?Sized,
    {
        let mut interval = tokio::time::interval(tick.max(Duration::from_millis(10)));
        loop {
            interval.tick().await;
            let measurement = match source.read().await {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "measurement unavailable, skipping tick");
                    continue;
                }
            };

            let commands = self.run_cycle(&measurement);
            source.apply(&commands).await?;

            info!(
                mode = %self.mode,
                soc_percent = self.battery.soc(),
                battery_state = %self.battery.state(),
                pv_power_w = self.pv.power_w(),
                setpoint_w = commands.battery_setpoint_w,
                curtail_percent = commands.pv_curtail_percent,
                shed = commands.load_shed.iter().filter(|s| **s).count(),
                "control tick"
            );

            if self.config.status_every_ticks > 0
                && self.cycle_count % self.config.status_every_ticks == 0
            {
                self.log_status();
            }
        }
    }
}
