//! # Battery system aggregate
//!
//! [`BatterySystem`] owns every bank, the SOC estimator state, the charge
//! stage machine and the protection flags. Its behaviour is split across
//! sibling modules, each adding an `impl BatterySystem` block:
//!
//! - `soc_estimator`: coulomb counting, OCV lookup, fusion and smoothing
//! - `charge_control`: charge/discharge decisions and power limits
//! - `safety`: hysteretic fault detection and recovery
//! - `thermal`: cooling/heating hysteresis
//!
//! Nothing here blocks or locks. The control loop is the only caller.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::clock::{secs_since, Clock, MonotonicClock};
use super::safety::{SafetyRecord, SafetyThresholds};
use crate::config::{BatteryConfig, BatteryTuning};
use crate::domain::{
    BatteryBank, BatteryError, BatteryState, BatteryStatusReport, ChargeStage, Chemistry,
    FaultFlags, HealthStatus, Measurement, DEFAULT_CELLS_IN_SERIES,
};

pub struct BatterySystem {
    pub(crate) chemistry: Chemistry,
    pub(crate) banks: Vec<BatteryBank>,
    pub(crate) active_banks: usize,
    pub(crate) tuning: BatteryTuning,
    pub(crate) safety: SafetyThresholds,
    pub(crate) clock: Arc<dyn Clock>,

    // Latest measurement
    pub(crate) voltage: f64,
    pub(crate) current: f64,
    pub(crate) temperature_c: f64,
    pub(crate) measured_at: DateTime<Utc>,
    pub(crate) reported_soc: Option<f64>,
    /// Readings from the last measurement that failed plausibility checks
    pub(crate) sensor_errors: Vec<BatteryError>,

    // Estimator
    pub(crate) accumulated_ah: f64,
    pub(crate) last_update: Option<Instant>,
    pub(crate) soc_coulomb: f64,
    pub(crate) soc_voltage: f64,
    pub(crate) soc_estimated: f64,
    pub(crate) soc_smoothed: f64,
    pub(crate) voltage_weight: f64,
    pub(crate) capacity_nominal_wh: f64,
    pub(crate) capacity_remaining_wh: f64,
    pub(crate) health_percent: f64,

    // Thermal
    pub(crate) cooling_active: bool,
    pub(crate) heating_active: bool,

    // Limits and outputs
    pub(crate) max_charge_power_w: f64,
    pub(crate) max_discharge_power_w: f64,
    pub(crate) charge_power_w: f64,
    pub(crate) discharge_power_w: f64,
    pub(crate) total_charge_wh: f64,
    pub(crate) total_discharge_wh: f64,
    pub(crate) last_charge_tick: Option<Instant>,
    pub(crate) last_discharge_tick: Option<Instant>,

    // Stage timers
    pub(crate) absorption_started: Option<Instant>,
    pub(crate) float_started: Option<Instant>,
    pub(crate) equalize_started: Option<Instant>,

    // Protection
    pub(crate) faults: FaultFlags,
    pub(crate) last_fault_reason: Option<String>,
    pub(crate) fault_timestamp: Option<DateTime<Utc>>,
    pub(crate) fault_entered: Option<Instant>,
    pub(crate) last_clear_attempt: Option<Instant>,
    pub(crate) fault_clear_attempts: u32,
    pub(crate) events: VecDeque<SafetyRecord>,

    pub(crate) state: BatteryState,
    pub(crate) previous_state: BatteryState,
    pub(crate) charge_stage: ChargeStage,

    // Bank bookkeeping
    pub(crate) full_charge_latched: bool,
    pub(crate) discharge_start_soc: Option<f64>,
    pub(crate) cycle_depth_percent: f64,
}

impl BatterySystem {
    pub fn new(config: &BatteryConfig, clock: Arc<dyn Clock>) -> Result<Self, BatteryError> {
        let first = config
            .banks
            .first()
            .ok_or_else(|| BatteryError::InvalidConfig("no battery banks configured".into()))?;
        if first.nominal_voltage <= 0.0 {
            return Err(BatteryError::InvalidConfig(format!(
                "bank {} has non-positive nominal voltage",
                first.id
            )));
        }

        let mut banks = Vec::with_capacity(config.banks.len());
        for bank in &config.banks {
            if bank.capacity_wh.is_nan() || bank.capacity_wh <= 0.0 {
                return Err(BatteryError::InvalidConfig(format!(
                    "bank {} has non-positive capacity",
                    bank.id
                )));
            }
            banks.push(BatteryBank {
                id: bank.id.clone(),
                nominal_voltage: bank.nominal_voltage,
                cells_in_series: bank.cells_in_series,
                parallel_strings: bank.parallel_strings,
                capacity_wh: bank.capacity_wh,
                max_charge_power_w: bank.max_charge_power_w,
                max_discharge_power_w: bank.max_discharge_power_w,
                cycle_count: 0,
                last_full_charge: None,
                health_percent: bank.health_percent,
                temperature_c: 25.0,
                soc_percent: 0.0,
            });
        }

        let active_banks = banks.len();
        let capacity_nominal_wh = banks.iter().map(|b| b.capacity_wh).sum();
        let max_charge_power_w = banks.iter().map(|b| b.max_charge_power_w).sum();
        let max_discharge_power_w = banks.iter().map(|b| b.max_discharge_power_w).sum();
        let health_percent =
            banks.iter().map(|b| b.health_percent).sum::<f64>() / active_banks as f64;

        info!(
            chemistry = %config.chemistry,
            banks = active_banks,
            capacity_wh = capacity_nominal_wh,
            "battery system initialised"
        );

        Ok(Self {
            chemistry: config.chemistry,
            banks,
            active_banks,
            tuning: config.tuning.clone(),
            safety: SafetyThresholds::default(),
            clock,
            voltage: 0.0,
            current: 0.0,
            temperature_c: 25.0,
            measured_at: Utc::now(),
            reported_soc: None,
            // No reading yet
            sensor_errors: vec![BatteryError::SensorOutOfRange {
                quantity: "battery_voltage",
                value: 0.0,
            }],
            accumulated_ah: 0.0,
            last_update: None,
            soc_coulomb: 0.0,
            soc_voltage: 0.0,
            soc_estimated: 0.0,
            soc_smoothed: 0.0,
            voltage_weight: 0.0,
            capacity_nominal_wh,
            capacity_remaining_wh: 0.0,
            health_percent,
            cooling_active: false,
            heating_active: false,
            max_charge_power_w,
            max_discharge_power_w,
            charge_power_w: 0.0,
            discharge_power_w: 0.0,
            total_charge_wh: 0.0,
            total_discharge_wh: 0.0,
            last_charge_tick: None,
            last_discharge_tick: None,
            absorption_started: None,
            float_started: None,
            equalize_started: None,
            faults: FaultFlags::default(),
            last_fault_reason: None,
            fault_timestamp: None,
            fault_entered: None,
            last_clear_attempt: None,
            fault_clear_attempts: 0,
            events: VecDeque::new(),
            state: BatteryState::Idle,
            previous_state: BatteryState::Idle,
            charge_stage: ChargeStage::Bulk,
            full_charge_latched: false,
            discharge_start_soc: None,
            cycle_depth_percent: 0.0,
        })
    }

    /// Build with the real monotonic clock
    pub fn from_config(config: &BatteryConfig) -> Result<Self, BatteryError> {
        Self::new(config, Arc::new(MonotonicClock))
    }

    /// Copy one cycle's readings into the aggregate.
    pub fn update_measurements(&mut self, measurement: &Measurement) {
        self.voltage = measurement.battery_voltage;
        self.current = measurement.battery_current;
        self.temperature_c = measurement.battery_temp;
        self.measured_at = measurement.timestamp;
        self.reported_soc = measurement.battery_soc;

        let cells = self.cells_in_series();
        self.sensor_errors = [
            measurement.check_voltage(self.chemistry, cells),
            measurement.check_current(),
            measurement.check_temperature(),
        ]
        .into_iter()
        .filter_map(Result::err)
        .collect();
        for err in &self.sensor_errors {
            warn!(error = %err, "sensor reading rejected");
        }

        if measurement.battery_temp.is_finite() {
            for bank in self.banks.iter_mut().take(self.active_banks) {
                bank.temperature_c = measurement.battery_temp;
            }
        }
    }

    /// True when the last reading of `quantity` failed its plausibility check.
    pub(crate) fn sensor_rejected(&self, quantity: &str) -> bool {
        self.sensor_errors.iter().any(|err| {
            matches!(err, BatteryError::SensorOutOfRange { quantity: q, .. } if *q == quantity)
        })
    }

    pub fn sensor_errors(&self) -> &[BatteryError] {
        &self.sensor_errors
    }

    pub(crate) fn cells_in_series(&self) -> u32 {
        match self.banks.first().map(|b| b.cells_in_series) {
            Some(0) | None => DEFAULT_CELLS_IN_SERIES,
            Some(n) => n,
        }
    }

    pub(crate) fn cell_voltage(&self) -> f64 {
        self.voltage / self.cells_in_series() as f64
    }

    /// Coulomb-counter capacity (Ah) referenced to the first bank's nominal voltage
    pub(crate) fn total_ah(&self) -> f64 {
        match self.banks.first() {
            Some(bank) if bank.nominal_voltage > 0.0 => {
                self.capacity_nominal_wh / bank.nominal_voltage
            }
            _ => 0.0,
        }
    }

    pub(crate) fn transition(&mut self, next: BatteryState) {
        if next == self.state {
            return;
        }
        debug!(from = %self.state, to = %next, soc_percent = self.soc_smoothed, "battery state transition");

        if next == BatteryState::Discharging {
            self.discharge_start_soc = Some(self.soc_smoothed);
        } else if self.state == BatteryState::Discharging {
            self.record_discharge_depth();
        }

        self.previous_state = self.state;
        self.state = next;
    }

    fn record_discharge_depth(&mut self) {
        let Some(start) = self.discharge_start_soc.take() else {
            return;
        };
        let depth = (start - self.soc_smoothed).max(0.0);
        self.cycle_depth_percent += depth;
        while self.cycle_depth_percent >= 100.0 {
            self.cycle_depth_percent -= 100.0;
            for bank in self.banks.iter_mut().take(self.active_banks) {
                bank.cycle_count += 1;
            }
        }
    }

    /// Stamp `last_full_charge` once each time the pack reaches its ceiling while charging.
    pub(crate) fn track_full_charge(&mut self) {
        let ceiling = self.tuning.max_operating_soc;
        if self.state.is_charging() && self.soc_smoothed >= ceiling && !self.full_charge_latched {
            self.full_charge_latched = true;
            let stamp = self.measured_at;
            for bank in self.banks.iter_mut().take(self.active_banks) {
                bank.last_full_charge = Some(stamp);
            }
            info!(soc_percent = self.soc_smoothed, "battery reached full charge");
        } else if self.soc_smoothed < ceiling - 5.0 {
            self.full_charge_latched = false;
        }
    }

    pub(crate) fn zero_outputs(&mut self) {
        self.charge_power_w = 0.0;
        self.discharge_power_w = 0.0;
        self.last_charge_tick = None;
        self.last_discharge_tick = None;
    }

    /// Operator-requested service mode. Suspends charge and discharge decisions.
    pub fn enter_maintenance(&mut self) {
        if self.state == BatteryState::Maintenance {
            return;
        }
        self.zero_outputs();
        self.transition(BatteryState::Maintenance);
        info!(previous = %self.previous_state, "battery entered maintenance");
    }

    pub fn exit_maintenance(&mut self) -> Result<(), BatteryError> {
        if self.state != BatteryState::Maintenance {
            warn!(state = %self.state, "exit_maintenance outside maintenance");
            return Err(BatteryError::NotInMaintenance);
        }
        self.charge_stage = ChargeStage::Bulk;
        self.absorption_started = None;
        self.float_started = None;
        self.equalize_started = None;
        self.transition(BatteryState::Idle);
        info!("battery left maintenance");
        Ok(())
    }

    pub fn chemistry(&self) -> Chemistry {
        self.chemistry
    }

    pub fn state(&self) -> BatteryState {
        self.state
    }

    pub fn previous_state(&self) -> BatteryState {
        self.previous_state
    }

    pub fn charge_stage(&self) -> ChargeStage {
        self.charge_stage
    }

    /// Authoritative SOC for every downstream decision
    pub fn soc(&self) -> f64 {
        self.soc_smoothed
    }

    pub fn soc_coulomb(&self) -> f64 {
        self.soc_coulomb
    }

    pub fn soc_voltage(&self) -> f64 {
        self.soc_voltage
    }

    pub fn soc_estimated(&self) -> f64 {
        self.soc_estimated
    }

    pub fn accumulated_ah(&self) -> f64 {
        self.accumulated_ah
    }

    pub fn last_update(&self) -> Option<Instant> {
        self.last_update
    }

    pub fn capacity_nominal_wh(&self) -> f64 {
        self.capacity_nominal_wh
    }

    pub fn capacity_remaining_wh(&self) -> f64 {
        self.capacity_remaining_wh
    }

    pub fn charge_power_w(&self) -> f64 {
        self.charge_power_w
    }

    pub fn discharge_power_w(&self) -> f64 {
        self.discharge_power_w
    }

    pub fn total_charge_wh(&self) -> f64 {
        self.total_charge_wh
    }

    pub fn total_discharge_wh(&self) -> f64 {
        self.total_discharge_wh
    }

    pub fn faults(&self) -> FaultFlags {
        self.faults
    }

    pub fn last_fault_reason(&self) -> Option<&str> {
        self.last_fault_reason.as_deref()
    }

    pub fn fault_timestamp(&self) -> Option<DateTime<Utc>> {
        self.fault_timestamp
    }

    pub fn fault_clear_attempts(&self) -> u32 {
        self.fault_clear_attempts
    }

    pub fn cooling_active(&self) -> bool {
        self.cooling_active
    }

    pub fn heating_active(&self) -> bool {
        self.heating_active
    }

    pub fn temperature_c(&self) -> f64 {
        self.temperature_c
    }

    /// Seconds spent in the current absorption, float or equalize stage
    pub fn stage_elapsed_s(&self) -> f64 {
        let started = match self.charge_stage {
            ChargeStage::Absorption => self.absorption_started,
            ChargeStage::Float => self.float_started,
            ChargeStage::Equalize => self.equalize_started,
            ChargeStage::Bulk => None,
        };
        started
            .map(|t| secs_since(self.clock.as_ref(), t))
            .unwrap_or(0.0)
    }

    pub fn tuning(&self) -> &BatteryTuning {
        &self.tuning
    }

    pub fn banks(&self) -> &[BatteryBank] {
        &self.banks[..self.active_banks]
    }

    pub fn status(&self) -> BatteryStatusReport {
        BatteryStatusReport {
            chemistry: self.chemistry,
            state: self.state,
            previous_state: self.previous_state,
            charge_stage: self.charge_stage,
            stage_elapsed_s: self.stage_elapsed_s(),
            soc_percent: self.soc_smoothed,
            soc_estimated_percent: self.soc_estimated,
            soc_coulomb_percent: self.soc_coulomb,
            soc_voltage_percent: self.soc_voltage,
            capacity_nominal_wh: self.capacity_nominal_wh,
            capacity_remaining_wh: self.capacity_remaining_wh,
            health_percent: self.health_percent,
            health_status: HealthStatus::from_health_percent(self.health_percent),
            temperature_c: self.temperature_c,
            cooling_active: self.cooling_active,
            heating_active: self.heating_active,
            charge_power_w: self.charge_power_w,
            discharge_power_w: self.discharge_power_w,
            max_charge_power_w: self.calculate_max_charge(),
            max_discharge_power_w: self.calculate_max_discharge(),
            total_charge_wh: self.total_charge_wh,
            total_discharge_wh: self.total_discharge_wh,
            active_banks: self.active_banks,
            faults: self.faults,
            last_fault_reason: self.last_fault_reason.clone(),
            fault_timestamp: self.fault_timestamp,
            fault_clear_attempts: self.fault_clear_attempts,
        }
    }

    pub fn log_status(&self) {
        info!(
            state = %self.state,
            stage = %self.charge_stage,
            soc_percent = self.soc_smoothed,
            soc_coulomb_percent = self.soc_coulomb,
            soc_voltage_percent = self.soc_voltage,
            capacity_remaining_wh = self.capacity_remaining_wh,
            temperature_c = self.temperature_c,
            charge_power_w = self.charge_power_w,
            discharge_power_w = self.discharge_power_w,
            cooling = self.cooling_active,
            heating = self.heating_active,
            fault = ?self.last_fault_reason,
            "battery status"
        );
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::BankConfig;
    use crate::controller::clock::ManualClock;

    pub fn battery_config(chemistry: Chemistry) -> BatteryConfig {
        BatteryConfig {
            chemistry,
            banks: vec![BankConfig::default()],
            tuning: BatteryTuning::default(),
        }
    }

    /// System on a manual clock, already past cold start at `soc`
    pub fn system_at(soc: f64) -> (BatterySystem, ManualClock) {
        let clock = ManualClock::new();
        let mut bat = BatterySystem::new(&battery_config(Chemistry::Lfp), Arc::new(clock.clone()))
            .expect("valid config");
        set_soc(&mut bat, soc);
        (bat, clock)
    }

    pub fn set_soc(bat: &mut BatterySystem, soc: f64) {
        bat.soc_smoothed = soc;
        bat.soc_estimated = soc;
        bat.soc_coulomb = soc;
        bat.accumulated_ah = soc / 100.0 * bat.total_ah();
        bat.capacity_remaining_wh = bat.capacity_nominal_wh * soc / 100.0;
        bat.last_update = Some(bat.clock.now());
    }

    pub fn measurement(voltage: f64, current: f64, temp: f64) -> Measurement {
        Measurement {
            battery_voltage: voltage,
            battery_current: current,
            battery_temp: temp,
            battery_soc: None,
            timestamp: Utc::now(),
        }
    }
}
