//! PV string supervision and maximum power point tracking.
//!
//! All tracking memory (previous power/voltage, perturbation direction,
//! pacing timestamp) lives on [`PvController`], so several arrays can be
//! tracked independently.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::clock::{secs_since, Clock};
use crate::config::PvConfig;
use crate::domain::{MpptAlgorithm, PvError, PvFaultKind, PvMeasurement, PvState, PvString};

const MPPT_INTERVAL: Duration = Duration::from_millis(100);
const SOILING_FACTOR: f64 = 0.98;
const WIRING_FACTOR: f64 = 0.97;
const CONSTANT_VOLTAGE_RATIO: f64 = 0.78;
const VREF_MIN_RATIO: f64 = 0.5;
const VREF_MAX_RATIO: f64 = 0.9;
const STRING_OVERVOLTAGE_RATIO: f64 = 1.1;
const STRING_OVERCURRENT_RATIO: f64 = 1.2;
const IMBALANCE_RATIO: f64 = 0.3;
/// Below this |dV| the incremental-conductance step falls back to dI
const DV_EPSILON: f64 = 1e-6;

pub struct PvController {
    state: PvState,
    algorithm: MpptAlgorithm,
    strings: Vec<PvString>,
    clock: Arc<dyn Clock>,

    total_capacity_w: f64,
    power_w: f64,
    max_operating_power_w: f64,
    curtail_percent: f64,
    curtail_start_soc: f64,
    curtail_max_percent: f64,

    voltage_ref: f64,
    step_size_v: f64,
    direction: f64,
    prev_power: Option<f64>,
    prev_voltage: f64,
    prev_current: f64,
    last_mppt_run: Option<Instant>,

    total_energy_wh: f64,
    last_energy_tick: Option<Instant>,

    fault_count: u32,
    last_fault_reason: Option<String>,
    last_fault_at: Option<DateTime<Utc>>,
}

impl PvController {
    pub fn new(config: &PvConfig, clock: Arc<dyn Clock>) -> Result<Self, PvError> {
        if config.strings.iter().all(|s| !s.enabled) {
            return Err(PvError::NoStrings);
        }
        if let Some(bad) = config.strings.iter().find(|s| !(s.max_voltage > 0.0)) {
            return Err(PvError::InvalidConfig(format!(
                "string {} has non-positive max_voltage",
                bad.id
            )));
        }

        let strings = config.strings.clone();
        let total_capacity_w = strings
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.max_power_w)
            .sum();

        info!(
            strings = strings.len(),
            capacity_w = total_capacity_w,
            algorithm = %config.algorithm,
            "pv controller initialised"
        );

        Ok(Self {
            state: PvState::Off,
            algorithm: config.algorithm,
            strings,
            clock,
            total_capacity_w,
            power_w: 0.0,
            max_operating_power_w: total_capacity_w,
            curtail_percent: 0.0,
            curtail_start_soc: config.curtail_start_soc,
            curtail_max_percent: config.curtail_max_percent,
            voltage_ref: 0.0,
            step_size_v: config.step_size_v,
            direction: 1.0,
            prev_power: None,
            prev_voltage: 0.0,
            prev_current: 0.0,
            last_mppt_run: None,
            total_energy_wh: 0.0,
            last_energy_tick: None,
            fault_count: 0,
            last_fault_reason: None,
            last_fault_at: None,
        })
    }

    /// Power up. Tracking begins once a string shows voltage.
    pub fn start(&mut self) {
        if self.state == PvState::Off {
            self.state = PvState::Starting;
        }
    }

    pub fn stop(&mut self) {
        self.state = PvState::Off;
        self.prev_power = None;
        self.last_mppt_run = None;
    }

    pub fn enter_maintenance(&mut self) {
        self.state = PvState::Maintenance;
    }

    pub fn exit_maintenance(&mut self) {
        if self.state == PvState::Maintenance {
            self.state = PvState::Starting;
        }
    }

    fn reference_index(&self) -> Option<usize> {
        self.strings.iter().position(|s| s.enabled)
    }

    /// Sum V x I over producing strings. Returns total PV power (W).
    pub fn update_measurements(&mut self, pv: &PvMeasurement) -> f64 {
        let total: f64 = self
            .strings
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_producing())
            .map(|(i, _)| (pv.voltage(i) * pv.current(i)).max(0.0))
            .sum();
        self.power_w = if total.is_finite() { total } else { 0.0 };

        let now = self.clock.now();
        if let Some(last) = self.last_energy_tick {
            self.total_energy_wh += self.power_w * secs_since(self.clock.as_ref(), last) / 3600.0;
        }
        self.last_energy_tick = Some(now);

        if self.state == PvState::Starting
            && self
                .strings
                .iter()
                .enumerate()
                .any(|(i, s)| s.is_producing() && pv.voltage(i) > 0.0)
        {
            debug!(power_w = self.power_w, "pv tracking started");
            self.state = if self.curtail_percent > 0.0 {
                PvState::Curtailed
            } else {
                PvState::Mppt
            };
        }

        self.power_w
    }

    /// Nameplate power of producing strings after soiling and wiring losses
    pub fn calculate_available_power(&self) -> f64 {
        self.strings
            .iter()
            .filter(|s| s.is_producing())
            .map(|s| s.max_power_w * SOILING_FACTOR * WIRING_FACTOR)
            .sum()
    }

    /// One tracking step, paced to at most every 100 ms.
    pub fn run_mppt(&mut self, pv: &PvMeasurement) {
        if self.state != PvState::Mppt {
            return;
        }
        let now = self.clock.now();
        if let Some(last) = self.last_mppt_run {
            if self.clock.elapsed_since(last) < MPPT_INTERVAL {
                return;
            }
        }
        self.last_mppt_run = Some(now);

        let Some(ref_idx) = self.reference_index() else {
            return;
        };
        let voltage = pv.voltage(ref_idx);
        let power = self.power_w;
        let current = if voltage > 0.0 { power / voltage } else { 0.0 };

        match self.algorithm {
            MpptAlgorithm::Off => return,
            MpptAlgorithm::PerturbObserve => match self.prev_power {
                None => self.voltage_ref = voltage,
                Some(prev) => {
                    if power < prev {
                        self.direction = -self.direction;
                    }
                    self.voltage_ref += self.direction * self.step_size_v;
                }
            },
            MpptAlgorithm::IncrementalConductance => {
                if self.prev_power.is_none() {
                    self.voltage_ref = voltage;
                } else {
                    let dv = voltage - self.prev_voltage;
                    let di = current - self.prev_current;
                    if dv.abs() < DV_EPSILON {
                        if di > 0.0 {
                            self.voltage_ref += self.step_size_v;
                        } else if di < 0.0 {
                            self.voltage_ref -= self.step_size_v;
                        }
                    } else if voltage > 0.0 {
                        // dP/dV = I + V dI/dV is zero at the maximum power point
                        let slope = di / dv + current / voltage;
                        if slope > 0.0 {
                            self.voltage_ref += self.step_size_v;
                        } else if slope < 0.0 {
                            self.voltage_ref -= self.step_size_v;
                        }
                    }
                }
            }
            MpptAlgorithm::ConstantVoltage => {
                self.voltage_ref = self.strings[ref_idx].max_voltage * CONSTANT_VOLTAGE_RATIO;
            }
        }

        self.prev_power = Some(power);
        self.prev_voltage = voltage;
        self.prev_current = current;

        let max_v = self.strings[ref_idx].max_voltage;
        self.voltage_ref = self
            .voltage_ref
            .clamp(max_v * VREF_MIN_RATIO, max_v * VREF_MAX_RATIO);
    }

    /// Limit output to `(100 - percent)` % of installed capacity.
    pub fn apply_curtailment(&mut self, percent: f64) {
        let percent = if percent.is_finite() {
            percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        self.curtail_percent = percent;
        self.max_operating_power_w = self.total_capacity_w * (1.0 - percent / 100.0);

        match self.state {
            PvState::Mppt if percent > 0.0 => {
                debug!(percent, "pv curtailed");
                self.state = PvState::Curtailed;
            }
            PvState::Curtailed if percent == 0.0 => {
                debug!("pv curtailment lifted");
                self.state = PvState::Mppt;
            }
            _ => {}
        }
    }

    /// Curtailment the controller should request for a nearly full battery
    /// with surplus generation.
    pub fn curtailment_for(&self, battery_soc: f64, excess_w: f64) -> f64 {
        if battery_soc > self.curtail_start_soc && excess_w > 100.0 {
            ((battery_soc - self.curtail_start_soc) * 5.0).min(self.curtail_max_percent)
        } else {
            0.0
        }
    }

    /// Flag strings that are over voltage, over current or out of line with
    /// the reference string. Returns true while any string is faulted.
    pub fn detect_faults(&mut self, pv: &PvMeasurement) -> bool {
        let Some(ref_idx) = self.reference_index() else {
            return false;
        };
        let ref_voltage = pv.voltage(ref_idx);
        let mut newly_faulted = Vec::new();

        for (i, string) in self.strings.iter_mut().enumerate() {
            if !string.enabled || string.fault.is_some() {
                continue;
            }
            let v = pv.voltage(i);
            let a = pv.current(i);

            let kind = if v > string.max_voltage * STRING_OVERVOLTAGE_RATIO {
                Some(PvFaultKind::Overvoltage)
            } else if a > string.max_current * STRING_OVERCURRENT_RATIO {
                Some(PvFaultKind::Overcurrent)
            } else if i != ref_idx
                && ref_voltage > 0.0
                && (v - ref_voltage).abs() > ref_voltage * IMBALANCE_RATIO
            {
                Some(PvFaultKind::VoltageImbalance)
            } else {
                None
            };

            if let Some(kind) = kind {
                string.fault = Some(kind);
                newly_faulted.push((string.id.clone(), kind, v, a));
            }
        }

        for (id, kind, voltage, current) in &newly_faulted {
            warn!(string = %id, fault = %kind, voltage, current, "pv string fault");
            self.fault_count += 1;
            self.last_fault_reason = Some(kind.to_string());
            self.last_fault_at = Some(Utc::now());
        }

        let any = self.strings.iter().any(|s| s.fault.is_some());
        if any && self.state != PvState::Maintenance {
            self.state = PvState::Fault;
        }
        any
    }

    pub fn clear_faults(&mut self) {
        for string in &mut self.strings {
            string.fault = None;
        }
        if self.state == PvState::Fault {
            self.state = if self.curtail_percent > 0.0 {
                PvState::Curtailed
            } else {
                PvState::Mppt
            };
        }
        self.last_fault_reason = None;
        info!("pv faults cleared");
    }

    /// Mean efficiency of producing strings (%)
    pub fn efficiency(&self) -> f64 {
        let producing: Vec<_> = self.strings.iter().filter(|s| s.is_producing()).collect();
        if producing.is_empty() {
            return 0.0;
        }
        producing.iter().map(|s| s.efficiency_percent).sum::<f64>() / producing.len() as f64
    }

    pub fn state(&self) -> PvState {
        self.state
    }

    pub fn algorithm(&self) -> MpptAlgorithm {
        self.algorithm
    }

    pub fn set_algorithm(&mut self, algorithm: MpptAlgorithm) {
        self.algorithm = algorithm;
        self.prev_power = None;
    }

    pub fn power_w(&self) -> f64 {
        self.power_w
    }

    pub fn voltage_ref(&self) -> f64 {
        self.voltage_ref
    }

    pub fn max_operating_power_w(&self) -> f64 {
        self.max_operating_power_w
    }

    pub fn curtail_percent(&self) -> f64 {
        self.curtail_percent
    }

    pub fn total_capacity_w(&self) -> f64 {
        self.total_capacity_w
    }

    pub fn total_energy_wh(&self) -> f64 {
        self.total_energy_wh
    }

    pub fn fault_count(&self) -> u32 {
        self.fault_count
    }

    pub fn last_fault_reason(&self) -> Option<&str> {
        self.last_fault_reason.as_deref()
    }

    pub fn strings(&self) -> &[PvString] {
        &self.strings
    }

    pub fn log_status(&self) {
        let active = self.strings.iter().filter(|s| s.is_producing()).count();
        info!(
            state = %self.state,
            algorithm = %self.algorithm,
            active_strings = active,
            total_strings = self.strings.len(),
            capacity_w = self.total_capacity_w,
            power_w = self.power_w,
            max_operating_power_w = self.max_operating_power_w,
            voltage_ref = self.voltage_ref,
            total_energy_kwh = self.total_energy_wh / 1000.0,
            fault_count = self.fault_count,
            last_fault = ?self.last_fault_reason,
            last_fault_at = ?self.last_fault_at,
            "pv status"
        );
    }

    #[cfg(test)]
    fn reference_voltage_bounds(&self) -> (f64, f64) {
        let max_v = self
            .reference_index()
            .map(|i| self.strings[i].max_voltage)
            .unwrap_or(0.0);
        (max_v * VREF_MIN_RATIO, max_v * VREF_MAX_RATIO)
    }
}
