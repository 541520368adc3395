//! Charge/discharge decisions, the Bulk/Absorption/Float/Equalize stage
//! machine and the published power limits.

use std::time::Instant;
use tracing::{debug, info, warn};

use super::battery_system::BatterySystem;
use super::clock::secs_since;
use crate::domain::{BatteryError, BatteryState, ChargeStage};

const EMERGENCY_SOC: f64 = 10.0;
const EMERGENCY_MIN_EXCESS_W: f64 = 10.0;
const NORMAL_MIN_EXCESS_W: f64 = 100.0;
const EMERGENCY_FLOOR_W: f64 = 100.0;
const FLOAT_POWER_FRACTION: f64 = 0.05;
const EQUALIZE_POWER_FRACTION: f64 = 0.10;
const FLOAT_REVERT_MARGIN: f64 = 5.0;

/// Charge power multiplier for pack temperature.
///
/// Above 40 °C derate linearly to 30 % at 60 °C. Below 0 °C only a 10 %
/// trickle is allowed, and only to recover a nearly empty pack. Between
/// 0 and 10 °C ramp linearly from 10 % to 100 %.
pub fn charge_temperature_factor(temperature_c: f64, soc_percent: f64) -> f64 {
    if temperature_c.is_nan() {
        0.0
    } else if temperature_c > 40.0 {
        1.0 - 0.7 * (temperature_c.min(60.0) - 40.0) / 20.0
    } else if temperature_c < 0.0 {
        if soc_percent < EMERGENCY_SOC {
            0.1
        } else {
            0.0
        }
    } else if temperature_c < 10.0 {
        0.1 + 0.9 * temperature_c / 10.0
    } else {
        1.0
    }
}

pub fn discharge_temperature_factor(temperature_c: f64) -> f64 {
    if temperature_c.is_nan() {
        0.0
    } else if temperature_c > 50.0 {
        0.5
    } else if temperature_c < -10.0 {
        0.2
    } else {
        1.0
    }
}

impl BatterySystem {
    /// Decide whether to charge from the surplus `available_power_w - load_power_w`.
    pub fn manage_charging(&mut self, available_power_w: f64, load_power_w: f64) {
        if self.state.is_locked_out() {
            return;
        }
        let now = self.clock.now();
        let excess = available_power_w - load_power_w;
        let soc = self.soc_smoothed;

        if self.charge_stage == ChargeStage::Equalize
            && excess > EMERGENCY_MIN_EXCESS_W
            && self.run_equalize(now, excess)
        {
            return;
        }

        let emergency = soc < EMERGENCY_SOC && excess > EMERGENCY_MIN_EXCESS_W;
        let normal = excess > NORMAL_MIN_EXCESS_W && soc < self.tuning.max_operating_soc;
        if !(emergency || normal) {
            self.stop_charging();
            return;
        }

        if self.state == BatteryState::Discharging {
            self.discharge_power_w = 0.0;
            self.last_discharge_tick = None;
        }

        // Bulk runs at the full available power
        let mut power = excess.min(self.max_charge_power_w).max(0.0);
        if soc < EMERGENCY_SOC && power < EMERGENCY_FLOOR_W {
            power = power.max(EMERGENCY_FLOOR_W.min(excess));
        }

        let stage = self.next_charge_stage(now, soc);
        match stage {
            ChargeStage::Absorption => {
                let elapsed = self
                    .absorption_started
                    .map(|t| secs_since(self.clock.as_ref(), t))
                    .unwrap_or(0.0);
                power *= (1.0 - elapsed / self.tuning.absorption_duration_s).max(0.1);
            }
            ChargeStage::Float => {
                power = power.min(self.max_charge_power_w * FLOAT_POWER_FRACTION);
            }
            ChargeStage::Bulk | ChargeStage::Equalize => {}
        }

        power *= charge_temperature_factor(self.temperature_c, soc);
        self.charge_power_w = power;
        self.transition(stage.battery_state());
        self.account_charge(now);
    }

    /// Stateful stage selection. Float is sticky until SOC falls well below
    /// the bulk threshold; Absorption ends on its timer.
    fn next_charge_stage(&mut self, now: Instant, soc: f64) -> ChargeStage {
        let bulk = self.tuning.bulk_charge_soc_limit;
        let absorption = self.tuning.absorption_charge_soc_limit;

        let next = match self.charge_stage {
            ChargeStage::Float if soc < bulk - FLOAT_REVERT_MARGIN => ChargeStage::Bulk,
            ChargeStage::Float => ChargeStage::Float,
            _ if soc >= absorption => ChargeStage::Float,
            _ if soc >= bulk => {
                let started = *self.absorption_started.get_or_insert(now);
                let elapsed = secs_since(self.clock.as_ref(), started);
                if elapsed >= self.tuning.absorption_duration_s {
                    ChargeStage::Float
                } else {
                    ChargeStage::Absorption
                }
            }
            _ => ChargeStage::Bulk,
        };

        if next != self.charge_stage {
            debug!(from = %self.charge_stage, to = %next, soc_percent = soc, "charge stage change");
        }
        match next {
            ChargeStage::Bulk => {
                self.absorption_started = None;
                self.float_started = None;
            }
            ChargeStage::Float => {
                self.absorption_started = None;
                self.float_started.get_or_insert(now);
            }
            ChargeStage::Absorption | ChargeStage::Equalize => {}
        }
        self.charge_stage = next;
        next
    }

    /// Returns false once the equalize period is over and normal charging should resume.
    fn run_equalize(&mut self, now: Instant, excess: f64) -> bool {
        let started = *self.equalize_started.get_or_insert(now);
        if secs_since(self.clock.as_ref(), started) >= self.tuning.equalize_duration_s {
            info!(soc_percent = self.soc_smoothed, "equalization complete");
            self.equalize_started = None;
            self.charge_stage = ChargeStage::Float;
            self.float_started = Some(now);
            return false;
        }

        let cap = self.max_charge_power_w * EQUALIZE_POWER_FRACTION;
        self.charge_power_w =
            excess.min(cap) * charge_temperature_factor(self.temperature_c, self.soc_smoothed);
        self.transition(BatteryState::Equalize);
        self.account_charge(now);
        true
    }

    fn stop_charging(&mut self) {
        if self.state != BatteryState::Idle {
            self.transition(BatteryState::Idle);
        }
        self.charge_stage = ChargeStage::Bulk;
        self.absorption_started = None;
        self.float_started = None;
        self.equalize_started = None;
        self.zero_outputs();
    }

    fn account_charge(&mut self, now: Instant) {
        let dt = self
            .last_charge_tick
            .map(|t| secs_since(self.clock.as_ref(), t))
            .unwrap_or(self.tuning.control_interval_s);
        self.last_charge_tick = Some(now);
        self.total_charge_wh += self.charge_power_w * dt / 3600.0;
    }

    /// Decide whether to discharge into `load_power_w`.
    pub fn manage_discharging(&mut self, load_power_w: f64, grid_available: bool) {
        if self.state.is_locked_out() {
            return;
        }
        let now = self.clock.now();
        let soc = self.soc_smoothed;
        let min_soc = self.tuning.min_operating_soc;

        let already = self.state == BatteryState::Discharging;
        let islanded = !grid_available
            && load_power_w > 10.0
            && (soc > min_soc + 5.0 || (already && soc > min_soc));
        let peak_shave = grid_available && soc > 70.0 && load_power_w > 100.0 && soc > min_soc;

        if !(islanded || peak_shave) {
            // No surplus left to charge from either
            if self.state.is_charging() {
                self.stop_charging();
                return;
            }
            if already {
                self.transition(BatteryState::Idle);
            }
            self.discharge_power_w = 0.0;
            self.last_discharge_tick = None;
            return;
        }

        if self.state.is_charging() {
            self.charge_stage = ChargeStage::Bulk;
            self.absorption_started = None;
            self.float_started = None;
            self.equalize_started = None;
        }
        self.charge_power_w = 0.0;
        self.last_charge_tick = None;

        let mut power = load_power_w.min(self.max_discharge_power_w).max(0.0);

        let headroom = soc - min_soc;
        if headroom < 10.0 {
            power *= (headroom / 10.0).max(0.1);
        }
        power *= discharge_temperature_factor(self.temperature_c);

        if power > 0.0 {
            let runway_h = self.capacity_nominal_wh * headroom.max(0.0) / 100.0 / power;
            if runway_h < 0.5 {
                power *= 0.5;
            }
        }

        self.discharge_power_w = power;
        self.transition(BatteryState::Discharging);

        let dt = self
            .last_discharge_tick
            .map(|t| secs_since(self.clock.as_ref(), t))
            .unwrap_or(self.tuning.control_interval_s);
        self.last_discharge_tick = Some(now);
        self.total_discharge_wh += power * dt / 3600.0;
    }

    /// Charge power the pack can accept right now (W).
    pub fn calculate_max_charge(&self) -> f64 {
        if self.state.is_locked_out() {
            return 0.0;
        }
        let soc = self.soc_smoothed;
        let mut limit = self.max_charge_power_w;
        if soc > 80.0 {
            limit *= (1.0 - 0.95 * (soc - 80.0) / 20.0).max(FLOAT_POWER_FRACTION);
        }
        let temp_factor = charge_temperature_factor(self.temperature_c, soc);
        limit *= temp_factor;
        if soc < 20.0 && temp_factor > 0.0 {
            limit = limit.max(EMERGENCY_FLOOR_W);
        }
        limit.min(self.max_charge_power_w).max(0.0)
    }

    /// Discharge power the pack can deliver right now (W).
    pub fn calculate_max_discharge(&self) -> f64 {
        if self.state.is_locked_out() {
            return 0.0;
        }
        let soc = self.soc_smoothed;
        let min_soc = self.tuning.min_operating_soc;
        let mut limit = self.max_discharge_power_w;
        if soc < 30.0 {
            let span = 30.0 - min_soc;
            let factor = if span > 0.0 {
                ((soc - min_soc) / span).clamp(0.0, 1.0)
            } else if soc > min_soc {
                1.0
            } else {
                0.0
            };
            limit *= factor;
        }
        (limit * discharge_temperature_factor(self.temperature_c)).max(0.0)
    }

    /// Start a timed equalization charge. Lead acid only, from a full pack.
    pub fn equalize(&mut self) -> Result<(), BatteryError> {
        if !self.chemistry.supports_equalization() {
            warn!(chemistry = %self.chemistry, "equalize rejected");
            return Err(BatteryError::EqualizationUnsupported(self.chemistry));
        }
        if self.state.is_locked_out() {
            return Err(BatteryError::Fault(
                self.last_fault_reason
                    .clone()
                    .unwrap_or_else(|| self.state.to_string()),
            ));
        }
        let required = self.tuning.absorption_charge_soc_limit;
        if self.soc_smoothed < required {
            return Err(BatteryError::SocTooLow {
                soc: self.soc_smoothed,
                required,
            });
        }

        let now = self.clock.now();
        self.charge_stage = ChargeStage::Equalize;
        self.equalize_started = Some(now);
        self.absorption_started = None;
        self.float_started = None;
        self.discharge_power_w = 0.0;
        self.last_discharge_tick = None;
        self.transition(BatteryState::Equalize);
        info!(soc_percent = self.soc_smoothed, "equalization started");
        Ok(())
    }
}
