//! Dual-method SOC estimation.
//!
//! Each cycle integrates measured current into `accumulated_ah`, looks the
//! resting cell voltage up on the chemistry's OCV curve, fuses the two with
//! a weight that collapses under load or at temperature extremes, and then
//! smooths the result with an adaptive exponential filter.

use tracing::{debug, info, warn};

use super::battery_system::BatterySystem;
use super::clock::secs_since;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Below this, a cycle is treated as a 1 s tick
const MIN_DT_S: f64 = 0.5;

/// Fraction of max charge current above which the OCV reading is ignored
const REST_CURRENT_FRACTION: f64 = 0.05;

const DRIFT_WEIGHT: f64 = 0.8;
const DRIFT_THRESHOLD_PERCENT: f64 = 18.0;

impl BatterySystem {
    /// Re-estimate SOC from the measurement last passed to `update_measurements`.
    ///
    /// The first call seeds the estimator (from the BMS-reported SOC, else
    /// 50 %) and returns. Invalid capacity configuration leaves every field
    /// untouched.
    pub fn calculate_soc(&mut self) {
        let total_ah = self.total_ah();
        let usable = self.capacity_nominal_wh > 0.0 && total_ah > 0.0;
        if !usable {
            warn!(
                capacity_wh = self.capacity_nominal_wh,
                "calculate_soc skipped: no usable capacity"
            );
            return;
        }

        let now = self.clock.now();
        let Some(last) = self.last_update else {
            self.cold_start(total_ah);
            self.last_update = Some(now);
            return;
        };

        let mut dt = secs_since(self.clock.as_ref(), last);
        if dt < MIN_DT_S {
            dt = 1.0;
        }
        self.last_update = Some(now);

        let nominal_v = self.banks[0].nominal_voltage;
        let self_discharge_wh = self.capacity_nominal_wh
            * (self.tuning.self_discharge_rate_pct_per_day / 100.0 / SECONDS_PER_DAY)
            * dt;
        self.accumulated_ah -= self_discharge_wh / nominal_v;

        if self.sensor_rejected("battery_current") {
            debug!(current_a = self.current, "coulomb step skipped");
        } else {
            // Positive current discharges, so charging yields delta_ah > 0
            let mut delta_ah = -self.current * dt / 3600.0;
            if delta_ah > 0.0 {
                delta_ah *= self.tuning.coulomb_efficiency;
            }
            self.accumulated_ah += delta_ah;
        }
        self.accumulated_ah = self.accumulated_ah.clamp(0.0, total_ah);
        self.soc_coulomb = 100.0 * self.accumulated_ah / total_ah;

        let voltage_ok = !self.sensor_rejected("battery_voltage");
        if voltage_ok {
            self.soc_voltage = self.chemistry.ocv_to_soc(self.cell_voltage());
        } else {
            debug!(voltage_v = self.voltage, "coulomb-only estimate");
        }

        let w = if voltage_ok { self.fusion_weight() } else { 0.0 };
        self.voltage_weight = w;
        self.soc_estimated = self.soc_coulomb * (1.0 - w) + self.soc_voltage * w;

        if w > DRIFT_WEIGHT && (self.soc_coulomb - self.soc_voltage).abs() > DRIFT_THRESHOLD_PERCENT {
            debug!(
                soc_coulomb = self.soc_coulomb,
                soc_voltage = self.soc_voltage,
                "coulomb counter resynced to rested voltage"
            );
            self.accumulated_ah = (self.soc_voltage / 100.0 * total_ah).clamp(0.0, total_ah);
            self.soc_coulomb = 100.0 * self.accumulated_ah / total_ah;
        }

        self.soc_smoothed = smooth(self.soc_smoothed, self.soc_estimated, self.tuning.smoothing_alpha);
        self.propagate_soc();
        self.track_full_charge();

        debug!(
            dt_s = dt,
            weight = w,
            soc_coulomb = self.soc_coulomb,
            soc_voltage = self.soc_voltage,
            soc_estimated = self.soc_estimated,
            soc_percent = self.soc_smoothed,
            "soc updated"
        );
    }

    fn cold_start(&mut self, total_ah: f64) {
        let seed = self
            .reported_soc
            .filter(|soc| soc.is_finite())
            .unwrap_or(50.0)
            .clamp(0.0, 100.0);

        self.soc_smoothed = seed;
        self.soc_estimated = seed;
        self.soc_coulomb = seed;
        self.soc_voltage = if !self.sensor_rejected("battery_voltage") {
            self.chemistry.ocv_to_soc(self.cell_voltage())
        } else {
            seed
        };
        self.accumulated_ah = seed / 100.0 * total_ah;
        self.propagate_soc();

        info!(soc_percent = seed, "soc estimator seeded");
    }

    fn propagate_soc(&mut self) {
        self.capacity_remaining_wh = self.capacity_nominal_wh * self.soc_smoothed / 100.0;
        let soc = self.soc_smoothed;
        for bank in self.banks.iter_mut().take(self.active_banks) {
            bank.soc_percent = soc;
        }
    }

    /// Weight given to the OCV estimate this cycle
    pub(crate) fn fusion_weight(&self) -> f64 {
        let mut w = self.tuning.soc_voltage_weight;
        if self.sensor_rejected("battery_current")
            || !self.current.is_finite()
            || self.current.abs() > REST_CURRENT_FRACTION * self.tuning.max_charge_current_a
        {
            w = 0.0;
        }
        // An unreadable temperature counts as extreme
        if !(10.0..=40.0).contains(&self.temperature_c) {
            w *= 0.3;
        }
        if w.is_finite() {
            w.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    pub fn voltage_weight(&self) -> f64 {
        self.voltage_weight
    }
}

/// Adaptive exponential smoothing: track real moves fast, damp jitter.
fn smooth(previous: f64, estimate: f64, base_alpha: f64) -> f64 {
    let change = (estimate - previous).abs();
    let alpha = if change > 1.0 {
        (base_alpha * 3.0).min(1.0)
    } else if change < 0.1 {
        base_alpha * 0.5
    } else {
        base_alpha
    };

    let next = alpha * estimate + (1.0 - alpha) * previous;
    if next.is_finite() {
        next.clamp(0.0, 100.0)
    } else {
        previous.clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::super::battery_system::test_support::*;
    use super::*;
    use crate::controller::clock::ManualClock;
    use crate::domain::{BatteryError, Chemistry};
    use proptest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;

    fn fresh(chemistry: Chemistry) -> (BatterySystem, ManualClock) {
        let clock = ManualClock::new();
        let bat = BatterySystem::new(&battery_config(chemistry), Arc::new(clock.clone())).unwrap();
        (bat, clock)
    }

    #[test]
    fn test_cold_start_seeds_from_reported_soc() {
        let (mut bat, _clock) = fresh(Chemistry::Lfp);
        let mut m = measurement(52.0, 0.0, 25.0);
        m.battery_soc = Some(50.0);
        bat.update_measurements(&m);
        bat.calculate_soc();

        assert_eq!(bat.soc(), 50.0);
        assert!(bat.last_update().is_some());
        assert_eq!(bat.capacity_remaining_wh(), 5_000.0);
        assert!((bat.accumulated_ah() - bat.total_ah() * 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_cold_start_defaults_to_half() {
        let (mut bat, _clock) = fresh(Chemistry::Nmc);
        bat.update_measurements(&measurement(f64::NAN, 0.0, 25.0));
        bat.calculate_soc();
        assert_eq!(bat.soc(), 50.0);
    }

    #[test]
    fn test_exact_table_hit_at_rest() {
        let (mut bat, clock) = fresh(Chemistry::Lfp);
        bat.update_measurements(&measurement(52.0, 0.0, 25.0));
        bat.calculate_soc();
        clock.advance_secs(1.0);
        bat.calculate_soc();
        assert!((bat.soc_voltage() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_charging_applies_coulomb_efficiency() {
        let (mut bat, clock) = system_at(50.0);
        bat.tuning.self_discharge_rate_pct_per_day = 0.0;
        let before = bat.accumulated_ah();
        bat.update_measurements(&measurement(52.0, -36.0, 25.0));
        clock.advance_secs(100.0);
        bat.calculate_soc();
        // 36 A for 100 s = 1 Ah, times 0.98
        assert!((bat.accumulated_ah() - before - 0.98).abs() < 1e-9);
    }

    #[test]
    fn test_discharging_is_not_derated() {
        let (mut bat, clock) = system_at(50.0);
        bat.tuning.self_discharge_rate_pct_per_day = 0.0;
        let before = bat.accumulated_ah();
        bat.update_measurements(&measurement(52.0, 36.0, 25.0));
        clock.advance_secs(100.0);
        bat.calculate_soc();
        assert!((before - bat.accumulated_ah() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_tiny_dt_is_treated_as_one_second() {
        let (mut bat, clock) = system_at(50.0);
        bat.tuning.self_discharge_rate_pct_per_day = 0.0;
        let before = bat.accumulated_ah();
        bat.update_measurements(&measurement(52.0, 36.0, 25.0));
        clock.advance_secs(0.1);
        bat.calculate_soc();
        assert!((before - bat.accumulated_ah() - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_self_discharge_drains_idle_pack() {
        let (mut bat, clock) = system_at(50.0);
        let before = bat.accumulated_ah();
        bat.update_measurements(&measurement(52.0, 0.0, 25.0));
        clock.advance_secs(86_400.0);
        bat.calculate_soc();
        // 0.1 %/day of 10 kWh = 10 Wh, / 48 V
        assert!((before - bat.accumulated_ah() - 10.0 / 48.0).abs() < 1e-9);
    }

    #[rstest]
    #[case(0.0, 25.0, 0.3)]
    #[case(4.0, 25.0, 0.3)]
    #[case(6.0, 25.0, 0.0)]
    #[case(-6.0, 25.0, 0.0)]
    #[case(0.0, 5.0, 0.09)]
    #[case(0.0, 45.0, 0.09)]
    #[case(0.0, f64::NAN, 0.09)]
    fn test_fusion_weight(#[case] current: f64, #[case] temp: f64, #[case] expected: f64) {
        let (mut bat, _clock) = system_at(50.0);
        bat.update_measurements(&measurement(52.0, current, temp));
        assert!((bat.fusion_weight() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_fusion_weight_clamped_to_unit_interval() {
        let (mut bat, _clock) = system_at(50.0);
        bat.tuning.soc_voltage_weight = 4.0;
        bat.update_measurements(&measurement(52.0, 0.0, 25.0));
        assert_eq!(bat.fusion_weight(), 1.0);
    }

    #[test]
    fn test_implausible_voltage_falls_back_to_coulomb() {
        let (mut bat, clock) = system_at(60.0);
        bat.update_measurements(&measurement(3.0, 0.0, 25.0));
        clock.advance_secs(1.0);
        bat.calculate_soc();
        assert_eq!(bat.voltage_weight(), 0.0);
        assert!((bat.soc_estimated() - bat.soc_coulomb()).abs() < 1e-9);
    }

    #[test]
    fn test_rejected_readings_are_recorded() {
        let (mut bat, _clock) = system_at(60.0);
        bat.update_measurements(&measurement(3.0, f64::NAN, 400.0));

        let quantities: Vec<_> = bat
            .sensor_errors()
            .iter()
            .filter_map(|err| match err {
                BatteryError::SensorOutOfRange { quantity, .. } => Some(*quantity),
                _ => None,
            })
            .collect();
        assert_eq!(quantities, vec!["battery_voltage", "battery_current", "battery_temp"]);

        bat.update_measurements(&measurement(52.0, 0.0, 25.0));
        assert!(bat.sensor_errors().is_empty());
    }

    #[test]
    fn test_non_finite_current_skips_integration() {
        let (mut bat, clock) = system_at(60.0);
        bat.tuning.self_discharge_rate_pct_per_day = 0.0;
        let before = bat.accumulated_ah();
        bat.update_measurements(&measurement(52.0, f64::NAN, 25.0));
        clock.advance_secs(1.0);
        bat.calculate_soc();
        assert_eq!(bat.accumulated_ah(), before);
        assert!(bat.soc().is_finite());
    }

    #[test]
    fn test_drift_correction_snaps_counter() {
        let (mut bat, clock) = system_at(90.0);
        bat.tuning.soc_voltage_weight = 1.0;
        // 3.25 V per cell reads 50 %, coulomb says 90 %
        bat.update_measurements(&measurement(52.0, 0.0, 25.0));
        clock.advance_secs(1.0);
        bat.calculate_soc();
        assert!((bat.soc_coulomb() - 50.0).abs() < 1e-6);
        assert!((bat.accumulated_ah() - 0.5 * bat.total_ah()).abs() < 1e-6);
    }

    #[test]
    fn test_no_drift_correction_below_weight_threshold() {
        let (mut bat, clock) = system_at(90.0);
        bat.tuning.self_discharge_rate_pct_per_day = 0.0;
        bat.update_measurements(&measurement(52.0, 0.0, 25.0));
        clock.advance_secs(1.0);
        bat.calculate_soc();
        assert!((bat.soc_coulomb() - 90.0).abs() < 1e-6);
    }

    #[rstest]
    #[case(50.0, 60.0, 0.1, 50.0 + 0.3 * 10.0)]
    #[case(50.0, 50.5, 0.1, 50.0 + 0.1 * 0.5)]
    #[case(50.0, 50.05, 0.1, 50.0 + 0.05 * 0.05)]
    #[case(50.0, 90.0, 0.5, 90.0)]
    fn test_adaptive_smoothing(
        #[case] prev: f64,
        #[case] est: f64,
        #[case] alpha: f64,
        #[case] expected: f64,
    ) {
        assert!((smooth(prev, est, alpha) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_smoothing_ignores_non_finite_estimate() {
        assert_eq!(smooth(40.0, f64::NAN, 0.1), 40.0);
    }

    #[test]
    fn test_rest_converges_to_ocv() {
        let (mut bat, clock) = system_at(20.0);
        bat.tuning.soc_voltage_weight = 1.0;
        // 3.30 V per cell = 70 %
        bat.update_measurements(&measurement(52.8, 0.0, 25.0));
        for _ in 0..200 {
            clock.advance_secs(1.0);
            bat.calculate_soc();
        }
        assert!((bat.soc() - 70.0).abs() < 0.5);
    }

    proptest! {
        #[test]
        fn prop_soc_bounded_and_capacity_consistent(
            steps in proptest::collection::vec(
                (-200.0f64..200.0, 20.0f64..70.0, -30.0f64..70.0, 0.0f64..30.0),
                1..40,
            ),
            seed in 0.0f64..100.0,
        ) {
            let (mut bat, clock) = system_at(seed);
            for (current, voltage, temp, dt) in steps {
                bat.update_measurements(&measurement(voltage, current, temp));
                clock.advance_secs(dt);
                bat.calculate_soc();
                prop_assert!((0.0..=100.0).contains(&bat.soc()));
                prop_assert!(bat.accumulated_ah() >= 0.0);
                prop_assert!(bat.accumulated_ah() <= bat.total_ah() + 1e-9);
                prop_assert_eq!(
                    bat.capacity_remaining_wh(),
                    bat.capacity_nominal_wh() * bat.soc() / 100.0
                );
            }
        }
    }
}
