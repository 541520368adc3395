use tracing::debug;

use super::battery_system::BatterySystem;

const COOLING_ON_C: f64 = 35.0;
const COOLING_OFF_C: f64 = 33.0;
const HEATING_ON_C: f64 = 8.0;
const HEATING_OFF_C: f64 = 10.0;

impl BatterySystem {
    /// Cooling/heating requests with 2 °C hysteresis. Actuation is external.
    pub fn thermal_management(&mut self) {
        let t = self.temperature_c;
        if t.is_nan() {
            return;
        }

        let cooling = if self.cooling_active {
            t > COOLING_OFF_C
        } else {
            t >= COOLING_ON_C
        };
        let heating = if self.heating_active {
            t < HEATING_OFF_C
        } else {
            t <= HEATING_ON_C
        };

        if cooling != self.cooling_active || heating != self.heating_active {
            debug!(temperature_c = t, cooling, heating, "thermal request changed");
        }
        self.cooling_active = cooling;
        self.heating_active = heating;
    }
}

#[cfg(test)]
mod tests {
    use super::super::battery_system::test_support::*;
    use rstest::rstest;

    #[rstest]
    #[case(&[30.0, 35.0], true)]
    #[case(&[30.0, 34.9], false)]
    #[case(&[36.0, 34.0], true)]
    #[case(&[36.0, 33.0], false)]
    fn test_cooling_hysteresis(#[case] temps: &[f64], #[case] expected: bool) {
        let (mut bat, _clock) = system_at(50.0);
        for &t in temps {
            bat.update_measurements(&measurement(52.0, 0.0, t));
            bat.thermal_management();
        }
        assert_eq!(bat.cooling_active(), expected);
    }

    #[rstest]
    #[case(&[20.0, 8.0], true)]
    #[case(&[20.0, 8.5], false)]
    #[case(&[5.0, 9.0], true)]
    #[case(&[5.0, 10.0], false)]
    fn test_heating_hysteresis(#[case] temps: &[f64], #[case] expected: bool) {
        let (mut bat, _clock) = system_at(50.0);
        for &t in temps {
            bat.update_measurements(&measurement(52.0, 0.0, t));
            bat.thermal_management();
        }
        assert_eq!(bat.heating_active(), expected);
    }

    #[test]
    fn test_nan_temperature_keeps_requests() {
        let (mut bat, _clock) = system_at(50.0);
        bat.update_measurements(&measurement(52.0, 0.0, 40.0));
        bat.thermal_management();
        bat.update_measurements(&measurement(52.0, 0.0, f64::NAN));
        bat.thermal_management();
        assert!(bat.cooling_active());
    }
}
