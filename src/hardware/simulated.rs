//! Simulated PV/battery/load plant for development without hardware.
//!
//! A poller task steps the plant physics at `poll_interval_ms` and publishes
//! each snapshot through the watch channel. Commands from the control loop
//! feed back into the next physics step.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{Local, Timelike};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::snapshot::{snapshot_channel, SnapshotReader, SnapshotWriter};
use super::MeasurementSource;
use crate::config::Config;
use crate::domain::{
    Chemistry, ControlCommands, Measurement, PvMeasurement, SystemMeasurement,
};

/// Fraction of open-circuit voltage where the string sits at its power point
const MPP_VOLTAGE_RATIO: f64 = 0.78;
const INTERNAL_RESISTANCE_OHM: f64 = 0.01;
const TEMP_RISE_PER_KW: f64 = 2.0;
const TEMP_SLEW_C_PER_S: f64 = 0.05;

/// Clear-sky irradiance fraction for a local clock hour (0..24)
pub fn solar_irradiance(hour: f64) -> f64 {
    if !(6.0..=18.0).contains(&hour) {
        return 0.0;
    }
    (PI * (hour - 6.0) / 12.0).sin().max(0.0)
}

#[derive(Debug, Clone)]
pub struct PlantPhysics {
    chemistry: Chemistry,
    cells_in_series: u32,
    capacity_ah: f64,
    soc_percent: f64,
    temperature_c: f64,
    ambient_c: f64,
    pv_peak_w: f64,
    base_load_w: f64,
    noise: f64,
    string_max_voltage: Vec<f64>,
    grid_outage_s: u64,
    elapsed_s: f64,

    setpoint_w: f64,
    curtail_percent: f64,
}

impl PlantPhysics {
    pub fn new(config: &Config) -> Result<Self> {
        let banks = &config.battery.banks;
        let capacity_ah: f64 = banks
            .iter()
            .map(|b| b.capacity_wh / b.nominal_voltage)
            .sum();
        if capacity_ah.is_nan() || capacity_ah <= 0.0 {
            bail!("simulated plant needs a battery bank with capacity");
        }
        let sim = &config.simulation;

        Ok(Self {
            chemistry: config.battery.chemistry,
            cells_in_series: banks.first().map(|b| b.cells_in_series).unwrap_or(16).max(1),
            capacity_ah,
            soc_percent: sim.initial_soc_percent,
            temperature_c: sim.ambient_temp_c,
            ambient_c: sim.ambient_temp_c,
            pv_peak_w: sim.pv_peak_w,
            base_load_w: sim.base_load_w,
            noise: sim.noise,
            string_max_voltage: config.pv.strings.iter().map(|s| s.max_voltage).collect(),
            grid_outage_s: sim.grid_outage_s,
            elapsed_s: 0.0,
            setpoint_w: 0.0,
            curtail_percent: 0.0,
        })
    }

    pub fn apply(&mut self, commands: &ControlCommands) {
        self.setpoint_w = commands.battery_setpoint_w;
        self.curtail_percent = if commands.pv_curtail {
            commands.pv_curtail_percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
    }

    fn jitter<R: Rng>(&self, rng: &mut R) -> f64 {
        if self.noise > 0.0 {
            1.0 + rng.gen_range(-self.noise..=self.noise)
        } else {
            1.0
        }
    }

    pub fn grid_available(&self) -> bool {
        self.grid_outage_s == 0 || (self.elapsed_s as u64 % 60) >= self.grid_outage_s
    }

    pub fn soc_percent(&self) -> f64 {
        self.soc_percent
    }

    /// Advance the plant by `dt_s` seconds and produce the resulting readings.
    pub fn step<R: Rng>(&mut self, dt_s: f64, irradiance: f64, rng: &mut R) -> SystemMeasurement {
        self.elapsed_s += dt_s;
        let cells = f64::from(self.cells_in_series);

        let pack_ocv = self.chemistry.soc_to_ocv(self.soc_percent) * cells;
        // Positive current discharges
        let current = if pack_ocv > 0.0 { self.setpoint_w / pack_ocv } else { 0.0 };
        self.soc_percent -= current * dt_s / 3600.0 / self.capacity_ah * 100.0;
        self.soc_percent = self.soc_percent.clamp(0.0, 100.0);
        let voltage = self.chemistry.soc_to_ocv(self.soc_percent) * cells
            - current * INTERNAL_RESISTANCE_OHM;

        let target_temp = self.ambient_c + self.setpoint_w.abs() / 1000.0 * TEMP_RISE_PER_KW;
        let slew = TEMP_SLEW_C_PER_S * dt_s;
        self.temperature_c += (target_temp - self.temperature_c).clamp(-slew, slew);

        let pv_total = self.pv_peak_w
            * irradiance.clamp(0.0, 1.0)
            * (1.0 - self.curtail_percent / 100.0)
            * self.jitter(rng);
        let strings = self.string_max_voltage.len().max(1) as f64;
        let mut pv = PvMeasurement::default();
        for &max_v in &self.string_max_voltage {
            let v = if pv_total > 0.0 {
                max_v * MPP_VOLTAGE_RATIO * self.jitter(rng)
            } else {
                0.0
            };
            let a = if v > 0.0 { pv_total / strings / v } else { 0.0 };
            pv.string_voltage.push(v);
            pv.string_current.push(a);
        }

        let other_load_w = self.base_load_w * self.jitter(rng);
        let grid_available = self.grid_available();
        let grid_power_w = if grid_available {
            other_load_w - pv_total - self.setpoint_w
        } else {
            0.0
        };

        SystemMeasurement {
            battery: Measurement {
                battery_voltage: voltage * self.jitter(rng),
                battery_current: current,
                battery_temp: self.temperature_c,
                battery_soc: Some(self.soc_percent),
                timestamp: chrono::Utc::now(),
            },
            pv,
            grid_available,
            grid_power_w,
            other_load_w,
        }
    }
}

/// The simulated plant as seen by the control loop
pub struct SimulatedPlant {
    physics: Arc<Mutex<PlantPhysics>>,
    reader: SnapshotReader,
}

impl SimulatedPlant {
    /// Build the plant and start its poller task.
    pub fn spawn(config: &Config) -> Result<(Self, JoinHandle<()>)> {
        let physics = Arc::new(Mutex::new(PlantPhysics::new(config)?));
        let mut rng = match config.simulation.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let (writer, reader) = snapshot_channel();
        writer.publish(physics.lock().step(0.0, irradiance_now(), &mut rng));

        let period = Duration::from_millis(config.simulation.poll_interval_ms.max(10));
        let handle = tokio::spawn(poll_loop(physics.clone(), writer, rng, period));
        info!(poll_ms = period.as_millis() as u64, "simulated plant started");

        Ok((Self { physics, reader }, handle))
    }

    pub fn soc_percent(&self) -> f64 {
        self.physics.lock().soc_percent()
    }
}

fn irradiance_now() -> f64 {
    let now = Local::now();
    solar_irradiance(f64::from(now.hour()) + f64::from(now.minute()) / 60.0)
}

async fn poll_loop(
    physics: Arc<Mutex<PlantPhysics>>,
    writer: SnapshotWriter,
    mut rng: StdRng,
    period: Duration,
) {
    let mut interval = tokio::time::interval(period);
    let dt = period.as_secs_f64();
    loop {
        interval.tick().await;
        if writer.reader_closed() {
            debug!("snapshot reader gone, poller stopping");
            break;
        }
        let snapshot = physics.lock().step(dt, irradiance_now(), &mut rng);
        writer.publish(snapshot);
    }
}

#[async_trait]
impl MeasurementSource for SimulatedPlant {
    async fn read(&self) -> Result<SystemMeasurement> {
        self.reader.latest()
    }

    async fn apply(&self, commands: &ControlCommands) -> Result<()> {
        self.physics.lock().apply(commands);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn physics(noise: f64) -> PlantPhysics {
        let mut config = Config::default();
        config.simulation.noise = noise;
        PlantPhysics::new(&config).unwrap()
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[rstest]
    #[case(3.0, 0.0)]
    #[case(6.0, 0.0)]
    #[case(12.0, 1.0)]
    #[case(20.0, 0.0)]
    fn test_solar_irradiance(#[case] hour: f64, #[case] expected: f64) {
        assert!((solar_irradiance(hour) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_discharge_drains_soc() {
        let mut p = physics(0.0);
        let mut rng = rng();
        p.apply(&ControlCommands {
            battery_setpoint_w: 2_000.0,
            ..Default::default()
        });
        let start = p.soc_percent();
        let m = p.step(600.0, 0.0, &mut rng);
        assert!(p.soc_percent() < start);
        assert!(m.battery.battery_current > 0.0);
    }

    #[test]
    fn test_charge_raises_soc() {
        let mut p = physics(0.0);
        let mut rng = rng();
        p.apply(&ControlCommands {
            battery_setpoint_w: -2_000.0,
            ..Default::default()
        });
        let start = p.soc_percent();
        p.step(600.0, 0.5, &mut rng);
        assert!(p.soc_percent() > start);
    }

    #[test]
    fn test_curtailment_cuts_pv() {
        let mut p = physics(0.0);
        let mut rng = rng();
        let full = p.step(1.0, 1.0, &mut rng);
        p.apply(&ControlCommands {
            pv_curtail: true,
            pv_curtail_percent: 50.0,
            ..Default::default()
        });
        let half = p.step(1.0, 1.0, &mut rng);

        let power = |m: &SystemMeasurement| {
            (0..m.pv.string_voltage.len())
                .map(|i| m.pv.voltage(i) * m.pv.current(i))
                .sum::<f64>()
        };
        assert!((power(&full) - 8_000.0).abs() < 1e-6);
        assert!((power(&half) - 4_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_grid_outage_window() {
        let mut config = Config::default();
        config.simulation.grid_outage_s = 20;
        let mut p = PlantPhysics::new(&config).unwrap();
        let mut rng = rng();

        assert!(!p.step(10.0, 0.0, &mut rng).grid_available);
        assert!(p.step(15.0, 0.0, &mut rng).grid_available);
    }

    #[tokio::test]
    async fn test_plant_serves_snapshots() {
        let mut config = Config::default();
        config.simulation.seed = Some(1);
        let (plant, handle) = SimulatedPlant::spawn(&config).unwrap();

        let m = plant.read().await.unwrap();
        assert_eq!(m.battery.battery_soc, Some(60.0));
        plant.apply(&ControlCommands::default()).await.unwrap();

        handle.abort();
    }
}
