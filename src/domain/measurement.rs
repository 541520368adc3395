use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

use super::battery::BatteryError;
use super::chemistry::Chemistry;

/// Used when a bank has no series cell count configured.
pub const DEFAULT_CELLS_IN_SERIES: u32 = 16;

/// Battery readings supplied once per cycle by the hardware layer.
///
/// Current sign convention: positive = discharge, negative = charge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Measurement {
    pub battery_voltage: f64,
    pub battery_current: f64,
    pub battery_temp: f64,
    /// SOC reported by the pack BMS, used only to seed the estimator on cold start
    pub battery_soc: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl Default for Measurement {
    fn default() -> Self {
        Self {
            battery_voltage: 52.0,
            battery_current: 0.0,
            battery_temp: 25.0,
            battery_soc: None,
            timestamp: Utc::now(),
        }
    }
}

impl Measurement {
    pub fn cell_voltage(&self, cells_in_series: u32) -> f64 {
        let cells = if cells_in_series == 0 {
            DEFAULT_CELLS_IN_SERIES
        } else {
            cells_in_series
        };
        self.battery_voltage / cells as f64
    }

    /// Reject voltage readings that no working sensor on this chemistry produces.
    pub fn check_voltage(&self, chemistry: Chemistry, cells_in_series: u32) -> Result<(), BatteryError> {
        let cell_v = self.cell_voltage(cells_in_series);
        let (lo, hi) = chemistry.plausible_cell_range();
        if !cell_v.is_finite() || cell_v < lo || cell_v > hi {
            return Err(BatteryError::SensorOutOfRange {
                quantity: "battery_voltage",
                value: self.battery_voltage,
            });
        }
        Ok(())
    }

    pub fn check_current(&self) -> Result<(), BatteryError> {
        if !self.battery_current.is_finite() {
            return Err(BatteryError::SensorOutOfRange {
                quantity: "battery_current",
                value: self.battery_current,
            });
        }
        Ok(())
    }

    pub fn check_temperature(&self) -> Result<(), BatteryError> {
        if !self.battery_temp.is_finite() || !(-40.0..=120.0).contains(&self.battery_temp) {
            return Err(BatteryError::SensorOutOfRange {
                quantity: "battery_temp",
                value: self.battery_temp,
            });
        }
        Ok(())
    }
}

/// Per-string PV readings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PvMeasurement {
    pub string_voltage: Vec<f64>,
    pub string_current: Vec<f64>,
}

impl PvMeasurement {
    pub fn voltage(&self, index: usize) -> f64 {
        self.string_voltage.get(index).copied().unwrap_or(0.0)
    }

    pub fn current(&self, index: usize) -> f64 {
        self.string_current.get(index).copied().unwrap_or(0.0)
    }
}

/// Everything the control loop reads at the start of a cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMeasurement {
    pub battery: Measurement,
    pub pv: PvMeasurement,
    pub grid_available: bool,
    /// Grid power (W), positive = import
    pub grid_power_w: f64,
    /// Consumption outside the managed load table (irrigation, EV charging)
    pub other_load_w: f64,
}

impl Default for SystemMeasurement {
    fn default() -> Self {
        Self {
            battery: Measurement::default(),
            pv: PvMeasurement::default(),
            grid_available: true,
            grid_power_w: 0.0,
            other_load_w: 0.0,
        }
    }
}

/// System-wide operating mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SystemMode {
    #[default]
    Normal,
    Island,
    Critical,
    Maintenance,
    Emergency,
}

/// Commands handed to the hardware layer at the end of a cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlCommands {
    pub battery_charge_power_w: f64,
    pub battery_discharge_power_w: f64,
    /// Signed battery setpoint (W), positive = discharge
    pub battery_setpoint_w: f64,
    pub pv_curtail: bool,
    pub pv_curtail_percent: f64,
    /// MPPT voltage reference for the reference string (V)
    pub pv_voltage_ref: f64,
    /// Shed flag per managed load, in configuration order
    pub load_shed: Vec<bool>,
    pub grid_connect: bool,
    pub island: bool,
}
