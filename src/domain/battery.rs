use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;

use super::chemistry::Chemistry;

/// Battery-specific errors
#[derive(Debug, Error, PartialEq)]
pub enum BatteryError {
    #[error("Invalid battery configuration: {0}")]
    InvalidConfig(String),
    #[error("Sensor reading out of range: {quantity} = {value}")]
    SensorOutOfRange { quantity: &'static str, value: f64 },
    #[error("Battery is not in fault state")]
    NotInFault,
    #[error("Battery in fault state: {0}")]
    Fault(String),
    #[error("Equalization not supported for {0}")]
    EqualizationUnsupported(Chemistry),
    #[error("SOC {soc:.1}% below required {required:.1}%")]
    SocTooLow { soc: f64, required: f64 },
    #[error("Battery is not in maintenance")]
    NotInMaintenance,
}

/// Battery health status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Warning,
    Critical,
    Offline,
}

impl HealthStatus {
    pub fn from_health_percent(health_percent: f64) -> Self {
        if health_percent >= 90.0 {
            HealthStatus::Healthy
        } else if health_percent >= 70.0 {
            HealthStatus::Degraded
        } else if health_percent >= 50.0 {
            HealthStatus::Warning
        } else if health_percent > 0.0 {
            HealthStatus::Critical
        } else {
            HealthStatus::Offline
        }
    }
}

/// Battery operational state
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BatteryState {
    #[default]
    Idle,
    Charging,
    Discharging,
    Float,
    Equalize,
    Fault,
    Maintenance,
}

impl BatteryState {
    /// Charging, Float and Equalize all put energy into the pack and exclude Discharging.
    pub fn is_charging(&self) -> bool {
        matches!(
            self,
            BatteryState::Charging | BatteryState::Float | BatteryState::Equalize
        )
    }

    /// States in which charge/discharge decisions are suspended.
    pub fn is_locked_out(&self) -> bool {
        matches!(self, BatteryState::Fault | BatteryState::Maintenance)
    }
}

impl std::str::FromStr for BatteryState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(BatteryState::Idle),
            "charging" => Ok(BatteryState::Charging),
            "discharging" => Ok(BatteryState::Discharging),
            "float" => Ok(BatteryState::Float),
            "equalize" => Ok(BatteryState::Equalize),
            "fault" => Ok(BatteryState::Fault),
            "maintenance" => Ok(BatteryState::Maintenance),
            _ => Err(format!("Unknown battery state: {}", s)),
        }
    }
}

impl std::fmt::Display for BatteryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatteryState::Idle => write!(f, "idle"),
            BatteryState::Charging => write!(f, "charging"),
            BatteryState::Discharging => write!(f, "discharging"),
            BatteryState::Float => write!(f, "float"),
            BatteryState::Equalize => write!(f, "equalize"),
            BatteryState::Fault => write!(f, "fault"),
            BatteryState::Maintenance => write!(f, "maintenance"),
        }
    }
}

/// Stage of the multi-stage charge profile
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ChargeStage {
    #[default]
    Bulk,
    Absorption,
    Float,
    Equalize,
}

impl ChargeStage {
    /// Top-level state that corresponds to charging in this stage
    pub fn battery_state(&self) -> BatteryState {
        match self {
            ChargeStage::Bulk | ChargeStage::Absorption => BatteryState::Charging,
            ChargeStage::Float => BatteryState::Float,
            ChargeStage::Equalize => BatteryState::Equalize,
        }
    }
}

/// Latched protection flags
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FaultFlags {
    pub overvoltage: bool,
    pub undervoltage: bool,
    pub overcurrent: bool,
    pub overtemperature: bool,
}

impl FaultFlags {
    pub fn any(&self) -> bool {
        self.overvoltage || self.undervoltage || self.overcurrent || self.overtemperature
    }
}

/// One physical battery pack
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryBank {
    pub id: String,
    pub nominal_voltage: f64,
    pub cells_in_series: u32,
    pub parallel_strings: u32,
    pub capacity_wh: f64,
    pub max_charge_power_w: f64,
    pub max_discharge_power_w: f64,
    pub cycle_count: u32,
    pub last_full_charge: Option<DateTime<Utc>>,
    pub health_percent: f64,
    pub temperature_c: f64,
    pub soc_percent: f64,
}

/// Read-only status snapshot for the API/status consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryStatusReport {
    pub chemistry: Chemistry,
    pub state: BatteryState,
    pub previous_state: BatteryState,
    pub charge_stage: ChargeStage,
    pub stage_elapsed_s: f64,
    pub soc_percent: f64,
    pub soc_estimated_percent: f64,
    pub soc_coulomb_percent: f64,
    pub soc_voltage_percent: f64,
    pub capacity_nominal_wh: f64,
    pub capacity_remaining_wh: f64,
    pub health_percent: f64,
    pub health_status: HealthStatus,
    pub temperature_c: f64,
    pub cooling_active: bool,
    pub heating_active: bool,
    pub charge_power_w: f64,
    pub discharge_power_w: f64,
    pub max_charge_power_w: f64,
    pub max_discharge_power_w: f64,
    pub total_charge_wh: f64,
    pub total_discharge_wh: f64,
    pub active_banks: usize,
    pub faults: FaultFlags,
    pub last_fault_reason: Option<String>,
    pub fault_timestamp: Option<DateTime<Utc>>,
    pub fault_clear_attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_strings() {
        for state in [
            BatteryState::Idle,
            BatteryState::Charging,
            BatteryState::Discharging,
            BatteryState::Float,
            BatteryState::Equalize,
            BatteryState::Fault,
            BatteryState::Maintenance,
        ] {
            assert_eq!(state.to_string().parse::<BatteryState>(), Ok(state));
        }
        assert!("bogus".parse::<BatteryState>().is_err());
    }

    #[test]
    fn test_stage_maps_to_state_family() {
        assert_eq!(ChargeStage::Bulk.battery_state(), BatteryState::Charging);
        assert_eq!(ChargeStage::Absorption.battery_state(), BatteryState::Charging);
        assert_eq!(ChargeStage::Float.battery_state(), BatteryState::Float);
        assert_eq!(ChargeStage::Equalize.battery_state(), BatteryState::Equalize);
        assert!(BatteryState::Float.is_charging());
        assert!(!BatteryState::Discharging.is_charging());
    }

    #[test]
    fn test_fault_flags_any() {
        let mut flags = FaultFlags::default();
        assert!(!flags.any());
        flags.overcurrent = true;
        assert!(flags.any());
    }

    #[test]
    fn test_health_status_bands() {
        assert_eq!(HealthStatus::from_health_percent(95.0), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_health_percent(75.0), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_health_percent(55.0), HealthStatus::Warning);
        assert_eq!(HealthStatus::from_health_percent(10.0), HealthStatus::Critical);
        assert_eq!(HealthStatus::from_health_percent(0.0), HealthStatus::Offline);
    }
}
