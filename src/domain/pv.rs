use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;
use validator::Validate;

/// PV-specific errors
#[derive(Debug, Error, PartialEq)]
pub enum PvError {
    #[error("Invalid PV configuration: {0}")]
    InvalidConfig(String),
    #[error("No enabled PV strings")]
    NoStrings,
}

/// PV subsystem state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum PvState {
    #[default]
    Off,
    Starting,
    Mppt,
    Curtailed,
    Fault,
    Maintenance,
}

/// Maximum power point tracking algorithm
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum MpptAlgorithm {
    Off,
    #[default]
    PerturbObserve,
    IncrementalConductance,
    ConstantVoltage,
}

/// Why a string was taken offline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum PvFaultKind {
    #[strum(to_string = "Overvoltage fault")]
    Overvoltage,
    #[strum(to_string = "Overcurrent fault")]
    Overcurrent,
    #[strum(to_string = "Voltage imbalance")]
    VoltageImbalance,
}

fn default_true() -> bool {
    true
}

fn default_efficiency() -> f64 {
    98.5
}

/// One PV string as installed
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PvString {
    pub id: String,
    #[validate(range(min = 0.0))]
    pub max_power_w: f64,
    #[validate(range(exclusive_min = 0.0))]
    pub max_voltage: f64,
    #[validate(range(exclusive_min = 0.0))]
    pub max_current: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_efficiency")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub efficiency_percent: f64,
    #[serde(skip)]
    pub fault: Option<PvFaultKind>,
}

impl PvString {
    pub fn new(id: impl Into<String>, max_power_w: f64, max_voltage: f64, max_current: f64) -> Self {
        Self {
            id: id.into(),
            max_power_w,
            max_voltage,
            max_current,
            enabled: true,
            efficiency_percent: default_efficiency(),
            fault: None,
        }
    }

    /// Enabled and not faulted
    pub fn is_producing(&self) -> bool {
        self.enabled && self.fault.is_none()
    }
}
