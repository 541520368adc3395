use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use thiserror::Error;
use validator::Validate;

/// Load-management errors
#[derive(Debug, Error, PartialEq)]
pub enum LoadError {
    #[error("Unknown load: {0}")]
    UnknownLoad(String),
    #[error("Load {0} is not deferrable")]
    NotDeferrable(String),
    #[error("Duplicate load id: {0}")]
    DuplicateId(String),
    #[error("Invalid load configuration: {0}")]
    InvalidConfig(String),
}

/// Load priority, most important first.
///
/// The derived ordering follows declaration order, so `Critical < NonEssential`.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LoadPriority {
    /// Refrigeration, medical, communications backbone
    Critical,
    High,
    #[default]
    Medium,
    Low,
    NonEssential,
}

/// Control state of a managed load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum LoadState {
    Off,
    #[default]
    On,
    Shed,
    Deferred,
    Fault,
}

/// A controllable load as configured
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LoadDefinition {
    #[validate(length(min = 1))]
    pub id: String,
    #[validate(range(min = 0.0))]
    pub rated_power_w: f64,
    #[serde(default)]
    pub priority: LoadPriority,
    #[serde(default)]
    pub deferrable: bool,
    #[serde(default)]
    pub sheddable: bool,
    #[serde(default)]
    #[validate(range(min = 0.0))]
    pub min_on_time_s: f64,
    #[serde(default)]
    #[validate(range(min = 0.0))]
    pub min_off_time_s: f64,
}

impl LoadDefinition {
    pub fn new(id: impl Into<String>, rated_power_w: f64, priority: LoadPriority) -> Self {
        Self {
            id: id.into(),
            rated_power_w,
            priority,
            deferrable: false,
            sheddable: priority != LoadPriority::Critical,
            min_on_time_s: 0.0,
            min_off_time_s: 0.0,
        }
    }

    pub fn deferrable(mut self) -> Self {
        self.deferrable = true;
        self
    }

    pub fn with_min_times(mut self, min_on_time_s: f64, min_off_time_s: f64) -> Self {
        self.min_on_time_s = min_on_time_s;
        self.min_off_time_s = min_off_time_s;
        self
    }

    /// Critical loads stay on whatever the configuration says
    pub fn can_ever_shed(&self) -> bool {
        self.sheddable && self.priority != LoadPriority::Critical
    }
}

/// Power drawn by loads that are currently on
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadPowerSummary {
    pub total_w: f64,
    pub critical_w: f64,
    pub deferrable_w: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(LoadPriority::Critical < LoadPriority::High);
        assert!(LoadPriority::Low < LoadPriority::NonEssential);
        assert_eq!(
            "non_essential".parse::<LoadPriority>().unwrap(),
            LoadPriority::NonEssential
        );
    }

    #[test]
    fn test_critical_is_never_sheddable() {
        let mut fridge = LoadDefinition::new("fridge", 150.0, LoadPriority::Critical);
        fridge.sheddable = true;
        assert!(!fridge.can_ever_shed());

        let pump = LoadDefinition::new("pool_pump", 800.0, LoadPriority::NonEssential);
        assert!(pump.can_ever_shed());
    }
}
