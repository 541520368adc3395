use anyhow::Result;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::domain::{Chemistry, LoadDefinition, MpptAlgorithm, PvString};

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub controller: ControllerConfig,
    #[validate(nested)]
    pub battery: BatteryConfig,
    #[validate(nested)]
    pub pv: PvConfig,
    #[validate(nested)]
    pub loads: LoadsConfig,
    #[validate(nested)]
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ControllerConfig {
    #[validate(range(min = 1))]
    pub tick_seconds: u64,
    #[validate(range(min = 0.0))]
    pub max_grid_import_w: f64,
    #[validate(range(min = 0.0))]
    pub max_grid_export_w: f64,
    /// Emit the full status dump every N ticks (0 disables it)
    pub status_every_ticks: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 1,
            max_grid_import_w: 10_000.0,
            max_grid_export_w: 5_000.0,
            status_every_ticks: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BatteryConfig {
    pub chemistry: Chemistry,
    #[validate(length(min = 1), nested)]
    pub banks: Vec<BankConfig>,
    #[validate(nested)]
    pub tuning: BatteryTuning,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            chemistry: Chemistry::Lfp,
            banks: vec![BankConfig::default()],
            tuning: BatteryTuning::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BankConfig {
    #[validate(length(min = 1))]
    pub id: String,
    #[validate(range(exclusive_min = 0.0))]
    pub nominal_voltage: f64,
    pub cells_in_series: u32,
    #[validate(range(min = 1))]
    pub parallel_strings: u32,
    #[validate(range(exclusive_min = 0.0))]
    pub capacity_wh: f64,
    #[validate(range(min = 0.0))]
    pub max_charge_power_w: f64,
    #[validate(range(min = 0.0))]
    pub max_discharge_power_w: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub health_percent: f64,
}

impl Default for BankConfig {
    fn default() -> Self {
        Self {
            id: "BANK_1".to_string(),
            nominal_voltage: 48.0,
            cells_in_series: 16,
            parallel_strings: 1,
            capacity_wh: 10_000.0,
            max_charge_power_w: 5_000.0,
            max_discharge_power_w: 5_000.0,
            health_percent: 100.0,
        }
    }
}

/// Estimator and charge-control tunables
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_soc_thresholds"))]
pub struct BatteryTuning {
    #[validate(range(min = 0.0, max = 1.0))]
    pub soc_voltage_weight: f64,
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    pub smoothing_alpha: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub min_operating_soc: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub max_operating_soc: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub bulk_charge_soc_limit: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub absorption_charge_soc_limit: f64,
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    pub coulomb_efficiency: f64,
    #[validate(range(min = 0.0, max = 10.0))]
    pub self_discharge_rate_pct_per_day: f64,
    #[validate(range(exclusive_min = 0.0))]
    pub absorption_duration_s: f64,
    #[validate(range(exclusive_min = 0.0))]
    pub equalize_duration_s: f64,
    #[validate(range(exclusive_min = 0.0))]
    pub max_charge_current_a: f64,
    #[validate(range(exclusive_min = 0.0))]
    pub max_discharge_current_a: f64,
    #[validate(range(min = 0.0))]
    pub fault_cooldown_s: f64,
    #[validate(range(exclusive_min = 0.0))]
    pub control_interval_s: f64,
}

impl Default for BatteryTuning {
    fn default() -> Self {
        Self {
            soc_voltage_weight: 0.3,
            smoothing_alpha: 0.1,
            min_operating_soc: 20.0,
            max_operating_soc: 98.0,
            bulk_charge_soc_limit: 85.0,
            absorption_charge_soc_limit: 95.0,
            coulomb_efficiency: 0.98,
            self_discharge_rate_pct_per_day: 0.1,
            absorption_duration_s: 7200.0,
            equalize_duration_s: 3600.0,
            max_charge_current_a: 100.0,
            max_discharge_current_a: 100.0,
            fault_cooldown_s: 300.0,
            control_interval_s: 1.0,
        }
    }
}

fn validate_soc_thresholds(tuning: &BatteryTuning) -> Result<(), ValidationError> {
    if tuning.min_operating_soc >= tuning.max_operating_soc {
        return Err(ValidationError::new("min_operating_soc_above_max"));
    }
    if tuning.bulk_charge_soc_limit > tuning.absorption_charge_soc_limit {
        return Err(ValidationError::new("bulk_limit_above_absorption_limit"));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PvConfig {
    pub algorithm: MpptAlgorithm,
    #[validate(range(exclusive_min = 0.0))]
    pub step_size_v: f64,
    #[validate(nested)]
    pub strings: Vec<PvString>,
    #[validate(range(min = 0.0, max = 100.0))]
    pub curtail_start_soc: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub curtail_max_percent: f64,
}

impl Default for PvConfig {
    fn default() -> Self {
        Self {
            algorithm: MpptAlgorithm::PerturbObserve,
            step_size_v: 0.5,
            strings: vec![
                PvString::new("PV_STRING_1", 5_000.0, 600.0, 10.0),
                PvString::new("PV_STRING_2", 5_000.0, 600.0, 10.0),
            ],
            curtail_start_soc: 90.0,
            curtail_max_percent: 50.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoadsConfig {
    #[validate(nested)]
    pub definitions: Vec<LoadDefinition>,
    #[validate(range(min = 0.0))]
    pub min_shed_duration_s: f64,
    #[validate(range(exclusive_min = 0.0))]
    pub rotation_interval_s: f64,
    #[validate(range(min = 0.0))]
    pub shed_deficit_threshold_w: f64,
    #[validate(range(min = 1.0, max = 3.0))]
    pub shed_margin: f64,
    #[validate(range(min = 0.0))]
    pub restore_surplus_w: f64,
}

impl Default for LoadsConfig {
    fn default() -> Self {
        Self {
            definitions: Vec::new(),
            min_shed_duration_s: 60.0,
            rotation_interval_s: 300.0,
            shed_deficit_threshold_w: 100.0,
            shed_margin: 1.2,
            restore_surplus_w: 200.0,
        }
    }
}

/// Parameters of the built-in simulated plant
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SimulationConfig {
    #[validate(range(min = 0.0, max = 100.0))]
    pub initial_soc_percent: f64,
    pub ambient_temp_c: f64,
    #[validate(range(min = 0.0))]
    pub pv_peak_w: f64,
    #[validate(range(min = 0.0))]
    pub base_load_w: f64,
    /// Relative sensor noise amplitude
    #[validate(range(min = 0.0, max = 0.5))]
    pub noise: f64,
    #[validate(range(min = 10))]
    pub poll_interval_ms: u64,
    /// Seconds of every simulated minute with the grid down (0 keeps it up)
    #[validate(range(max = 60))]
    pub grid_outage_s: u64,
    /// Fixed RNG seed for reproducible runs
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            initial_soc_percent: 60.0,
            ambient_temp_c: 25.0,
            pv_peak_w: 8_000.0,
            base_load_w: 1_200.0,
            noise: 0.01,
            poll_interval_ms: 500,
            grid_outage_s: 0,
            seed: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("HEC__").split("__"));
        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Config = Figment::new().merge(Toml::string(toml)).extract()?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LoadPriority;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.battery.tuning.max_operating_soc, 98.0);
        assert_eq!(config.battery.banks.len(), 1);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [battery]
            chemistry = "nmc"

            [battery.tuning]
            smoothing_alpha = 0.2

            [[loads.definitions]]
            id = "pool_pump"
            rated_power_w = 800.0
            priority = "non_essential"
            sheddable = true
            "#,
        )
        .unwrap();

        assert_eq!(config.battery.chemistry, Chemistry::Nmc);
        assert_eq!(config.battery.tuning.smoothing_alpha, 0.2);
        assert_eq!(config.battery.tuning.bulk_charge_soc_limit, 85.0);
        assert_eq!(config.loads.definitions.len(), 1);
        assert_eq!(
            config.loads.definitions[0].priority,
            LoadPriority::NonEssential
        );
        assert_eq!(config.pv.strings.len(), 2);
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let result = Config::from_toml_str(
            r#"
            [battery.tuning]
            bulk_charge_soc_limit = 97.0
            absorption_charge_soc_limit = 90.0
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_empty_bank_list() {
        let mut config = Config::default();
        config.battery.banks.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_weight() {
        let result = Config::from_toml_str(
            r#"
            [battery.tuning]
            soc_voltage_weight = 1.5
            "#,
        );
        assert!(result.is_err());
    }
}
