//! # Cell chemistry
//!
//! Every chemistry-specific constant lives here: the open-circuit-voltage
//! curve used for voltage-based SOC estimation and the per-cell voltage
//! protection limits. Callers ask the [`Chemistry`] value instead of matching
//! on it themselves.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// One breakpoint of an OCV curve: resting cell voltage and the SOC it maps to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OcvPoint {
    pub voltage: f64,
    pub soc_percent: f64,
}

const fn pt(voltage: f64, soc_percent: f64) -> OcvPoint {
    OcvPoint { voltage, soc_percent }
}

const LFP_OCV: [OcvPoint; 9] = [
    pt(2.80, 0.0),
    pt(3.00, 2.0),
    pt(3.10, 10.0),
    pt(3.20, 30.0),
    pt(3.25, 50.0),
    pt(3.30, 70.0),
    pt(3.35, 85.0),
    pt(3.40, 95.0),
    pt(3.45, 100.0),
];

const NMC_OCV: [OcvPoint; 8] = [
    pt(3.00, 0.0),
    pt(3.40, 10.0),
    pt(3.60, 30.0),
    pt(3.70, 50.0),
    pt(3.85, 70.0),
    pt(4.00, 85.0),
    pt(4.10, 95.0),
    pt(4.20, 100.0),
];

const LEAD_ACID_OCV: [OcvPoint; 6] = [
    pt(1.75, 0.0),
    pt(1.95, 20.0),
    pt(2.05, 50.0),
    pt(2.15, 80.0),
    pt(2.25, 95.0),
    pt(2.35, 100.0),
];

/// Per-cell protection thresholds (V)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellVoltageLimits {
    pub max_cell_v: f64,
    pub min_cell_v: f64,
}

/// Battery chemistry type
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Chemistry {
    /// Lithium iron phosphate
    #[default]
    #[serde(alias = "lifepo4")]
    #[strum(to_string = "lfp", serialize = "lifepo4")]
    Lfp,
    /// Nickel manganese cobalt
    Nmc,
    /// Flooded / AGM lead acid
    #[serde(alias = "lead-acid")]
    LeadAcid,
}

impl Chemistry {
    pub fn ocv_table(&self) -> &'static [OcvPoint] {
        match self {
            Chemistry::Lfp => &LFP_OCV,
            Chemistry::Nmc => &NMC_OCV,
            Chemistry::LeadAcid => &LEAD_ACID_OCV,
        }
    }

    pub fn cell_limits(&self) -> CellVoltageLimits {
        match self {
            Chemistry::Lfp => CellVoltageLimits { max_cell_v: 3.65, min_cell_v: 2.5 },
            Chemistry::Nmc => CellVoltageLimits { max_cell_v: 4.2, min_cell_v: 3.0 },
            Chemistry::LeadAcid => CellVoltageLimits { max_cell_v: 2.45, min_cell_v: 1.75 },
        }
    }

    /// Range of cell voltages that can come from a working sensor. Readings
    /// outside it are treated as sensor faults, not as battery state.
    pub fn plausible_cell_range(&self) -> (f64, f64) {
        let limits = self.cell_limits();
        (limits.min_cell_v * 0.5, limits.max_cell_v * 1.25)
    }

    /// Only flooded lead acid benefits from a controlled overcharge.
    pub fn supports_equalization(&self) -> bool {
        matches!(self, Chemistry::LeadAcid)
    }

    /// Map a resting cell voltage to SOC (%) by piecewise-linear interpolation
    /// over this chemistry's OCV curve, clamping outside the table.
    pub fn ocv_to_soc(&self, cell_voltage: f64) -> f64 {
        let table = self.ocv_table();
        let first = table[0];
        let last = table[table.len() - 1];

        if cell_voltage.is_nan() || cell_voltage <= first.voltage {
            return first.soc_percent;
        }
        if cell_voltage >= last.voltage {
            return last.soc_percent;
        }

        for pair in table.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            if cell_voltage < hi.voltage {
                let t = (cell_voltage - lo.voltage) / (hi.voltage - lo.voltage);
                return lo.soc_percent + t * (hi.soc_percent - lo.soc_percent);
            }
        }

        last.soc_percent
    }

    /// Resting cell voltage for a given SOC. Inverse of [`Chemistry::ocv_to_soc`].
    pub fn soc_to_ocv(&self, soc_percent: f64) -> f64 {
        let table = self.ocv_table();
        let soc = if soc_percent.is_nan() {
            0.0
        } else {
            soc_percent.clamp(0.0, 100.0)
        };

        for pair in table.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            if soc <= hi.soc_percent {
                let t = (soc - lo.soc_percent) / (hi.soc_percent - lo.soc_percent);
                return lo.voltage + t * (hi.voltage - lo.voltage);
            }
        }

        table[table.len() - 1].voltage
    }
}

/// Free-function form of [`Chemistry::ocv_to_soc`].
pub fn ocv_to_soc(cell_voltage: f64, chemistry: Chemistry) -> f64 {
    chemistry.ocv_to_soc(cell_voltage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(Chemistry::Lfp, 3.25, 50.0)]
    #[case(Chemistry::Lfp, 3.45, 100.0)]
    #[case(Chemistry::Lfp, 2.80, 0.0)]
    #[case(Chemistry::Nmc, 3.70, 50.0)]
    #[case(Chemistry::Nmc, 4.00, 85.0)]
    #[case(Chemistry::LeadAcid, 2.05, 50.0)]
    #[case(Chemistry::LeadAcid, 2.35, 100.0)]
    fn test_exact_breakpoints(#[case] chem: Chemistry, #[case] v: f64, #[case] soc: f64) {
        assert!((ocv_to_soc(v, chem) - soc).abs() < 1e-9);
    }

    #[rstest]
    #[case(Chemistry::Lfp, 1.0, 0.0)]
    #[case(Chemistry::Lfp, 4.0, 100.0)]
    #[case(Chemistry::Nmc, 2.0, 0.0)]
    #[case(Chemistry::Nmc, 5.0, 100.0)]
    #[case(Chemistry::LeadAcid, 1.0, 0.0)]
    #[case(Chemistry::LeadAcid, 3.0, 100.0)]
    fn test_clamps_outside_table(#[case] chem: Chemistry, #[case] v: f64, #[case] soc: f64) {
        assert_eq!(ocv_to_soc(v, chem), soc);
    }

    #[test]
    fn test_interpolates_between_breakpoints() {
        // Halfway between (3.20, 30) and (3.25, 50)
        let soc = ocv_to_soc(3.225, Chemistry::Lfp);
        assert!((soc - 40.0).abs() < 1e-6);

        // Halfway between (2.15, 80) and (2.25, 95)
        let soc = ocv_to_soc(2.20, Chemistry::LeadAcid);
        assert!((soc - 87.5).abs() < 1e-6);
    }

    #[rstest]
    #[case(Chemistry::Lfp, 40.0)]
    #[case(Chemistry::Nmc, 77.0)]
    #[case(Chemistry::LeadAcid, 12.5)]
    fn test_soc_to_ocv_inverts_curve(#[case] chem: Chemistry, #[case] soc: f64) {
        let v = chem.soc_to_ocv(soc);
        assert!((chem.ocv_to_soc(v) - soc).abs() < 1e-6);
    }

    #[test]
    fn test_nan_voltage_maps_to_empty() {
        assert_eq!(ocv_to_soc(f64::NAN, Chemistry::Nmc), 0.0);
    }

    #[test]
    fn test_tables_are_monotonic() {
        for chem in [Chemistry::Lfp, Chemistry::Nmc, Chemistry::LeadAcid] {
            for pair in chem.ocv_table().windows(2) {
                assert!(pair[0].voltage < pair[1].voltage);
                assert!(pair[0].soc_percent < pair[1].soc_percent);
            }
        }
    }

    #[test]
    fn test_parse_chemistry_names() {
        assert_eq!("lfp".parse::<Chemistry>().unwrap(), Chemistry::Lfp);
        assert_eq!("LiFePO4".parse::<Chemistry>().unwrap(), Chemistry::Lfp);
        assert_eq!("NMC".parse::<Chemistry>().unwrap(), Chemistry::Nmc);
        assert_eq!("lead_acid".parse::<Chemistry>().unwrap(), Chemistry::LeadAcid);
        assert_eq!(Chemistry::LeadAcid.to_string(), "lead_acid");
    }

    #[test]
    fn test_only_lead_acid_equalizes() {
        assert!(Chemistry::LeadAcid.supports_equalization());
        assert!(!Chemistry::Lfp.supports_equalization());
        assert!(!Chemistry::Nmc.supports_equalization());
    }

    fn any_chemistry() -> impl Strategy<Value = Chemistry> {
        prop_oneof![
            Just(Chemistry::Lfp),
            Just(Chemistry::Nmc),
            Just(Chemistry::LeadAcid)
        ]
    }

    proptest! {
        #[test]
        fn prop_ocv_is_monotonic(chem in any_chemistry(), a in 0.0f64..5.0, b in 0.0f64..5.0) {
            let (lo, hi) = if a < b { (a, b) } else { (b, a) };
            prop_assert!(ocv_to_soc(lo, chem) <= ocv_to_soc(hi, chem));
        }

        #[test]
        fn prop_ocv_is_pure_and_bounded(chem in any_chemistry(), v in -1.0f64..6.0) {
            let first = ocv_to_soc(v, chem);
            let second = ocv_to_soc(v, chem);
            prop_assert_eq!(first, second);
            prop_assert!((0.0..=100.0).contains(&first));
        }
    }
}
