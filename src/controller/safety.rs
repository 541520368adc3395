use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::battery_system::BatterySystem;
use super::clock::secs_since;
use crate::domain::{BatteryError, BatteryState};

/// Safety event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SafetyEvent {
    /// Cell voltage above the chemistry maximum
    Overvoltage { cell_voltage: f64, limit_v: f64 },
    /// Cell voltage below the chemistry minimum
    Undervoltage { cell_voltage: f64, limit_v: f64 },
    /// Pack current beyond the configured limit in either direction
    Overcurrent { current_a: f64, limit_a: f64 },
    /// Pack temperature above the trip point
    Overtemperature { temperature_c: f64, limit_c: f64 },
    /// Fault state left after all conditions resolved
    FaultCleared { attempts: u32 },
}

impl SafetyEvent {
    /// Human-readable reason stored in `last_fault_reason`
    pub fn reason(&self) -> &'static str {
        match self {
            SafetyEvent::Overvoltage { .. } => "Overvoltage",
            SafetyEvent::Undervoltage { .. } => "Undervoltage",
            SafetyEvent::Overcurrent { .. } => "Overcurrent",
            SafetyEvent::Overtemperature { .. } => "Overtemperature",
            SafetyEvent::FaultCleared { .. } => "Cleared",
        }
    }
}

pub type SafetyRecord = (DateTime<Utc>, SafetyEvent);

/// Set/clear points of the hysteretic fault detectors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyThresholds {
    /// Overvoltage clears at `max_cell_v * ratio`
    pub overvoltage_clear_ratio: f64,
    /// Undervoltage clears at `min_cell_v * ratio`
    pub undervoltage_clear_ratio: f64,
    pub overcurrent_set_ratio: f64,
    pub overcurrent_clear_ratio: f64,
    pub overtemperature_set_c: f64,
    pub overtemperature_clear_c: f64,
    pub max_event_history: usize,
    /// Clear attempts after which the operator should take over
    pub maintenance_after_attempts: u32,
}

impl Default for SafetyThresholds {
    fn default() -> Self {
        Self {
            overvoltage_clear_ratio: 0.98,
            undervoltage_clear_ratio: 1.04,
            overcurrent_set_ratio: 1.2,
            overcurrent_clear_ratio: 1.1,
            overtemperature_set_c: 60.0,
            overtemperature_clear_c: 55.0,
            max_event_history: 100,
            maintenance_after_attempts: 3,
        }
    }
}

/// A latched flag stays set until its clear condition holds.
fn latch(active: bool, set: bool, clear: bool) -> bool {
    if active {
        !clear
    } else {
        set
    }
}

impl BatterySystem {
    /// Run the four fault detectors. Returns true while any fault is active.
    pub fn check_limits(&mut self) -> bool {
        let limits = self.chemistry.cell_limits();
        let t = self.safety.clone();
        let mut raised = Vec::new();

        if self.voltage.is_finite() {
            let cell_v = self.cell_voltage();

            let ov = latch(
                self.faults.overvoltage,
                cell_v > limits.max_cell_v,
                cell_v <= limits.max_cell_v * t.overvoltage_clear_ratio,
            );
            if ov && !self.faults.overvoltage {
                raised.push(SafetyEvent::Overvoltage {
                    cell_voltage: cell_v,
                    limit_v: limits.max_cell_v,
                });
            }
            self.faults.overvoltage = ov;

            let uv = latch(
                self.faults.undervoltage,
                cell_v < limits.min_cell_v,
                cell_v >= limits.min_cell_v * t.undervoltage_clear_ratio,
            );
            if uv && !self.faults.undervoltage {
                raised.push(SafetyEvent::Undervoltage {
                    cell_voltage: cell_v,
                    limit_v: limits.min_cell_v,
                });
            }
            self.faults.undervoltage = uv;
        }

        if self.current.is_finite() {
            // Positive current discharges
            let charge_a = -self.current;
            let discharge_a = self.current;
            let max_charge = self.tuning.max_charge_current_a;
            let max_discharge = self.tuning.max_discharge_current_a;

            let oc = latch(
                self.faults.overcurrent,
                charge_a > max_charge * t.overcurrent_set_ratio
                    || discharge_a > max_discharge * t.overcurrent_set_ratio,
                charge_a <= max_charge * t.overcurrent_clear_ratio
                    && discharge_a <= max_discharge * t.overcurrent_clear_ratio,
            );
            if oc && !self.faults.overcurrent {
                let limit_a = if charge_a > 0.0 { max_charge } else { max_discharge };
                raised.push(SafetyEvent::Overcurrent {
                    current_a: self.current,
                    limit_a: limit_a * t.overcurrent_set_ratio,
                });
            }
            self.faults.overcurrent = oc;
        }

        if !self.temperature_c.is_nan() {
            let ot = latch(
                self.faults.overtemperature,
                self.temperature_c > t.overtemperature_set_c,
                self.temperature_c <= t.overtemperature_clear_c,
            );
            if ot && !self.faults.overtemperature {
                raised.push(SafetyEvent::Overtemperature {
                    temperature_c: self.temperature_c,
                    limit_c: t.overtemperature_set_c,
                });
            }
            if !ot && self.faults.overtemperature {
                info!(temperature_c = self.temperature_c, "overtemperature condition cleared");
            }
            self.faults.overtemperature = ot;
        }

        for event in raised {
            self.raise_fault(event);
        }

        self.faults.any()
    }

    fn raise_fault(&mut self, event: SafetyEvent) {
        let reason = event.reason();
        error!(
            reason,
            event = ?event,
            soc_percent = self.soc_smoothed,
            state = %self.state,
            "SAFETY FAULT: battery protection tripped"
        );

        self.last_fault_reason = Some(reason.to_string());
        self.fault_timestamp = Some(self.measured_at);
        self.record_event(self.measured_at, event);

        if self.state != BatteryState::Fault {
            self.fault_entered = Some(self.clock.now());
            self.last_clear_attempt = None;
            self.fault_clear_attempts = 0;
            self.zero_outputs();
            self.transition(BatteryState::Fault);
        }
    }

    fn record_event(&mut self, at: DateTime<Utc>, event: SafetyEvent) {
        self.events.push_back((at, event));
        while self.events.len() > self.safety.max_event_history {
            self.events.pop_front();
        }
    }

    /// Attempt to leave Fault. Succeeds only once every flag has resolved.
    ///
    /// Every call counts as an attempt. On success the state before the
    /// fault is restored (Idle if that was itself Fault).
    pub fn clear_faults(&mut self) -> Result<bool, BatteryError> {
        if self.state != BatteryState::Fault {
            return Err(BatteryError::NotInFault);
        }

        self.fault_clear_attempts += 1;
        self.last_clear_attempt = Some(self.clock.now());

        if self.faults.any() {
            warn!(
                attempts = self.fault_clear_attempts,
                faults = ?self.faults,
                "fault clear refused: conditions persist"
            );
            if self.needs_maintenance() {
                warn!(
                    attempts = self.fault_clear_attempts,
                    "battery fault not clearing, maintenance recommended"
                );
            }
            return Ok(false);
        }

        let resume = match self.previous_state {
            BatteryState::Fault => BatteryState::Idle,
            other => other,
        };
        self.fault_entered = None;
        let attempts = self.fault_clear_attempts;
        self.record_event(Utc::now(), SafetyEvent::FaultCleared { attempts });
        self.transition(resume);
        info!(attempts, resumed = %resume, "battery fault cleared");
        Ok(true)
    }

    /// Retry `clear_faults` once the cool-down has passed since entering
    /// Fault and since the previous attempt.
    pub fn try_auto_clear(&mut self) -> bool {
        if self.state != BatteryState::Fault {
            return false;
        }
        let cooldown = self.tuning.fault_cooldown_s;
        let clock = self.clock.as_ref();
        let since_entry = self
            .fault_entered
            .map(|t| secs_since(clock, t))
            .unwrap_or(f64::INFINITY);
        let since_attempt = self
            .last_clear_attempt
            .map(|t| secs_since(clock, t))
            .unwrap_or(f64::INFINITY);

        if since_entry < cooldown || since_attempt < cooldown {
            return false;
        }
        matches!(self.clear_faults(), Ok(true))
    }

    pub fn needs_maintenance(&self) -> bool {
        self.state == BatteryState::Fault
            && self.fault_clear_attempts >= self.safety.maintenance_after_attempts
    }

    /// Most recent safety events, newest last
    pub fn recent_events(&self, count: usize) -> Vec<SafetyRecord> {
        let skip = self.events.len().saturating_sub(count);
        self.events.iter().skip(skip).cloned().collect()
    }

    pub fn clear_event_history(&mut self) {
        self.events.clear();
    }
}
