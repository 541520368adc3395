//! Priority-ordered load shedding for islanded operation.
//!
//! Loads are shed from `NonEssential` upwards until the deficit (plus a
//! margin) is covered, and restored from `High` downwards when the grid
//! returns or a surplus appears. Critical loads are never touched. Every
//! switch honours the load's minimum on/off time, and long shedding
//! periods rotate which loads are off among peers of equal priority.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use strum::IntoEnumIterator;
use tracing::{debug, info};

use super::clock::{secs_since, Clock};
use crate::config::LoadsConfig;
use crate::domain::{LoadDefinition, LoadError, LoadPowerSummary, LoadPriority, LoadState};

#[derive(Debug, Clone)]
struct ManagedLoad {
    def: LoadDefinition,
    state: LoadState,
    last_change: Instant,
}

pub struct LoadManager {
    loads: Vec<ManagedLoad>,
    clock: Arc<dyn Clock>,
    config: LoadsConfig,

    shedding_active: bool,
    shed_target_w: f64,
    rotation_started: Option<Instant>,

    shed_event_count: u32,
    restore_event_count: u32,
    total_energy_wh: f64,
    last_energy_tick: Option<Instant>,
}

impl LoadManager {
    pub fn new(config: &LoadsConfig, clock: Arc<dyn Clock>) -> Result<Self, LoadError> {
        let mut seen = HashSet::new();
        for def in &config.definitions {
            if !seen.insert(def.id.as_str()) {
                return Err(LoadError::DuplicateId(def.id.clone()));
            }
            if def.rated_power_w.is_nan() || def.rated_power_w < 0.0 {
                return Err(LoadError::InvalidConfig(format!(
                    "load {} has negative rated power",
                    def.id
                )));
            }
        }

        let now = clock.now();
        let loads = config
            .definitions
            .iter()
            .map(|def| ManagedLoad {
                def: def.clone(),
                state: LoadState::On,
                last_change: now,
            })
            .collect::<Vec<_>>();

        info!(loads = loads.len(), "load manager initialised");

        Ok(Self {
            loads,
            clock,
            config: config.clone(),
            shedding_active: false,
            shed_target_w: 0.0,
            rotation_started: None,
            shed_event_count: 0,
            restore_event_count: 0,
            total_energy_wh: 0.0,
            last_energy_tick: None,
        })
    }

    /// Power drawn by loads that are on, split by class.
    pub fn update_measurements(&mut self) -> LoadPowerSummary {
        let mut summary = LoadPowerSummary::default();
        for load in self.loads.iter().filter(|l| l.state == LoadState::On) {
            summary.total_w += load.def.rated_power_w;
            if load.def.priority == LoadPriority::Critical {
                summary.critical_w += load.def.rated_power_w;
            }
            if load.def.deferrable {
                summary.deferrable_w += load.def.rated_power_w;
            }
        }

        let now = self.clock.now();
        if let Some(last) = self.last_energy_tick {
            self.total_energy_wh += summary.total_w * secs_since(self.clock.as_ref(), last) / 3600.0;
        }
        self.last_energy_tick = Some(now);

        summary
    }

    fn index_of(&self, id: &str) -> Result<usize, LoadError> {
        self.loads
            .iter()
            .position(|l| l.def.id == id)
            .ok_or_else(|| LoadError::UnknownLoad(id.to_string()))
    }

    /// Minimum on time before switching off, minimum off time before switching on.
    pub fn check_timing_constraints(&self, index: usize) -> bool {
        let Some(load) = self.loads.get(index) else {
            return false;
        };
        let since = secs_since(self.clock.as_ref(), load.last_change);
        if load.state == LoadState::On {
            since >= load.def.min_on_time_s
        } else {
            since >= load.def.min_off_time_s
        }
    }

    pub fn can_shed_load(&self, index: usize) -> bool {
        self.loads.get(index).is_some_and(|load| {
            load.state == LoadState::On
                && load.def.can_ever_shed()
                && self.check_timing_constraints(index)
        })
    }

    fn set_state(&mut self, index: usize, state: LoadState) {
        let now = self.clock.now();
        let load = &mut self.loads[index];
        debug!(load = %load.def.id, from = %load.state, to = %state, "load state change");
        load.state = state;
        load.last_change = now;
    }

    /// Shed or restore loads against the current power balance.
    /// Returns true if any load changed state.
    pub fn manage_shedding(
        &mut self,
        available_power_w: f64,
        total_load_w: f64,
        grid_available: bool,
    ) -> bool {
        if grid_available {
            if self.shedding_active || self.any_shed() {
                return self.restore_shed(f64::INFINITY);
            }
            return false;
        }

        let deficit = total_load_w - available_power_w;
        let mut changed = false;

        if deficit > self.config.shed_deficit_threshold_w {
            if !self.shedding_active {
                self.shedding_active = true;
                self.rotation_started = Some(self.clock.now());
                self.shed_event_count += 1;
                info!(deficit_w = deficit, "load shedding started");
            }
            self.shed_target_w = deficit * self.config.shed_margin;
            changed |= self.shed_loads(self.shed_target_w);
        } else if self.shedding_active && -deficit > self.config.restore_surplus_w {
            changed |= self.restore_shed(-deficit);
        }

        if self.shedding_active {
            let due = self
                .rotation_started
                .map(|t| secs_since(self.clock.as_ref(), t) >= self.config.rotation_interval_s)
                .unwrap_or(false);
            if due {
                changed |= self.rotate_shedding();
            }
        }

        changed
    }

    fn shed_loads(&mut self, target_w: f64) -> bool {
        let mut shed_w = 0.0;
        let mut changed = false;

        for priority in LoadPriority::iter().rev() {
            if priority == LoadPriority::Critical {
                break;
            }
            for i in 0..self.loads.len() {
                if shed_w >= target_w {
                    return changed;
                }
                if self.loads[i].def.priority == priority && self.can_shed_load(i) {
                    shed_w += self.loads[i].def.rated_power_w;
                    self.set_state(i, LoadState::Shed);
                    info!(load = %self.loads[i].def.id, priority = %priority, "load shed");
                    changed = true;
                }
            }
        }

        changed
    }

    /// Bring shed loads back, most important first, within `budget_w`.
    pub fn restore_shed(&mut self, budget_w: f64) -> bool {
        let mut budget = budget_w;
        let mut changed = false;

        for priority in LoadPriority::iter() {
            for i in 0..self.loads.len() {
                let load = &self.loads[i];
                if load.def.priority != priority || load.state != LoadState::Shed {
                    continue;
                }
                if load.def.rated_power_w <= budget && self.check_timing_constraints(i) {
                    budget -= load.def.rated_power_w;
                    self.set_state(i, LoadState::On);
                    self.restore_event_count += 1;
                    info!(load = %self.loads[i].def.id, "load restored");
                    changed = true;
                }
            }
        }

        if !self.any_shed() && self.shedding_active {
            self.shedding_active = false;
            self.shed_target_w = 0.0;
            self.rotation_started = None;
            info!("load shedding ended");
        }
        changed
    }

    /// Swap one long-shed load for an equal-priority peer that is on.
    pub fn rotate_shedding(&mut self) -> bool {
        self.rotation_started = Some(self.clock.now());

        let min_shed = self.config.min_shed_duration_s;
        let pair = (0..self.loads.len())
            .filter(|&i| {
                let load = &self.loads[i];
                load.state == LoadState::Shed
                    && secs_since(self.clock.as_ref(), load.last_change) >= min_shed
                    && self.check_timing_constraints(i)
            })
            .find_map(|i| {
                let priority = self.loads[i].def.priority;
                (0..self.loads.len())
                    .find(|&j| {
                        j != i && self.loads[j].def.priority == priority && self.can_shed_load(j)
                    })
                    .map(|j| (i, j))
            });

        let Some((restore, shed)) = pair else {
            return false;
        };
        self.set_state(restore, LoadState::On);
        self.set_state(shed, LoadState::Shed);
        self.restore_event_count += 1;
        info!(
            restored = %self.loads[restore].def.id,
            shed = %self.loads[shed].def.id,
            "load shedding rotated"
        );
        true
    }

    /// Park a deferrable load until surplus power is available.
    pub fn defer_load(&mut self, id: &str) -> Result<(), LoadError> {
        let index = self.index_of(id)?;
        if !self.loads[index].def.deferrable {
            return Err(LoadError::NotDeferrable(id.to_string()));
        }
        if matches!(self.loads[index].state, LoadState::On | LoadState::Off) {
            self.set_state(index, LoadState::Deferred);
        }
        Ok(())
    }

    /// Start deferred loads that fit into `excess_w`. Returns how many started.
    pub fn prioritize_deferrable(&mut self, excess_w: f64) -> usize {
        if excess_w.is_nan() || excess_w <= 0.0 {
            return 0;
        }
        let mut budget = excess_w;
        let mut started = 0;

        for priority in LoadPriority::iter() {
            for i in 0..self.loads.len() {
                let load = &self.loads[i];
                if load.def.priority != priority
                    || load.state != LoadState::Deferred
                    || load.def.rated_power_w > budget
                    || !self.check_timing_constraints(i)
                {
                    continue;
                }
                budget -= load.def.rated_power_w;
                self.set_state(i, LoadState::On);
                started += 1;
            }
        }
        started
    }

    /// Mark a load as faulted (excluded from all control) or return it to service.
    pub fn set_fault(&mut self, id: &str, faulted: bool) -> Result<(), LoadError> {
        let index = self.index_of(id)?;
        match (faulted, self.loads[index].state) {
            (true, LoadState::Fault) | (false, LoadState::On) => {}
            (true, _) => self.set_state(index, LoadState::Fault),
            (false, LoadState::Fault) => self.set_state(index, LoadState::Off),
            (false, _) => {}
        }
        Ok(())
    }

    /// Power of loads that are on or waiting to run
    pub fn power_needed(&self) -> f64 {
        self.loads
            .iter()
            .filter(|l| matches!(l.state, LoadState::On | LoadState::Deferred))
            .map(|l| l.def.rated_power_w)
            .sum()
    }

    fn any_shed(&self) -> bool {
        self.loads.iter().any(|l| l.state == LoadState::Shed)
    }

    /// Shed flag per load, in configuration order
    pub fn shed_flags(&self) -> Vec<bool> {
        self.loads.iter().map(|l| l.state == LoadState::Shed).collect()
    }

    pub fn state_of(&self, id: &str) -> Result<LoadState, LoadError> {
        self.index_of(id).map(|i| self.loads[i].state)
    }

    pub fn shedding_active(&self) -> bool {
        self.shedding_active
    }

    pub fn shed_target_w(&self) -> f64 {
        self.shed_target_w
    }

    pub fn shed_event_count(&self) -> u32 {
        self.shed_event_count
    }

    pub fn restore_event_count(&self) -> u32 {
        self.restore_event_count
    }

    pub fn total_energy_wh(&self) -> f64 {
        self.total_energy_wh
    }

    pub fn log_status(&self) {
        let shed = self.loads.iter().filter(|l| l.state == LoadState::Shed).count();
        info!(
            loads = self.loads.len(),
            shed,
            shedding_active = self.shedding_active,
            power_needed_w = self.power_needed(),
            shed_events = self.shed_event_count,
            restore_events = self.restore_event_count,
            total_energy_kwh = self.total_energy_wh / 1000.0,
            "load status"
        );
        for load in &self.loads {
            debug!(
                load = %load.def.id,
                priority = %load.def.priority,
                state = %load.state,
                rated_power_w = load.def.rated_power_w,
                deferrable = load.def.deferrable,
                "load detail"
            );
        }
    }
}
