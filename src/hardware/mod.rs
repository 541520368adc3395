//! Boundary between the control loop and the plant.
//!
//! Drivers (Modbus, CAN, serial) live outside this crate; they implement
//! [`MeasurementSource`] and the controller never sees anything else.

pub mod snapshot;
#[cfg(feature = "sim")]
pub mod simulated;

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::{ControlCommands, SystemMeasurement};

pub use snapshot::{snapshot_channel, SnapshotReader, SnapshotWriter};
#[cfg(feature = "sim")]
pub use simulated::SimulatedPlant;

#[async_trait]
pub trait MeasurementSource: Send + Sync {
    /// Latest complete snapshot of the plant
    async fn read(&self) -> Result<SystemMeasurement>;
    /// Hand the cycle's commands to the actuators
    async fn apply(&self, commands: &ControlCommands) -> Result<()>;
}
