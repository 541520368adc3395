//! Single-writer, single-reader handoff of measurement snapshots.
//!
//! The poller owns the [`SnapshotWriter`]; the control loop owns the
//! [`SnapshotReader`]. The reader always sees the latest complete snapshot
//! and never a partially written one.

use anyhow::{anyhow, Result};
use tokio::sync::watch;

use crate::domain::SystemMeasurement;

pub struct SnapshotWriter {
    tx: watch::Sender<Option<SystemMeasurement>>,
}

pub struct SnapshotReader {
    rx: watch::Receiver<Option<SystemMeasurement>>,
}

pub fn snapshot_channel() -> (SnapshotWriter, SnapshotReader) {
    let (tx, rx) = watch::channel(None);
    (SnapshotWriter { tx }, SnapshotReader { rx })
}

impl SnapshotWriter {
    /// Replace the current snapshot. Succeeds even after the reader is gone.
    pub fn publish(&self, measurement: SystemMeasurement) {
        self.tx.send_replace(Some(measurement));
    }

    pub fn reader_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl SnapshotReader {
    pub fn latest(&self) -> Result<SystemMeasurement> {
        self.rx
            .borrow()
            .clone()
            .ok_or_else(|| anyhow!("no measurement published yet"))
    }

    /// Wait for the next snapshot. Errors once the writer is dropped.
    pub async fn changed(&mut self) -> Result<SystemMeasurement> {
        self.rx.changed().await?;
        self.latest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reader_sees_latest_snapshot() {
        let (writer, mut reader) = snapshot_channel();
        assert!(reader.latest().is_err());

        let mut m = SystemMeasurement::default();
        m.other_load_w = 100.0;
        writer.publish(m.clone());
        m.other_load_w = 250.0;
        writer.publish(m);

        let seen = reader.changed().await.unwrap();
        assert_eq!(seen.other_load_w, 250.0);
        assert_eq!(reader.latest().unwrap().other_load_w, 250.0);
    }

    #[tokio::test]
    async fn test_dropped_writer_ends_stream() {
        let (writer, mut reader) = snapshot_channel();
        drop(writer);
        assert!(reader.changed().await.is_err());
    }

    #[test]
    fn test_writer_notices_closed_reader() {
        let (writer, reader) = snapshot_channel();
        assert!(!writer.reader_closed());
        drop(reader);
        assert!(writer.reader_closed());
        writer.publish(SystemMeasurement::default());
    }
}
