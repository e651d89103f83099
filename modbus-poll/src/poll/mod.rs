//! Synchronized polling of many devices.
//!
//! One task per device ([`worker`]) and one pacing task ([`coordinator`]) per session, owned by
//! the [`Poller`] control plane. Each cycle the coordinator triggers every worker, waits for all
//! of them to report, and hands one [`Snapshot`] to the [`SnapshotSink`].

use serde::Serialize;
use std::{collections::BTreeMap, time::SystemTime};
use tokio::{sync::mpsc, time::Instant};

use crate::modbus::{DeviceId, Value};

pub mod control;
mod coordinator;
mod worker;

pub use self::control::Poller;

/// Everything gathered in one poll cycle.
///
/// A device that read successfully appears in `values`, even with an empty list when it has no
/// registers configured. A device whose read failed appears in `errors` instead. Devices that
/// were skipped because they are disconnected appear in neither.
#[derive(Clone, Debug, Serialize)]
pub struct Snapshot {
    /// Cycle number within the session, starting from 0.
    pub cycle: u64,

    #[serde(skip)]
    pub started: Instant,

    #[serde(with = "humantime_serde")]
    pub timestamp: SystemTime,

    pub values: BTreeMap<DeviceId, Vec<Value>>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<DeviceId, String>,
}

/// Receives one snapshot per completed cycle, called from the coordinator task.
///
/// Implementations must not block; hand the snapshot off to another thread if it needs heavy
/// work.
pub trait SnapshotSink: Send + Sync + 'static {
    fn accept(&self, snapshot: Snapshot);
}

impl SnapshotSink for mpsc::UnboundedSender<Snapshot> {
    fn accept(&self, snapshot: Snapshot) {
        // A dropped receiver means nobody is listening any more.
        let _ = self.send(snapshot);
    }
}

impl<F> SnapshotSink for F
where
    F: Fn(Snapshot) + Send + Sync + 'static,
{
    fn accept(&self, snapshot: Snapshot) {
        self(snapshot)
    }
}

/// What one worker did in one cycle.
#[derive(Debug)]
pub(crate) enum Outcome {
    Values(Vec<Value>),
    Failed {
        message: String,
        /// The worker dropped the transport because the link is gone.
        disconnected: bool,
    },
    /// Not connected, or the worker has stopped.
    Skipped,
}

#[derive(Debug)]
pub(crate) struct Report {
    pub device: DeviceId,
    pub outcome: Outcome,
}

#[test]
fn snapshot_serializes_without_empty_errors() {
    use serde_json::json;

    let snapshot = Snapshot {
        cycle: 3,
        started: Instant::now(),
        timestamp: SystemTime::UNIX_EPOCH,
        values: BTreeMap::from([(1, vec![4, 5]), (2, vec![])]),
        errors: BTreeMap::new(),
    };

    assert_eq!(
        serde_json::to_value(&snapshot).unwrap(),
        json!({
            "cycle": 3,
            "timestamp": "1970-01-01T00:00:00Z",
            "values": { "1": [4, 5], "2": [] },
        })
    );
}
