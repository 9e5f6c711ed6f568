//! Operator state as the checkpoint system sees it.
//!
//! The checkpoint system only deals in bytes so each operator can
//! store custom types without going through generic gymnastics.

use std::any::type_name;
use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::Error;
use crate::errors::Result;

/// A snapshot of a single operator's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBytes(pub Vec<u8>);

impl StateBytes {
    /// Serialize this state object from an operator into bytes the
    /// checkpoint system can store.
    pub fn ser<T: Serialize>(obj: &T) -> Result<Self> {
        serde_json::to_vec(obj).map(Self).map_err(|err| {
            let t_name = type_name::<T>();
            Error::Operator(format!("error serializing state type {t_name}: {err}"))
        })
    }

    /// Deserialize these bytes from the checkpoint system into a
    /// state object that an operator can use.
    pub fn de<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.0).map_err(|err| {
            let t_name = type_name::<T>();
            Error::Operator(format!("error deserializing state type {t_name}: {err}"))
        })
    }
}

/// State of one operator inside a chain, as stored in a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorState {
    /// Position of the operator in its chain.
    pub index: usize,
    /// Watermark timestamp this state was taken at.
    pub timestamp: u64,
    pub state: StateBytes,
}

/// How many snapshots a log keeps when nothing checkpoints it.
pub const MAX_RETAINED_SNAPSHOTS: usize = 32;

/// Snapshots of one stateful operator keyed by the watermark they
/// were taken at.
///
/// A checkpoint picks, for every operator, the newest snapshot at or
/// below the group's safe timestamp, so older ones have to be kept
/// around until a checkpoint moves past them. At most `retained` are
/// kept; past that the oldest snapshot is evicted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLog {
    snapshots: BTreeMap<u64, StateBytes>,
    retained: usize,
    evicted: bool,
}

impl Default for StateLog {
    fn default() -> Self {
        Self::bounded(MAX_RETAINED_SNAPSHOTS)
    }
}

impl StateLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A log that never holds more than `retained` snapshots. Zero is
    /// treated as one, the latest snapshot is always kept.
    pub fn bounded(retained: usize) -> Self {
        Self {
            snapshots: BTreeMap::new(),
            retained: retained.max(1),
            evicted: false,
        }
    }

    pub fn record(&mut self, timestamp: u64, state: StateBytes) {
        self.snapshots.insert(timestamp, state);
        while self.snapshots.len() > self.retained {
            self.snapshots.pop_first();
            self.evicted = true;
        }
    }

    /// Timestamp of the most recent watermark snapshot.
    pub fn latest_timestamp(&self) -> Option<u64> {
        self.snapshots.keys().next_back().copied()
    }

    /// Newest snapshot taken at or before `timestamp`.
    pub fn state_at(&self, timestamp: u64) -> Option<(u64, &StateBytes)> {
        self.snapshots
            .range(..=timestamp)
            .next_back()
            .map(|(ts, state)| (*ts, state))
    }

    /// Snapshot to store in a checkpoint taken at `timestamp`.
    ///
    /// Once snapshots were evicted, the one at or before `timestamp`
    /// may be gone. The oldest retained one is used instead; replayed
    /// events up to its own timestamp are dropped on restore.
    pub fn checkpoint_state(&self, timestamp: u64) -> Option<(u64, &StateBytes)> {
        self.state_at(timestamp).or_else(|| {
            self.evicted
                .then(|| self.snapshots.iter().next())
                .flatten()
                .map(|(ts, state)| (*ts, state))
        })
    }

    /// Drop every snapshot older than the newest one at or before
    /// `timestamp`, since recovery can never need them again.
    ///
    /// Returns how many snapshots were dropped.
    pub fn drain_garbage(&mut self, timestamp: u64) -> usize {
        let Some((keep, _)) = self.state_at(timestamp) else {
            return 0;
        };
        let retained = self.snapshots.split_off(&keep);
        let dropped = std::mem::replace(&mut self.snapshots, retained);
        dropped.len()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
