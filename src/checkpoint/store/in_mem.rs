use std::collections::BTreeMap;
use std::sync::Mutex;

use super::CheckpointStore;
use crate::checkpoint::GroupCheckpoint;
use crate::common::GroupId;
use crate::errors::Result;
use crate::lock;

/// Checkpoints that live as long as the process.
#[derive(Default)]
pub struct InMemCheckpointStore {
    records: Mutex<BTreeMap<GroupId, GroupCheckpoint>>,
}

impl InMemCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for InMemCheckpointStore {
    fn save(&self, checkpoint: &GroupCheckpoint) -> Result<()> {
        lock!(self.records).insert(checkpoint.group_id.clone(), checkpoint.clone());
        Ok(())
    }

    fn load(&self, group: &GroupId) -> Result<Option<GroupCheckpoint>> {
        Ok(lock!(self.records).get(group).cloned())
    }

    fn delete(&self, group: &GroupId) -> Result<bool> {
        Ok(lock!(self.records).remove(group).is_some())
    }

    fn groups(&self) -> Result<Vec<GroupId>> {
        Ok(lock!(self.records).keys().cloned().collect())
    }
}
