//! Where checkpoints are kept.

use std::sync::Arc;

use super::GroupCheckpoint;
use crate::common::GroupId;
use crate::config::EngineConfig;
use crate::errors::Result;

mod in_mem;
mod sqlite;

pub use in_mem::InMemCheckpointStore;
pub use sqlite::SqliteCheckpointStore;

/// Durable home of [`GroupCheckpoint`]s. A newer checkpoint of a
/// group replaces the older one.
pub trait CheckpointStore: Send + Sync {
    fn save(&self, checkpoint: &GroupCheckpoint) -> Result<()>;

    fn load(&self, group: &GroupId) -> Result<Option<GroupCheckpoint>>;

    /// Returns whether there was anything to delete.
    fn delete(&self, group: &GroupId) -> Result<bool>;

    fn groups(&self) -> Result<Vec<GroupId>>;
}

/// The store `config` asks for.
pub fn open_store(config: &EngineConfig) -> Result<Arc<dyn CheckpointStore>> {
    match &config.checkpoint_db {
        Some(path) => {
            tracing::info!("Keeping checkpoints in {path:?}");
            Ok(Arc::new(SqliteCheckpointStore::open(path)?))
        }
        None => Ok(Arc::new(InMemCheckpointStore::new())),
    }
}
