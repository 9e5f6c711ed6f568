//! What a checkpoint is made of.

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::common::GroupId;
use crate::common::QueryId;
use crate::common::TenantId;
use crate::dag::ConfigDag;
use crate::dag::RestoredStates;

/// One query of a checkpointed group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryCheckpoint {
    pub dag: ConfigDag,
    /// Stateful operator snapshots per config vertex.
    pub states: RestoredStates,
}

/// A consistent snapshot of a whole group.
///
/// Every operator state in here is as of `min_timestamp`, the
/// group's safe replay point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupCheckpoint {
    pub group_id: GroupId,
    pub tenant_id: TenantId,
    pub min_timestamp: u64,
    /// Load of the group when it was checkpointed, what recovery uses
    /// to find it a home.
    pub load: f64,
    pub created_at: DateTime<Utc>,
    pub queries: BTreeMap<QueryId, QueryCheckpoint>,
}
