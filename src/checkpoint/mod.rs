//! Group checkpoints.
//!
//! A checkpoint captures every stateful operator of a group as of a
//! single timestamp, the group's safe replay point: the smallest
//! "latest snapshot" timestamp across its stateful operators. Using
//! one point for the whole group keeps joins and windows fed by
//! several chains consistent with each other.

use std::collections::BTreeMap;
use std::sync::Arc;

use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use opentelemetry::KeyValue;

use crate::common::GroupId;
use crate::errors::Result;
use crate::group::Group;
use crate::with_timer;

mod model;
mod store;

pub use model::*;
pub use store::*;

struct CheckpointMetrics {
    written: Counter<u64>,
    failed: Counter<u64>,
    collected: Counter<u64>,
    duration: Histogram<f64>,
    labels: Vec<KeyValue>,
}

impl CheckpointMetrics {
    fn new() -> Self {
        let meter = opentelemetry::global::meter("groupflow");
        Self {
            written: meter
                .u64_counter("checkpoint_count")
                .with_description("number of group checkpoints written")
                .init(),
            failed: meter
                .u64_counter("checkpoint_failure_count")
                .with_description("number of group checkpoints that could not be written")
                .init(),
            collected: meter
                .u64_counter("state_snapshot_gc_count")
                .with_description("number of operator snapshots dropped after a checkpoint")
                .init(),
            duration: meter
                .f64_histogram("checkpoint_duration_seconds")
                .with_description("group checkpoint duration in seconds")
                .init(),
            labels: vec![],
        }
    }
}

pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    metrics: CheckpointMetrics,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            metrics: CheckpointMetrics::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Snapshot `group` and persist it.
    ///
    /// Snapshots older than the one written are dropped afterwards.
    #[tracing::instrument(name = "checkpoint", skip_all, fields(group = %group.id()))]
    pub fn checkpoint(&self, group: &Group) -> Result<GroupCheckpoint> {
        let res = with_timer!(self.metrics.duration, self.metrics.labels, {
            self.write(group)
        });
        match &res {
            Ok(_) => self.metrics.written.add(1, &self.metrics.labels),
            Err(_) => self.metrics.failed.add(1, &self.metrics.labels),
        }
        res
    }

    fn write(&self, group: &Group) -> Result<GroupCheckpoint> {
        let (checkpoint, chains) = {
            let dags = group.dags();
            let chains: Vec<_> = dags.chains().filter(|c| c.is_stateful()).cloned().collect();
            let min_timestamp = chains
                .iter()
                .flat_map(|chain| chain.latest_timestamps())
                .map(|ts| ts.unwrap_or(0))
                .min()
                .unwrap_or(u64::MAX);

            let mut queries = BTreeMap::new();
            for (query, record) in dags.queries() {
                let mut states = BTreeMap::new();
                for (config_id, vertex_id) in &record.vertex_map {
                    let Some(chain) = dags.vertex(vertex_id).and_then(|v| v.as_chain()) else {
                        continue;
                    };
                    let snapshot = chain.states_at(min_timestamp);
                    if !snapshot.is_empty() {
                        states.insert(*config_id, snapshot);
                    }
                }
                queries.insert(
                    query.clone(),
                    QueryCheckpoint {
                        dag: record.dag.clone(),
                        states,
                    },
                );
            }
            let checkpoint = GroupCheckpoint {
                group_id: group.id().clone(),
                tenant_id: group.tenant().clone(),
                min_timestamp,
                load: group.load(),
                created_at: chrono::Utc::now(),
                queries,
            };
            (checkpoint, chains)
        };

        self.store.save(&checkpoint)?;
        let collected: usize = chains
            .iter()
            .map(|chain| chain.drain_garbage(checkpoint.min_timestamp))
            .sum();
        self.metrics
            .collected
            .add(collected as u64, &self.metrics.labels);
        tracing::debug!(
            "Checkpointed {} queries at {}, dropped {collected} old snapshots",
            checkpoint.queries.len(),
            checkpoint.min_timestamp
        );
        Ok(checkpoint)
    }

    pub fn load(&self, group: &GroupId) -> Result<Option<GroupCheckpoint>> {
        self.store.load(group)
    }

    pub fn delete(&self, group: &GroupId) -> Result<bool> {
        self.store.delete(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::QueryId;
    use crate::dag::ConfigDag;
    use crate::dag::ConfigVertexId;
    use crate::dag::Edge;
    use crate::dag::MergeRequest;
    use crate::dag::OperatorConfig;
    use crate::dag::QueryMerger;
    use crate::dag::VertexConfig;
    use crate::testing::*;
    use serde_json::json;
    use serde_json::Value;

    fn manager() -> CheckpointManager {
        CheckpointManager::new(Arc::new(InMemCheckpointStore::new()))
    }

    /// Two stateful chains off two feeds.
    fn two_counters() -> ConfigDag {
        let mut dag = ConfigDag::new();
        for feed in ["a", "b"] {
            let src = dag.vertex(feed_source(feed));
            let count = dag.vertex(VertexConfig::chain(vec![OperatorConfig::new(
                "count",
                json!(null),
            )]));
            let out = dag.vertex(collect_sink(feed));
            dag.edge(src, count, Edge::default());
            dag.edge(count, out, Edge::default());
        }
        dag
    }

    fn drain(group: &Group) {
        while let Some(chain) = group.next_chain() {
            while chain.process_next() {}
            chain.finish_pass();
        }
    }

    #[test]
    fn checkpoint_uses_group_minimum_timestamp() {
        let (factory, feeds, _outputs) = factory();
        let merger = QueryMerger::new(Arc::new(factory));
        let group = Group::new("g".into(), "t".into(), 1);
        merger
            .merge(
                &mut group.dags(),
                MergeRequest {
                    query: &QueryId::from("q"),
                    dag: &two_counters(),
                    restored: None,
                    owner: group.activation(),
                    defer_start: false,
                },
            )
            .unwrap();

        let (a, b) = (feeds.get("a"), feeds.get("b"));
        a.push_data(1, json!(1));
        a.push_watermark(1);
        a.push_data(3, json!(3));
        a.push_watermark(3);
        b.push_data(2, json!(2));
        b.push_watermark(2);
        drain(&group);

        let checkpoints = manager();
        let checkpoint = checkpoints.checkpoint(&group).unwrap();
        assert_eq!(checkpoint.min_timestamp, 2);
        let states = &checkpoint.queries[&QueryId::from("q")].states;
        // Chain `a` is checkpointed as of 1, the newest snapshot <= 2.
        let a_state = &states[&ConfigVertexId(1)][0];
        assert_eq!(a_state.timestamp, 1);
        assert_eq!(a_state.state.de::<Value>().unwrap(), json!({ "seen": 1 }));
        let b_state = &states[&ConfigVertexId(4)][0];
        assert_eq!(b_state.timestamp, 2);

        assert_eq!(checkpoints.load(group.id()).unwrap(), Some(checkpoint));
    }

    #[test]
    fn operator_without_snapshot_pins_timestamp_to_zero() {
        let (factory, feeds, _outputs) = factory();
        let merger = QueryMerger::new(Arc::new(factory));
        let group = Group::new("g".into(), "t".into(), 1);
        merger
            .merge(
                &mut group.dags(),
                MergeRequest {
                    query: &QueryId::from("q"),
                    dag: &two_counters(),
                    restored: None,
                    owner: group.activation(),
                    defer_start: false,
                },
            )
            .unwrap();
        feeds.get("a").push_watermark(5);
        drain(&group);

        let checkpoint = manager().checkpoint(&group).unwrap();
        assert_eq!(checkpoint.min_timestamp, 0);
        assert!(checkpoint.queries[&QueryId::from("q")].states.is_empty());
    }

    #[test]
    fn stateless_group_checkpoints_at_max() {
        let (factory, _feeds, _outputs) = factory();
        let merger = QueryMerger::new(Arc::new(factory));
        let group = Group::new("g".into(), "t".into(), 1);
        merger
            .merge(
                &mut group.dags(),
                MergeRequest {
                    query: &QueryId::from("q"),
                    dag: &linear("f", &[1], "out"),
                    restored: None,
                    owner: group.activation(),
                    defer_start: false,
                },
            )
            .unwrap();
        let checkpoint = manager().checkpoint(&group).unwrap();
        assert_eq!(checkpoint.min_timestamp, u64::MAX);
        assert_eq!(checkpoint.queries.len(), 1);
    }

    #[test]
    fn checkpoint_collects_older_snapshots() {
        let (factory, feeds, _outputs) = factory();
        let merger = QueryMerger::new(Arc::new(factory));
        let group = Group::new("g".into(), "t".into(), 1);
        merger
            .merge(
                &mut group.dags(),
                MergeRequest {
                    query: &QueryId::from("q"),
                    dag: &single_chain("f", vec![OperatorConfig::new("sum", json!(null))], "o"),
                    restored: None,
                    owner: group.activation(),
                    defer_start: false,
                },
            )
            .unwrap();
        let feed = feeds.get("f");
        for ts in 1..=3 {
            feed.push_data(ts, json!(ts));
            feed.push_watermark(ts);
        }
        drain(&group);
        let chain = group.dags().chains().next().unwrap().clone();
        assert_eq!(chain.states_at(1).len(), 1);

        manager().checkpoint(&group).unwrap();
        // Only the checkpointed snapshot is left.
        assert!(chain.states_at(2).is_empty());
        assert_eq!(chain.states_at(3)[0].timestamp, 3);
    }
}
