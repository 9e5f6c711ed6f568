//! Groupflow runs many tenants' streaming queries inside one worker.
//!
//! Queries submitted by the same tenant are merged into shared
//! physical DAGs, so common sources and operator prefixes are only
//! evaluated once. Each tenant's DAGs form a [`group::Group`], the unit
//! of scheduling: a pool of event processor threads picks groups with
//! a fair, virtual-time based policy, rebalances them between
//! processors and isolates the ones that run for too long.
//!
//! Groups are periodically checkpointed to sqlite. When a worker goes
//! away, its groups are redistributed over the remaining workers and
//! rebuilt from their last checkpoint, replaying the events that came
//! after it.
//!
//! The entry point is [`run::run`], which starts a [`task::Task`]
//! with metrics, logging and the introspection API attached.

#[macro_use]
pub(crate) mod macros;

pub mod checkpoint;
pub mod common;
pub mod config;
pub mod connectors;
pub mod dag;
pub mod errors;
pub mod group;
pub mod metrics;
pub mod operators;
pub mod recovery;
pub mod run;
pub mod scheduler;
pub mod task;
pub mod tracing;
pub mod webserver;

#[cfg(test)]
pub(crate) mod testing;
