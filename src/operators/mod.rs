//! Operators and the runtime pieces that move events between them.
//!
//! An [`OperatorChain`] is a queue-backed run of operators processed
//! sequentially by whichever event processor currently owns its
//! group. Output leaves a vertex through an [`OutputEmitter`].

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::dag::Direction;
use crate::dag::OperatorConfig;
use crate::errors::Error;
use crate::errors::Result;

pub mod builtin;
pub mod chain;
pub mod emitter;
pub mod state;

pub use chain::*;
pub use emitter::*;
pub use state::*;

/// A single item flowing through a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEvent {
    pub timestamp: u64,
    pub value: Value,
}

impl DataEvent {
    pub fn new(timestamp: u64, value: Value) -> Self {
        Self { timestamp, value }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    Data(DataEvent),
    /// No more data at or below this timestamp will arrive. Stateful
    /// operators snapshot themselves when one passes through.
    Watermark(u64),
}

impl Event {
    pub fn timestamp(&self) -> u64 {
        match self {
            Self::Data(data) => data.timestamp,
            Self::Watermark(ts) => *ts,
        }
    }
}

/// User logic run inside an [`OperatorChain`].
///
/// Only the processor running the owning group ever calls into an
/// operator, so implementations need no internal locking.
pub trait Operator: Send {
    /// Process one event, pushing anything to send downstream onto
    /// `out`. `direction` is only meaningful for the first operator
    /// of a chain with more than one input.
    fn process(
        &mut self,
        direction: Direction,
        event: DataEvent,
        out: &mut Vec<DataEvent>,
    ) -> Result<()>;

    fn is_stateful(&self) -> bool {
        false
    }

    /// Current state, if this operator has any.
    fn snapshot(&self) -> Result<Option<StateBytes>> {
        Ok(None)
    }

    /// Replace the current state with a previously taken snapshot.
    fn restore(&mut self, _state: &StateBytes) -> Result<()> {
        Err(Error::Operator("operator is stateless".into()))
    }
}

pub type OperatorFactory = Arc<dyn Fn(&Value) -> Result<Box<dyn Operator>> + Send + Sync>;

/// Maps operator kinds named in a [`OperatorConfig`] to constructors.
#[derive(Clone)]
pub struct OperatorRegistry {
    factories: HashMap<String, OperatorFactory>,
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        builtin::register(&mut registry);
        registry
    }
}

impl OperatorRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&Value) -> Result<Box<dyn Operator>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_owned(), Arc::new(factory));
    }

    pub fn build(&self, config: &OperatorConfig) -> Result<Box<dyn Operator>> {
        let factory = self
            .factories
            .get(&config.kind)
            .ok_or_else(|| Error::UnknownOperator(config.kind.clone()))?;
        factory(&config.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_kind_is_an_error() {
        let registry = OperatorRegistry::default();
        let res = registry.build(&OperatorConfig::new("nope", Value::Null));
        assert!(matches!(res, Err(Error::UnknownOperator(kind)) if kind == "nope"));
    }

    #[test]
    fn custom_operators_can_be_registered() {
        struct Double;
        impl Operator for Double {
            fn process(
                &mut self,
                _direction: Direction,
                event: DataEvent,
                out: &mut Vec<DataEvent>,
            ) -> Result<()> {
                let n = event.value.as_i64().unwrap_or(0);
                out.push(DataEvent::new(event.timestamp, json!(n * 2)));
                Ok(())
            }
        }

        let mut registry = OperatorRegistry::empty();
        registry.register("double", |_| Ok(Box::new(Double)));
        let mut op = registry
            .build(&OperatorConfig::new("double", Value::Null))
            .unwrap();
        let mut out = Vec::new();
        op.process(Direction::Left, DataEvent::new(1, json!(21)), &mut out)
            .unwrap();
        assert_eq!(out, vec![DataEvent::new(1, json!(42))]);
    }
}
