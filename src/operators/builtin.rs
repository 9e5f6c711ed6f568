//! Operators available to every engine.

use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use serde_json::Value;

use super::DataEvent;
use super::Operator;
use super::OperatorRegistry;
use super::StateBytes;
use crate::dag::Direction;
use crate::errors::Error;
use crate::errors::Result;

pub(crate) fn register(registry: &mut OperatorRegistry) {
    registry.register("identity", |_| Ok(Box::new(Identity)));
    registry.register("union", |_| Ok(Box::new(Identity)));
    registry.register("map_add", |params| Ok(Box::new(MapAdd::from_params(params)?)));
    registry.register("filter_min", |params| {
        Ok(Box::new(FilterMin::from_params(params)?))
    });
    registry.register("count", |_| Ok(Box::new(Count::default())));
    registry.register("sum", |_| Ok(Box::new(Sum::default())));
}

fn number_param(params: &Value, name: &str) -> Result<f64> {
    params
        .get(name)
        .and_then(Value::as_f64)
        .ok_or_else(|| Error::Operator(format!("missing numeric parameter `{name}`")))
}

fn number(event: &DataEvent) -> Result<f64> {
    event
        .value
        .as_f64()
        .ok_or_else(|| Error::Operator(format!("expected a number, got {}", event.value)))
}

/// Keeps JSON integers integral when the result allows it.
fn to_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        json!(n as i64)
    } else {
        json!(n)
    }
}

/// Passes events through untouched. Registered as `union` too, where
/// it merges both inputs into one stream.
struct Identity;

impl Operator for Identity {
    fn process(&mut self, _: Direction, event: DataEvent, out: &mut Vec<DataEvent>) -> Result<()> {
        out.push(event);
        Ok(())
    }
}

struct MapAdd {
    value: f64,
}

impl MapAdd {
    fn from_params(params: &Value) -> Result<Self> {
        Ok(Self {
            value: number_param(params, "value")?,
        })
    }
}

impl Operator for MapAdd {
    fn process(&mut self, _: Direction, event: DataEvent, out: &mut Vec<DataEvent>) -> Result<()> {
        let n = number(&event)?;
        out.push(DataEvent::new(event.timestamp, to_value(n + self.value)));
        Ok(())
    }
}

struct FilterMin {
    min: f64,
}

impl FilterMin {
    fn from_params(params: &Value) -> Result<Self> {
        Ok(Self {
            min: number_param(params, "min")?,
        })
    }
}

impl Operator for FilterMin {
    fn process(&mut self, _: Direction, event: DataEvent, out: &mut Vec<DataEvent>) -> Result<()> {
        if number(&event)? >= self.min {
            out.push(event);
        }
        Ok(())
    }
}

/// Emits the running number of events seen.
#[derive(Default, Serialize, Deserialize)]
struct Count {
    seen: u64,
}

impl Operator for Count {
    fn process(&mut self, _: Direction, event: DataEvent, out: &mut Vec<DataEvent>) -> Result<()> {
        self.seen += 1;
        out.push(DataEvent::new(event.timestamp, json!(self.seen)));
        Ok(())
    }

    fn is_stateful(&self) -> bool {
        true
    }

    fn snapshot(&self) -> Result<Option<StateBytes>> {
        StateBytes::ser(self).map(Some)
    }

    fn restore(&mut self, state: &StateBytes) -> Result<()> {
        *self = state.de()?;
        Ok(())
    }
}

/// Emits the running sum of numeric events.
#[derive(Default, Serialize, Deserialize)]
struct Sum {
    total: f64,
}

impl Operator for Sum {
    fn process(&mut self, _: Direction, event: DataEvent, out: &mut Vec<DataEvent>) -> Result<()> {
        self.total += number(&event)?;
        out.push(DataEvent::new(event.timestamp, to_value(self.total)));
        Ok(())
    }

    fn is_stateful(&self) -> bool {
        true
    }

    fn snapshot(&self) -> Result<Option<StateBytes>> {
        StateBytes::ser(self).map(Some)
    }

    fn restore(&mut self, state: &StateBytes) -> Result<()> {
        *self = state.de()?;
        Ok(())
    }
}
