//! Source and sink contracts.
//!
//! Concrete network connectors live outside the engine; they plug in
//! through a [`ConnectorRegistry`]. The merger only cares about a
//! connector's configuration, which is what identifies it.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::errors::Error;
use crate::errors::Result;
use crate::operators::DataEvent;
use crate::operators::Event;
use crate::operators::OutputEmitter;

pub mod manual;

pub use manual::*;

pub trait SourceConnector: Send {
    /// Begin emitting into `emitter`. Called at most once.
    fn start(&mut self, emitter: Arc<OutputEmitter>) -> Result<()>;

    /// Events after `timestamp` this source can send again, used when
    /// resuming from a checkpoint.
    fn replay_since(&mut self, _timestamp: u64) -> Result<Vec<Event>> {
        Ok(Vec::new())
    }

    fn close(&mut self) -> Result<()>;
}

pub trait SinkConnector: Send {
    fn write(&mut self, event: &DataEvent) -> Result<()>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub type SourceFactory = Arc<dyn Fn(&Value) -> Result<Box<dyn SourceConnector>> + Send + Sync>;
pub type SinkFactory = Arc<dyn Fn(&Value) -> Result<Box<dyn SinkConnector>> + Send + Sync>;

/// Maps connector names in a vertex config to constructors.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    sources: HashMap<String, SourceFactory>,
    sinks: HashMap<String, SinkFactory>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the in-process `manual` source and the
    /// `collect` and `log` sinks.
    pub fn with_manual(feeds: ManualFeeds, outputs: CollectedOutputs) -> Self {
        let mut registry = Self::new();
        registry.register_source("manual", move |params| {
            let name = name_param(params, "feed")?;
            Ok(Box::new(ManualSource::new(feeds.get(&name))))
        });
        registry.register_sink("collect", move |params| {
            let name = name_param(params, "name")?;
            Ok(Box::new(CollectSink::new(outputs.clone(), name)))
        });
        registry.register_sink("log", |params| {
            let name = name_param(params, "name").unwrap_or_else(|_| "log".to_owned());
            Ok(Box::new(LogSink { name }))
        });
        registry
    }

    pub fn register_source<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&Value) -> Result<Box<dyn SourceConnector>> + Send + Sync + 'static,
    {
        self.sources.insert(kind.to_owned(), Arc::new(factory));
    }

    pub fn register_sink<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&Value) -> Result<Box<dyn SinkConnector>> + Send + Sync + 'static,
    {
        self.sinks.insert(kind.to_owned(), Arc::new(factory));
    }

    pub fn build_source(&self, kind: &str, params: &Value) -> Result<Box<dyn SourceConnector>> {
        let factory = self
            .sources
            .get(kind)
            .ok_or_else(|| Error::UnknownConnector(kind.to_owned()))?;
        factory(params)
    }

    pub fn build_sink(&self, kind: &str, params: &Value) -> Result<Box<dyn SinkConnector>> {
        let factory = self
            .sinks
            .get(kind)
            .ok_or_else(|| Error::UnknownConnector(kind.to_owned()))?;
        factory(params)
    }
}

fn name_param(params: &Value, key: &str) -> Result<String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| Error::Connector(format!("missing string parameter `{key}`")))
}

/// Writes every item to the log at info level.
struct LogSink {
    name: String,
}

impl SinkConnector for LogSink {
    fn write(&mut self, event: &DataEvent) -> Result<()> {
        tracing::info!(sink = %self.name, ts = event.timestamp, "{}", event.value);
        Ok(())
    }
}
