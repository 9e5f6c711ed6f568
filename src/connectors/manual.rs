//! In-process source and sink.
//!
//! A [`ManualFeed`] plays the role of a broker: anything pushed is
//! kept so a recovering source can ask for it again, and forwarded to
//! every started source reading the feed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use super::SinkConnector;
use super::SourceConnector;
use crate::errors::Result;
use crate::lock;
use crate::operators::DataEvent;
use crate::operators::Event;
use crate::operators::OutputEmitter;

#[derive(Default)]
struct FeedInner {
    log: Vec<Event>,
    next_sub: u64,
    subscribers: Vec<(u64, Arc<OutputEmitter>)>,
}

#[derive(Default)]
pub struct ManualFeed {
    inner: Mutex<FeedInner>,
}

impl ManualFeed {
    pub fn push(&self, event: Event) {
        let mut inner = lock!(self.inner);
        inner.log.push(event.clone());
        for (_, emitter) in &inner.subscribers {
            emitter.emit(event.clone());
        }
    }

    pub fn push_data(&self, timestamp: u64, value: serde_json::Value) {
        self.push(Event::Data(DataEvent::new(timestamp, value)));
    }

    pub fn push_watermark(&self, timestamp: u64) {
        self.push(Event::Watermark(timestamp));
    }

    pub fn subscribers(&self) -> usize {
        lock!(self.inner).subscribers.len()
    }

    fn subscribe(&self, emitter: Arc<OutputEmitter>) -> u64 {
        let mut inner = lock!(self.inner);
        let id = inner.next_sub;
        inner.next_sub += 1;
        inner.subscribers.push((id, emitter));
        id
    }

    fn unsubscribe(&self, id: u64) {
        lock!(self.inner).subscribers.retain(|(sub, _)| *sub != id);
    }

    fn since(&self, timestamp: u64) -> Vec<Event> {
        lock!(self.inner)
            .log
            .iter()
            .filter(|event| event.timestamp() > timestamp)
            .cloned()
            .collect()
    }
}

/// Named feeds shared between the test driver and the engine.
#[derive(Clone, Default)]
pub struct ManualFeeds {
    feeds: Arc<Mutex<HashMap<String, Arc<ManualFeed>>>>,
}

impl ManualFeeds {
    /// Get or create a feed.
    pub fn get(&self, name: &str) -> Arc<ManualFeed> {
        lock!(self.feeds)
            .entry(name.to_owned())
            .or_default()
            .clone()
    }
}

pub struct ManualSource {
    feed: Arc<ManualFeed>,
    subscription: Option<u64>,
}

impl ManualSource {
    pub fn new(feed: Arc<ManualFeed>) -> Self {
        Self {
            feed,
            subscription: None,
        }
    }
}

impl SourceConnector for ManualSource {
    fn start(&mut self, emitter: Arc<OutputEmitter>) -> Result<()> {
        self.subscription = Some(self.feed.subscribe(emitter));
        Ok(())
    }

    fn replay_since(&mut self, timestamp: u64) -> Result<Vec<Event>> {
        Ok(self.feed.since(timestamp))
    }

    fn close(&mut self) -> Result<()> {
        if let Some(id) = self.subscription.take() {
            self.feed.unsubscribe(id);
        }
        Ok(())
    }
}

/// Named item buffers filled by `collect` sinks.
#[derive(Clone, Default)]
pub struct CollectedOutputs {
    outputs: Arc<Mutex<HashMap<String, Vec<DataEvent>>>>,
}

impl CollectedOutputs {
    pub fn get(&self, name: &str) -> Vec<DataEvent> {
        lock!(self.outputs).get(name).cloned().unwrap_or_default()
    }

    pub fn values(&self, name: &str) -> Vec<serde_json::Value> {
        self.get(name).into_iter().map(|e| e.value).collect()
    }

    pub fn len(&self, name: &str) -> usize {
        lock!(self.outputs).get(name).map_or(0, Vec::len)
    }

    fn append(&self, name: &str, event: DataEvent) {
        lock!(self.outputs)
            .entry(name.to_owned())
            .or_default()
            .push(event);
    }
}

pub struct CollectSink {
    outputs: CollectedOutputs,
    name: String,
}

impl CollectSink {
    pub fn new(outputs: CollectedOutputs, name: String) -> Self {
        Self { outputs, name }
    }
}

impl SinkConnector for CollectSink {
    fn write(&mut self, event: &DataEvent) -> Result<()> {
        self.outputs.append(&self.name, event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replay_returns_events_after_timestamp() {
        let feeds = ManualFeeds::default();
        let feed = feeds.get("f");
        feed.push_data(1, json!(1));
        feed.push_watermark(1);
        feed.push_data(2, json!(2));

        let mut source = ManualSource::new(feeds.get("f"));
        let replay = source.replay_since(1).unwrap();
        assert_eq!(replay, vec![Event::Data(DataEvent::new(2, json!(2)))]);
    }

    #[test]
    fn close_unsubscribes() {
        let feeds = ManualFeeds::default();
        let mut source = ManualSource::new(feeds.get("f"));
        source.start(Arc::new(OutputEmitter::new())).unwrap();
        assert_eq!(feeds.get("f").subscribers(), 1);
        source.close().unwrap();
        assert_eq!(feeds.get("f").subscribers(), 0);
    }
}
