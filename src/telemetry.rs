//! Document publication
//!
//! Collection cycles hand their asset documents and events to a
//! `DocumentSink`, keeping the orchestrator independent of where the
//! metadata ends up (a document store, a message bus, stdout).

use async_trait::async_trait;
use std::sync::Mutex;

use crate::assets::AssetDocument;
use crate::flyer::FlyEvent;
use crate::json_output::{output_event, DocumentEvent};

/// Receiver of the documents produced by a collection cycle
#[async_trait]
pub trait DocumentSink: Send + Sync {
    /// Publish one resource or datum document
    async fn publish_asset(&self, doc: &AssetDocument) -> anyhow::Result<()>;

    /// Publish one per-frame event
    async fn publish_event(&self, event: &FlyEvent) -> anyhow::Result<()>;

    /// Publish anything else under a topic, such as a cycle summary
    async fn publish_custom(&self, topic: &str, data: &serde_json::Value) -> anyhow::Result<()> {
        let _ = (topic, data);
        Ok(())
    }
}

/// Discards everything
#[derive(Debug, Clone)]
pub struct NoOpSink;

#[async_trait]
impl DocumentSink for NoOpSink {
    async fn publish_asset(&self, _doc: &AssetDocument) -> anyhow::Result<()> {
        Ok(())
    }

    async fn publish_event(&self, _event: &FlyEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Writes every document to stdout as a JSON line
#[derive(Debug, Clone)]
pub struct ConsoleSink {
    pub pretty_print: bool,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self { pretty_print: false }
    }

    pub fn pretty() -> Self {
        Self { pretty_print: true }
    }

    fn emit(&self, event: &DocumentEvent) -> anyhow::Result<()> {
        if self.pretty_print {
            println!("{}", serde_json::to_string_pretty(event)?);
        } else {
            output_event(event);
        }
        Ok(())
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentSink for ConsoleSink {
    async fn publish_asset(&self, doc: &AssetDocument) -> anyhow::Result<()> {
        self.emit(&DocumentEvent::new(doc.kind().as_str(), serde_json::to_value(doc)?))
    }

    async fn publish_event(&self, event: &FlyEvent) -> anyhow::Result<()> {
        self.emit(&DocumentEvent::new("event", serde_json::to_value(event)?))
    }

    async fn publish_custom(&self, topic: &str, data: &serde_json::Value) -> anyhow::Result<()> {
        self.emit(&DocumentEvent::new(topic, data.clone()))
    }
}

/// Keeps everything in memory, in publication order
#[derive(Debug, Default)]
pub struct MemorySink {
    assets: Mutex<Vec<AssetDocument>>,
    events: Mutex<Vec<FlyEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assets(&self) -> Vec<AssetDocument> {
        self.assets.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn events(&self) -> Vec<FlyEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl DocumentSink for MemorySink {
    async fn publish_asset(&self, doc: &AssetDocument) -> anyhow::Result<()> {
        self.assets
            .lock()
            .map_err(|_| anyhow::anyhow!("asset store poisoned"))?
            .push(doc.clone());
        Ok(())
    }

    async fn publish_event(&self, event: &FlyEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("event store poisoned"))?
            .push(event.clone());
        Ok(())
    }
}
