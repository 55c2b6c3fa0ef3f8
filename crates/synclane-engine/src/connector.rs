//! Source and destination process abstractions.
//!
//! The replication core drives connectors only through these traits. Errors
//! are opaque `anyhow` chains; the driver classifies them by side.

use async_trait::async_trait;
use synclane_types::{ConfiguredCatalog, ProtocolMessage};

/// Everything a connector needs to start one sync.
#[derive(Debug, Clone)]
pub struct ConnectorStartConfig {
    pub catalog: ConfiguredCatalog,
    pub config: serde_json::Value,
    /// Latest persisted checkpoint, handed to sources for incremental reads.
    pub state: Option<serde_json::Value>,
}

#[async_trait]
pub trait Source: Send + Sync {
    async fn start(&mut self, config: ConnectorStartConfig) -> anyhow::Result<()>;

    /// Next message, or `None` when nothing is available right now.
    async fn attempt_read(&mut self) -> anyhow::Result<Option<ProtocolMessage>>;

    fn is_finished(&self) -> bool;

    /// Exit code once finished.
    fn exit_value(&self) -> Option<i32>;

    async fn cancel(&mut self) -> anyhow::Result<()>;

    async fn close(&mut self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait Destination: Send + Sync {
    async fn start(&mut self, config: ConnectorStartConfig) -> anyhow::Result<()>;

    async fn accept(&mut self, message: ProtocolMessage) -> anyhow::Result<()>;

    /// Signal that no more messages will be accepted.
    async fn notify_end_of_input(&mut self) -> anyhow::Result<()>;

    async fn attempt_read(&mut self) -> anyhow::Result<Option<ProtocolMessage>>;

    fn is_finished(&self) -> bool;

    fn exit_value(&self) -> Option<i32>;

    async fn cancel(&mut self) -> anyhow::Result<()>;

    async fn close(&mut self) -> anyhow::Result<()>;
}
