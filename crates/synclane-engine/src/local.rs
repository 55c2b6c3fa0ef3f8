//! In-process connectors for local runs and tests.
//!
//! [`ReplaySource`] replays a fixed list of protocol messages.
//! [`EchoDestination`] acknowledges every checkpoint with the number of
//! records it received since the previous one, the way a well-behaved
//! destination would.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use synclane_types::{ProtocolMessage, StateMessage, StateType, StreamDescriptor, StreamStatus};

use crate::connector::{ConnectorStartConfig, Destination, Source};

#[derive(Debug, Default)]
pub struct ReplaySource {
    messages: VecDeque<ProtocolMessage>,
    exit_code: i32,
    started: bool,
    cancelled: bool,
}

impl ReplaySource {
    #[must_use]
    pub fn new(messages: Vec<ProtocolMessage>) -> Self {
        Self {
            messages: messages.into(),
            ..Self::default()
        }
    }

    /// Load one protocol message per non-blank line.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a line is not a valid
    /// protocol message.
    pub fn from_jsonl(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read source messages: {}", path.display()))?;
        let messages = content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("invalid protocol message at {}:{}", path.display(), i + 1))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self::new(messages))
    }

    /// Exit code reported once every message has been read.
    #[must_use]
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.messages.len()
    }

    /// Messages not yet read, in replay order.
    pub fn messages(&self) -> impl Iterator<Item = &ProtocolMessage> {
        self.messages.iter()
    }
}

#[async_trait]
impl Source for ReplaySource {
    async fn start(&mut self, config: ConnectorStartConfig) -> anyhow::Result<()> {
        tracing::debug!(
            streams = config.catalog.streams.len(),
            messages = self.messages.len(),
            "Replay source started"
        );
        self.started = true;
        Ok(())
    }

    async fn attempt_read(&mut self) -> anyhow::Result<Option<ProtocolMessage>> {
        anyhow::ensure!(self.started, "replay source read before start");
        Ok(self.messages.pop_front())
    }

    fn is_finished(&self) -> bool {
        self.cancelled || self.messages.is_empty()
    }

    fn exit_value(&self) -> Option<i32> {
        self.is_finished().then_some(self.exit_code)
    }

    async fn cancel(&mut self) -> anyhow::Result<()> {
        self.cancelled = true;
        self.messages.clear();
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct EchoDestination {
    outbox: VecDeque<ProtocolMessage>,
    per_stream: BTreeMap<StreamDescriptor, u64>,
    seen_streams: BTreeSet<StreamDescriptor>,
    records_received: u64,
    ended: bool,
    cancelled: bool,
}

impl EchoDestination {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records_received(&self) -> u64 {
        self.records_received
    }

    fn acknowledge(&mut self, state: StateMessage) {
        let count = match (state.state_type, state.stream_descriptor()) {
            (StateType::Stream, Some(desc)) => self.per_stream.remove(desc).unwrap_or(0),
            _ => std::mem::take(&mut self.per_stream).into_values().sum(),
        };
        #[allow(clippy::cast_precision_loss)]
        let ack = state.with_destination_count(count as f64);
        self.outbox.push_back(ProtocolMessage::state(ack));
    }
}

#[async_trait]
impl Destination for EchoDestination {
    async fn start(&mut self, config: ConnectorStartConfig) -> anyhow::Result<()> {
        tracing::debug!(streams = config.catalog.streams.len(), "Echo destination started");
        Ok(())
    }

    async fn accept(&mut self, message: ProtocolMessage) -> anyhow::Result<()> {
        anyhow::ensure!(!self.ended, "message accepted after end of input");
        match message {
            ProtocolMessage::Record { record } => {
                let desc = record.descriptor();
                *self.per_stream.entry(desc.clone()).or_default() += 1;
                self.seen_streams.insert(desc);
                self.records_received += 1;
            }
            ProtocolMessage::State { state } => {
                if let Some(desc) = state.stream_descriptor() {
                    self.seen_streams.insert(desc.clone());
                }
                self.acknowledge(state);
            }
            other => tracing::trace!(message_type = other.kind(), "Echo destination ignoring message"),
        }
        Ok(())
    }

    async fn notify_end_of_input(&mut self) -> anyhow::Result<()> {
        self.ended = true;
        for desc in &self.seen_streams {
            self.outbox.push_back(ProtocolMessage::stream_status(
                desc.clone(),
                StreamStatus::Complete,
                Vec::new(),
                0,
            ));
        }
        Ok(())
    }

    async fn attempt_read(&mut self) -> anyhow::Result<Option<ProtocolMessage>> {
        Ok(self.outbox.pop_front())
    }

    fn is_finished(&self) -> bool {
        self.cancelled || (self.ended && self.outbox.is_empty())
    }

    fn exit_value(&self) -> Option<i32> {
        self.is_finished().then_some(0)
    }

    async fn cancel(&mut self) -> anyhow::Result<()> {
        self.cancelled = true;
        self.outbox.clear();
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}
