//! Per-stream rate-limit backoff tracking.
//!
//! A stream is rate-limited while it has an entry in the map. The entry is
//! created by a stream-status trace carrying exactly one `RATE_LIMITED`
//! reason and removed by the next record for that stream.

use std::sync::Arc;

use dashmap::DashMap;
use synclane_types::{MessageOrigin, ProtocolMessage, StreamDescriptor, StreamStatusTrace};

use crate::clock::Clock;
use crate::events::{ReplicationEventPublishingHelper, RunningReason};

#[derive(Debug)]
pub struct RateLimitedMessageHandler {
    enabled: bool,
    publisher: ReplicationEventPublishingHelper,
    clock: Arc<dyn Clock>,
    streams: DashMap<StreamDescriptor, i64>,
}

impl RateLimitedMessageHandler {
    #[must_use]
    pub fn new(enabled: bool, publisher: ReplicationEventPublishingHelper, clock: Arc<dyn Clock>) -> Self {
        Self {
            enabled,
            publisher,
            clock,
            streams: DashMap::new(),
        }
    }

    /// Route a source message to the matching transition.
    pub fn handle(&self, message: &ProtocolMessage) {
        if !self.enabled {
            return;
        }
        match message {
            ProtocolMessage::Record { record } => {
                self.mark_stream_as_running(&record.descriptor(), record.emitted_at);
            }
            ProtocolMessage::Trace { trace } => {
                if let Some(status) = trace.stream_status().filter(|s| s.is_rate_limited()) {
                    self.mark_stream_as_rate_limited(status, trace.emitted_at);
                }
            }
            _ => {}
        }
    }

    /// Enter backoff at `timestamp` (epoch ms).
    pub fn mark_stream_as_rate_limited(&self, status: &StreamStatusTrace, timestamp: i64) {
        if !self.enabled {
            return;
        }
        let quota_reset = status
            .reasons
            .first()
            .and_then(|r| r.rate_limited)
            .and_then(|r| r.quota_reset);
        let stream = &status.stream_descriptor;
        self.streams.insert(stream.clone(), timestamp);
        tracing::info!(stream = %stream, timestamp, quota_reset, "Stream is rate limited");
        self.publisher.publish_running_status_event(
            stream,
            MessageOrigin::Source,
            RunningReason::RateLimited { quota_reset },
            timestamp,
        );
    }

    /// Leave backoff if the stream is rate-limited. Returns the transition
    /// timestamp: the latest of the record's `emitted_at`, the current time,
    /// and the rate-limited timestamp.
    pub fn mark_stream_as_running(&self, stream: &StreamDescriptor, record_emitted_at: i64) -> Option<i64> {
        if !self.enabled {
            return None;
        }
        let (_, limited_at) = self.streams.remove(stream)?;
        let timestamp = record_emitted_at.max(self.clock.now_millis()).max(limited_at);
        tracing::info!(stream = %stream, timestamp, "Stream resumed after rate limit");
        self.publisher.publish_running_status_event(
            stream,
            MessageOrigin::Source,
            RunningReason::Resumed,
            timestamp,
        );
        Some(timestamp)
    }

    #[must_use]
    pub fn rate_limited_since(&self, stream: &StreamDescriptor) -> Option<i64> {
        self.streams.get(stream).map(|entry| *entry.value())
    }

    #[must_use]
    pub fn rate_limited_stream_count(&self) -> usize {
        self.streams.len()
    }
}
