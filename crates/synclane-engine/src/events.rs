//! Replication status events and the publishing seam.

use std::sync::Arc;

use parking_lot::Mutex;
use synclane_types::{MessageOrigin, ProtocolMessage, ReplicationContext, StreamDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncompleteRunCause {
    Failed,
    Canceled,
}

impl IncompleteRunCause {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

/// Why a stream entered (or re-entered) the running state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningReason {
    Resumed,
    RateLimited { quota_reset: Option<i64> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationEvent {
    /// A connector message forwarded as-is.
    Status {
        origin: MessageOrigin,
        message: ProtocolMessage,
    },
    Running {
        stream: StreamDescriptor,
        origin: MessageOrigin,
        reason: RunningReason,
        /// Epoch milliseconds of the transition.
        timestamp: i64,
    },
    Complete {
        stream: StreamDescriptor,
        origin: MessageOrigin,
    },
    Incomplete {
        stream: StreamDescriptor,
        origin: MessageOrigin,
        cause: IncompleteRunCause,
    },
}

impl ReplicationEvent {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Running { .. } => "running",
            Self::Complete { .. } => "complete",
            Self::Incomplete { .. } => "incomplete",
        }
    }
}

/// External event bus. Publishing is fire-and-forget.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, ctx: &ReplicationContext, event: ReplicationEvent);
}

/// Publisher that writes every event to the log.
#[derive(Debug, Default)]
pub struct TracingEventPublisher;

impl EventPublisher for TracingEventPublisher {
    fn publish(&self, ctx: &ReplicationContext, event: ReplicationEvent) {
        match &event {
            ReplicationEvent::Status { origin, message } => tracing::debug!(
                connection_id = %ctx.connection_id,
                origin = %origin,
                message_type = message.kind(),
                "Status event"
            ),
            ReplicationEvent::Running {
                stream,
                reason,
                timestamp,
                ..
            } => tracing::info!(
                connection_id = %ctx.connection_id,
                stream = %stream,
                reason = ?reason,
                timestamp,
                "Stream running"
            ),
            ReplicationEvent::Complete { stream, origin } => tracing::info!(
                connection_id = %ctx.connection_id,
                stream = %stream,
                origin = %origin,
                "Stream complete"
            ),
            ReplicationEvent::Incomplete {
                stream,
                origin,
                cause,
            } => tracing::info!(
                connection_id = %ctx.connection_id,
                stream = %stream,
                origin = %origin,
                cause = cause.as_str(),
                "Stream incomplete"
            ),
        }
    }
}

/// Publisher that keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<ReplicationEvent>>,
}

impl RecordingEventPublisher {
    #[must_use]
    pub fn events(&self) -> Vec<ReplicationEvent> {
        self.events.lock().clone()
    }
}

impl EventPublisher for RecordingEventPublisher {
    fn publish(&self, _ctx: &ReplicationContext, event: ReplicationEvent) {
        self.events.lock().push(event);
    }
}

/// Binds a publisher to the sync's context.
#[derive(Clone)]
pub struct ReplicationEventPublishingHelper {
    publisher: Arc<dyn EventPublisher>,
    ctx: Arc<ReplicationContext>,
}

impl std::fmt::Debug for ReplicationEventPublishingHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationEventPublishingHelper")
            .field("connection_id", &self.ctx.connection_id)
            .finish_non_exhaustive()
    }
}

impl ReplicationEventPublishingHelper {
    #[must_use]
    pub fn new(publisher: Arc<dyn EventPublisher>, ctx: Arc<ReplicationContext>) -> Self {
        Self { publisher, ctx }
    }

    pub fn publish_status_event(&self, origin: MessageOrigin, message: &ProtocolMessage) {
        self.publisher.publish(
            &self.ctx,
            ReplicationEvent::Status {
                origin,
                message: message.clone(),
            },
        );
    }

    pub fn publish_running_status_event(
        &self,
        stream: &StreamDescriptor,
        origin: MessageOrigin,
        reason: RunningReason,
        timestamp: i64,
    ) {
        self.publisher.publish(
            &self.ctx,
            ReplicationEvent::Running {
                stream: stream.clone(),
                origin,
                reason,
                timestamp,
            },
        );
    }

    pub fn publish_complete_status_event(&self, stream: &StreamDescriptor, origin: MessageOrigin) {
        self.publisher.publish(
            &self.ctx,
            ReplicationEvent::Complete {
                stream: stream.clone(),
                origin,
            },
        );
    }

    pub fn publish_incomplete_status_event(
        &self,
        stream: &StreamDescriptor,
        origin: MessageOrigin,
        cause: IncompleteRunCause,
    ) {
        self.publisher.publish(
            &self.ctx,
            ReplicationEvent::Incomplete {
                stream: stream.clone(),
                origin,
                cause,
            },
        );
    }
}
