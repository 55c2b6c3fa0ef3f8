//! Protocol messages exchanged with source and destination connectors.
//!
//! A [`ProtocolMessage`] is a tagged union serialized as
//! `{"type": "RECORD", "record": {...}}`. Trace messages carry a second tag
//! (`STREAM_STATUS`, `ANALYTICS`, `ERROR`, `ESTIMATE`) flattened next to
//! their `emitted_at` timestamp.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Stream identity
// ---------------------------------------------------------------------------

/// `(namespace, name)` pair identifying one logical stream within a sync.
///
/// The default value (empty name, no namespace) is the wildcard descriptor
/// used for sync-wide status events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl StreamDescriptor {
    /// Descriptor for a stream without a namespace.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }

    /// Set the namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Sync-wide wildcard descriptor.
    #[must_use]
    pub fn wildcard() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.name.is_empty() && self.namespace.is_none()
    }
}

impl std::fmt::Display for StreamDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Which side of the pipeline produced (or is validating) a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageOrigin {
    Source,
    Destination,
    Internal,
}

impl MessageOrigin {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Source => "SOURCE",
            Self::Destination => "DESTINATION",
            Self::Internal => "INTERNAL",
        }
    }

    /// Capitalized label used in human-readable log lines.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Source => "Source",
            Self::Destination => "Destination",
            Self::Internal => "Internal",
        }
    }
}

impl std::fmt::Display for MessageOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A single data record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMessage {
    pub stream: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub data: Value,
    /// Epoch milliseconds at which the connector emitted the record.
    pub emitted_at: i64,
}

impl RecordMessage {
    #[must_use]
    pub fn descriptor(&self) -> StreamDescriptor {
        StreamDescriptor {
            name: self.stream.clone(),
            namespace: self.namespace.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// State checkpoints
// ---------------------------------------------------------------------------

/// Checkpoint granularity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateType {
    Global,
    Stream,
    #[default]
    Legacy,
}

impl StateType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "GLOBAL",
            Self::Stream => "STREAM",
            Self::Legacy => "LEGACY",
        }
    }
}

/// Per-stream portion of a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamState {
    pub stream_descriptor: StreamDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_state: Option<Value>,
}

/// Checkpoint spanning every stream of a sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_state: Option<Value>,
    #[serde(default)]
    pub stream_states: Vec<StreamState>,
}

/// Record counts reported alongside a checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StateStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_count: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_record_count: Option<f64>,
}

impl StateStats {
    #[must_use]
    pub fn with_record_count(count: f64) -> Self {
        Self {
            record_count: Some(count),
            rejected_record_count: None,
        }
    }
}

/// A checkpoint emitted by a source and echoed back by the destination once
/// every record before it has been committed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateMessage {
    #[serde(rename = "type", default)]
    pub state_type: StateType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<GlobalState>,
    /// Opaque payload of legacy checkpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_stats: Option<StateStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_stats: Option<StateStats>,
    /// Stats-tracking id attached by the pipeline before forwarding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl StateMessage {
    /// Per-stream checkpoint.
    #[must_use]
    pub fn for_stream(descriptor: StreamDescriptor, state: Value) -> Self {
        Self {
            state_type: StateType::Stream,
            stream: Some(StreamState {
                stream_descriptor: descriptor,
                stream_state: Some(state),
            }),
            ..Self::default()
        }
    }

    /// Sync-wide checkpoint covering `streams`.
    #[must_use]
    pub fn global(shared_state: Value, streams: Vec<StreamState>) -> Self {
        Self {
            state_type: StateType::Global,
            global: Some(GlobalState {
                shared_state: Some(shared_state),
                stream_states: streams,
            }),
            ..Self::default()
        }
    }

    /// Legacy checkpoint carrying only an opaque blob.
    #[must_use]
    pub fn legacy(data: Value) -> Self {
        Self {
            state_type: StateType::Legacy,
            data: Some(data),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_source_count(mut self, count: f64) -> Self {
        self.source_stats = Some(StateStats::with_record_count(count));
        self
    }

    #[must_use]
    pub fn with_destination_count(mut self, count: f64) -> Self {
        self.destination_stats = Some(StateStats::with_record_count(count));
        self
    }

    /// Stream covered by a STREAM checkpoint.
    #[must_use]
    pub fn stream_descriptor(&self) -> Option<&StreamDescriptor> {
        self.stream.as_ref().map(|s| &s.stream_descriptor)
    }

    #[must_use]
    pub fn source_record_count(&self) -> Option<f64> {
        self.source_stats.and_then(|s| s.record_count)
    }

    #[must_use]
    pub fn destination_record_count(&self) -> Option<f64> {
        self.destination_stats.and_then(|s| s.record_count)
    }
}

// ---------------------------------------------------------------------------
// Traces
// ---------------------------------------------------------------------------

/// Lifecycle status of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamStatus {
    Started,
    Running,
    Complete,
    Incomplete,
}

impl StreamStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Running => "RUNNING",
            Self::Complete => "COMPLETE",
            Self::Incomplete => "INCOMPLETE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamStatusReasonType {
    RateLimited,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitedReason {
    /// Epoch milliseconds at which the upstream quota resets, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_reset: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStatusReason {
    #[serde(rename = "type")]
    pub reason_type: StreamStatusReasonType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limited: Option<RateLimitedReason>,
}

impl StreamStatusReason {
    #[must_use]
    pub fn rate_limited(quota_reset: Option<i64>) -> Self {
        Self {
            reason_type: StreamStatusReasonType::RateLimited,
            rate_limited: Some(RateLimitedReason { quota_reset }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStatusTrace {
    pub stream_descriptor: StreamDescriptor,
    pub status: StreamStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<StreamStatusReason>,
}

impl StreamStatusTrace {
    /// True when the trace carries exactly one reason and it is `RATE_LIMITED`.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self.reasons.as_slice(),
            [reason] if reason.reason_type == StreamStatusReasonType::RateLimited
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsTrace {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorFailureType {
    SystemError,
    ConfigError,
    TransientError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorTrace {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_type: Option<ErrorFailureType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_descriptor: Option<StreamDescriptor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EstimateType {
    Stream,
    Sync,
}

/// Connector-provided size estimate for a stream or the whole sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstimateTrace {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(rename = "type")]
    pub estimate_type: EstimateType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_estimate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_estimate: Option<u64>,
}

/// Second-level tag of a trace message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TracePayload {
    StreamStatus { stream_status: StreamStatusTrace },
    Analytics { analytics: AnalyticsTrace },
    Error { error: ErrorTrace },
    Estimate { estimate: EstimateTrace },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceMessage {
    pub emitted_at: i64,
    #[serde(flatten)]
    pub payload: TracePayload,
}

impl TraceMessage {
    #[must_use]
    pub fn stream_status(&self) -> Option<&StreamStatusTrace> {
        match &self.payload {
            TracePayload::StreamStatus { stream_status } => Some(stream_status),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Control and log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlType {
    ConnectorConfig,
}

/// Out-of-band instruction from a connector to the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub emitted_at: i64,
    #[serde(rename = "type")]
    pub kind: ControlType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector_config: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub level: LogLevel,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Any message a connector can emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolMessage {
    Record { record: RecordMessage },
    State { state: StateMessage },
    Trace { trace: TraceMessage },
    Control { control: ControlMessage },
    Log { log: LogMessage },
}

impl ProtocolMessage {
    #[must_use]
    pub fn record(descriptor: &StreamDescriptor, data: Value, emitted_at: i64) -> Self {
        Self::Record {
            record: RecordMessage {
                stream: descriptor.name.clone(),
                namespace: descriptor.namespace.clone(),
                data,
                emitted_at,
            },
        }
    }

    #[must_use]
    pub fn state(state: StateMessage) -> Self {
        Self::State { state }
    }

    #[must_use]
    pub fn stream_status(
        descriptor: StreamDescriptor,
        status: StreamStatus,
        reasons: Vec<StreamStatusReason>,
        emitted_at: i64,
    ) -> Self {
        Self::Trace {
            trace: TraceMessage {
                emitted_at,
                payload: TracePayload::StreamStatus {
                    stream_status: StreamStatusTrace {
                        stream_descriptor: descriptor,
                        status,
                        reasons,
                    },
                },
            },
        }
    }

    /// Upper-case wire tag, used as a log field.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Record { .. } => "RECORD",
            Self::State { .. } => "STATE",
            Self::Trace { .. } => "TRACE",
            Self::Control { .. } => "CONTROL",
            Self::Log { .. } => "LOG",
        }
    }

    #[must_use]
    pub fn as_record(&self) -> Option<&RecordMessage> {
        match self {
            Self::Record { record } => Some(record),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_state(&self) -> Option<&StateMessage> {
        match self {
            Self::State { state } => Some(state),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_trace(&self) -> Option<&TraceMessage> {
        match self {
            Self::Trace { trace } => Some(trace),
            _ => None,
        }
    }

    /// Stream-status payload, if this is a `TRACE/STREAM_STATUS` message.
    #[must_use]
    pub fn as_stream_status(&self) -> Option<&StreamStatusTrace> {
        self.as_trace().and_then(TraceMessage::stream_status)
    }

    #[must_use]
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Control { .. })
    }

    #[must_use]
    pub fn is_analytics(&self) -> bool {
        matches!(
            self,
            Self::Trace {
                trace: TraceMessage {
                    payload: TracePayload::Analytics { .. },
                    ..
                }
            }
        )
    }

    /// Control messages and stream-status traces are forwarded to the
    /// event bus.
    #[must_use]
    pub fn should_publish(&self) -> bool {
        self.is_control() || self.as_stream_status().is_some()
    }

    /// Stream this message refers to, when it refers to exactly one.
    #[must_use]
    pub fn stream_descriptor(&self) -> Option<StreamDescriptor> {
        match self {
            Self::Record { record } => Some(record.descriptor()),
            Self::State { state } => state.stream_descriptor().cloned(),
            Self::Trace { trace } => match &trace.payload {
                TracePayload::StreamStatus { stream_status } => {
                    Some(stream_status.stream_descriptor.clone())
                }
                TracePayload::Error { error } => error.stream_descriptor.clone(),
                TracePayload::Estimate { estimate } if estimate.estimate_type == EstimateType::Stream => {
                    Some(StreamDescriptor {
                        name: estimate.name.clone(),
                        namespace: estimate.namespace.clone(),
                    })
                }
                _ => None,
            },
            Self::Control { .. } | Self::Log { .. } => None,
        }
    }
}
