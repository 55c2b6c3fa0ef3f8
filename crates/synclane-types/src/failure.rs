//! Failure reasons recorded during a sync attempt.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::StreamDescriptor;

/// Component a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureOrigin {
    Source,
    Destination,
    Replication,
    Persistence,
    Platform,
    Unknown,
}

impl FailureOrigin {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Destination => "destination",
            Self::Replication => "replication",
            Self::Persistence => "persistence",
            Self::Platform => "platform",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FailureOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure category surfaced to users and retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    ConfigError,
    SystemError,
    TransientError,
    HeartbeatTimeout,
    DestinationTimeout,
    ManualCancellation,
}

impl FailureType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfigError => "config_error",
            Self::SystemError => "system_error",
            Self::TransientError => "transient_error",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::DestinationTimeout => "destination_timeout",
            Self::ManualCancellation => "manual_cancellation",
        }
    }
}

/// One recorded failure.
///
/// `external_message` is shown to users; `internal_message` and `stacktrace`
/// carry diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReason {
    pub failure_origin: FailureOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_type: Option<FailureType>,
    pub external_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_descriptor: Option<StreamDescriptor>,
    /// Epoch milliseconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl FailureReason {
    #[must_use]
    pub fn new(origin: FailureOrigin, external_message: impl Into<String>, timestamp: i64) -> Self {
        Self {
            failure_origin: origin,
            failure_type: None,
            external_message: external_message.into(),
            internal_message: None,
            stacktrace: None,
            retryable: None,
            stream_descriptor: None,
            timestamp,
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_type(mut self, failure_type: FailureType) -> Self {
        self.failure_type = Some(failure_type);
        self
    }

    #[must_use]
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_stacktrace(mut self, stacktrace: impl Into<String>) -> Self {
        self.stacktrace = Some(stacktrace.into());
        self
    }

    #[must_use]
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    #[must_use]
    pub fn with_stream(mut self, descriptor: StreamDescriptor) -> Self {
        self.stream_descriptor = Some(descriptor);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
