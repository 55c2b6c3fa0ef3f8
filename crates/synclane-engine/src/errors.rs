//! Replication error model and failure-reason classification.

use std::time::Duration;

use synclane_state::StateError;
use synclane_types::{FailureOrigin, FailureReason, FailureType, StreamDescriptor};

// ---------------------------------------------------------------------------
// ReplicationError
// ---------------------------------------------------------------------------

/// Every way a replication attempt can fail.
///
/// `Source` and `Destination` wrap opaque connector-process failures;
/// `HeartbeatTimeout` and `DestinationTimeout` are the liveness failures
/// that map to their own failure categories.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("source process failed: {0:#}")]
    Source(anyhow::Error),

    #[error("destination process failed: {0:#}")]
    Destination(anyhow::Error),

    #[error(
        "source heartbeat timed out: last message {}s ago, threshold {}s",
        time_since_last_beat.as_secs(),
        threshold.as_secs()
    )]
    HeartbeatTimeout {
        threshold: Duration,
        time_since_last_beat: Duration,
    },

    #[error(
        "destination timed out: call in flight for {}s, threshold {}s",
        elapsed.as_secs(),
        threshold.as_secs()
    )]
    DestinationTimeout { threshold: Duration, elapsed: Duration },

    #[error("{0}")]
    InvalidChecksum(String),

    #[error("workload heartbeat failed: {0}")]
    WorkloadHeartbeat(String),

    #[error("stream status tracked for a stream outside the catalog: {0}")]
    UnknownStream(StreamDescriptor),

    #[error("checkpoint persistence failed: {0}")]
    Persistence(#[from] StateError),

    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, ReplicationError>;

impl ReplicationError {
    /// Classify this error as a user-facing [`FailureReason`].
    #[must_use]
    pub fn failure_reason(&self, timestamp: i64) -> FailureReason {
        let reason = match self {
            Self::Source(_) => FailureReason::new(
                FailureOrigin::Source,
                "Something went wrong within the source connector",
                timestamp,
            )
            .with_type(FailureType::SystemError),
            Self::Destination(_) => FailureReason::new(
                FailureOrigin::Destination,
                "Something went wrong within the destination connector",
                timestamp,
            )
            .with_type(FailureType::SystemError),
            Self::HeartbeatTimeout {
                threshold,
                time_since_last_beat,
            } => FailureReason::new(
                FailureOrigin::Source,
                format!(
                    "The source did not send any records in the last {} seconds, exceeding the configured {} seconds threshold",
                    time_since_last_beat.as_secs(),
                    threshold.as_secs()
                ),
                timestamp,
            )
            .with_type(FailureType::HeartbeatTimeout),
            Self::DestinationTimeout { threshold, elapsed } => FailureReason::new(
                FailureOrigin::Destination,
                format!(
                    "The destination did not make progress in the last {} minutes, exceeding the configured {} minutes threshold",
                    elapsed.as_secs() / 60,
                    threshold.as_secs() / 60
                ),
                timestamp,
            )
            .with_type(FailureType::DestinationTimeout),
            Self::WorkloadHeartbeat(_) => FailureReason::new(
                FailureOrigin::Platform,
                "Workload heartbeat error",
                timestamp,
            )
            .with_type(FailureType::TransientError)
            .with_retryable(true),
            Self::Persistence(_) => FailureReason::new(
                FailureOrigin::Persistence,
                "Something went wrong while persisting sync state",
                timestamp,
            )
            .with_type(FailureType::SystemError),
            Self::InvalidChecksum(_) | Self::UnknownStream(_) | Self::Internal(_) => {
                FailureReason::new(
                    FailureOrigin::Replication,
                    "Something went wrong during replication",
                    timestamp,
                )
                .with_type(FailureType::SystemError)
            }
        };
        let reason = reason
            .with_internal_message(self.to_string())
            .with_stacktrace(format!("{self:?}"));
        match self {
            Self::UnknownStream(desc) => reason.with_stream(desc.clone()),
            _ => reason,
        }
    }
}
