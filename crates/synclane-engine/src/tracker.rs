//! Routes connector messages into the stats tracker and collects connector
//! error traces.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use synclane_types::{
    ErrorFailureType, FailureOrigin, FailureReason, FailureType, ProtocolMessage, RecordMessage, TraceMessage,
    TracePayload,
};

use crate::errors::Result;
use crate::stats::SyncStatsTracker;

pub const MAX_MESSAGE_LENGTH: usize = 50_000;
pub const MAX_STACKTRACE_LENGTH: usize = 100_000;

const TRUNCATION_NOTICE: &str = "Remainder truncated by the platform.";

#[derive(Debug)]
pub struct MessageTracker {
    stats: Arc<SyncStatsTracker>,
    source_errors: Mutex<Vec<TraceMessage>>,
    destination_errors: Mutex<Vec<TraceMessage>>,
}

impl MessageTracker {
    #[must_use]
    pub fn new(stats: Arc<SyncStatsTracker>) -> Self {
        Self {
            stats,
            source_errors: Mutex::new(Vec::new()),
            destination_errors: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn sync_stats_tracker(&self) -> &Arc<SyncStatsTracker> {
        &self.stats
    }

    /// # Errors
    ///
    /// Propagates checksum failures raised while tracking a source state.
    pub fn accept_from_source(&self, message: &ProtocolMessage) -> Result<()> {
        match message {
            ProtocolMessage::Record { record } => self.stats.update_stats(record),
            ProtocolMessage::State { state } => self.stats.update_source_states_stats(state)?,
            ProtocolMessage::Trace { trace } => self.handle_trace(trace, &self.source_errors),
            ProtocolMessage::Control { .. } | ProtocolMessage::Log { .. } => {}
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Propagates checksum failures raised while committing a destination
    /// state.
    pub fn accept_from_destination(&self, message: &ProtocolMessage) -> Result<()> {
        match message {
            ProtocolMessage::State { state } => self.stats.update_destination_state_stats(state)?,
            ProtocolMessage::Trace { trace } => self.handle_trace(trace, &self.destination_errors),
            ProtocolMessage::Record { .. } | ProtocolMessage::Control { .. } | ProtocolMessage::Log { .. } => {}
        }
        Ok(())
    }

    /// Count a source record that was dropped before reaching the
    /// destination.
    pub fn accept_filtered_from_source(&self, record: &RecordMessage) {
        self.stats.update_filtered_out_records_stats(record);
    }

    fn handle_trace(&self, trace: &TraceMessage, errors: &Mutex<Vec<TraceMessage>>) {
        match &trace.payload {
            TracePayload::Error { .. } => errors.lock().push(trace.clone()),
            TracePayload::Estimate { estimate } => self.stats.update_estimates(estimate),
            TracePayload::StreamStatus { .. } | TracePayload::Analytics { .. } => {}
        }
    }

    /// Failure reasons for every error trace seen, source first.
    #[must_use]
    pub fn error_trace_failures(&self, job_id: i64, attempt: u32) -> Vec<FailureReason> {
        let source = self.source_errors.lock();
        let destination = self.destination_errors.lock();
        source
            .iter()
            .map(|t| trace_failure(t, FailureOrigin::Source, "read", job_id, attempt))
            .chain(
                destination
                    .iter()
                    .map(|t| trace_failure(t, FailureOrigin::Destination, "write", job_id, attempt)),
            )
            .collect()
    }
}

fn trace_failure(
    trace: &TraceMessage,
    origin: FailureOrigin,
    command: &str,
    job_id: i64,
    attempt: u32,
) -> FailureReason {
    let TracePayload::Error { error } = &trace.payload else {
        return FailureReason::new(origin, "", trace.emitted_at);
    };
    let failure_type = match error.failure_type {
        Some(ErrorFailureType::ConfigError) => FailureType::ConfigError,
        Some(ErrorFailureType::TransientError) => FailureType::TransientError,
        Some(ErrorFailureType::SystemError) | None => FailureType::SystemError,
    };
    let mut reason = FailureReason::new(
        origin,
        truncate_with_notice(&error.message, MAX_MESSAGE_LENGTH),
        trace.emitted_at,
    )
    .with_type(failure_type)
    .with_metadata("jobId", Value::from(job_id))
    .with_metadata("attemptNumber", Value::from(attempt))
    .with_metadata("from_trace_message", Value::Bool(true))
    .with_metadata("connector_command", Value::from(command));
    if let Some(internal) = &error.internal_message {
        reason = reason.with_internal_message(truncate_with_notice(internal, MAX_MESSAGE_LENGTH));
    }
    if let Some(stack) = &error.stack_trace {
        reason = reason.with_stacktrace(truncate_with_notice(stack, MAX_STACKTRACE_LENGTH));
    }
    if let Some(desc) = &error.stream_descriptor {
        reason = reason.with_stream(desc.clone());
    }
    reason
}

/// Cap connector-provided text at `max_chars`, appending a notice when cut.
#[must_use]
pub fn truncate_with_notice(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(TRUNCATION_NOTICE.len() + 1);
    let mut out: String = text.chars().take(keep).collect();
    out.push(' ');
    out.push_str(TRUNCATION_NOTICE);
    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use synclane_types::{ErrorTrace, EstimateTrace, EstimateType, ReplicationContext, StateMessage, StreamDescriptor};

    use super::*;
    use crate::checksum::{DeploymentInfo, RecordingErrorReporter, StateChecksumCountEventHandler};
    use crate::clock::ManualClock;
    use crate::config::ReplicationFeatureFlags;

    fn tracker() -> MessageTracker {
        let checksum = StateChecksumCountEventHandler::new(
            ReplicationContext::default(),
            &ReplicationFeatureFlags::default(),
            DeploymentInfo::default(),
            None,
            Arc::new(RecordingErrorReporter::default()),
            Arc::new(ManualClock::at(0)),
        );
        MessageTracker::new(Arc::new(SyncStatsTracker::new(Arc::new(checksum))))
    }

    fn error_trace(message: &str, failure_type: Option<ErrorFailureType>, at: i64) -> ProtocolMessage {
        ProtocolMessage::Trace {
            trace: TraceMessage {
                emitted_at: at,
                payload: TracePayload::Error {
                    error: ErrorTrace {
                        message: message.into(),
                        internal_message: Some("internal".into()),
                        stack_trace: None,
                        failure_type,
                        stream_descriptor: Some(StreamDescriptor::new("users")),
                    },
                },
            },
        }
    }

    #[test]
    fn records_and_states_reach_stats() {
        let t = tracker();
        let users = StreamDescriptor::new("users");
        t.accept_from_source(&ProtocolMessage::record(&users, json!({"a": 1}), 0)).unwrap();
        t.accept_from_source(&ProtocolMessage::record(&users, json!({"a": 2}), 0)).unwrap();
        let mut state = StateMessage::for_stream(users.clone(), json!({})).with_source_count(2.0);
        state.id = Some(1);
        t.accept_from_source(&ProtocolMessage::state(state.clone())).unwrap();
        t.accept_from_destination(&ProtocolMessage::state(state.with_destination_count(2.0)))
            .unwrap();

        let stats = t.sync_stats_tracker();
        assert_eq!(stats.total_records_emitted(), 2);
        assert_eq!(stats.stream_to_committed_records()[&users], 2);
    }

    #[test]
    fn destination_records_are_ignored() {
        let t = tracker();
        t.accept_from_destination(&ProtocolMessage::record(&StreamDescriptor::new("users"), json!({}), 0))
            .unwrap();
        assert_eq!(t.sync_stats_tracker().total_records_emitted(), 0);
    }

    #[test]
    fn estimates_are_forwarded() {
        let t = tracker();
        t.accept_from_source(&ProtocolMessage::Trace {
            trace: TraceMessage {
                emitted_at: 0,
                payload: TracePayload::Estimate {
                    estimate: EstimateTrace {
                        name: String::new(),
                        namespace: None,
                        estimate_type: EstimateType::Sync,
                        row_estimate: Some(10),
                        byte_estimate: Some(100),
                    },
                },
            },
        })
        .unwrap();
        assert_eq!(t.sync_stats_tracker().total_stats(false).estimated_records, Some(10));
    }

    #[test]
    fn error_traces_become_failures() {
        let t = tracker();
        t.accept_from_source(&error_trace("bad creds", Some(ErrorFailureType::ConfigError), 5))
            .unwrap();
        t.accept_from_destination(&error_trace("disk full", None, 7)).unwrap();

        let failures = t.error_trace_failures(12, 3);
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].failure_origin, FailureOrigin::Source);
        assert_eq!(failures[0].failure_type, Some(FailureType::ConfigError));
        assert_eq!(failures[0].external_message, "bad creds");
        assert_eq!(failures[0].timestamp, 5);
        assert_eq!(failures[0].metadata["jobId"], json!(12));
        assert_eq!(failures[0].metadata["connector_command"], json!("read"));
        assert_eq!(failures[1].failure_origin, FailureOrigin::Destination);
        assert_eq!(failures[1].failure_type, Some(FailureType::SystemError));
        assert_eq!(failures[1].stream_descriptor, Some(StreamDescriptor::new("users")));
    }

    #[test]
    fn long_messages_are_truncated() {
        let long = "x".repeat(200);
        let out = truncate_with_notice(&long, 100);
        assert_eq!(out.chars().count(), 100);
        assert!(out.ends_with(TRUNCATION_NOTICE));
        assert_eq!(truncate_with_notice("short", 100), "short");
    }
}
