//! Cross-checking of checkpoint record counts.
//!
//! Every STREAM or GLOBAL checkpoint may carry up to three independent
//! record counts: the count the source reported, the count the destination
//! reported when acknowledging it, and the count the platform observed
//! passing through. [`StateChecksumCountEventHandler`] compares whichever
//! counts are present, emits capped telemetry events, and optionally fails
//! the sync when they disagree.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use synclane_types::{
    FailureOrigin, MessageOrigin, ReplicationContext, StateMessage, StateType, StreamDescriptor,
};
use uuid::Uuid;

use crate::checkpoint::{state_hash, stats_tracking_id};
use crate::clock::Clock;
use crate::config::ReplicationFeatureFlags;
use crate::errors::{ReplicationError, Result};

const MAX_MISSING_EVENTS: usize = 25;
const MAX_MISMATCH_EVENTS: usize = 25;
const MAX_SUCCESS_EVENTS: usize = 3;

const DROPPED_RECORDS_SUMMARY: &str = "The sync appears to have dropped records";

// ---------------------------------------------------------------------------
// Telemetry payloads and collaborators
// ---------------------------------------------------------------------------

/// Identity of the deployment running the sync, stamped on every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentInfo {
    #[serde(default)]
    pub deployment_id: Uuid,
    #[serde(default = "default_deployment_mode")]
    pub deployment_mode: String,
    #[serde(default = "default_deployment_version")]
    pub deployment_version: String,
    #[serde(default)]
    pub tracking_email: Option<String>,
}

fn default_deployment_mode() -> String {
    "oss".to_string()
}

fn default_deployment_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl Default for DeploymentInfo {
    fn default() -> Self {
        Self {
            deployment_id: Uuid::nil(),
            deployment_mode: default_deployment_mode(),
            deployment_version: default_deployment_version(),
            tracking_email: None,
        }
    }
}

/// One telemetry row describing a count observed for a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChecksumCountEvent {
    pub deployment_version: String,
    pub attempt_number: u32,
    pub connection_id: String,
    pub deployment_id: String,
    pub deployment_mode: String,
    pub email: Option<String>,
    pub id: String,
    pub job_id: i64,
    pub record_count: i64,
    pub state_hash: String,
    pub state_id: String,
    pub state_origin: String,
    pub state_type: String,
    pub stream_name: Option<String>,
    pub stream_namespace: Option<String>,
    /// Epoch microseconds.
    pub timestamp: i64,
    pub valid_data: bool,
}

/// Telemetry bucket; each bucket has its own cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumEventType {
    Success,
    Missing,
    Mismatch,
}

impl ChecksumEventType {
    fn cap(self) -> usize {
        match self {
            Self::Success => MAX_SUCCESS_EVENTS,
            Self::Missing => MAX_MISSING_EVENTS,
            Self::Mismatch => MAX_MISMATCH_EVENTS,
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Success => 0,
            Self::Missing => 1,
            Self::Mismatch => 2,
        }
    }
}

/// Sink for checksum telemetry.
pub trait ChecksumEventWriter: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the events could not be published. The handler
    /// logs and drops it.
    fn publish_events(&self, events: &[StateChecksumCountEvent]) -> anyhow::Result<()>;

    fn close(&self) {}
}

/// Non-fatal checksum mismatch handed to the error reporter.
#[derive(Debug)]
pub struct ChecksumErrorReport<'a> {
    pub workspace_id: Uuid,
    pub connection_id: Uuid,
    pub job_id: i64,
    pub attempt: u32,
    pub origin: FailureOrigin,
    pub message: &'a str,
    pub summary: &'a str,
    pub state: &'a StateMessage,
}

/// External error-reporting collaborator.
pub trait StateChecksumErrorReporter: Send + Sync {
    fn report_error(&self, report: &ChecksumErrorReport<'_>);
}

/// Reporter that only logs.
#[derive(Debug, Default)]
pub struct TracingErrorReporter;

impl StateChecksumErrorReporter for TracingErrorReporter {
    fn report_error(&self, report: &ChecksumErrorReport<'_>) {
        tracing::warn!(
            connection_id = %report.connection_id,
            job_id = report.job_id,
            attempt = report.attempt,
            origin = %report.origin,
            summary = report.summary,
            "{}",
            report.message
        );
    }
}

/// Writer that keeps every published event in memory.
#[derive(Debug, Default)]
pub struct RecordingChecksumEventWriter {
    events: Mutex<Vec<StateChecksumCountEvent>>,
    closes: AtomicUsize,
}

impl RecordingChecksumEventWriter {
    #[must_use]
    pub fn events(&self) -> Vec<StateChecksumCountEvent> {
        self.events.lock().clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }

    #[must_use]
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl ChecksumEventWriter for RecordingChecksumEventWriter {
    fn publish_events(&self, events: &[StateChecksumCountEvent]) -> anyhow::Result<()> {
        self.events.lock().extend_from_slice(events);
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Reporter that keeps every report's origin and message in memory.
#[derive(Debug, Default)]
pub struct RecordingErrorReporter {
    reports: Mutex<Vec<(FailureOrigin, String)>>,
}

impl RecordingErrorReporter {
    #[must_use]
    pub fn reports(&self) -> Vec<(FailureOrigin, String)> {
        self.reports.lock().clone()
    }
}

impl StateChecksumErrorReporter for RecordingErrorReporter {
    fn report_error(&self, report: &ChecksumErrorReport<'_>) {
        self.reports
            .lock()
            .push((report.origin, report.message.to_string()));
    }
}

// ---------------------------------------------------------------------------
// Validation request
// ---------------------------------------------------------------------------

/// Inputs for validating one checkpoint.
#[derive(Debug, Clone, Copy)]
pub struct ChecksumCheck<'a> {
    pub state: &'a StateMessage,
    pub platform_record_count: f64,
    pub origin: MessageOrigin,
    /// False once a state-id collision made platform counts unreliable.
    pub checksum_validation_enabled: bool,
    pub include_stream_in_logs: bool,
    pub stream_platform_record_counts: Option<&'a BTreeMap<StreamDescriptor, u64>>,
    pub filtered_out_records: f64,
}

impl<'a> ChecksumCheck<'a> {
    #[must_use]
    pub fn new(state: &'a StateMessage, platform_record_count: f64, origin: MessageOrigin) -> Self {
        Self {
            state,
            platform_record_count,
            origin,
            checksum_validation_enabled: true,
            include_stream_in_logs: true,
            stream_platform_record_counts: None,
            filtered_out_records: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

pub struct StateChecksumCountEventHandler {
    ctx: ReplicationContext,
    deployment: DeploymentInfo,
    emit_events: bool,
    fail_on_invalid_checksum: bool,
    log_state_messages: bool,
    writer: Option<Arc<dyn ChecksumEventWriter>>,
    reporter: Arc<dyn StateChecksumErrorReporter>,
    clock: Arc<dyn Clock>,
    id_supplier: Box<dyn Fn() -> Uuid + Send + Sync>,
    no_checksum_error: AtomicBool,
    source_state_seen: AtomicBool,
    destination_state_seen: AtomicBool,
    closed: AtomicBool,
    emitted: [AtomicUsize; 3],
}

impl std::fmt::Debug for StateChecksumCountEventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateChecksumCountEventHandler")
            .field("connection_id", &self.ctx.connection_id)
            .field("emit_events", &self.emit_events)
            .field("fail_on_invalid_checksum", &self.fail_on_invalid_checksum)
            .field("no_checksum_error", &self.no_checksum_error)
            .finish_non_exhaustive()
    }
}

impl StateChecksumCountEventHandler {
    #[must_use]
    pub fn new(
        ctx: ReplicationContext,
        flags: &ReplicationFeatureFlags,
        deployment: DeploymentInfo,
        writer: Option<Arc<dyn ChecksumEventWriter>>,
        reporter: Arc<dyn StateChecksumErrorReporter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ctx,
            deployment,
            emit_events: flags.emit_state_checksum_events,
            fail_on_invalid_checksum: flags.fail_sync_on_invalid_checksum,
            log_state_messages: flags.log_state_messages,
            writer,
            reporter,
            clock,
            id_supplier: Box::new(Uuid::new_v4),
            no_checksum_error: AtomicBool::new(true),
            source_state_seen: AtomicBool::new(false),
            destination_state_seen: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            emitted: [AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0)],
        }
    }

    /// Replace the event-id generator.
    #[must_use]
    pub fn with_id_supplier(mut self, supplier: impl Fn() -> Uuid + Send + Sync + 'static) -> Self {
        self.id_supplier = Box::new(supplier);
        self
    }

    /// True until any checkpoint fails or lacks a count.
    #[must_use]
    pub fn no_checksum_error(&self) -> bool {
        self.no_checksum_error.load(Ordering::SeqCst)
    }

    /// Compare the counts available on `check.state`.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::InvalidChecksum`] when counts disagree,
    /// failing on invalid checksums is enabled, and the platform counts are
    /// reliable.
    pub fn validate_state_checksum(&self, check: &ChecksumCheck<'_>) -> Result<()> {
        let state = check.state;
        if !matches!(state.state_type, StateType::Stream | StateType::Global) {
            return Ok(());
        }
        self.mark_state_seen(check.origin);

        let stats = match check.origin {
            MessageOrigin::Source => state.source_stats,
            MessageOrigin::Destination => state.destination_stats,
            MessageOrigin::Internal => None,
        };
        let platform = check.platform_record_count;
        let valid_data = check.checksum_validation_enabled;

        let Some(stats) = stats else {
            if check.origin == MessageOrigin::Destination {
                match state.source_stats {
                    Some(source_stats) => self.destination_missing_source_present(
                        source_stats.record_count.unwrap_or(0.0),
                        platform,
                        state,
                        valid_data,
                    ),
                    None => self.source_and_destination_missing(platform, state, valid_data),
                }
            }
            return Ok(());
        };
        let Some(state_count) = stats.record_count else {
            return Ok(());
        };

        if check.origin != MessageOrigin::Destination {
            if (state_count - platform).abs() > f64::EPSILON {
                return self.state_and_platform_mismatch(check, state_count);
            }
            self.checksum_is_valid(check);
            return Ok(());
        }

        let destination_total = state_count + stats.rejected_record_count.unwrap_or(0.0);
        match state.source_stats {
            Some(source_stats) => {
                let Some(source) = source_stats.record_count else {
                    return Ok(());
                };
                let filtered = check.filtered_out_records;
                let counts_differ = |a: f64| (a - filtered - destination_total).abs() > f64::EPSILON;
                if counts_differ(source) || counts_differ(platform) {
                    self.mismatch_all_three_present(check, source, destination_total)
                } else {
                    self.checksum_is_valid(check);
                    Ok(())
                }
            }
            None => {
                let result = if (platform - destination_total).abs() > f64::EPSILON {
                    self.state_and_platform_mismatch(check, destination_total)
                } else {
                    Ok(())
                };
                self.source_missing_destination_present(destination_total, platform, state, valid_data);
                result
            }
        }
    }

    /// Emit the sync-level success triple (at most once) when the sync
    /// completed, both sides checkpointed, and no checkpoint ever failed.
    pub fn close(&self, completed_successfully: bool) {
        tracing::info!("Closing state checksum handler");
        if completed_successfully
            && !self.closed.load(Ordering::SeqCst)
            && self.source_state_seen.load(Ordering::SeqCst)
            && self.destination_state_seen.load(Ordering::SeqCst)
            && self.no_checksum_error()
        {
            tracing::info!("No checksum errors were reported in the entire sync");
            let dummy = dummy_state();
            let events = [MessageOrigin::Source, MessageOrigin::Internal, MessageOrigin::Destination]
                .into_iter()
                .map(|origin| self.event(1.0, &dummy, origin, true))
                .collect::<Vec<_>>();
            self.track_events(&events, ChecksumEventType::Success);
            self.closed.store(true, Ordering::SeqCst);
        }
        if let Some(writer) = &self.writer {
            writer.close();
        }
    }

    // -- outcomes -----------------------------------------------------------

    fn mark_state_seen(&self, origin: MessageOrigin) {
        match origin {
            MessageOrigin::Source => self.source_state_seen.store(true, Ordering::SeqCst),
            MessageOrigin::Destination => self.destination_state_seen.store(true, Ordering::SeqCst),
            MessageOrigin::Internal => {}
        }
    }

    fn source_and_destination_missing(&self, platform: f64, state: &StateMessage, valid: bool) {
        self.no_checksum_error.store(false, Ordering::SeqCst);
        let events = [self.event(platform, state, MessageOrigin::Internal, valid)];
        self.track_events(&events, ChecksumEventType::Missing);
    }

    fn destination_missing_source_present(&self, source: f64, platform: f64, state: &StateMessage, valid: bool) {
        self.no_checksum_error.store(false, Ordering::SeqCst);
        let events = [
            self.event(source, state, MessageOrigin::Source, valid),
            self.event(platform, state, MessageOrigin::Internal, valid),
        ];
        self.track_events(&events, ChecksumEventType::Missing);
    }

    fn source_missing_destination_present(&self, destination: f64, platform: f64, state: &StateMessage, valid: bool) {
        self.no_checksum_error.store(false, Ordering::SeqCst);
        let events = [
            self.event(platform, state, MessageOrigin::Internal, valid),
            self.event(destination, state, MessageOrigin::Destination, valid),
        ];
        self.track_events(&events, ChecksumEventType::Missing);
    }

    fn mismatch_all_three_present(&self, check: &ChecksumCheck<'_>, source: f64, destination: f64) -> Result<()> {
        self.no_checksum_error.store(false, Ordering::SeqCst);
        let valid = check.checksum_validation_enabled;
        let events = [
            self.event(source, check.state, MessageOrigin::Source, valid),
            self.event(check.platform_record_count, check.state, MessageOrigin::Internal, valid),
            self.event(destination, check.state, MessageOrigin::Destination, valid),
        ];
        self.track_events(&events, ChecksumEventType::Mismatch);

        let message = format!(
            "{} state message checksum is invalid: source record count {source:?} , destination record count {destination:?} and platform record count {:?} does not equal each other{}{}",
            check.origin.label(),
            check.platform_record_count,
            stream_suffix(check.include_stream_in_logs, check.state),
            collision_suffix(valid),
        );
        self.log_and_fail_if_required(&message, check)
    }

    fn state_and_platform_mismatch(&self, check: &ChecksumCheck<'_>, state_count: f64) -> Result<()> {
        self.no_checksum_error.store(false, Ordering::SeqCst);
        let mut message = format!(
            "{} state message checksum is invalid: state record count {state_count:?} does not equal platform tracked record count {:?}{}{}",
            check.origin.label(),
            check.platform_record_count,
            stream_suffix(check.include_stream_in_logs, check.state),
            collision_suffix(check.checksum_validation_enabled),
        );
        if check.include_stream_in_logs {
            let per_stream = check
                .stream_platform_record_counts
                .map(|counts| {
                    counts
                        .iter()
                        .map(|(desc, count)| format!(" {desc} : {count}"))
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            message.push_str(" Observed the following record counts per stream: \n");
            message.push_str(&per_stream);
        }
        self.log_and_fail_if_required(&message, check)
    }

    fn checksum_is_valid(&self, check: &ChecksumCheck<'_>) {
        let include_stream = check.include_stream_in_logs || self.log_state_messages;
        tracing::debug!(
            "{} state message checksum is valid{}{}",
            check.origin.label(),
            stream_suffix(include_stream, check.state),
            collision_suffix(check.checksum_validation_enabled),
        );
    }

    fn log_and_fail_if_required(&self, message: &str, check: &ChecksumCheck<'_>) -> Result<()> {
        tracing::error!("{message}");
        tracing::error!(
            state = %serde_json::to_string(check.state).unwrap_or_default(),
            "Raw state message with bad count"
        );
        let valid = check.checksum_validation_enabled;
        if self.fail_on_invalid_checksum && valid {
            return Err(ReplicationError::InvalidChecksum(message.to_string()));
        }
        if valid {
            let origin = match check.origin {
                MessageOrigin::Source => FailureOrigin::Source,
                MessageOrigin::Destination => FailureOrigin::Destination,
                MessageOrigin::Internal => FailureOrigin::Platform,
            };
            self.reporter.report_error(&ChecksumErrorReport {
                workspace_id: self.ctx.workspace_id,
                connection_id: self.ctx.connection_id,
                job_id: self.ctx.job_id,
                attempt: self.ctx.attempt,
                origin,
                message,
                summary: DROPPED_RECORDS_SUMMARY,
                state: check.state,
            });
        }
        Ok(())
    }

    // -- telemetry ----------------------------------------------------------

    fn track_events(&self, events: &[StateChecksumCountEvent], event_type: ChecksumEventType) {
        if !self.emit_events {
            return;
        }
        let counter = &self.emitted[event_type.index()];
        if counter.load(Ordering::SeqCst) > event_type.cap() {
            return;
        }
        if let Some(writer) = &self.writer {
            if let Err(e) = writer.publish_events(events) {
                tracing::error!(error = %e, "Failed to emit state checksum events");
                return;
            }
        }
        counter.fetch_add(events.len(), Ordering::SeqCst);
    }

    #[allow(clippy::cast_possible_truncation)]
    fn event(&self, record_count: f64, state: &StateMessage, origin: MessageOrigin, valid_data: bool) -> StateChecksumCountEvent {
        let (stream_name, stream_namespace) = match (state.state_type, state.stream_descriptor()) {
            (StateType::Stream, Some(desc)) => (Some(desc.name.clone()), desc.namespace.clone()),
            _ => (None, None),
        };
        StateChecksumCountEvent {
            deployment_version: self.deployment.deployment_version.clone(),
            attempt_number: self.ctx.attempt,
            connection_id: self.ctx.connection_id.to_string(),
            deployment_id: self.deployment.deployment_id.to_string(),
            deployment_mode: self.deployment.deployment_mode.clone(),
            email: self.deployment.tracking_email.clone(),
            id: (self.id_supplier)().to_string(),
            job_id: self.ctx.job_id,
            record_count: record_count as i64,
            state_hash: state_hash(state).to_string(),
            state_id: stats_tracking_id(state).to_string(),
            state_origin: origin.as_str().to_string(),
            state_type: state.state_type.as_str().to_string(),
            stream_name,
            stream_namespace,
            timestamp: self.clock.now_millis().saturating_mul(1_000),
            valid_data,
        }
    }
}

fn stream_suffix(include_stream: bool, state: &StateMessage) -> String {
    match (include_stream, state.stream_descriptor()) {
        (true, Some(desc)) => format!(" for stream {desc}."),
        _ => ".".to_string(),
    }
}

fn collision_suffix(valid_data: bool) -> &'static str {
    if valid_data {
        " No hash collisions were observed."
    } else {
        " Hash collisions were observed so count comparison result may be wrong."
    }
}

fn dummy_state() -> StateMessage {
    StateMessage::for_stream(
        StreamDescriptor::new("dummy-name").with_namespace("dummy-namespace"),
        json!({"cursor": "value"}),
    )
    .with_source_count(1.0)
    .with_destination_count(1.0)
}
