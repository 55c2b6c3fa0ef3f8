//! Message-processing hub of a replication attempt.
//!
//! The driver hands every message read from the source to
//! [`ReplicationWorkerHelper::process_message_from_source`] and every message
//! read from the destination to
//! [`ReplicationWorkerHelper::process_message_from_destination`]. The helper
//! keeps the bookkeeping collaborators up to date, publishes status events,
//! persists acknowledged checkpoints, and assembles the final
//! [`ReplicationOutput`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use synclane_state::SyncPersistence;
use synclane_types::{
    ConfiguredCatalog, FailureReason, FailureType, MessageOrigin, PerformanceMetrics, ProtocolMessage,
    ReplicationAttemptSummary, ReplicationContext, ReplicationOutput, ReplicationStatus, StreamDescriptor,
};
use tokio::sync::watch;

use crate::analytics::AnalyticsMessageTracker;
use crate::checkpoint::StateIdAttacher;
use crate::checksum::{
    ChecksumEventWriter, DeploymentInfo, StateChecksumCountEventHandler, StateChecksumErrorReporter,
    TracingErrorReporter,
};
use crate::clock::{millis_between, Clock, SystemClock};
use crate::completion::StreamStatusCompletionTracker;
use crate::config::types::DestinationConfig;
use crate::config::ReplicationFeatureFlags;
use crate::connector::{ConnectorStartConfig, Destination, Source};
use crate::errors::{ReplicationError, Result};
use crate::events::{EventPublisher, IncompleteRunCause, ReplicationEventPublishingHelper, TracingEventPublisher};
use crate::fields::FieldSelector;
use crate::mapper::NamespaceMapper;
use crate::rate_limit::RateLimitedMessageHandler;
use crate::stats::SyncStatsTracker;
use crate::tracker::MessageTracker;
use crate::workload::{NoopWorkloadApiClient, WorkloadApiClient, WorkloadApiError};

/// Records between two progress log lines.
pub const RECORDS_READ_LOG_INTERVAL: u64 = 5000;

/// What one attempt replicates.
#[derive(Debug, Clone, Default)]
pub struct ReplicationInput {
    pub catalog: ConfiguredCatalog,
    pub destination: DestinationConfig,
    pub source_config: serde_json::Value,
    pub destination_config: serde_json::Value,
    /// Checkpoint handed to the source for incremental reads.
    pub state: Option<serde_json::Value>,
}

/// External services the helper talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub persistence: Arc<dyn SyncPersistence>,
    pub publisher: Arc<dyn EventPublisher>,
    pub workload_api: Arc<dyn WorkloadApiClient>,
    pub checksum_writer: Option<Arc<dyn ChecksumEventWriter>>,
    pub error_reporter: Arc<dyn StateChecksumErrorReporter>,
    pub clock: Arc<dyn Clock>,
    pub deployment: DeploymentInfo,
}

impl Collaborators {
    /// Log-only collaborators around `persistence`.
    #[must_use]
    pub fn new(persistence: Arc<dyn SyncPersistence>) -> Self {
        Self {
            persistence,
            publisher: Arc::new(TracingEventPublisher),
            workload_api: Arc::new(NoopWorkloadApiClient),
            checksum_writer: None,
            error_reporter: Arc::new(TracingErrorReporter),
            clock: Arc::new(SystemClock::new()),
            deployment: DeploymentInfo::default(),
        }
    }
}

pub struct ReplicationWorkerHelper {
    ctx: Arc<ReplicationContext>,
    flags: ReplicationFeatureFlags,
    input: ReplicationInput,
    clock: Arc<dyn Clock>,
    persistence: Arc<dyn SyncPersistence>,
    workload_api: Arc<dyn WorkloadApiClient>,
    events: ReplicationEventPublishingHelper,
    mapper: NamespaceMapper,
    field_selector: FieldSelector,
    message_tracker: MessageTracker,
    analytics: AnalyticsMessageTracker,
    rate_limiter: RateLimitedMessageHandler,
    completion: StreamStatusCompletionTracker,
    state_ids: StateIdAttacher,

    cancelled: AtomicBool,
    failed: AtomicBool,
    aborted: AtomicBool,
    /// Flips to `true` once the attempt is aborted or cancelled.
    stop: watch::Sender<bool>,
    output_closed: AtomicBool,
    records_read: AtomicU64,
    source_states: AtomicU64,
    destination_states: AtomicU64,
    current_destination_stream: Mutex<Option<StreamDescriptor>>,
    failures: Mutex<Vec<FailureReason>>,
    start_time: i64,
}

impl std::fmt::Debug for ReplicationWorkerHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationWorkerHelper")
            .field("connection_id", &self.ctx.connection_id)
            .field("cancelled", &self.cancelled)
            .field("failed", &self.failed)
            .field("aborted", &self.aborted)
            .field("records_read", &self.records_read)
            .finish_non_exhaustive()
    }
}

impl ReplicationWorkerHelper {
    /// Bind the attempt's context and flags and start completion tracking.
    #[must_use]
    pub fn initialize(
        ctx: ReplicationContext,
        flags: ReplicationFeatureFlags,
        input: ReplicationInput,
        collaborators: Collaborators,
    ) -> Self {
        let Collaborators {
            persistence,
            publisher,
            workload_api,
            checksum_writer,
            error_reporter,
            clock,
            deployment,
        } = collaborators;

        let checksum = StateChecksumCountEventHandler::new(
            ctx.clone(),
            &flags,
            deployment,
            checksum_writer,
            error_reporter,
            clock.clone(),
        );
        let stats = Arc::new(SyncStatsTracker::new(Arc::new(checksum)));
        let ctx = Arc::new(ctx);
        let events = ReplicationEventPublishingHelper::new(publisher, ctx.clone());
        let completion = StreamStatusCompletionTracker::new(clock.clone());
        completion.start_tracking(&input.catalog, flags.stream_status_completion_tracking);

        tracing::info!(
            connection_id = %ctx.connection_id,
            job_id = ctx.job_id,
            attempt = ctx.attempt,
            streams = input.catalog.streams.len(),
            "Replication initialized"
        );

        Self {
            mapper: NamespaceMapper::new(&input.destination, &input.catalog),
            field_selector: FieldSelector::new(&input.catalog, flags.field_selection_enabled),
            message_tracker: MessageTracker::new(stats),
            analytics: AnalyticsMessageTracker::new(),
            rate_limiter: RateLimitedMessageHandler::new(
                flags.process_rate_limited_message,
                events.clone(),
                clock.clone(),
            ),
            completion,
            state_ids: StateIdAttacher::new(),
            start_time: clock.now_millis(),
            ctx,
            flags,
            input,
            clock,
            persistence,
            workload_api,
            events,
            cancelled: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            stop: watch::Sender::new(false),
            output_closed: AtomicBool::new(false),
            records_read: AtomicU64::new(0),
            source_states: AtomicU64::new(0),
            destination_states: AtomicU64::new(0),
            current_destination_stream: Mutex::new(None),
            failures: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn context(&self) -> &ReplicationContext {
        &self.ctx
    }

    #[must_use]
    pub fn flags(&self) -> &ReplicationFeatureFlags {
        &self.flags
    }

    #[must_use]
    pub fn mapper(&self) -> &NamespaceMapper {
        &self.mapper
    }

    #[must_use]
    pub fn message_tracker(&self) -> &MessageTracker {
        &self.message_tracker
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &RateLimitedMessageHandler {
        &self.rate_limiter
    }

    #[must_use]
    pub fn completion_tracker(&self) -> &StreamStatusCompletionTracker {
        &self.completion
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // -----------------------------------------------------------------------
    // Connector startup
    // -----------------------------------------------------------------------

    /// # Errors
    ///
    /// Returns [`ReplicationError::Source`] if the source fails to start.
    pub async fn start_source(&self, source: &mut dyn Source) -> Result<()> {
        let config = ConnectorStartConfig {
            catalog: self.input.catalog.clone(),
            config: self.input.source_config.clone(),
            state: self.input.state.clone(),
        };
        source
            .start(config)
            .await
            .map_err(|e| ReplicationError::Source(e.context("failed to start source")))
    }

    /// Start the destination with the catalog as it will see it.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::Destination`] if the destination fails to
    /// start.
    pub async fn start_destination(&self, destination: &mut dyn Destination) -> Result<()> {
        let config = ConnectorStartConfig {
            catalog: self.output_catalog(),
            config: self.input.destination_config.clone(),
            state: None,
        };
        destination
            .start(config)
            .await
            .map_err(|e| ReplicationError::Destination(e.context("failed to start destination")))
    }

    #[must_use]
    pub fn output_catalog(&self) -> ConfiguredCatalog {
        self.mapper.map_catalog(&self.input.catalog)
    }

    // -----------------------------------------------------------------------
    // Message processing
    // -----------------------------------------------------------------------

    /// Process one source message and return the copy bound for the
    /// destination, or `None` for a record whose stream is not in the
    /// catalog. Dropped records still count as read and are reported as
    /// filtered out.
    ///
    /// # Errors
    ///
    /// Returns checksum failures, or [`ReplicationError::UnknownStream`] for
    /// stream statuses outside the catalog.
    pub fn process_message_from_source(&self, mut message: ProtocolMessage) -> Result<Option<ProtocolMessage>> {
        if let ProtocolMessage::State { state } = &mut message {
            self.state_ids.attach(state);
        }
        self.internal_process_message_from_source(&mut message)?;
        if let Some(record) = message.as_record() {
            let stream = record.descriptor();
            if self.input.catalog.find(&stream).is_none() {
                tracing::debug!(stream = %stream, "Dropping record for stream outside the catalog");
                self.message_tracker.accept_filtered_from_source(record);
                return Ok(None);
            }
        }
        Ok(Some(self.mapper.map_message(message)))
    }

    fn internal_process_message_from_source(&self, message: &mut ProtocolMessage) -> Result<()> {
        if let ProtocolMessage::Record { record } = message {
            self.field_selector.filter_selected_fields(record);
            self.field_selector.validate_schema(record);
        }
        let message = &*message;

        if let Some(status) = message.as_stream_status() {
            self.completion.track(status)?;
        }
        self.rate_limiter.handle(message);
        self.message_tracker.accept_from_source(message)?;
        if message.is_analytics() {
            self.analytics.add_message(message, MessageOrigin::Source);
        }
        if message.should_publish() {
            self.events.publish_status_event(MessageOrigin::Source, message);
        }

        let records_read = self.records_read.fetch_add(1, Ordering::Relaxed) + 1;
        if records_read % RECORDS_READ_LOG_INTERVAL == 0 {
            tracing::info!(
                connection_id = %self.ctx.connection_id,
                records_read,
                bytes_read = self.message_tracker.sync_stats_tracker().total_bytes_emitted(),
                "Records read"
            );
        }

        if let Some(state) = message.as_state() {
            self.source_states.fetch_add(1, Ordering::Relaxed);
            if self.flags.log_state_messages {
                tracing::info!(state_type = state.state_type.as_str(), id = state.id, "State from source");
            }
        }
        Ok(())
    }

    /// Process one destination message.
    ///
    /// # Errors
    ///
    /// Returns checksum failures, or [`ReplicationError::Persistence`] when
    /// an acknowledged checkpoint cannot be stored.
    pub fn process_message_from_destination(&self, message: ProtocolMessage) -> Result<()> {
        let message = self.mapper.revert_message(message);
        self.internal_process_message_from_destination(&message)
    }

    fn internal_process_message_from_destination(&self, message: &ProtocolMessage) -> Result<()> {
        tracing::debug!(message_type = message.kind(), "Message from destination");

        if let Some(stream) = message.stream_descriptor() {
            let mut current = self.current_destination_stream.lock();
            if let Some(previous) = current.as_ref().filter(|p| **p != stream) {
                self.events
                    .publish_complete_status_event(previous, MessageOrigin::Destination);
            }
            tracing::debug!(stream = %stream, "Current destination stream");
            *current = Some(stream);
        }

        self.message_tracker.accept_from_destination(message)?;
        if message.is_analytics() {
            self.analytics.add_message(message, MessageOrigin::Destination);
        }

        if let Some(state) = message.as_state() {
            self.persistence.persist(self.ctx.connection_id, state)?;
            self.destination_states.fetch_add(1, Ordering::Relaxed);
            if self.flags.log_state_messages {
                tracing::info!(state_type = state.state_type.as_str(), id = state.id, "State from destination");
            }
        }

        if message.should_publish() {
            self.events
                .publish_status_event(MessageOrigin::Destination, message);
        }
        Ok(())
    }

    /// Completion statuses to send before ending the destination's input.
    #[must_use]
    pub fn stream_statuses_to_send(&self, source_exit_code: i32) -> Vec<ProtocolMessage> {
        self.completion.finalize(source_exit_code, &self.mapper)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn end_of_source(&self) {
        let stats = self.message_tracker.sync_stats_tracker();
        tracing::info!(
            connection_id = %self.ctx.connection_id,
            records_read = self.records_read(),
            records_emitted = stats.total_records_emitted(),
            bytes_emitted = stats.total_bytes_emitted(),
            source_states = self.source_states.load(Ordering::Relaxed),
            "Total records read"
        );
        self.field_selector.report_metrics();
    }

    pub fn end_of_destination(&self) {
        if let Some(stream) = self.current_destination_stream.lock().as_ref() {
            self.events
                .publish_complete_status_event(stream, MessageOrigin::Destination);
        }
        tracing::info!(
            connection_id = %self.ctx.connection_id,
            destination_states = self.destination_states.load(Ordering::Relaxed),
            "Destination finished"
        );
    }

    /// Move every stream to a terminal status and flush buffered analytics.
    pub fn end_of_replication(&self) {
        let all_streams = StreamDescriptor::wildcard();
        if self.is_cancelled() {
            self.events.publish_incomplete_status_event(
                &all_streams,
                MessageOrigin::Internal,
                IncompleteRunCause::Canceled,
            );
        } else {
            self.events
                .publish_complete_status_event(&all_streams, MessageOrigin::Internal);
        }
        self.flush_analytics();
    }

    pub fn flush_analytics(&self) {
        let flushed = self.analytics.flush();
        tracing::debug!(flushed, total = self.analytics.total_flushed(), "Flushed analytics");
    }

    pub fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.stop.send_replace(true);
    }

    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.stop.send_replace(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// True once aborted or cancelled.
    #[must_use]
    pub fn should_abort(&self) -> bool {
        self.aborted.load(Ordering::SeqCst) || self.is_cancelled()
    }

    /// Resolves once [`should_abort`](Self::should_abort) turns true.
    pub async fn stopped(&self) {
        let mut rx = self.stop.subscribe();
        // `self` owns the sender, so the channel never closes here.
        let _ = rx.wait_for(|stop| *stop).await;
    }

    #[must_use]
    pub fn records_read(&self) -> u64 {
        self.records_read.load(Ordering::Relaxed)
    }

    /// Record `error` as a failure reason and mark every stream failed.
    pub fn track_failure(&self, error: &ReplicationError) {
        tracing::error!(
            connection_id = %self.ctx.connection_id,
            error = %error,
            "Replication failure"
        );
        self.failures
            .lock()
            .push(error.failure_reason(self.clock.now_millis()));
        self.events.publish_incomplete_status_event(
            &StreamDescriptor::wildcard(),
            MessageOrigin::Internal,
            IncompleteRunCause::Failed,
        );
    }

    // -----------------------------------------------------------------------
    // Output
    // -----------------------------------------------------------------------

    /// Assemble the attempt summary from the accumulated state.
    #[must_use]
    pub fn replication_output(&self, performance_metrics: Option<PerformanceMetrics>) -> ReplicationOutput {
        let status = ReplicationStatus::resolve(self.is_cancelled(), self.has_failed());
        let completed = status == ReplicationStatus::Completed;
        let stats = self.message_tracker.sync_stats_tracker();
        let total_stats = stats.total_stats(completed);
        let stream_stats = stats.stream_stats(completed);

        if !completed && !stats.checksum_validation_enabled() {
            tracing::warn!("Could not reliably determine committed record counts");
        }
        if !self.output_closed.swap(true, Ordering::SeqCst) {
            stats.end_of_replication(completed);
        }

        let summary = ReplicationAttemptSummary {
            status,
            records_synced: total_stats.records_committed.unwrap_or(0),
            bytes_synced: total_stats.bytes_committed.unwrap_or(0),
            start_time: self.start_time,
            end_time: self.clock.now_millis(),
            total_stats,
            stream_stats,
            performance_metrics,
        };

        let mut failures = self
            .message_tracker
            .error_trace_failures(self.ctx.job_id, self.ctx.attempt);
        failures.extend(self.failures.lock().iter().cloned());
        failures.sort_by_key(|f| f.timestamp);

        tracing::info!(
            connection_id = %self.ctx.connection_id,
            status = %summary.status,
            records_synced = summary.records_synced,
            bytes_synced = summary.bytes_synced,
            started = %format_millis(summary.start_time),
            ended = %format_millis(summary.end_time),
            failures = failures.len(),
            "Sync summary"
        );
        for failure in &failures {
            tracing::info!(
                origin = failure.failure_origin.as_str(),
                failure_type = failure.failure_type.map(FailureType::as_str),
                message = %failure.external_message,
                "Sync failure"
            );
        }

        ReplicationOutput {
            replication_attempt_summary: summary,
            output_catalog: self.output_catalog(),
            failures,
        }
    }

    /// Append `output` to the attempt history. Errors are logged.
    pub fn record_attempt(&self, output: &ReplicationOutput) {
        if let Err(e) = self
            .persistence
            .record_attempt(self.ctx.connection_id, self.ctx.job_id, self.ctx.attempt, output)
        {
            tracing::warn!(error = %e, "Failed to record attempt summary");
        }
    }

    // -----------------------------------------------------------------------
    // Workload heartbeat
    // -----------------------------------------------------------------------

    /// Heartbeat the workload service every `interval` until the workload is
    /// gone or heartbeats keep failing past the configured timeout.
    pub async fn run_workload_heartbeat(self: Arc<Self>, interval: Duration) {
        let workload_id = self.ctx.workload_id();
        let timeout = self.flags.workload_heartbeat_timeout;
        let mut last_success = self.clock.now_millis();
        loop {
            match self.workload_api.heartbeat(&workload_id).await {
                Ok(()) => last_success = self.clock.now_millis(),
                Err(WorkloadApiError::Gone(_)) => {
                    tracing::warn!(workload_id, "Workload is gone, cancelling replication");
                    self.mark_cancelled();
                    return;
                }
                Err(e) => {
                    let since = millis_between(last_success, self.clock.now_millis());
                    if since > timeout {
                        tracing::warn!(
                            workload_id,
                            error = %e,
                            since_last_success_secs = since.as_secs(),
                            "Workload heartbeat failing past timeout, stopping"
                        );
                        self.mark_cancelled();
                        self.abort();
                        self.track_failure(&ReplicationError::WorkloadHeartbeat(e.to_string()));
                        return;
                    }
                    tracing::warn!(workload_id, error = %e, "Workload heartbeat failed, retrying");
                }
            }
            tokio::time::sleep(interval).await;
        }
    }
}

fn format_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis).map_or_else(|| millis.to_string(), |t| t.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;
    use synclane_state::SqliteSyncPersistence;
    use synclane_types::{ConfiguredStream, StateMessage, StreamStatus, StreamStatusReason};

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{Flag, FlagContext, FlagValue, StaticFlagClient};
    use crate::events::{RecordingEventPublisher, ReplicationEvent, RunningReason};

    struct Fixture {
        helper: Arc<ReplicationWorkerHelper>,
        events: Arc<RecordingEventPublisher>,
        persistence: Arc<SqliteSyncPersistence>,
        clock: Arc<ManualClock>,
    }

    fn users() -> StreamDescriptor {
        StreamDescriptor::new("users").with_namespace("public")
    }

    fn fixture_with(client: &StaticFlagClient, workload_api: Arc<dyn WorkloadApiClient>) -> Fixture {
        let events = Arc::new(RecordingEventPublisher::default());
        let persistence = Arc::new(SqliteSyncPersistence::in_memory().unwrap());
        let clock = Arc::new(ManualClock::at(1_000));
        let collaborators = Collaborators {
            persistence: persistence.clone(),
            publisher: events.clone(),
            workload_api,
            checksum_writer: None,
            error_reporter: Arc::new(TracingErrorReporter),
            clock: clock.clone(),
            deployment: DeploymentInfo::default(),
        };
        let input = ReplicationInput {
            catalog: ConfiguredCatalog::new(vec![ConfiguredStream::new(&users())]),
            ..ReplicationInput::default()
        };
        let flags = ReplicationFeatureFlags::resolve(client, &FlagContext::default());
        let helper = ReplicationWorkerHelper::initialize(ReplicationContext::default(), flags, input, collaborators);
        Fixture {
            helper: Arc::new(helper),
            events,
            persistence,
            clock,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(&StaticFlagClient::default(), Arc::new(NoopWorkloadApiClient))
    }

    fn record(id: u64) -> ProtocolMessage {
        ProtocolMessage::record(&users(), json!({ "id": id }), 0)
    }

    #[test]
    fn source_states_get_ids_and_are_forwarded() {
        let f = fixture();
        let out = f
            .helper
            .process_message_from_source(ProtocolMessage::state(StateMessage::for_stream(users(), json!({}))))
            .unwrap()
            .unwrap();
        assert_eq!(out.as_state().unwrap().id, Some(1));
        assert_eq!(f.helper.records_read(), 1);
    }

    #[test]
    fn destination_states_are_persisted() {
        let f = fixture();
        let mut state = StateMessage::for_stream(users(), json!({"cursor": 1}));
        state.id = Some(1);
        f.helper
            .process_message_from_destination(ProtocolMessage::state(state))
            .unwrap();
        let stored = f
            .persistence
            .latest_checkpoints(f.helper.context().connection_id)
            .unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[test]
    fn destination_stream_change_completes_previous_stream() {
        let f = fixture();
        let other = StreamDescriptor::new("orders");
        f.helper
            .process_message_from_destination(ProtocolMessage::stream_status(users(), StreamStatus::Running, vec![], 0))
            .unwrap();
        f.helper
            .process_message_from_destination(ProtocolMessage::stream_status(other.clone(), StreamStatus::Running, vec![], 0))
            .unwrap();
        f.helper.end_of_destination();

        let completes: Vec<_> = f
            .events
            .events()
            .into_iter()
            .filter_map(|e| match e {
                ReplicationEvent::Complete { stream, .. } => Some(stream),
                _ => None,
            })
            .collect();
        assert_eq!(completes, vec![users(), other]);
    }

    #[test]
    fn rate_limited_stream_resumes_on_record() {
        let client = StaticFlagClient::default().with(Flag::ProcessRateLimitedMessage, FlagValue::Bool(true));
        let f = fixture_with(&client, Arc::new(NoopWorkloadApiClient));
        f.clock.set(200);
        f.helper
            .process_message_from_source(ProtocolMessage::stream_status(
                users(),
                StreamStatus::Running,
                vec![StreamStatusReason::rate_limited(None)],
                100,
            ))
            .unwrap();
        f.helper.process_message_from_source(record(1)).unwrap();

        let running: Vec<_> = f
            .events
            .events()
            .into_iter()
            .filter_map(|e| match e {
                ReplicationEvent::Running { reason, timestamp, .. } => Some((reason, timestamp)),
                _ => None,
            })
            .collect();
        assert_eq!(
            running,
            vec![
                (RunningReason::RateLimited { quota_reset: None }, 100),
                (RunningReason::Resumed, 200)
            ]
        );
    }

    #[test]
    fn abort_and_cancel_both_stop_processing() {
        let f = fixture();
        assert!(!f.helper.should_abort());
        f.helper.abort();
        assert!(f.helper.should_abort());
        assert!(!f.helper.is_cancelled());

        let g = fixture();
        g.helper.mark_cancelled();
        assert!(g.helper.should_abort());
    }

    #[test]
    fn cancelled_replication_reports_cancelled_over_failed() {
        let f = fixture();
        f.helper.mark_cancelled();
        f.helper.mark_failed();
        f.helper.end_of_replication();

        assert!(f.events.events().contains(&ReplicationEvent::Incomplete {
            stream: StreamDescriptor::wildcard(),
            origin: MessageOrigin::Internal,
            cause: IncompleteRunCause::Canceled,
        }));
        assert_eq!(f.helper.replication_output(None).status(), ReplicationStatus::Cancelled);
    }

    #[test]
    fn failures_are_sorted_by_timestamp() {
        let f = fixture();
        f.clock.set(50);
        f.helper
            .track_failure(&ReplicationError::Destination(anyhow::anyhow!("late")));
        f.clock.set(10);
        f.helper
            .track_failure(&ReplicationError::Source(anyhow::anyhow!("early")));
        f.helper.mark_failed();

        let output = f.helper.replication_output(None);
        assert_eq!(output.status(), ReplicationStatus::Failed);
        let timestamps: Vec<_> = output.failures.iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![10, 50]);
    }

    #[test]
    fn output_is_stable_across_calls() {
        let f = fixture();
        for i in 0..3 {
            f.helper.process_message_from_source(record(i)).unwrap();
        }
        let a = f.helper.replication_output(None);
        let b = f.helper.replication_output(None);
        assert_eq!(a.replication_attempt_summary.status, b.replication_attempt_summary.status);
        assert_eq!(a.replication_attempt_summary.total_stats, b.replication_attempt_summary.total_stats);
        assert_eq!(a.replication_attempt_summary.records_synced, 3);
    }

    // -----------------------------------------------------------------------
    // Workload heartbeat
    // -----------------------------------------------------------------------

    struct ScriptedWorkloadApi {
        responses: Mutex<Vec<std::result::Result<(), WorkloadApiError>>>,
    }

    #[async_trait]
    impl WorkloadApiClient for ScriptedWorkloadApi {
        async fn heartbeat(&self, _workload_id: &str) -> std::result::Result<(), WorkloadApiError> {
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                Ok(())
            } else {
                responses.remove(0)
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gone_workload_cancels_replication() {
        let api = Arc::new(ScriptedWorkloadApi {
            responses: Mutex::new(vec![Ok(()), Err(WorkloadApiError::Gone("w".into()))]),
        });
        let f = fixture_with(&StaticFlagClient::default(), api);
        f.helper
            .clone()
            .run_workload_heartbeat(Duration::from_secs(1))
            .await;
        assert!(f.helper.is_cancelled());
        assert!(f.helper.replication_output(None).failures.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_heartbeat_failure_stops_and_records_failure() {
        let failures = (0..10)
            .map(|_| Err(WorkloadApiError::Other("503".into())))
            .collect();
        let api = Arc::new(ScriptedWorkloadApi {
            responses: Mutex::new(failures),
        });
        let client = StaticFlagClient::default().with(Flag::WorkloadHeartbeatTimeoutMinutes, FlagValue::Int(1));
        let f = fixture_with(&client, api);

        let clock = f.clock.clone();
        let helper = f.helper.clone();
        let beat = tokio::spawn(helper.run_workload_heartbeat(Duration::from_secs(30)));
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(30)).await;
            clock.advance(Duration::from_secs(30));
        }
        beat.await.unwrap();

        assert!(f.helper.should_abort());
        let output = f.helper.replication_output(None);
        assert_eq!(output.failures.len(), 1);
        assert_eq!(output.failures[0].failure_origin, synclane_types::FailureOrigin::Platform);
    }

    #[test]
    fn records_outside_catalog_are_filtered_out() {
        let f = fixture();
        let ghost = StreamDescriptor::new("ghost");
        f.helper.process_message_from_source(record(1)).unwrap().unwrap();
        let dropped = f
            .helper
            .process_message_from_source(ProtocolMessage::record(&ghost, json!({ "id": 2 }), 0))
            .unwrap();
        assert!(dropped.is_none());
        assert_eq!(f.helper.records_read(), 2);

        let output = f.helper.replication_output(None);
        let totals = &output.replication_attempt_summary.total_stats;
        assert_eq!(totals.records_emitted, 2);
        assert_eq!(totals.records_filtered_out, 1);
        assert_eq!(output.replication_attempt_summary.records_synced, 1);
    }
}
