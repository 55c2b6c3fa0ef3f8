//! Replication driver: runs the source, writer and destination loops of one
//! attempt concurrently and turns the outcome into a [`ReplicationOutput`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use synclane_types::{PerformanceMetrics, ProtocolMessage, ReplicationOutput, StageTiming};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

use crate::connector::{Destination, Source};
use crate::errors::{ReplicationError, Result};
use crate::heartbeat::{
    HeartbeatMonitor, HeartbeatTimeoutChaperone, DEFAULT_HEARTBEAT_POLL_INTERVAL, DEFAULT_HEARTBEAT_THRESHOLD,
};
use crate::helper::ReplicationWorkerHelper;
use crate::timeout::{DestinationTimeoutMonitor, DEFAULT_TIMEOUT_POLL_INTERVAL};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Pause between polls of a connector that had nothing to read.
pub const DEFAULT_IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

type SharedSource = Arc<Mutex<Box<dyn Source>>>;
type SharedDestination = Arc<Mutex<Box<dyn Destination>>>;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Longest the source may go without emitting a message.
    pub heartbeat_threshold: Duration,
    pub heartbeat_poll_interval: Duration,
    pub timeout_poll_interval: Duration,
    pub channel_capacity: usize,
    pub idle_poll_interval: Duration,
    /// Heartbeat the workload service while the attempt runs.
    pub workload_heartbeat: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            heartbeat_threshold: DEFAULT_HEARTBEAT_THRESHOLD,
            heartbeat_poll_interval: DEFAULT_HEARTBEAT_POLL_INTERVAL,
            timeout_poll_interval: DEFAULT_TIMEOUT_POLL_INTERVAL,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            idle_poll_interval: DEFAULT_IDLE_POLL_INTERVAL,
            workload_heartbeat: false,
        }
    }
}

/// Pipeline stages timed into [`PerformanceMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ReadFromSource,
    WriteToDestination,
    ReadFromDestination,
}

impl Stage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadFromSource => "read_from_source",
            Self::WriteToDestination => "write_to_destination",
            Self::ReadFromDestination => "read_from_destination",
        }
    }
}

enum WriterInput {
    Message(ProtocolMessage),
    EndOfSource { exit_code: i32 },
}

/// Cancels a running attempt from another task.
#[derive(Clone)]
pub struct ReplicationCanceller {
    helper: Arc<ReplicationWorkerHelper>,
    source: SharedSource,
    destination: SharedDestination,
}

impl ReplicationCanceller {
    /// Mark the attempt cancelled and cancel both connectors. Marking
    /// interrupts any read or accept still in flight, which frees the
    /// connector locks.
    pub async fn cancel(&self) {
        tracing::info!(connection_id = %self.helper.context().connection_id, "Cancelling replication");
        self.helper.mark_cancelled();
        cancel_connectors(&self.source, &self.destination).await;
    }
}

pub struct ReplicationWorker {
    helper: Arc<ReplicationWorkerHelper>,
    source: SharedSource,
    destination: SharedDestination,
    options: WorkerOptions,
}

impl ReplicationWorker {
    #[must_use]
    pub fn new(
        helper: ReplicationWorkerHelper,
        source: Box<dyn Source>,
        destination: Box<dyn Destination>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            helper: Arc::new(helper),
            source: Arc::new(Mutex::new(source)),
            destination: Arc::new(Mutex::new(destination)),
            options,
        }
    }

    #[must_use]
    pub fn helper(&self) -> &Arc<ReplicationWorkerHelper> {
        &self.helper
    }

    #[must_use]
    pub fn canceller(&self) -> ReplicationCanceller {
        ReplicationCanceller {
            helper: self.helper.clone(),
            source: self.source.clone(),
            destination: self.destination.clone(),
        }
    }

    /// Run the attempt to completion. Failures are recorded in the returned
    /// output rather than returned as errors.
    pub async fn run(self) -> ReplicationOutput {
        let helper = self.helper.clone();
        let ctx = helper.context();
        tracing::info!(
            connection_id = %ctx.connection_id,
            job_id = ctx.job_id,
            attempt = ctx.attempt,
            "Starting replication"
        );

        let workload_heartbeat = self.options.workload_heartbeat.then(|| {
            let interval = helper.flags().workload_heartbeat_interval;
            tokio::spawn(helper.clone().run_workload_heartbeat(interval))
        });

        let performance_metrics = match self.replicate().await {
            Ok(metrics) => Some(metrics),
            Err(error) => {
                helper.track_failure(&error);
                helper.mark_failed();
                if matches!(
                    error,
                    ReplicationError::HeartbeatTimeout { .. } | ReplicationError::DestinationTimeout { .. }
                ) {
                    helper.abort();
                }
                cancel_connectors(&self.source, &self.destination).await;
                None
            }
        };

        if helper.has_failed() && !helper.is_cancelled() {
            helper.flush_analytics();
        } else {
            helper.end_of_replication();
        }
        close_connectors(&self.source, &self.destination).await;
        if let Some(handle) = workload_heartbeat {
            handle.abort();
        }

        let output = helper.replication_output(performance_metrics);
        helper.record_attempt(&output);
        output
    }

    async fn replicate(&self) -> Result<PerformanceMetrics> {
        let helper = &self.helper;
        helper.start_source(self.source.lock().await.as_mut()).await?;
        helper
            .start_destination(self.destination.lock().await.as_mut())
            .await?;

        let (tx, rx) = mpsc::channel::<WriterInput>(self.options.channel_capacity);
        let mut join_set: JoinSet<Result<(Stage, Option<StageTiming>)>> = JoinSet::new();

        let monitor = Arc::new(HeartbeatMonitor::new(
            self.options.heartbeat_threshold,
            helper.clock().clone(),
        ));
        let chaperone = HeartbeatTimeoutChaperone::new(
            monitor.clone(),
            self.options.heartbeat_poll_interval,
            helper.flags().fail_sync_on_heartbeat_failure,
        );
        let source_loop = read_from_source(
            helper.clone(),
            self.source.clone(),
            monitor,
            tx,
            self.options.idle_poll_interval,
        );
        join_set.spawn(async move {
            let timing = chaperone.run_with_heartbeat(source_loop).await?;
            Ok((Stage::ReadFromSource, Some(timing)))
        });

        let flags = helper.flags();
        let threshold = if flags.destination_timeout_enabled {
            flags.destination_timeout
        } else {
            Duration::MAX
        };
        let timeout_monitor = Arc::new(DestinationTimeoutMonitor::new(
            threshold,
            self.options.timeout_poll_interval,
            flags.fail_sync_on_destination_timeout,
            helper.clock().clone(),
        ));
        let writer_loop = write_to_destination(
            helper.clone(),
            self.destination.clone(),
            timeout_monitor.clone(),
            rx,
        );
        join_set.spawn(async move {
            let timing = timeout_monitor.run_with_timeout(writer_loop).await?;
            Ok((Stage::WriteToDestination, timing))
        });

        join_set.spawn(read_from_destination(
            helper.clone(),
            self.destination.clone(),
            self.options.idle_poll_interval,
        ));

        let mut metrics = PerformanceMetrics::default();
        let mut first_error: Option<ReplicationError> = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok((stage, timing))) => {
                    if let Some(timing) = timing {
                        metrics.0.insert(stage.as_str().to_string(), timing);
                    }
                }
                Ok(Err(error)) => {
                    tracing::error!(error = %error, "Replication task failed");
                    if first_error.is_none() {
                        first_error = Some(error);
                        join_set.abort_all();
                    }
                }
                Err(join_err) if join_err.is_cancelled() && first_error.is_some() => {}
                Err(join_err) => {
                    join_set.abort_all();
                    return Err(anyhow::anyhow!("replication task panicked: {join_err}").into());
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(metrics),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline loops
// ---------------------------------------------------------------------------

async fn read_from_source(
    helper: Arc<ReplicationWorkerHelper>,
    source: SharedSource,
    monitor: Arc<HeartbeatMonitor>,
    tx: mpsc::Sender<WriterInput>,
    idle: Duration,
) -> Result<StageTiming> {
    let started = Instant::now();
    let mut executions = 0u64;

    while !helper.should_abort() {
        let message = {
            let mut source = source.lock().await;
            if source.is_finished() {
                break;
            }
            tokio::select! {
                biased;
                () = helper.stopped() => break,
                read = source.attempt_read() => {
                    read.map_err(|e| ReplicationError::Source(e.context("failed to read from source")))?
                }
            }
        };
        let Some(message) = message else {
            tokio::time::sleep(idle).await;
            continue;
        };
        monitor.beat();
        executions += 1;

        let Some(message) = helper.process_message_from_source(message)? else {
            continue;
        };
        if matches!(message, ProtocolMessage::Record { .. } | ProtocolMessage::State { .. })
            && tx.send(WriterInput::Message(message)).await.is_err()
        {
            tracing::debug!("Writer gone, stopping source read");
            break;
        }
    }

    if helper.should_abort() {
        tracing::info!(records_read = helper.records_read(), "Source read aborted");
        helper.end_of_source();
        return Ok(timing(executions, started));
    }

    let exit_code = source.lock().await.exit_value().unwrap_or(0);
    if exit_code != 0 {
        return Err(ReplicationError::Source(anyhow::anyhow!(
            "source process exited with non-zero exit code {exit_code}"
        )));
    }
    helper.end_of_source();
    // The writer may already have stopped on abort.
    let _ = tx.send(WriterInput::EndOfSource { exit_code }).await;
    Ok(timing(executions, started))
}

async fn write_to_destination(
    helper: Arc<ReplicationWorkerHelper>,
    destination: SharedDestination,
    timeout: Arc<DestinationTimeoutMonitor>,
    mut rx: mpsc::Receiver<WriterInput>,
) -> Result<StageTiming> {
    let started = Instant::now();
    let mut executions = 0u64;

    loop {
        let input = tokio::select! {
            biased;
            () = helper.stopped() => break,
            input = rx.recv() => input,
        };
        let Some(input) = input else {
            break;
        };
        match input {
            WriterInput::Message(message) => {
                accept(&helper, &destination, &timeout, message).await?;
                executions += 1;
            }
            WriterInput::EndOfSource { exit_code } => {
                for status in helper.stream_statuses_to_send(exit_code) {
                    accept(&helper, &destination, &timeout, status).await?;
                }
                let mut destination = destination.lock().await;
                timeout.start_notify_end_of_input_timer();
                let result = tokio::select! {
                    biased;
                    () = helper.stopped() => Ok(()),
                    result = destination.notify_end_of_input() => result,
                };
                timeout.reset_notify_end_of_input_timer();
                result.map_err(|e| ReplicationError::Destination(e.context("failed to end destination input")))?;
                tracing::info!(messages_written = executions, "Destination input ended");
                break;
            }
        }
    }
    Ok(timing(executions, started))
}

/// Hand `message` to the destination. The accept timer covers only the
/// call itself, not the wait for the connector lock.
async fn accept(
    helper: &ReplicationWorkerHelper,
    destination: &SharedDestination,
    timeout: &DestinationTimeoutMonitor,
    message: ProtocolMessage,
) -> Result<()> {
    let mut destination = destination.lock().await;
    timeout.start_accept_timer();
    let result = tokio::select! {
        biased;
        () = helper.stopped() => Ok(()),
        result = destination.accept(message) => result,
    };
    timeout.reset_accept_timer();
    result.map_err(|e| ReplicationError::Destination(e.context("destination failed to accept message")))
}

async fn read_from_destination(
    helper: Arc<ReplicationWorkerHelper>,
    destination: SharedDestination,
    idle: Duration,
) -> Result<(Stage, Option<StageTiming>)> {
    let started = Instant::now();
    let mut executions = 0u64;

    while !helper.should_abort() {
        let message = {
            let mut destination = destination.lock().await;
            if destination.is_finished() {
                break;
            }
            tokio::select! {
                biased;
                () = helper.stopped() => break,
                read = destination.attempt_read() => {
                    read.map_err(|e| ReplicationError::Destination(e.context("failed to read from destination")))?
                }
            }
        };
        match message {
            Some(message) => {
                executions += 1;
                helper.process_message_from_destination(message)?;
            }
            None => tokio::time::sleep(idle).await,
        }
    }

    if !helper.should_abort() {
        let exit_code = destination.lock().await.exit_value().unwrap_or(0);
        if exit_code != 0 {
            return Err(ReplicationError::Destination(anyhow::anyhow!(
                "destination process exited with non-zero exit code {exit_code}"
            )));
        }
    }
    helper.end_of_destination();
    Ok((Stage::ReadFromDestination, Some(timing(executions, started))))
}

fn timing(executions: u64, started: Instant) -> StageTiming {
    StageTiming {
        executions,
        total_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    }
}

async fn cancel_connectors(source: &SharedSource, destination: &SharedDestination) {
    if let Err(e) = source.lock().await.cancel().await {
        tracing::warn!(error = %e, "Failed to cancel source");
    }
    if let Err(e) = destination.lock().await.cancel().await {
        tracing::warn!(error = %e, "Failed to cancel destination");
    }
}

async fn close_connectors(source: &SharedSource, destination: &SharedDestination) {
    if let Err(e) = source.lock().await.close().await {
        tracing::warn!(error = %e, "Failed to close source");
    }
    if let Err(e) = destination.lock().await.close().await {
        tracing::warn!(error = %e, "Failed to close destination");
    }
}
