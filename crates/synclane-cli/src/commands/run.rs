use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;

use synclane_engine::config::{parser, validator, FlagContext, ReplicationFeatureFlags, SyncConfig};
use synclane_engine::{
    Collaborators, EchoDestination, ReplaySource, ReplicationInput, ReplicationWorker,
    ReplicationWorkerHelper, WorkerOptions,
};
use synclane_state::{SqliteSyncPersistence, SyncPersistence};
use synclane_types::{ReplicationOutput, ReplicationStatus};

/// Execute the `run` command: parse, validate, and run one sync attempt.
pub async fn execute(sync_path: &Path, source_exit_code: i32, workload_heartbeat: bool) -> Result<()> {
    // 1. Parse sync YAML
    let config = parser::parse_sync(sync_path)
        .with_context(|| format!("Failed to parse sync: {}", sync_path.display()))?;

    // 2. Validate
    validator::validate_sync(&config)?;

    tracing::info!(
        connection_id = %config.connection.connection_id,
        job_id = config.connection.job_id,
        attempt = config.connection.attempt,
        streams = config.catalog.streams.len(),
        "Sync validated"
    );

    // 3. Wire the attempt
    let flags = ReplicationFeatureFlags::resolve(
        &config.flag_client(),
        &FlagContext::from(&config.connection),
    );
    let persistence = open_persistence(&config)?;
    let input = replication_input(&config, persistence.as_ref())?;
    let collaborators = Collaborators {
        deployment: config.deployment.clone(),
        ..Collaborators::new(persistence)
    };
    let helper =
        ReplicationWorkerHelper::initialize(config.connection.clone(), flags, input, collaborators);

    let source = ReplaySource::from_jsonl(&config.source.messages)?.with_exit_code(source_exit_code);
    let options = WorkerOptions {
        heartbeat_threshold: config
            .source
            .max_seconds_between_messages
            .map_or(WorkerOptions::default().heartbeat_threshold, Duration::from_secs),
        workload_heartbeat,
        ..WorkerOptions::default()
    };
    let worker = ReplicationWorker::new(helper, Box::new(source), Box::new(EchoDestination::new()), options);

    // 4. Run, cancelling on Ctrl+C
    let canceller = worker.canceller();
    let interrupt = tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            return;
        }
        tracing::info!("Received Ctrl+C, cancelling sync");
        canceller.cancel().await;
    });
    let output = worker.run().await;
    interrupt.abort();

    // 5. Report
    println!("{}", serde_json::to_string_pretty(&output)?);
    print_summary(&output);

    match output.status() {
        ReplicationStatus::Completed => Ok(()),
        status => anyhow::bail!("Sync {status}"),
    }
}

fn open_persistence(config: &SyncConfig) -> Result<Arc<dyn SyncPersistence>> {
    let persistence = match &config.persistence {
        Some(p) => SqliteSyncPersistence::open(&p.path)
            .with_context(|| format!("Failed to open state database: {}", p.path.display()))?,
        None => SqliteSyncPersistence::in_memory()?,
    };
    Ok(Arc::new(persistence))
}

/// Attempt input, seeded with the checkpoints a previous attempt persisted.
fn replication_input(config: &SyncConfig, persistence: &dyn SyncPersistence) -> Result<ReplicationInput> {
    let checkpoints = persistence.latest_checkpoints(config.connection.connection_id)?;
    let state = if checkpoints.is_empty() {
        None
    } else {
        tracing::info!(checkpoints = checkpoints.len(), "Resuming from stored checkpoints");
        Some(serde_json::to_value(&checkpoints)?)
    };

    Ok(ReplicationInput {
        catalog: config.catalog.clone(),
        destination: config.destination.clone(),
        source_config: json!({ "messages": config.source.messages }),
        destination_config: json!({}),
        state,
    })
}

fn print_summary(output: &ReplicationOutput) {
    let summary = &output.replication_attempt_summary;
    eprintln!("Sync {}.", summary.status);
    eprintln!("  Records synced:  {}", summary.records_synced);
    eprintln!("  Bytes synced:    {}", summary.bytes_synced);
    eprintln!(
        "  States:          {} emitted, {} committed",
        summary.total_stats.source_state_messages_emitted,
        summary.total_stats.destination_state_messages_emitted
    );
    #[allow(clippy::cast_precision_loss)]
    let duration_secs = (summary.end_time - summary.start_time).max(0) as f64 / 1000.0;
    eprintln!("  Duration:        {duration_secs:.2}s");
    for failure in &output.failures {
        eprintln!(
            "  Failure ({}): {}",
            failure.failure_origin.as_str(),
            failure.external_message
        );
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn fixture(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .parent()
            .unwrap()
            .parent()
            .unwrap()
            .join("tests/fixtures/syncs")
            .join(name)
    }

    #[test]
    fn input_has_no_state_on_first_attempt() {
        let config = parser::parse_sync(&fixture("users_orders.yaml")).unwrap();
        let persistence = SqliteSyncPersistence::in_memory().unwrap();
        let input = replication_input(&config, &persistence).unwrap();
        assert!(input.state.is_none());
        assert_eq!(input.catalog.streams.len(), 2);
    }

    #[tokio::test]
    async fn run_completes_and_stores_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = std::fs::read_to_string(fixture("users_orders.yaml")).unwrap();
        let messages = fixture("../messages/users_orders.jsonl");
        let sync = dir.path().join("sync.yaml");
        std::fs::write(
            &sync,
            yaml.replace("../messages/users_orders.jsonl", &messages.display().to_string())
                + "persistence:\n  path: state.db\n",
        )
        .unwrap();

        execute(&sync, 0, false).await.unwrap();

        let config = parser::parse_sync(&sync).unwrap();
        let persistence = SqliteSyncPersistence::open(&dir.path().join("state.db")).unwrap();
        let input = replication_input(&config, &persistence).unwrap();
        assert!(input.state.is_some());
    }

    #[tokio::test]
    async fn run_fails_when_source_exits_non_zero() {
        let err = execute(&fixture("users_orders.yaml"), 1, false).await.unwrap_err();
        assert!(err.to_string().contains("failed"));
    }
}
