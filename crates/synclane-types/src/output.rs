//! Terminal artifacts of a sync attempt.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::catalog::ConfiguredCatalog;
use crate::failure::FailureReason;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Final status of a replication attempt.
///
/// Resolved in strict priority order: cancelled, then failed, then completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationStatus {
    Completed,
    Failed,
    Cancelled,
}

impl ReplicationStatus {
    #[must_use]
    pub fn resolve(cancelled: bool, failed: bool) -> Self {
        if cancelled {
            Self::Cancelled
        } else if failed {
            Self::Failed
        } else {
            Self::Completed
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ReplicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Record and byte counters for a sync or a single stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub records_emitted: u64,
    pub bytes_emitted: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records_committed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_committed: Option<u64>,
    pub records_filtered_out: u64,
    pub bytes_filtered_out: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_records: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_bytes: Option<u64>,
    pub source_state_messages_emitted: u64,
    pub destination_state_messages_emitted: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSyncStats {
    pub stream_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_namespace: Option<String>,
    pub stats: SyncStats,
}

/// Time spent in each pipeline stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTiming {
    pub executions: u64,
    pub total_ms: u64,
}

/// Per-stage timings keyed by stage name (`read_from_source`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PerformanceMetrics(pub BTreeMap<String, StageTiming>);

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationAttemptSummary {
    pub status: ReplicationStatus,
    pub records_synced: u64,
    pub bytes_synced: u64,
    /// Epoch milliseconds.
    pub start_time: i64,
    /// Epoch milliseconds.
    pub end_time: i64,
    pub total_stats: SyncStats,
    pub stream_stats: Vec<StreamSyncStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance_metrics: Option<PerformanceMetrics>,
}

/// Everything a sync attempt reports once it is over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationOutput {
    pub replication_attempt_summary: ReplicationAttemptSummary,
    pub output_catalog: ConfiguredCatalog,
    /// Ordered by timestamp.
    pub failures: Vec<FailureReason>,
}

impl ReplicationOutput {
    #[must_use]
    pub fn status(&self) -> ReplicationStatus {
        self.replication_attempt_summary.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn status_strings() {
        assert_eq!(ReplicationStatus::Completed.as_str(), "completed");
        assert_eq!(ReplicationStatus::Cancelled.to_string(), "cancelled");
    }

    proptest! {
        #[test]
        fn cancellation_takes_priority(cancelled in any::<bool>(), failed in any::<bool>()) {
            let status = ReplicationStatus::resolve(cancelled, failed);
            match (cancelled, failed) {
                (true, _) => prop_assert_eq!(status, ReplicationStatus::Cancelled),
                (false, true) => prop_assert_eq!(status, ReplicationStatus::Failed),
                (false, false) => prop_assert_eq!(status, ReplicationStatus::Completed),
            }
        }
    }
}
