//! Identifiers for one sync attempt.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable identifiers for one sync attempt.
///
/// Created once when the replication helper is initialized and shared
/// read-only by every collaborator for the lifetime of the attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationContext {
    #[serde(default)]
    pub is_reset: bool,
    pub connection_id: Uuid,
    #[serde(default)]
    pub source_id: Uuid,
    #[serde(default)]
    pub destination_id: Uuid,
    pub job_id: i64,
    pub attempt: u32,
    pub workspace_id: Uuid,
    #[serde(default)]
    pub source_image: String,
    #[serde(default)]
    pub destination_image: String,
    pub source_definition_id: Uuid,
    pub destination_definition_id: Uuid,
    /// Id used when heartbeating the workload-tracking service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_id: Option<String>,
}

impl ReplicationContext {
    /// Workload id, defaulting to `<connection>_<job>_<attempt>_sync`.
    #[must_use]
    pub fn workload_id(&self) -> String {
        self.workload_id.clone().unwrap_or_else(|| {
            format!("{}_{}_{}_sync", self.connection_id, self.job_id, self.attempt)
        })
    }
}
