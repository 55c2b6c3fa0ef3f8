//! Workload-tracking API seam.

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum WorkloadApiError {
    /// The workload no longer exists on the server side.
    #[error("workload {0} is gone")]
    Gone(String),

    #[error("workload heartbeat failed: {0}")]
    Other(String),
}

#[async_trait]
pub trait WorkloadApiClient: Send + Sync {
    async fn heartbeat(&self, workload_id: &str) -> Result<(), WorkloadApiError>;
}

/// Client for runs without a workload service. Every heartbeat succeeds.
#[derive(Debug, Default)]
pub struct NoopWorkloadApiClient;

#[async_trait]
impl WorkloadApiClient for NoopWorkloadApiClient {
    async fn heartbeat(&self, workload_id: &str) -> Result<(), WorkloadApiError> {
        tracing::trace!(workload_id, "Workload heartbeat");
        Ok(())
    }
}
