//! Persistence trait consumed by the replication helper.

use synclane_types::{ReplicationOutput, StateMessage};
use uuid::Uuid;

use crate::error;

/// Durable storage for destination-acknowledged checkpoints.
///
/// Implementations must be `Send + Sync` because the destination read loop
/// persists checkpoints from its own task.
pub trait SyncPersistence: Send + Sync {
    /// Record `state` as the latest checkpoint for its stream (or for the
    /// whole connection when the checkpoint is global or legacy).
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint cannot be serialized or stored.
    fn persist(&self, connection_id: Uuid, state: &StateMessage) -> error::Result<()>;

    /// Every latest checkpoint stored for `connection_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored rows cannot be read.
    fn latest_checkpoints(&self, connection_id: Uuid) -> error::Result<Vec<StateMessage>>;

    /// Append the terminal output of one attempt to the attempt history.
    ///
    /// # Errors
    ///
    /// Returns an error if the summary cannot be serialized or stored.
    fn record_attempt(
        &self,
        connection_id: Uuid,
        job_id: i64,
        attempt: u32,
        output: &ReplicationOutput,
    ) -> error::Result<()>;
}
