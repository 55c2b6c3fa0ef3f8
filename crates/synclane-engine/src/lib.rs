//! Replication core for synclane.
//!
//! [`ReplicationWorkerHelper`] processes every message moving between a
//! source and a destination; [`ReplicationWorker`] drives the two connectors
//! concurrently around it.

#![warn(clippy::pedantic)]

pub mod analytics;
pub mod checkpoint;
pub mod checksum;
pub mod clock;
pub mod completion;
pub mod config;
pub mod connector;
pub mod errors;
pub mod events;
pub mod fields;
pub mod heartbeat;
pub mod helper;
pub mod local;
pub mod mapper;
pub mod rate_limit;
pub mod stats;
pub mod timeout;
pub mod tracker;
pub mod worker;
pub mod workload;

// Re-export public API for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ReplicationFeatureFlags, SyncConfig};
pub use connector::{ConnectorStartConfig, Destination, Source};
pub use errors::ReplicationError;
pub use events::{EventPublisher, ReplicationEvent, TracingEventPublisher};
pub use helper::{Collaborators, ReplicationInput, ReplicationWorkerHelper};
pub use local::{EchoDestination, ReplaySource};
pub use worker::{ReplicationCanceller, ReplicationWorker, WorkerOptions};
