//! Shared data model for the synclane replication core.
//!
//! Pure data types: protocol messages exchanged with connectors, the
//! configured catalog, the per-attempt replication context, failure reasons,
//! and the terminal sync summary. Kept free of engine dependencies so the
//! state and engine crates can share them.

#![warn(clippy::pedantic)]

pub mod catalog;
pub mod context;
pub mod failure;
pub mod message;
pub mod output;

pub use catalog::{ConfiguredCatalog, ConfiguredStream, DestinationSyncMode, SyncMode};
pub use context::ReplicationContext;
pub use failure::{FailureOrigin, FailureReason, FailureType};
pub use message::{
    AnalyticsTrace, ControlMessage, ControlType, ErrorFailureType, ErrorTrace, EstimateTrace,
    EstimateType, GlobalState, LogLevel, LogMessage, MessageOrigin, ProtocolMessage,
    RateLimitedReason, RecordMessage, StateMessage, StateStats, StateType, StreamDescriptor,
    StreamState, StreamStatus, StreamStatusReason, StreamStatusReasonType, StreamStatusTrace,
    TraceMessage, TracePayload,
};
pub use output::{
    PerformanceMetrics, ReplicationAttemptSummary, ReplicationOutput, ReplicationStatus,
    StageTiming, StreamSyncStats, SyncStats,
};
