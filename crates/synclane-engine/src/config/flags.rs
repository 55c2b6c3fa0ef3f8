//! Feature-flag evaluation, resolved once per sync.
//!
//! Components never query a [`FeatureFlagClient`] directly. The driver calls
//! [`ReplicationFeatureFlags::resolve`] once and hands the resulting value to
//! every component constructor, so a flag cannot flap mid-sync.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use synclane_types::ReplicationContext;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

/// Every flag the replication core reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flag {
    ProcessRateLimitedMessage,
    StreamStatusCompletionTracking,
    ShouldFailSyncOnDestinationTimeout,
    DestinationTimeoutEnabled,
    DestinationTimeoutSeconds,
    ShouldFailSyncIfHeartbeatFailure,
    WorkloadHeartbeatRateSeconds,
    WorkloadHeartbeatTimeoutMinutes,
    FailSyncOnInvalidChecksum,
    EmitStateChecksumEvents,
    FieldSelectionEnabled,
    LogStateMessages,
}

impl Flag {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProcessRateLimitedMessage => "process_rate_limited_message",
            Self::StreamStatusCompletionTracking => "stream_status_completion_tracking",
            Self::ShouldFailSyncOnDestinationTimeout => "should_fail_sync_on_destination_timeout",
            Self::DestinationTimeoutEnabled => "destination_timeout_enabled",
            Self::DestinationTimeoutSeconds => "destination_timeout_seconds",
            Self::ShouldFailSyncIfHeartbeatFailure => "should_fail_sync_if_heartbeat_failure",
            Self::WorkloadHeartbeatRateSeconds => "workload_heartbeat_rate_seconds",
            Self::WorkloadHeartbeatTimeoutMinutes => "workload_heartbeat_timeout_minutes",
            Self::FailSyncOnInvalidChecksum => "fail_sync_on_invalid_checksum",
            Self::EmitStateChecksumEvents => "emit_state_checksum_events",
            Self::FieldSelectionEnabled => "field_selection_enabled",
            Self::LogStateMessages => "log_state_messages",
        }
    }
}

/// Value of a flag, either on/off or numeric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Int(i64),
}

/// Entities a flag may be targeted at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagContext {
    pub connection_id: Uuid,
    pub workspace_id: Uuid,
    pub source_definition_id: Uuid,
    pub destination_definition_id: Uuid,
}

impl From<&ReplicationContext> for FlagContext {
    fn from(ctx: &ReplicationContext) -> Self {
        Self {
            connection_id: ctx.connection_id,
            workspace_id: ctx.workspace_id,
            source_definition_id: ctx.source_definition_id,
            destination_definition_id: ctx.destination_definition_id,
        }
    }
}

/// Source of flag values. Assumed side-effect-free and fast.
pub trait FeatureFlagClient: Send + Sync {
    fn bool_variation(&self, flag: Flag, ctx: &FlagContext) -> bool;
    fn int_variation(&self, flag: Flag, ctx: &FlagContext) -> i64;
}

/// Flag client backed by a fixed map, with per-connection overrides.
///
/// Flags absent from the map fall back to [`default_flag_value`].
#[derive(Debug, Clone, Default)]
pub struct StaticFlagClient {
    values: HashMap<Flag, FlagValue>,
    connection_overrides: HashMap<(Uuid, Flag), FlagValue>,
}

impl StaticFlagClient {
    #[must_use]
    pub fn new(values: HashMap<Flag, FlagValue>) -> Self {
        Self {
            values,
            connection_overrides: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, flag: Flag, value: FlagValue) -> Self {
        self.values.insert(flag, value);
        self
    }

    #[must_use]
    pub fn with_connection_override(mut self, connection_id: Uuid, flag: Flag, value: FlagValue) -> Self {
        self.connection_overrides.insert((connection_id, flag), value);
        self
    }

    fn lookup(&self, flag: Flag, ctx: &FlagContext) -> FlagValue {
        self.connection_overrides
            .get(&(ctx.connection_id, flag))
            .or_else(|| self.values.get(&flag))
            .copied()
            .unwrap_or_else(|| default_flag_value(flag))
    }
}

impl FeatureFlagClient for StaticFlagClient {
    fn bool_variation(&self, flag: Flag, ctx: &FlagContext) -> bool {
        match self.lookup(flag, ctx) {
            FlagValue::Bool(b) => b,
            FlagValue::Int(i) => i != 0,
        }
    }

    fn int_variation(&self, flag: Flag, ctx: &FlagContext) -> i64 {
        match self.lookup(flag, ctx) {
            FlagValue::Int(i) => i,
            FlagValue::Bool(b) => i64::from(b),
        }
    }
}

/// Value used when no client entry exists for `flag`.
#[must_use]
pub fn default_flag_value(flag: Flag) -> FlagValue {
    match flag {
        Flag::ProcessRateLimitedMessage
        | Flag::StreamStatusCompletionTracking
        | Flag::ShouldFailSyncIfHeartbeatFailure
        | Flag::FailSyncOnInvalidChecksum
        | Flag::EmitStateChecksumEvents
        | Flag::LogStateMessages => FlagValue::Bool(false),
        Flag::ShouldFailSyncOnDestinationTimeout
        | Flag::DestinationTimeoutEnabled
        | Flag::FieldSelectionEnabled => FlagValue::Bool(true),
        Flag::DestinationTimeoutSeconds => FlagValue::Int(86_400),
        Flag::WorkloadHeartbeatRateSeconds => FlagValue::Int(60),
        Flag::WorkloadHeartbeatTimeoutMinutes => FlagValue::Int(10),
    }
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// All flag-gated behavior for one sync, resolved once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct ReplicationFeatureFlags {
    pub process_rate_limited_message: bool,
    pub stream_status_completion_tracking: bool,
    pub fail_sync_on_destination_timeout: bool,
    pub destination_timeout_enabled: bool,
    pub destination_timeout: Duration,
    pub fail_sync_on_heartbeat_failure: bool,
    pub workload_heartbeat_interval: Duration,
    pub workload_heartbeat_timeout: Duration,
    pub fail_sync_on_invalid_checksum: bool,
    pub emit_state_checksum_events: bool,
    pub field_selection_enabled: bool,
    pub log_state_messages: bool,
}

impl ReplicationFeatureFlags {
    /// Evaluate every flag against `ctx`.
    #[must_use]
    pub fn resolve(client: &dyn FeatureFlagClient, ctx: &FlagContext) -> Self {
        let secs = |flag| Duration::from_secs(u64::try_from(client.int_variation(flag, ctx)).unwrap_or(0));
        Self {
            process_rate_limited_message: client.bool_variation(Flag::ProcessRateLimitedMessage, ctx),
            stream_status_completion_tracking: client
                .bool_variation(Flag::StreamStatusCompletionTracking, ctx),
            fail_sync_on_destination_timeout: client
                .bool_variation(Flag::ShouldFailSyncOnDestinationTimeout, ctx),
            destination_timeout_enabled: client.bool_variation(Flag::DestinationTimeoutEnabled, ctx),
            destination_timeout: secs(Flag::DestinationTimeoutSeconds),
            fail_sync_on_heartbeat_failure: client
                .bool_variation(Flag::ShouldFailSyncIfHeartbeatFailure, ctx),
            workload_heartbeat_interval: secs(Flag::WorkloadHeartbeatRateSeconds),
            workload_heartbeat_timeout: secs(Flag::WorkloadHeartbeatTimeoutMinutes) * 60,
            fail_sync_on_invalid_checksum: client.bool_variation(Flag::FailSyncOnInvalidChecksum, ctx),
            emit_state_checksum_events: client.bool_variation(Flag::EmitStateChecksumEvents, ctx),
            field_selection_enabled: client.bool_variation(Flag::FieldSelectionEnabled, ctx),
            log_state_messages: client.bool_variation(Flag::LogStateMessages, ctx),
        }
    }
}

impl Default for ReplicationFeatureFlags {
    fn default() -> Self {
        Self::resolve(&StaticFlagClient::default(), &FlagContext::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_client_is_empty() {
        let flags = ReplicationFeatureFlags::default();
        assert!(!flags.process_rate_limited_message);
        assert!(flags.fail_sync_on_destination_timeout);
        assert_eq!(flags.destination_timeout, Duration::from_secs(86_400));
        assert_eq!(flags.workload_heartbeat_interval, Duration::from_secs(60));
        assert_eq!(flags.workload_heartbeat_timeout, Duration::from_secs(600));
    }

    #[test]
    fn connection_override_beats_global_value() {
        let conn = Uuid::new_v4();
        let client = StaticFlagClient::default()
            .with(Flag::ProcessRateLimitedMessage, FlagValue::Bool(false))
            .with_connection_override(conn, Flag::ProcessRateLimitedMessage, FlagValue::Bool(true));

        let targeted = FlagContext {
            connection_id: conn,
            ..FlagContext::default()
        };
        assert!(ReplicationFeatureFlags::resolve(&client, &targeted).process_rate_limited_message);
        assert!(
            !ReplicationFeatureFlags::resolve(&client, &FlagContext::default())
                .process_rate_limited_message
        );
    }

    #[test]
    fn negative_durations_clamp_to_zero() {
        let client = StaticFlagClient::default().with(Flag::DestinationTimeoutSeconds, FlagValue::Int(-5));
        let flags = ReplicationFeatureFlags::resolve(&client, &FlagContext::default());
        assert_eq!(flags.destination_timeout, Duration::ZERO);
    }

    #[test]
    fn flag_value_deserializes_untagged() {
        let v: HashMap<Flag, FlagValue> =
            serde_yaml::from_str("process_rate_limited_message: true\ndestination_timeout_seconds: 30\n")
                .unwrap();
        assert_eq!(v[&Flag::ProcessRateLimitedMessage], FlagValue::Bool(true));
        assert_eq!(v[&Flag::DestinationTimeoutSeconds], FlagValue::Int(30));
    }
}
