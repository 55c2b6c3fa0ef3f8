//! Sync YAML configuration types.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use synclane_types::{ConfiguredCatalog, ReplicationContext};

use crate::checksum::DeploymentInfo;
use crate::config::flags::{Flag, FlagValue, StaticFlagClient};

/// Top-level sync configuration parsed from YAML.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    pub version: String,
    pub connection: ReplicationContext,
    pub catalog: ConfiguredCatalog,
    pub source: SourceConfig,
    #[serde(default)]
    pub destination: DestinationConfig,
    #[serde(default)]
    pub persistence: Option<PersistenceConfig>,
    #[serde(default)]
    pub flags: HashMap<Flag, FlagValue>,
    #[serde(default)]
    pub deployment: DeploymentInfo,
}

impl SyncConfig {
    /// Flag client serving the `flags:` section.
    #[must_use]
    pub fn flag_client(&self) -> StaticFlagClient {
        StaticFlagClient::new(self.flags.clone())
    }
}

/// Where the source reads its messages from.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// JSONL file of protocol messages to replay.
    pub messages: PathBuf,
    /// Longest silence tolerated between two source messages.
    #[serde(default)]
    pub max_seconds_between_messages: Option<u64>,
}

/// How stream identities are rewritten on the way to the destination.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DestinationConfig {
    #[serde(default)]
    pub namespace_definition: NamespaceDefinition,
    /// Template for `custom_format`; `${SOURCE_NAMESPACE}` is replaced with
    /// the source namespace.
    #[serde(default)]
    pub namespace_format: Option<String>,
    /// Prepended to every stream name.
    #[serde(default)]
    pub prefix: Option<String>,
}

/// Destination namespace policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceDefinition {
    /// Keep the namespace the source reported.
    #[default]
    Source,
    /// Drop the namespace and let the destination use its default.
    Destination,
    /// Build the namespace from `namespace_format`.
    CustomFormat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    pub path: PathBuf,
}
