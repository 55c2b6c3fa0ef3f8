//! Configured catalog types.
//!
//! A [`ConfiguredCatalog`] is the set of [`ConfiguredStream`]s selected for one
//! sync, each with its read/write modes and optional field selection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::StreamDescriptor;

/// How data is read from a source stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// One-time full read of all records.
    #[default]
    FullRefresh,
    /// Cursor-based incremental reads since last checkpoint.
    Incremental,
}

/// How data is written to a destination stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationSyncMode {
    #[default]
    Append,
    Overwrite,
    AppendDedup,
}

/// A stream selected for replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfiguredStream {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// JSON schema of the stream's records.
    #[serde(default)]
    pub json_schema: Value,
    #[serde(default)]
    pub sync_mode: SyncMode,
    #[serde(default)]
    pub destination_sync_mode: DestinationSyncMode,
    /// Top-level fields to keep. `None` keeps every field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_fields: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primary_key: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_field: Option<String>,
}

impl ConfiguredStream {
    /// Minimal full-refresh append stream.
    #[must_use]
    pub fn new(descriptor: &StreamDescriptor) -> Self {
        Self {
            name: descriptor.name.clone(),
            namespace: descriptor.namespace.clone(),
            json_schema: Value::Null,
            sync_mode: SyncMode::default(),
            destination_sync_mode: DestinationSyncMode::default(),
            selected_fields: None,
            primary_key: Vec::new(),
            cursor_field: None,
        }
    }

    #[must_use]
    pub fn descriptor(&self) -> StreamDescriptor {
        StreamDescriptor {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
        }
    }

    /// Property names declared in the stream's JSON schema, if any.
    #[must_use]
    pub fn schema_properties(&self) -> Option<Vec<&str>> {
        self.json_schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.keys().map(String::as_str).collect())
    }
}

/// Streams selected for one sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfiguredCatalog {
    pub streams: Vec<ConfiguredStream>,
}

impl ConfiguredCatalog {
    #[must_use]
    pub fn new(streams: Vec<ConfiguredStream>) -> Self {
        Self { streams }
    }

    pub fn descriptors(&self) -> impl Iterator<Item = StreamDescriptor> + '_ {
        self.streams.iter().map(ConfiguredStream::descriptor)
    }

    #[must_use]
    pub fn find(&self, descriptor: &StreamDescriptor) -> Option<&ConfiguredStream> {
        self.streams
            .iter()
            .find(|s| s.name == descriptor.name && s.namespace == descriptor.namespace)
    }
}
