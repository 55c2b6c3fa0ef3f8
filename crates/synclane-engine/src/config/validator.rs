//! Semantic validation for parsed sync configuration values.

use std::collections::HashSet;

use anyhow::{bail, Result};
use synclane_types::SyncMode;

use crate::config::flags::{Flag, FlagValue};
use crate::config::types::{NamespaceDefinition, SyncConfig};

/// Flags that must hold a strictly positive integer.
const POSITIVE_INT_FLAGS: &[Flag] = &[
    Flag::DestinationTimeoutSeconds,
    Flag::WorkloadHeartbeatRateSeconds,
    Flag::WorkloadHeartbeatTimeoutMinutes,
];

/// Validate a parsed sync configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the sync config.
pub fn validate_sync(config: &SyncConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "Unsupported sync version '{}', expected '1.0'",
            config.version
        ));
    }

    if config.connection.job_id < 0 {
        errors.push("connection.job_id must not be negative".to_string());
    }

    if config.catalog.streams.is_empty() {
        errors.push("Catalog must define at least one stream".to_string());
    }

    let mut seen = HashSet::new();
    for (i, stream) in config.catalog.streams.iter().enumerate() {
        if stream.name.trim().is_empty() {
            errors.push(format!("Stream {i} has an empty name"));
        }
        if !seen.insert(stream.descriptor()) {
            errors.push(format!("Stream '{}' is configured more than once", stream.descriptor()));
        }
        if stream.sync_mode == SyncMode::Incremental && stream.cursor_field.is_none() {
            errors.push(format!(
                "Stream '{}' uses incremental sync but has no cursor_field",
                stream.name
            ));
        }
        if stream.selected_fields.as_ref().is_some_and(Vec::is_empty) {
            errors.push(format!(
                "Stream '{}' selects no fields; omit selected_fields to keep all",
                stream.name
            ));
        }
    }

    if config.source.messages.as_os_str().is_empty() {
        errors.push("source.messages must not be empty".to_string());
    }

    if config.destination.namespace_definition == NamespaceDefinition::CustomFormat
        && config
            .destination
            .namespace_format
            .as_deref()
            .is_none_or(|f| f.trim().is_empty())
    {
        errors.push(
            "destination.namespace_definition 'custom_format' requires namespace_format".to_string(),
        );
    }

    for flag in POSITIVE_INT_FLAGS {
        if let Some(FlagValue::Int(v)) = config.flags.get(flag) {
            if *v <= 0 {
                errors.push(format!("flag '{}' must be > 0", flag.as_str()));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Sync validation failed:\n  - {}", errors.join("\n  - "));
    }
}
