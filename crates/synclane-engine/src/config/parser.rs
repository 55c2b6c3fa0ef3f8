//! Sync YAML parsing with environment variable substitution.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::types::SyncConfig;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Placeholders interpreted later by the namespace mapper, never by the
/// environment.
const RESERVED_PLACEHOLDERS: &[&str] = &["SOURCE_NAMESPACE"];

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns an error if any referenced environment variable is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let mut errors = Vec::new();

    for cap in ENV_VAR_RE.captures_iter(input) {
        let var_name = &cap[1];
        if RESERVED_PLACEHOLDERS.contains(&var_name) {
            continue;
        }
        match std::env::var(var_name) {
            Ok(val) => {
                result = result.replace(&cap[0], &val);
            }
            Err(_) => {
                errors.push(var_name.to_string());
            }
        }
    }

    if !errors.is_empty() {
        anyhow::bail!("Missing environment variable(s): {}", errors.join(", "));
    }

    Ok(result)
}

/// Parse a sync YAML string (after env var substitution).
///
/// # Errors
///
/// Returns an error if env var substitution fails or the YAML is invalid.
pub fn parse_sync_str(yaml_str: &str) -> Result<SyncConfig> {
    let substituted = substitute_env_vars(yaml_str)?;
    let config: SyncConfig =
        serde_yaml::from_str(&substituted).context("Failed to parse sync YAML")?;
    Ok(config)
}

/// Parse a sync YAML file. Relative `source.messages` and
/// `persistence.path` entries are resolved against the file's directory.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn parse_sync(path: &Path) -> Result<SyncConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read sync file: {}", path.display()))?;
    let mut config = parse_sync_str(&content)?;

    if let Some(base) = path.parent() {
        if config.source.messages.is_relative() {
            config.source.messages = base.join(&config.source.messages);
        }
        if let Some(persistence) = config.persistence.as_mut() {
            if persistence.path.is_relative() {
                persistence.path = base.join(&persistence.path);
            }
        }
    }
    Ok(config)
}
