use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};

use synclane_engine::config::{parser, validator};
use synclane_engine::ReplaySource;
use synclane_types::StreamDescriptor;

/// Execute the `check` command: validate sync config and the replayed messages.
pub fn execute(sync_path: &Path) -> Result<()> {
    // 1. Parse sync YAML
    let config = parser::parse_sync(sync_path)
        .with_context(|| format!("Failed to parse sync: {}", sync_path.display()))?;

    // 2. Validate sync structure
    validator::validate_sync(&config)?;
    println!("Sync structure:    OK");

    // 3. Load source messages
    let source = ReplaySource::from_jsonl(&config.source.messages)?;
    println!("Source messages:   OK ({} messages)", source.remaining());

    // 4. Every stream the source mentions must be configured
    let unknown = unknown_streams(&source, config.catalog.descriptors().collect());
    if unknown.is_empty() {
        println!("Catalog coverage:  OK");
        println!("\nAll checks passed.");
        Ok(())
    } else {
        println!("Catalog coverage:  FAILED");
        for desc in &unknown {
            println!("  unknown stream: {desc}");
        }
        anyhow::bail!("One or more checks failed")
    }
}

fn unknown_streams(
    source: &ReplaySource,
    configured: BTreeSet<StreamDescriptor>,
) -> BTreeSet<StreamDescriptor> {
    source
        .messages()
        .filter_map(synclane_types::ProtocolMessage::stream_descriptor)
        .filter(|desc| !configured.contains(desc))
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use synclane_types::ProtocolMessage;

    use super::*;

    #[test]
    fn reports_streams_missing_from_catalog() {
        let users = StreamDescriptor::new("users");
        let ghost = StreamDescriptor::new("ghost");
        let source = ReplaySource::new(vec![
            ProtocolMessage::record(&users, json!({}), 0),
            ProtocolMessage::record(&ghost, json!({}), 0),
        ]);
        let unknown = unknown_streams(&source, BTreeSet::from([users]));
        assert_eq!(unknown, BTreeSet::from([ghost]));
    }
}
