//! Destination-side stream naming.
//!
//! Messages bound for the destination have their namespace rewritten per
//! the configured [`NamespaceDefinition`] and their stream name prefixed.
//! Messages coming back from the destination are reverted to the source's
//! names so that bookkeeping keys stay canonical.

use std::collections::HashMap;

use synclane_types::{ConfiguredCatalog, ProtocolMessage, StreamDescriptor, TracePayload};

use crate::config::types::DestinationConfig;
use crate::config::NamespaceDefinition;

const SOURCE_NAMESPACE_PLACEHOLDER: &str = "${SOURCE_NAMESPACE}";

#[derive(Debug, Clone)]
pub struct NamespaceMapper {
    definition: NamespaceDefinition,
    format: Option<String>,
    prefix: String,
    reverse: HashMap<StreamDescriptor, StreamDescriptor>,
}

impl NamespaceMapper {
    /// Build a mapper and index the catalog for reverse lookups.
    #[must_use]
    pub fn new(config: &DestinationConfig, catalog: &ConfiguredCatalog) -> Self {
        let mut mapper = Self {
            definition: config.namespace_definition,
            format: config.namespace_format.clone(),
            prefix: config.prefix.clone().unwrap_or_default(),
            reverse: HashMap::new(),
        };
        mapper.reverse = catalog
            .descriptors()
            .map(|source| (mapper.map_descriptor(&source), source))
            .collect();
        mapper
    }

    /// Mapper that leaves every name unchanged.
    #[must_use]
    pub fn identity() -> Self {
        Self {
            definition: NamespaceDefinition::Source,
            format: None,
            prefix: String::new(),
            reverse: HashMap::new(),
        }
    }

    #[must_use]
    pub fn map_descriptor(&self, source: &StreamDescriptor) -> StreamDescriptor {
        if source.is_wildcard() {
            return source.clone();
        }
        StreamDescriptor {
            name: format!("{}{}", self.prefix, source.name),
            namespace: self.map_namespace(source.namespace.as_deref()),
        }
    }

    /// Source descriptor for a destination descriptor. Unknown descriptors
    /// are returned unchanged.
    #[must_use]
    pub fn revert_descriptor(&self, destination: &StreamDescriptor) -> StreamDescriptor {
        self.reverse
            .get(destination)
            .cloned()
            .unwrap_or_else(|| destination.clone())
    }

    fn map_namespace(&self, source_namespace: Option<&str>) -> Option<String> {
        match self.definition {
            NamespaceDefinition::Source => source_namespace.map(str::to_string),
            NamespaceDefinition::Destination => None,
            NamespaceDefinition::CustomFormat => {
                let format = self.format.as_deref().unwrap_or_default();
                let namespace = format.replace(SOURCE_NAMESPACE_PLACEHOLDER, source_namespace.unwrap_or_default());
                (!namespace.trim().is_empty()).then_some(namespace)
            }
        }
    }

    /// Outbound copy of `message` with destination names.
    #[must_use]
    pub fn map_message(&self, message: ProtocolMessage) -> ProtocolMessage {
        rewrite(message, |d| self.map_descriptor(d))
    }

    /// Inbound copy of `message` with source names.
    #[must_use]
    pub fn revert_message(&self, message: ProtocolMessage) -> ProtocolMessage {
        rewrite(message, |d| self.revert_descriptor(d))
    }

    /// Catalog as the destination sees it.
    #[must_use]
    pub fn map_catalog(&self, catalog: &ConfiguredCatalog) -> ConfiguredCatalog {
        let mut mapped = catalog.clone();
        for stream in &mut mapped.streams {
            let desc = self.map_descriptor(&stream.descriptor());
            stream.name = desc.name;
            stream.namespace = desc.namespace;
        }
        mapped
    }
}

fn rewrite(
    mut message: ProtocolMessage,
    f: impl Fn(&StreamDescriptor) -> StreamDescriptor,
) -> ProtocolMessage {
    match &mut message {
        ProtocolMessage::Record { record } => {
            let desc = f(&record.descriptor());
            record.stream = desc.name;
            record.namespace = desc.namespace;
        }
        ProtocolMessage::State { state } => {
            if let Some(stream) = state.stream.as_mut() {
                stream.stream_descriptor = f(&stream.stream_descriptor);
            }
            if let Some(global) = state.global.as_mut() {
                for stream in &mut global.stream_states {
                    stream.stream_descriptor = f(&stream.stream_descriptor);
                }
            }
        }
        ProtocolMessage::Trace { trace } => match &mut trace.payload {
            TracePayload::StreamStatus { stream_status } => {
                stream_status.stream_descriptor = f(&stream_status.stream_descriptor);
            }
            TracePayload::Error { error } => {
                if let Some(desc) = error.stream_descriptor.as_mut() {
                    *desc = f(desc);
                }
            }
            TracePayload::Analytics { .. } | TracePayload::Estimate { .. } => {}
        },
        ProtocolMessage::Control { .. } | ProtocolMessage::Log { .. } => {}
    }
    message
}
