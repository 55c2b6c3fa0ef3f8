//! Field selection and lightweight schema validation for source records.

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::Mutex;
use synclane_types::{ConfiguredCatalog, RecordMessage, StreamDescriptor};

/// Per-stream schema findings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaValidationSummary {
    /// Records carrying at least one undeclared field.
    pub records_with_unexpected_fields: u64,
    /// Undeclared field name to occurrence count.
    pub unexpected_fields: BTreeMap<String, u64>,
}

#[derive(Debug)]
pub struct FieldSelector {
    field_selection_enabled: bool,
    selected: HashMap<StreamDescriptor, HashSet<String>>,
    declared: HashMap<StreamDescriptor, HashSet<String>>,
    findings: Mutex<BTreeMap<StreamDescriptor, SchemaValidationSummary>>,
}

impl FieldSelector {
    #[must_use]
    pub fn new(catalog: &ConfiguredCatalog, field_selection_enabled: bool) -> Self {
        let selected = catalog
            .streams
            .iter()
            .filter_map(|s| {
                let fields = s.selected_fields.as_ref()?;
                Some((s.descriptor(), fields.iter().cloned().collect()))
            })
            .collect();
        let declared = catalog
            .streams
            .iter()
            .filter_map(|s| {
                let props = s.schema_properties()?;
                Some((s.descriptor(), props.into_iter().map(str::to_string).collect()))
            })
            .collect();
        Self {
            field_selection_enabled,
            selected,
            declared,
            findings: Mutex::new(BTreeMap::new()),
        }
    }

    /// Drop top-level fields the catalog did not select. No-op when field
    /// selection is disabled or the stream selects every field.
    pub fn filter_selected_fields(&self, record: &mut RecordMessage) {
        if !self.field_selection_enabled {
            return;
        }
        let Some(keep) = self.selected.get(&record.descriptor()) else {
            return;
        };
        if let Some(data) = record.data.as_object_mut() {
            data.retain(|key, _| keep.contains(key));
        }
    }

    /// Count top-level fields absent from the stream's declared schema.
    pub fn validate_schema(&self, record: &RecordMessage) {
        let stream = record.descriptor();
        let (Some(declared), Some(data)) = (self.declared.get(&stream), record.data.as_object()) else {
            return;
        };
        let mut unexpected = data.keys().filter(|k| !declared.contains(*k)).peekable();
        if unexpected.peek().is_none() {
            return;
        }
        let mut findings = self.findings.lock();
        let summary = findings.entry(stream).or_default();
        summary.records_with_unexpected_fields += 1;
        for field in unexpected {
            *summary.unexpected_fields.entry(field.clone()).or_default() += 1;
        }
    }

    /// Log the per-stream validation summary and return it.
    pub fn report_metrics(&self) -> BTreeMap<StreamDescriptor, SchemaValidationSummary> {
        let findings = self.findings.lock().clone();
        for (stream, summary) in &findings {
            let fields: Vec<&str> = summary.unexpected_fields.keys().map(String::as_str).collect();
            tracing::warn!(
                stream = %stream,
                records = summary.records_with_unexpected_fields,
                fields = ?fields,
                "Records contained fields not declared in the stream schema"
            );
        }
        findings
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use synclane_types::ConfiguredStream;

    use super::*;

    fn catalog() -> ConfiguredCatalog {
        let mut users = ConfiguredStream::new(&StreamDescriptor::new("users"));
        users.selected_fields = Some(vec!["id".into(), "name".into()]);
        users.json_schema = json!({"properties": {"id": {}, "name": {}}});
        let events = ConfiguredStream::new(&StreamDescriptor::new("events"));
        ConfiguredCatalog::new(vec![users, events])
    }

    fn record(stream: &str, data: serde_json::Value) -> RecordMessage {
        RecordMessage {
            stream: stream.into(),
            namespace: None,
            data,
            emitted_at: 0,
        }
    }

    #[test]
    fn unselected_fields_are_dropped() {
        let selector = FieldSelector::new(&catalog(), true);
        let mut r = record("users", json!({"id": 1, "name": "a", "secret": "x"}));
        selector.filter_selected_fields(&mut r);
        assert_eq!(r.data, json!({"id": 1, "name": "a"}));
    }

    #[test]
    fn disabled_selection_keeps_everything() {
        let selector = FieldSelector::new(&catalog(), false);
        let mut r = record("users", json!({"id": 1, "secret": "x"}));
        selector.filter_selected_fields(&mut r);
        assert_eq!(r.data, json!({"id": 1, "secret": "x"}));
    }

    #[test]
    fn streams_without_selection_are_untouched() {
        let selector = FieldSelector::new(&catalog(), true);
        let mut r = record("events", json!({"a": 1}));
        selector.filter_selected_fields(&mut r);
        assert_eq!(r.data, json!({"a": 1}));
    }

    #[test]
    fn undeclared_fields_are_counted() {
        let selector = FieldSelector::new(&catalog(), false);
        selector.validate_schema(&record("users", json!({"id": 1, "extra": 2})));
        selector.validate_schema(&record("users", json!({"id": 2, "extra": 3, "more": 4})));
        selector.validate_schema(&record("users", json!({"id": 3})));
        selector.validate_schema(&record("events", json!({"anything": 1})));

        let report = selector.report_metrics();
        let users = &report[&StreamDescriptor::new("users")];
        assert_eq!(users.records_with_unexpected_fields, 2);
        assert_eq!(users.unexpected_fields["extra"], 2);
        assert_eq!(users.unexpected_fields["more"], 1);
        assert!(!report.contains_key(&StreamDescriptor::new("events")));
    }
}
