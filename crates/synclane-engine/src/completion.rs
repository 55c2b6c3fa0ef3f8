//! Per-stream completion ledger.
//!
//! Lets the pipeline assert COMPLETE for every catalog stream at a
//! successful exit, even when the source never reported it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use synclane_types::{ConfiguredCatalog, ProtocolMessage, StreamDescriptor, StreamStatus, StreamStatusTrace};

use crate::clock::Clock;
use crate::errors::{ReplicationError, Result};
use crate::mapper::NamespaceMapper;

#[derive(Debug)]
pub struct StreamStatusCompletionTracker {
    clock: Arc<dyn Clock>,
    enabled: AtomicBool,
    streams: Mutex<BTreeMap<StreamDescriptor, bool>>,
}

impl StreamStatusCompletionTracker {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            enabled: AtomicBool::new(false),
            streams: Mutex::new(BTreeMap::new()),
        }
    }

    /// Seed the ledger with every catalog stream, all incomplete. Does
    /// nothing when `enabled` is false.
    pub fn start_tracking(&self, catalog: &ConfiguredCatalog, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            return;
        }
        let mut streams = self.streams.lock();
        streams.clear();
        streams.extend(catalog.descriptors().map(|desc| (desc, false)));
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Record a source stream status.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::UnknownStream`] if tracking is enabled and
    /// the stream is not part of the catalog.
    pub fn track(&self, status: &StreamStatusTrace) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let mut streams = self.streams.lock();
        let entry = streams
            .get_mut(&status.stream_descriptor)
            .ok_or_else(|| ReplicationError::UnknownStream(status.stream_descriptor.clone()))?;
        if status.status == StreamStatus::Complete {
            *entry = true;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_complete(&self, stream: &StreamDescriptor) -> bool {
        self.streams.lock().get(stream).copied().unwrap_or(false)
    }

    /// Synthesized COMPLETE statuses, mapped to destination names.
    ///
    /// A zero exit code completes every catalog stream; any other code only
    /// those seen completing.
    #[must_use]
    pub fn finalize(&self, exit_code: i32, mapper: &NamespaceMapper) -> Vec<ProtocolMessage> {
        if !self.is_enabled() {
            return Vec::new();
        }
        let emitted_at = self.clock.now_millis();
        self.streams
            .lock()
            .iter()
            .filter(|(_, complete)| exit_code == 0 || **complete)
            .map(|(desc, _)| {
                mapper.map_message(ProtocolMessage::stream_status(
                    desc.clone(),
                    StreamStatus::Complete,
                    Vec::new(),
                    emitted_at,
                ))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use synclane_types::ConfiguredStream;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::types::DestinationConfig;

    fn catalog(names: &[&str]) -> ConfiguredCatalog {
        ConfiguredCatalog::new(
            names
                .iter()
                .map(|n| ConfiguredStream::new(&StreamDescriptor::new(*n)))
                .collect(),
        )
    }

    fn status(name: &str, status: StreamStatus) -> StreamStatusTrace {
        StreamStatusTrace {
            stream_descriptor: StreamDescriptor::new(name),
            status,
            reasons: vec![],
        }
    }

    fn tracker() -> StreamStatusCompletionTracker {
        StreamStatusCompletionTracker::new(Arc::new(ManualClock::at(42)))
    }

    #[test]
    fn success_completes_every_stream() {
        let t = tracker();
        t.start_tracking(&catalog(&["a", "b"]), true);
        let out = t.finalize(0, &NamespaceMapper::identity());
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|m| m.as_stream_status().unwrap().status == StreamStatus::Complete));
        assert_eq!(out[0].as_trace().unwrap().emitted_at, 42);
    }

    #[test]
    fn failure_completes_only_observed_streams() {
        let t = tracker();
        t.start_tracking(&catalog(&["a", "b"]), true);
        t.track(&status("a", StreamStatus::Running)).unwrap();
        t.track(&status("b", StreamStatus::Complete)).unwrap();
        let out = t.finalize(1, &NamespaceMapper::identity());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].stream_descriptor(), Some(StreamDescriptor::new("b")));
    }

    #[test]
    fn unknown_stream_is_rejected() {
        let t = tracker();
        t.start_tracking(&catalog(&["a"]), true);
        let err = t.track(&status("ghost", StreamStatus::Complete)).unwrap_err();
        assert!(matches!(err, ReplicationError::UnknownStream(d) if d.name == "ghost"));
    }

    #[test]
    fn disabled_tracker_is_a_no_op() {
        let t = tracker();
        t.start_tracking(&catalog(&["a"]), false);
        t.track(&status("ghost", StreamStatus::Complete)).unwrap();
        assert!(t.finalize(0, &NamespaceMapper::identity()).is_empty());
    }

    #[test]
    fn finalized_statuses_use_destination_names() {
        let cat = catalog(&["a"]);
        let mapper = NamespaceMapper::new(
            &DestinationConfig {
                prefix: Some("p_".into()),
                ..DestinationConfig::default()
            },
            &cat,
        );
        let t = tracker();
        t.start_tracking(&cat, true);
        let out = t.finalize(0, &mapper);
        assert_eq!(out[0].stream_descriptor(), Some(StreamDescriptor::new("p_a")));
    }

    proptest! {
        #[test]
        fn finalize_matches_exit_code(completed in proptest::collection::vec(any::<bool>(), 1..8), exit_code in 0i32..3) {
            let names: Vec<String> = (0..completed.len()).map(|i| format!("s{i}")).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let t = tracker();
            t.start_tracking(&catalog(&refs), true);
            for (name, done) in names.iter().zip(&completed) {
                if *done {
                    t.track(&status(name, StreamStatus::Complete)).unwrap();
                }
            }
            let out = t.finalize(exit_code, &NamespaceMapper::identity());
            let expected = if exit_code == 0 { completed.len() } else { completed.iter().filter(|c| **c).count() };
            prop_assert_eq!(out.len(), expected);
        }
    }
}
