//! Buffered connector analytics traces.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use synclane_types::{AnalyticsTrace, MessageOrigin, ProtocolMessage, TracePayload};

/// Batch size at which buffered analytics are flushed automatically.
pub const MAX_ANALYTICS_MESSAGES_PER_BATCH: usize = 1000;

#[derive(Debug, Default)]
pub struct AnalyticsMessageTracker {
    buffer: Mutex<Vec<(MessageOrigin, AnalyticsTrace)>>,
    flushed: AtomicU64,
}

impl AnalyticsMessageTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer an analytics trace. Other messages are ignored.
    pub fn add_message(&self, message: &ProtocolMessage, origin: MessageOrigin) {
        let Some(TracePayload::Analytics { analytics }) = message.as_trace().map(|t| &t.payload) else {
            return;
        };
        let full = {
            let mut buffer = self.buffer.lock();
            buffer.push((origin, analytics.clone()));
            buffer.len() >= MAX_ANALYTICS_MESSAGES_PER_BATCH
        };
        if full {
            self.flush();
        }
    }

    /// Log and clear the buffer. Returns how many traces were flushed.
    pub fn flush(&self) -> usize {
        let batch = std::mem::take(&mut *self.buffer.lock());
        if batch.is_empty() {
            return 0;
        }
        for (origin, trace) in &batch {
            tracing::info!(
                origin = %origin,
                analytics_type = %trace.kind,
                value = trace.value.as_deref().unwrap_or_default(),
                "Connector analytics"
            );
        }
        self.flushed.fetch_add(batch.len() as u64, Ordering::Relaxed);
        batch.len()
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.lock().len()
    }

    #[must_use]
    pub fn total_flushed(&self) -> u64 {
        self.flushed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use synclane_types::{StreamDescriptor, TraceMessage};

    use super::*;

    fn analytics(kind: &str) -> ProtocolMessage {
        ProtocolMessage::Trace {
            trace: TraceMessage {
                emitted_at: 0,
                payload: TracePayload::Analytics {
                    analytics: AnalyticsTrace {
                        kind: kind.into(),
                        value: Some("1".into()),
                    },
                },
            },
        }
    }

    #[test]
    fn buffers_until_flushed() {
        let tracker = AnalyticsMessageTracker::new();
        tracker.add_message(&analytics("a"), MessageOrigin::Source);
        tracker.add_message(&analytics("b"), MessageOrigin::Destination);
        tracker.add_message(
            &ProtocolMessage::record(&StreamDescriptor::new("s"), json!({}), 0),
            MessageOrigin::Source,
        );
        assert_eq!(tracker.pending(), 2);
        assert_eq!(tracker.flush(), 2);
        assert_eq!(tracker.pending(), 0);
        assert_eq!(tracker.flush(), 0);
    }

    #[test]
    fn full_batch_flushes_itself() {
        let tracker = AnalyticsMessageTracker::new();
        for _ in 0..MAX_ANALYTICS_MESSAGES_PER_BATCH {
            tracker.add_message(&analytics("x"), MessageOrigin::Source);
        }
        assert_eq!(tracker.pending(), 0);
        assert_eq!(tracker.total_flushed(), MAX_ANALYTICS_MESSAGES_PER_BATCH as u64);
    }
}
