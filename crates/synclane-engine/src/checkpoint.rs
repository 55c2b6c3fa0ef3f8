//! Checkpoint identity: stats-tracking ids and content hashes.

use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use synclane_types::{StateMessage, StateType};

/// Hands out the stats-tracking id attached to every source checkpoint so
/// the destination's echo can be matched back to it.
#[derive(Debug)]
pub struct StateIdAttacher {
    next: AtomicU64,
}

impl StateIdAttacher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Overwrite `state.id` with the next id.
    pub fn attach(&self, state: &mut StateMessage) -> u64 {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        state.id = Some(id);
        id
    }
}

impl Default for StateIdAttacher {
    fn default() -> Self {
        Self::new()
    }
}

/// Id used to correlate source and destination copies of a checkpoint.
/// Falls back to the content hash when no id was attached.
#[must_use]
pub fn stats_tracking_id(state: &StateMessage) -> u64 {
    state.id.unwrap_or_else(|| u64::from(state_hash(state)))
}

/// `murmur3_32` (seed 0) over the serialized checkpoint payload: the global
/// state, the stream state, or the legacy blob depending on the type.
#[must_use]
pub fn state_hash(state: &StateMessage) -> u32 {
    let payload = match state.state_type {
        StateType::Global => serde_json::to_vec(&state.global),
        StateType::Stream => serde_json::to_vec(
            &state
                .stream
                .as_ref()
                .and_then(|s| s.stream_state.as_ref())
                .unwrap_or(&Value::Null),
        ),
        StateType::Legacy => serde_json::to_vec(&state.data),
    }
    .unwrap_or_default();
    murmur3::murmur3_32(&mut Cursor::new(payload), 0).unwrap_or_default()
}
