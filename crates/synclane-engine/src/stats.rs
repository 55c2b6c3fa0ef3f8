//! Per-stream record and checkpoint bookkeeping.
//!
//! Records seen since the last source checkpoint accumulate in an "emitted"
//! bucket. A source checkpoint stages that bucket under the checkpoint's
//! stats-tracking id; the destination's acknowledgement of that id moves
//! every staged bucket up to and including it into the committed counters.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use synclane_types::{
    EstimateTrace, EstimateType, MessageOrigin, RecordMessage, StateMessage, StateType,
    StreamDescriptor, StreamSyncStats, SyncStats,
};

use crate::checkpoint::stats_tracking_id;
use crate::checksum::{ChecksumCheck, StateChecksumCountEventHandler};
use crate::errors::Result;

// ---------------------------------------------------------------------------
// Per-stream tracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
struct EmittedCounters {
    records: u64,
    bytes: u64,
    filtered_records: u64,
    filtered_bytes: u64,
}

#[derive(Debug)]
struct StagedStats {
    state_id: u64,
    counters: EmittedCounters,
}

#[derive(Debug, Clone, Copy, Default)]
struct StreamCounters {
    emitted_records: u64,
    emitted_bytes: u64,
    filtered_records: u64,
    filtered_bytes: u64,
    committed_records: u64,
    committed_bytes: u64,
    rejected_records: u64,
    estimated_records: Option<u64>,
    estimated_bytes: Option<u64>,
    source_state_count: u64,
    destination_state_count: u64,
}

#[derive(Debug)]
struct StreamStatsTracker {
    descriptor: StreamDescriptor,
    stats: StreamCounters,
    emitted: EmittedCounters,
    previous_emitted: EmittedCounters,
    staged: VecDeque<StagedStats>,
    state_ids: HashSet<u64>,
    unreliable: bool,
}

impl StreamStatsTracker {
    fn new(descriptor: StreamDescriptor) -> Self {
        Self {
            descriptor,
            stats: StreamCounters::default(),
            emitted: EmittedCounters::default(),
            previous_emitted: EmittedCounters::default(),
            staged: VecDeque::new(),
            state_ids: HashSet::new(),
            unreliable: false,
        }
    }

    fn track_record(&mut self, bytes: u64) {
        self.emitted.records += 1;
        self.emitted.bytes += bytes;
        self.stats.emitted_records += 1;
        self.stats.emitted_bytes += bytes;
    }

    fn track_filtered_out(&mut self, bytes: u64) {
        self.emitted.filtered_records += 1;
        self.emitted.filtered_bytes += bytes;
        self.stats.filtered_records += 1;
        self.stats.filtered_bytes += bytes;
    }

    fn track_state_from_source(&mut self, state_id: u64) {
        self.stats.source_state_count += 1;
        if self.unreliable {
            return;
        }
        if !self.state_ids.insert(state_id) {
            // Id collision: staged counts can no longer be matched reliably.
            self.unreliable = true;
            self.staged.clear();
            tracing::info!(
                stream = %self.descriptor,
                state_id,
                "State collision detected, disabling state tracking for stream"
            );
            return;
        }
        self.previous_emitted = std::mem::take(&mut self.emitted);
        self.staged.push_back(StagedStats {
            state_id,
            counters: self.previous_emitted,
        });
    }

    fn track_state_from_destination(&mut self, state: &StateMessage, state_id: u64) {
        self.stats.destination_state_count += 1;
        if self.unreliable {
            return;
        }
        if !self.state_ids.contains(&state_id) {
            tracing::warn!(
                stream = %self.descriptor,
                state_id,
                "Unexpected state from destination, id not found in the stored state ids"
            );
            return;
        }
        if self.staged.is_empty() {
            tracing::warn!(
                stream = %self.descriptor,
                state_id,
                "Unexpected state from destination, no staged stats"
            );
            return;
        }

        while let Some(staged) = self.staged.pop_front() {
            self.state_ids.remove(&staged.state_id);
            let c = staged.counters;
            self.stats.committed_bytes += c.bytes.saturating_sub(c.filtered_bytes);
            self.stats.committed_records += c.records.saturating_sub(c.filtered_records);

            if staged.state_id == state_id {
                let rejected = state
                    .destination_stats
                    .and_then(|s| s.rejected_record_count)
                    .filter(|r| *r > 0.0);
                if let Some(rejected) = rejected {
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let rejected = rejected as u64;
                    self.stats.rejected_records += rejected;
                    self.stats.committed_records = self.stats.committed_records.saturating_sub(rejected);
                }
                break;
            }
        }
    }

    fn staged_counters(&self, state_id: u64) -> EmittedCounters {
        match self.staged.iter().find(|s| s.state_id == state_id) {
            Some(staged) => staged.counters,
            None => {
                tracing::warn!(
                    stream = %self.descriptor,
                    state_id,
                    "Could not find the state id in the staged stats"
                );
                EmittedCounters::default()
            }
        }
    }

    fn to_stream_sync_stats(&self, completed: bool, estimates_valid: bool) -> StreamSyncStats {
        let s = self.stats;
        let (records_committed, bytes_committed) = if completed {
            (
                s.emitted_records.saturating_sub(s.filtered_records),
                s.emitted_bytes.saturating_sub(s.filtered_bytes),
            )
        } else {
            (s.committed_records, s.committed_bytes)
        };
        StreamSyncStats {
            stream_name: self.descriptor.name.clone(),
            stream_namespace: self.descriptor.namespace.clone(),
            stats: SyncStats {
                records_emitted: s.emitted_records,
                bytes_emitted: s.emitted_bytes,
                records_committed: Some(records_committed),
                bytes_committed: Some(bytes_committed),
                records_filtered_out: s.filtered_records,
                bytes_filtered_out: s.filtered_bytes,
                estimated_records: s.estimated_records.filter(|_| estimates_valid),
                estimated_bytes: s.estimated_bytes.filter(|_| estimates_valid),
                source_state_messages_emitted: s.source_state_count,
                destination_state_messages_emitted: s.destination_state_count,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Sync-wide tracker
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Inner {
    streams: HashMap<StreamDescriptor, StreamStatsTracker>,
    expected_estimate_type: Option<EstimateType>,
    estimate_error: bool,
    sync_estimated_records: Option<u64>,
    sync_estimated_bytes: Option<u64>,
    checksum_validation_enabled: bool,
}

impl Inner {
    fn tracker(&mut self, descriptor: &StreamDescriptor) -> &mut StreamStatsTracker {
        self.streams
            .entry(descriptor.clone())
            .or_insert_with(|| StreamStatsTracker::new(descriptor.clone()))
    }

    fn named(&self) -> impl Iterator<Item = &StreamStatsTracker> {
        self.streams.values().filter(|t| !t.descriptor.is_wildcard())
    }

    fn emitted_by_stream(&self) -> BTreeMap<StreamDescriptor, u64> {
        self.named()
            .map(|t| (t.descriptor.clone(), t.stats.emitted_records))
            .collect()
    }

    fn committed_by_stream(&self) -> BTreeMap<StreamDescriptor, u64> {
        self.named()
            .map(|t| (t.descriptor.clone(), t.stats.committed_records))
            .collect()
    }

    fn update_validation_status(&mut self, descriptor: &StreamDescriptor, origin: MessageOrigin) {
        let reliable = self.streams.get(descriptor).is_none_or(|t| !t.unreliable);
        if self.checksum_validation_enabled && !reliable {
            tracing::warn!(
                origin = %origin,
                stream = %descriptor,
                "State message checksum validation disabled: state message collision detected"
            );
            self.checksum_validation_enabled = false;
        }
    }
}

/// Sync-wide stats, one [`StreamStatsTracker`] per stream.
///
/// Legacy checkpoints and checkpoints without a stream descriptor are
/// tracked under the wildcard descriptor and only contribute to the totals.
pub struct SyncStatsTracker {
    inner: Mutex<Inner>,
    checksum: Arc<StateChecksumCountEventHandler>,
}

impl std::fmt::Debug for SyncStatsTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStatsTracker")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl SyncStatsTracker {
    #[must_use]
    pub fn new(checksum: Arc<StateChecksumCountEventHandler>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                streams: HashMap::new(),
                expected_estimate_type: None,
                estimate_error: false,
                sync_estimated_records: None,
                sync_estimated_bytes: None,
                checksum_validation_enabled: true,
            }),
            checksum,
        }
    }

    pub fn update_stats(&self, record: &RecordMessage) {
        let bytes = record_size(record);
        self.inner.lock().tracker(&record.descriptor()).track_record(bytes);
    }

    pub fn update_filtered_out_records_stats(&self, record: &RecordMessage) {
        let bytes = record_size(record);
        self.inner.lock().tracker(&record.descriptor()).track_filtered_out(bytes);
    }

    /// Mixing STREAM and SYNC estimates in one sync invalidates all
    /// estimates.
    pub fn update_estimates(&self, estimate: &EstimateTrace) {
        let mut inner = self.inner.lock();
        if inner.estimate_error {
            return;
        }
        match inner.expected_estimate_type {
            None => inner.expected_estimate_type = Some(estimate.estimate_type),
            Some(expected) if expected != estimate.estimate_type => {
                tracing::info!("STREAM and SYNC estimates should not be emitted in the same sync");
                inner.estimate_error = true;
                return;
            }
            Some(_) => {}
        }
        match estimate.estimate_type {
            EstimateType::Stream => {
                let desc = StreamDescriptor {
                    name: estimate.name.clone(),
                    namespace: estimate.namespace.clone(),
                };
                let tracker = inner.tracker(&desc);
                tracker.stats.estimated_records = estimate.row_estimate;
                tracker.stats.estimated_bytes = estimate.byte_estimate;
            }
            EstimateType::Sync => {
                inner.sync_estimated_records = estimate.row_estimate;
                inner.sync_estimated_bytes = estimate.byte_estimate;
            }
        }
    }

    /// Stage the counts covered by a source checkpoint and validate the
    /// source-reported count against them.
    ///
    /// # Errors
    ///
    /// Propagates [`crate::ReplicationError::InvalidChecksum`] from the
    /// checksum handler.
    pub fn update_source_states_stats(&self, state: &StateMessage) -> Result<()> {
        let state_id = stats_tracking_id(state);
        let (platform, enabled, counts, include_stream) = {
            let mut inner = self.inner.lock();
            if state.state_type == StateType::Global {
                let descriptors = state
                    .global
                    .iter()
                    .flat_map(|g| g.stream_states.iter().map(|s| s.stream_descriptor.clone()))
                    .collect::<Vec<_>>();
                for desc in &descriptors {
                    inner.tracker(desc).track_state_from_source(state_id);
                    inner.update_validation_status(desc, MessageOrigin::Source);
                }
                let platform: u64 = inner.streams.values().map(|t| t.previous_emitted.records).sum();
                (platform, inner.checksum_validation_enabled, inner.emitted_by_stream(), false)
            } else {
                let desc = state.stream_descriptor().cloned().unwrap_or_default();
                let tracker = inner.tracker(&desc);
                tracker.track_state_from_source(state_id);
                let platform = tracker.previous_emitted.records;
                inner.update_validation_status(&desc, MessageOrigin::Source);
                (platform, inner.checksum_validation_enabled, inner.emitted_by_stream(), true)
            }
        };

        #[allow(clippy::cast_precision_loss)]
        let mut check = ChecksumCheck::new(state, platform as f64, MessageOrigin::Source);
        check.checksum_validation_enabled = enabled;
        check.include_stream_in_logs = include_stream;
        check.stream_platform_record_counts = Some(&counts);
        self.checksum.validate_state_checksum(&check)
    }

    /// Validate a destination acknowledgement, then commit the staged
    /// counts it covers.
    ///
    /// # Errors
    ///
    /// Propagates [`crate::ReplicationError::InvalidChecksum`]; nothing is
    /// committed in that case.
    pub fn update_destination_state_stats(&self, state: &StateMessage) -> Result<()> {
        let state_id = stats_tracking_id(state);
        let global = state.state_type == StateType::Global;
        let desc = state.stream_descriptor().cloned().unwrap_or_default();

        let (platform, filtered, enabled, counts, include_stream) = {
            let mut inner = self.inner.lock();
            if global {
                let (platform, filtered) = inner.streams.values().fold((0, 0), |(p, f), t| {
                    let c = t.staged_counters(state_id);
                    (p + c.records, f + c.filtered_records)
                });
                let counts = inner.emitted_by_stream();
                (platform, filtered, inner.checksum_validation_enabled, counts, false)
            } else {
                let c = inner.tracker(&desc).staged_counters(state_id);
                let counts = inner.committed_by_stream();
                (c.records, c.filtered_records, inner.checksum_validation_enabled, counts, true)
            }
        };

        #[allow(clippy::cast_precision_loss)]
        let mut check = ChecksumCheck::new(state, platform as f64, MessageOrigin::Destination);
        check.checksum_validation_enabled = enabled;
        check.include_stream_in_logs = include_stream;
        check.stream_platform_record_counts = Some(&counts);
        #[allow(clippy::cast_precision_loss)]
        {
            check.filtered_out_records = filtered as f64;
        }
        self.checksum.validate_state_checksum(&check)?;

        let mut inner = self.inner.lock();
        if global {
            for stream_state in state.global.iter().flat_map(|g| g.stream_states.iter()) {
                inner
                    .tracker(&stream_state.stream_descriptor)
                    .track_state_from_destination(state, state_id);
            }
        } else {
            inner.tracker(&desc).track_state_from_destination(state, state_id);
        }
        Ok(())
    }

    /// False once any stream saw a duplicate checkpoint id.
    #[must_use]
    pub fn checksum_validation_enabled(&self) -> bool {
        self.inner.lock().checksum_validation_enabled
    }

    /// Per-stream stats sorted by descriptor. With `completed`, committed
    /// counts are emitted minus filtered.
    #[must_use]
    pub fn stream_stats(&self, completed: bool) -> Vec<StreamSyncStats> {
        let inner = self.inner.lock();
        let mut trackers = inner.named().collect::<Vec<_>>();
        trackers.sort_by(|a, b| a.descriptor.cmp(&b.descriptor));
        trackers
            .into_iter()
            .map(|t| t.to_stream_sync_stats(completed, !inner.estimate_error))
            .collect()
    }

    /// Sum of the per-stream stats plus state counts from every tracker.
    #[must_use]
    pub fn total_stats(&self, completed: bool) -> SyncStats {
        let streams = self.stream_stats(completed);
        let inner = self.inner.lock();

        let mut total = SyncStats::default();
        if !streams.is_empty() {
            total.records_committed = Some(0);
            total.bytes_committed = Some(0);
        }
        for s in streams.iter().map(|s| &s.stats) {
            total.records_emitted += s.records_emitted;
            total.bytes_emitted += s.bytes_emitted;
            total.records_filtered_out += s.records_filtered_out;
            total.bytes_filtered_out += s.bytes_filtered_out;
            total.records_committed = total.records_committed.map(|c| c + s.records_committed.unwrap_or(0));
            total.bytes_committed = total.bytes_committed.map(|c| c + s.bytes_committed.unwrap_or(0));
        }
        for t in inner.streams.values() {
            total.source_state_messages_emitted += t.stats.source_state_count;
            total.destination_state_messages_emitted += t.stats.destination_state_count;
        }

        if !inner.estimate_error && inner.expected_estimate_type == Some(EstimateType::Sync) {
            total.estimated_records = inner.sync_estimated_records;
            total.estimated_bytes = inner.sync_estimated_bytes;
        } else {
            total.estimated_records = sum_present(streams.iter().map(|s| s.stats.estimated_records));
            total.estimated_bytes = sum_present(streams.iter().map(|s| s.stats.estimated_bytes));
        }
        total
    }

    #[must_use]
    pub fn stream_to_emitted_records(&self) -> BTreeMap<StreamDescriptor, u64> {
        self.inner.lock().emitted_by_stream()
    }

    #[must_use]
    pub fn stream_to_committed_records(&self) -> BTreeMap<StreamDescriptor, u64> {
        self.inner.lock().committed_by_stream()
    }

    #[must_use]
    pub fn total_records_emitted(&self) -> u64 {
        self.inner.lock().streams.values().map(|t| t.stats.emitted_records).sum()
    }

    #[must_use]
    pub fn total_bytes_emitted(&self) -> u64 {
        self.inner.lock().streams.values().map(|t| t.stats.emitted_bytes).sum()
    }

    pub fn end_of_replication(&self, completed_successfully: bool) {
        self.checksum.close(completed_successfully);
    }
}

fn sum_present(values: impl Iterator<Item = Option<u64>>) -> Option<u64> {
    values.flatten().fold(None, |acc, v| Some(acc.unwrap_or(0) + v))
}

/// Serialized size of the record payload.
fn record_size(record: &RecordMessage) -> u64 {
    serde_json::to_vec(&record.data).map_or(0, |b| b.len() as u64)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use synclane_types::{ProtocolMessage, ReplicationContext, StreamState};

    use super::*;
    use crate::checksum::{DeploymentInfo, RecordingErrorReporter};
    use crate::clock::ManualClock;
    use crate::config::{Flag, FlagContext, FlagValue, ReplicationFeatureFlags, StaticFlagClient};
    use crate::errors::ReplicationError;

    fn tracker(fail_on_invalid: bool) -> SyncStatsTracker {
        let client = StaticFlagClient::default().with(Flag::FailSyncOnInvalidChecksum, FlagValue::Bool(fail_on_invalid));
        let flags = ReplicationFeatureFlags::resolve(&client, &FlagContext::default());
        let handler = StateChecksumCountEventHandler::new(
            ReplicationContext::default(),
            &flags,
            DeploymentInfo::default(),
            None,
            Arc::new(RecordingErrorReporter::default()),
            Arc::new(ManualClock::at(0)),
        );
        SyncStatsTracker::new(Arc::new(handler))
    }

    fn users() -> StreamDescriptor {
        StreamDescriptor::new("users").with_namespace("public")
    }

    fn record(desc: &StreamDescriptor, id: u64) -> RecordMessage {
        match ProtocolMessage::record(desc, json!({ "id": id }), 0) {
            ProtocolMessage::Record { record } => record,
            _ => unreachable!(),
        }
    }

    fn state(desc: &StreamDescriptor, cursor: u64, id: u64) -> StateMessage {
        let mut s = StateMessage::for_stream(desc.clone(), json!({ "cursor": cursor }));
        s.id = Some(id);
        s
    }

    // -----------------------------------------------------------------------
    // Staging and committing
    // -----------------------------------------------------------------------

    #[test]
    fn destination_ack_commits_staged_records() {
        let t = tracker(true);
        for i in 0..3 {
            t.update_stats(&record(&users(), i));
        }
        t.update_source_states_stats(&state(&users(), 3, 1).with_source_count(3.0)).unwrap();
        t.update_stats(&record(&users(), 4));

        assert_eq!(t.stream_to_committed_records()[&users()], 0);
        t.update_destination_state_stats(&state(&users(), 3, 1).with_destination_count(3.0))
            .unwrap();

        assert_eq!(t.stream_to_committed_records()[&users()], 3);
        assert_eq!(t.stream_to_emitted_records()[&users()], 4);
        let stats = t.total_stats(false);
        assert_eq!(stats.records_emitted, 4);
        assert_eq!(stats.records_committed, Some(3));
        assert_eq!(stats.source_state_messages_emitted, 1);
        assert_eq!(stats.destination_state_messages_emitted, 1);
    }

    #[test]
    fn ack_of_later_state_commits_everything_before_it() {
        let t = tracker(false);
        t.update_stats(&record(&users(), 1));
        t.update_source_states_stats(&state(&users(), 1, 1)).unwrap();
        t.update_stats(&record(&users(), 2));
        t.update_stats(&record(&users(), 3));
        t.update_source_states_stats(&state(&users(), 3, 2)).unwrap();

        t.update_destination_state_stats(&state(&users(), 3, 2)).unwrap();
        assert_eq!(t.stream_to_committed_records()[&users()], 3);
    }

    #[test]
    fn rejected_records_are_not_committed() {
        let t = tracker(false);
        for i in 0..5 {
            t.update_stats(&record(&users(), i));
        }
        t.update_source_states_stats(&state(&users(), 5, 1)).unwrap();
        let mut ack = state(&users(), 5, 1).with_destination_count(3.0);
        if let Some(stats) = ack.destination_stats.as_mut() {
            stats.rejected_record_count = Some(2.0);
        }
        t.update_destination_state_stats(&ack).unwrap();
        assert_eq!(t.stream_to_committed_records()[&users()], 3);
    }

    #[test]
    fn filtered_records_are_excluded_from_committed() {
        let t = tracker(true);
        t.update_stats(&record(&users(), 1));
        t.update_stats(&record(&users(), 2));
        t.update_filtered_out_records_stats(&record(&users(), 2));
        t.update_source_states_stats(&state(&users(), 2, 1)).unwrap();
        t.update_destination_state_stats(&state(&users(), 2, 1)).unwrap();

        let stats = &t.stream_stats(false)[0].stats;
        assert_eq!(stats.records_committed, Some(1));
        assert_eq!(stats.records_filtered_out, 1);
    }

    #[test]
    fn completed_sync_reports_emitted_minus_filtered_as_committed() {
        let t = tracker(false);
        for i in 0..4 {
            t.update_stats(&record(&users(), i));
        }
        t.update_filtered_out_records_stats(&record(&users(), 9));
        let stats = t.total_stats(true);
        assert_eq!(stats.records_committed, Some(3));
        assert_eq!(t.total_stats(false).records_committed, Some(0));
    }

    #[test]
    fn unknown_destination_state_is_ignored() {
        let t = tracker(false);
        t.update_stats(&record(&users(), 1));
        t.update_destination_state_stats(&state(&users(), 1, 77)).unwrap();
        assert_eq!(t.stream_to_committed_records()[&users()], 0);
        assert_eq!(t.total_stats(false).destination_state_messages_emitted, 1);
    }

    // -----------------------------------------------------------------------
    // Collisions
    // -----------------------------------------------------------------------

    #[test]
    fn duplicate_state_id_disables_checksum_validation() {
        let t = tracker(true);
        t.update_stats(&record(&users(), 1));
        t.update_source_states_stats(&state(&users(), 1, 5)).unwrap();
        assert!(t.checksum_validation_enabled());

        // Wrong count, but the collision makes the comparison informational.
        t.update_source_states_stats(&state(&users(), 1, 5).with_source_count(40.0))
            .unwrap();
        assert!(!t.checksum_validation_enabled());

        t.update_destination_state_stats(&state(&users(), 1, 5)).unwrap();
        assert_eq!(t.stream_to_committed_records()[&users()], 0);
    }

    // -----------------------------------------------------------------------
    // Checksums through the tracker
    // -----------------------------------------------------------------------

    #[test]
    fn source_count_mismatch_fails_when_enabled() {
        let t = tracker(true);
        t.update_stats(&record(&users(), 1));
        let err = t
            .update_source_states_stats(&state(&users(), 1, 1).with_source_count(2.0))
            .unwrap_err();
        assert!(matches!(err, ReplicationError::InvalidChecksum(_)));
    }

    #[test]
    fn destination_mismatch_leaves_counts_uncommitted() {
        let t = tracker(true);
        for i in 0..3 {
            t.update_stats(&record(&users(), i));
        }
        t.update_source_states_stats(&state(&users(), 3, 1).with_source_count(3.0)).unwrap();
        let ack = state(&users(), 3, 1).with_source_count(3.0).with_destination_count(2.0);
        assert!(t.update_destination_state_stats(&ack).is_err());
        assert_eq!(t.stream_to_committed_records()[&users()], 0);
    }

    #[test]
    fn global_state_sums_counts_across_streams() {
        let t = tracker(true);
        let orders = StreamDescriptor::new("orders");
        t.update_stats(&record(&users(), 1));
        t.update_stats(&record(&orders, 1));
        t.update_stats(&record(&orders, 2));

        let mut global = StateMessage::global(
            json!({"lsn": 10}),
            vec![
                StreamState { stream_descriptor: users(), stream_state: None },
                StreamState { stream_descriptor: orders.clone(), stream_state: None },
            ],
        )
        .with_source_count(3.0);
        global.id = Some(1);
        t.update_source_states_stats(&global).unwrap();

        let ack = global.clone().with_destination_count(3.0);
        t.update_destination_state_stats(&ack).unwrap();
        assert_eq!(t.stream_to_committed_records()[&orders], 2);
        assert_eq!(t.stream_to_committed_records()[&users()], 1);
    }

    #[test]
    fn legacy_states_only_count_towards_totals() {
        let t = tracker(false);
        t.update_stats(&record(&users(), 1));
        let mut legacy = StateMessage::legacy(json!({"cursor": 1}));
        legacy.id = Some(1);
        t.update_source_states_stats(&legacy).unwrap();

        assert_eq!(t.stream_stats(false).len(), 1);
        assert_eq!(t.total_stats(false).source_state_messages_emitted, 1);
    }

    // -----------------------------------------------------------------------
    // Estimates
    // -----------------------------------------------------------------------

    fn estimate(kind: EstimateType, name: &str, rows: u64) -> EstimateTrace {
        EstimateTrace {
            name: name.into(),
            namespace: None,
            estimate_type: kind,
            row_estimate: Some(rows),
            byte_estimate: Some(rows * 10),
        }
    }

    #[test]
    fn stream_estimates_are_summed() {
        let t = tracker(false);
        t.update_estimates(&estimate(EstimateType::Stream, "a", 5));
        t.update_estimates(&estimate(EstimateType::Stream, "b", 7));
        let total = t.total_stats(false);
        assert_eq!(total.estimated_records, Some(12));
        assert_eq!(total.estimated_bytes, Some(120));
    }

    #[test]
    fn sync_estimate_overrides_stream_sum() {
        let t = tracker(false);
        t.update_estimates(&estimate(EstimateType::Sync, "", 100));
        assert_eq!(t.total_stats(false).estimated_records, Some(100));
    }

    #[test]
    fn mixed_estimate_types_drop_all_estimates() {
        let t = tracker(false);
        t.update_estimates(&estimate(EstimateType::Stream, "a", 5));
        t.update_estimates(&estimate(EstimateType::Sync, "", 100));
        let total = t.total_stats(false);
        assert_eq!(total.estimated_records, None);
        assert!(t.stream_stats(false).iter().all(|s| s.stats.estimated_records.is_none()));
    }
}
