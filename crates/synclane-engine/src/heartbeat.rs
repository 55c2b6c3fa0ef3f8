//! Source liveness tracking.
//!
//! [`HeartbeatMonitor`] records when the source last produced a message.
//! [`HeartbeatTimeoutChaperone`] races the source read loop against a poll
//! loop that watches the monitor for staleness.

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{millis_between, Clock};
use crate::errors::{ReplicationError, Result};

const NEVER_BEATEN: i64 = -1;

/// Default interval between staleness checks.
pub const DEFAULT_HEARTBEAT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Default threshold when the source declares no maximum silence.
pub const DEFAULT_HEARTBEAT_THRESHOLD: Duration = Duration::from_secs(24 * 60 * 60);

/// Last-seen-activity tracker for the source.
///
/// `beat` may be called from the read loop while `is_beating` is polled from
/// another task.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    threshold: Duration,
    clock: Arc<dyn Clock>,
    last_beat: AtomicI64,
}

impl HeartbeatMonitor {
    /// Create a monitor and record an initial beat.
    #[must_use]
    pub fn new(threshold: Duration, clock: Arc<dyn Clock>) -> Self {
        let monitor = Self::without_initial_beat(threshold, clock);
        monitor.beat();
        monitor
    }

    /// Create a monitor in the never-beaten state.
    #[must_use]
    pub fn without_initial_beat(threshold: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            threshold,
            clock,
            last_beat: AtomicI64::new(NEVER_BEATEN),
        }
    }

    pub fn beat(&self) {
        self.last_beat.store(self.clock.now_millis(), Ordering::SeqCst);
    }

    /// `None` before the first beat, otherwise whether the last beat is
    /// younger than the threshold.
    #[must_use]
    pub fn is_beating(&self) -> Option<bool> {
        self.time_since_last_beat().map(|since| since < self.threshold)
    }

    #[must_use]
    pub fn time_since_last_beat(&self) -> Option<Duration> {
        match self.last_beat.load(Ordering::SeqCst) {
            NEVER_BEATEN => None,
            last => Some(millis_between(last, self.clock.now_millis())),
        }
    }

    #[must_use]
    pub fn threshold(&self) -> Duration {
        self.threshold
    }
}

/// Fails (or warns about) a source read loop whose monitor goes stale.
#[derive(Debug, Clone)]
pub struct HeartbeatTimeoutChaperone {
    monitor: Arc<HeartbeatMonitor>,
    poll_interval: Duration,
    fail_on_timeout: bool,
}

impl HeartbeatTimeoutChaperone {
    #[must_use]
    pub fn new(monitor: Arc<HeartbeatMonitor>, poll_interval: Duration, fail_on_timeout: bool) -> Self {
        Self {
            monitor,
            poll_interval,
            fail_on_timeout,
        }
    }

    /// Run `work` while watching the monitor.
    ///
    /// # Errors
    ///
    /// Returns `work`'s error, or [`ReplicationError::HeartbeatTimeout`]
    /// (after dropping `work`) when the monitor goes stale and failing is
    /// enabled.
    pub async fn run_with_heartbeat<F, T>(&self, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::pin!(work);
        tokio::select! {
            biased;
            output = &mut work => output,
            since = self.wait_for_stale() => Err(ReplicationError::HeartbeatTimeout {
                threshold: self.monitor.threshold(),
                time_since_last_beat: since,
            }),
        }
    }

    /// Resolves once the monitor is stale and failing is enabled. When
    /// failing is disabled, staleness is only logged and this never resolves.
    async fn wait_for_stale(&self) -> Duration {
        loop {
            tokio::time::sleep(self.poll_interval).await;
            if self.monitor.is_beating() != Some(false) {
                continue;
            }
            let since = self.monitor.time_since_last_beat().unwrap_or_default();
            if self.fail_on_timeout {
                return since;
            }
            tracing::warn!(
                threshold_secs = self.monitor.threshold().as_secs(),
                since_last_beat_secs = since.as_secs(),
                "Source heartbeat is stale but failing the sync is disabled"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};

    fn manual_monitor(threshold_ms: u64) -> (Arc<ManualClock>, HeartbeatMonitor) {
        let clock = Arc::new(ManualClock::at(1_000));
        let monitor = HeartbeatMonitor::new(Duration::from_millis(threshold_ms), clock.clone());
        (clock, monitor)
    }

    #[test]
    fn never_beaten_reports_nothing() {
        let monitor = HeartbeatMonitor::without_initial_beat(
            Duration::from_secs(1),
            Arc::new(ManualClock::at(0)),
        );
        assert_eq!(monitor.is_beating(), None);
        assert_eq!(monitor.time_since_last_beat(), None);
    }

    #[test]
    fn fresh_then_stale_then_fresh_again() {
        let (clock, monitor) = manual_monitor(100);
        assert_eq!(monitor.is_beating(), Some(true));

        clock.advance(Duration::from_millis(99));
        assert_eq!(monitor.is_beating(), Some(true));

        clock.advance(Duration::from_millis(1));
        assert_eq!(monitor.is_beating(), Some(false));
        assert_eq!(monitor.time_since_last_beat(), Some(Duration::from_millis(100)));

        monitor.beat();
        assert_eq!(monitor.is_beating(), Some(true));
        assert_eq!(monitor.time_since_last_beat(), Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn chaperone_returns_work_result_when_source_keeps_beating() {
        let monitor = Arc::new(HeartbeatMonitor::new(
            Duration::from_secs(10),
            Arc::new(SystemClock::new()),
        ));
        let chaperone = HeartbeatTimeoutChaperone::new(monitor.clone(), Duration::from_secs(1), true);

        let beating = monitor.clone();
        let result = chaperone
            .run_with_heartbeat(async move {
                for _ in 0..5 {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    beating.beat();
                }
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(result, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn chaperone_fails_when_source_goes_silent() {
        let monitor = Arc::new(HeartbeatMonitor::new(
            Duration::from_secs(10),
            Arc::new(SystemClock::new()),
        ));
        let chaperone = HeartbeatTimeoutChaperone::new(monitor, Duration::from_secs(1), true);

        let err = chaperone
            .run_with_heartbeat(async {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        match err {
            ReplicationError::HeartbeatTimeout {
                threshold,
                time_since_last_beat,
            } => {
                assert_eq!(threshold, Duration::from_secs(10));
                assert!(time_since_last_beat >= threshold);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn chaperone_only_warns_when_failing_is_disabled() {
        let monitor = Arc::new(HeartbeatMonitor::new(
            Duration::from_secs(1),
            Arc::new(SystemClock::new()),
        ));
        let chaperone = HeartbeatTimeoutChaperone::new(monitor, Duration::from_millis(500), false);

        let result = chaperone
            .run_with_heartbeat(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok("done")
            })
            .await
            .unwrap();
        assert_eq!(result, "done");
    }
}
