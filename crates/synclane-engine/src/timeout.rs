//! Destination liveness tracking with cooperative cancellation.
//!
//! Two timer windows are tracked: one for `accept` and one for
//! `notify_end_of_input`. Each window holds the start timestamp of the call
//! in flight, or a sentinel when idle. Starting a window again before it is
//! reset overwrites the previous start.

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::clock::{millis_between, Clock};
use crate::errors::{ReplicationError, Result};

const IDLE: i64 = -1;

/// Default interval between timeout checks.
pub const DEFAULT_TIMEOUT_POLL_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct DestinationTimeoutMonitor {
    accept_started_at: AtomicI64,
    notify_end_of_input_started_at: AtomicI64,
    threshold: Duration,
    poll_interval: Duration,
    fail_on_timeout: bool,
    clock: Arc<dyn Clock>,
}

impl DestinationTimeoutMonitor {
    #[must_use]
    pub fn new(
        threshold: Duration,
        poll_interval: Duration,
        fail_on_timeout: bool,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            accept_started_at: AtomicI64::new(IDLE),
            notify_end_of_input_started_at: AtomicI64::new(IDLE),
            threshold,
            poll_interval,
            fail_on_timeout,
            clock,
        }
    }

    pub fn start_accept_timer(&self) {
        self.accept_started_at
            .store(self.clock.now_millis(), Ordering::SeqCst);
    }

    pub fn reset_accept_timer(&self) {
        self.accept_started_at.store(IDLE, Ordering::SeqCst);
    }

    pub fn start_notify_end_of_input_timer(&self) {
        self.notify_end_of_input_started_at
            .store(self.clock.now_millis(), Ordering::SeqCst);
    }

    pub fn reset_notify_end_of_input_timer(&self) {
        self.notify_end_of_input_started_at
            .store(IDLE, Ordering::SeqCst);
    }

    #[must_use]
    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Elapsed time of the first window found over the threshold.
    #[must_use]
    pub fn timed_out(&self) -> Option<Duration> {
        let now = self.clock.now_millis();
        [
            ("accept", &self.accept_started_at),
            ("notify_end_of_input", &self.notify_end_of_input_started_at),
        ]
        .into_iter()
        .find_map(|(call, window)| {
            let started = window.load(Ordering::SeqCst);
            if started == IDLE {
                return None;
            }
            let elapsed = millis_between(started, now);
            (elapsed > self.threshold).then(|| {
                tracing::warn!(
                    call,
                    elapsed_secs = elapsed.as_secs(),
                    threshold_secs = self.threshold.as_secs(),
                    "Destination call exceeded timeout threshold"
                );
                elapsed
            })
        })
    }

    /// Race `work` against the timeout poll loop.
    ///
    /// Returns `Ok(Some(_))` with the work's output when it finishes first;
    /// the poll loop is dropped. When the poll loop detects a timeout first
    /// and failing is disabled, the timeout is logged and `Ok(None)` is
    /// returned while `work` keeps running detached.
    ///
    /// # Errors
    ///
    /// Returns `work`'s own error, or [`ReplicationError::DestinationTimeout`]
    /// after aborting `work` when failing on timeout is enabled.
    pub async fn run_with_timeout<F, T>(&self, work: F) -> Result<Option<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let mut work = AbortOnDrop::new(tokio::spawn(work));
        tokio::select! {
            biased;
            joined = &mut work.handle => {
                let output = joined.map_err(|e| anyhow::anyhow!("destination write task failed: {e}"))??;
                Ok(Some(output))
            }
            elapsed = self.poll_for_timeout() => {
                if self.fail_on_timeout {
                    drop(work);
                    Err(ReplicationError::DestinationTimeout {
                        threshold: self.threshold,
                        elapsed,
                    })
                } else {
                    tracing::warn!(
                        elapsed_secs = elapsed.as_secs(),
                        "Destination has timed out but failing the sync is disabled"
                    );
                    work.detach();
                    Ok(None)
                }
            }
        }
    }

    async fn poll_for_timeout(&self) -> Duration {
        loop {
            tokio::time::sleep(self.poll_interval).await;
            if let Some(elapsed) = self.timed_out() {
                return elapsed;
            }
        }
    }
}

/// Aborts the spawned task when dropped unless detached, so a caller that
/// stops waiting also stops the work.
struct AbortOnDrop<T> {
    handle: JoinHandle<T>,
    armed: bool,
}

impl<T> AbortOnDrop<T> {
    fn new(handle: JoinHandle<T>) -> Self {
        Self { handle, armed: true }
    }

    fn detach(mut self) {
        self.armed = false;
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        if self.armed {
            self.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::clock::{ManualClock, SystemClock};

    fn monitor(fail_on_timeout: bool) -> DestinationTimeoutMonitor {
        DestinationTimeoutMonitor::new(
            Duration::from_secs(10),
            Duration::from_secs(1),
            fail_on_timeout,
            Arc::new(SystemClock::new()),
        )
    }

    #[test]
    fn idle_windows_never_time_out() {
        let clock = Arc::new(ManualClock::at(0));
        let m = DestinationTimeoutMonitor::new(
            Duration::from_secs(1),
            Duration::from_secs(1),
            true,
            clock.clone(),
        );
        clock.advance(Duration::from_secs(100));
        assert_eq!(m.timed_out(), None);
    }

    #[test]
    fn accept_window_times_out_and_resets() {
        let clock = Arc::new(ManualClock::at(0));
        let m = DestinationTimeoutMonitor::new(
            Duration::from_secs(1),
            Duration::from_secs(1),
            true,
            clock.clone(),
        );
        m.start_accept_timer();
        clock.advance(Duration::from_millis(1_500));
        assert_eq!(m.timed_out(), Some(Duration::from_millis(1_500)));

        m.reset_accept_timer();
        assert_eq!(m.timed_out(), None);
    }

    #[test]
    fn restarting_a_window_discards_previous_start() {
        let clock = Arc::new(ManualClock::at(0));
        let m = DestinationTimeoutMonitor::new(
            Duration::from_secs(1),
            Duration::from_secs(1),
            true,
            clock.clone(),
        );
        m.start_notify_end_of_input_timer();
        clock.advance(Duration::from_millis(900));
        m.start_notify_end_of_input_timer();
        clock.advance(Duration::from_millis(900));
        assert_eq!(m.timed_out(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn work_finishing_first_wins() {
        let m = monitor(true);
        m.start_accept_timer();
        let out = m
            .run_with_timeout(async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(3)
            })
            .await
            .unwrap();
        assert_eq!(out, Some(3));

        // The monitor stays reusable after a clean race.
        m.reset_accept_timer();
        let out = m.run_with_timeout(async { Ok(4) }).await.unwrap();
        assert_eq!(out, Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn work_error_propagates() {
        let m = monitor(true);
        let err = m
            .run_with_timeout(async {
                Err::<(), _>(ReplicationError::Destination(anyhow::anyhow!("disk full")))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Destination(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_aborts_work_when_failing_is_enabled() {
        let m = monitor(true);
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        m.start_accept_timer();

        let err = m
            .run_with_timeout(async move {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        match err {
            ReplicationError::DestinationTimeout { threshold, elapsed } => {
                assert_eq!(threshold, Duration::from_secs(10));
                assert!(elapsed > threshold);
            }
            other => panic!("unexpected error: {other}"),
        }

        tokio::time::sleep(Duration::from_secs(7_200)).await;
        assert!(!finished.load(Ordering::SeqCst), "aborted work must not finish");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_leaves_work_running_when_failing_is_disabled() {
        let m = monitor(false);
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        m.start_notify_end_of_input_timer();

        let out = m
            .run_with_timeout(async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(out, None);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(finished.load(Ordering::SeqCst), "detached work keeps running");
    }
}
