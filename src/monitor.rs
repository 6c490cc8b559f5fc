//! Turning a stream of noisy printer status polls into a verdict on the job.

use std::{sync::Arc, time::Duration};

use crate::{config::TimingConfig, Backend, DeviceId, DeviceState, DeviceStatus, RetryPolicy};

/// How long to wait before the next poll, from the reported minutes left.
pub fn poll_interval(remaining_minutes: Option<u32>) -> Duration {
    match remaining_minutes {
        Some(m) if m > 10 => Duration::from_secs(60),
        Some(m) if m > 2 => Duration::from_secs(30),
        Some(_) => Duration::from_secs(10),
        None => Duration::from_secs(30),
    }
}

/// What a single status means for the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Nothing decided yet, keep polling.
    Pending,
    /// The printer reported FINISH.
    Finished,
    /// The printer is IDLE with the job at (nearly) full progress.
    CompletedIdle,
    /// The printer sat IDLE at low progress for too long.
    Stalled,
    /// The printer reported a state that ends the job.
    Fatal(DeviceState),
}

/// Classifies successive statuses of one job.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    stall_threshold: u32,
    suspicious_idle: u32,
}

impl ProgressTracker {
    /// A tracker that reports a stall once IDLE-at-low-progress has been
    /// seen on more than `stall_threshold` consecutive polls.
    pub fn new(stall_threshold: u32) -> Self {
        Self {
            stall_threshold,
            suspicious_idle: 0,
        }
    }

    /// Consecutive low-progress IDLE polls seen so far.
    pub fn suspicious_idle(&self) -> u32 {
        self.suspicious_idle
    }

    /// Classify the next status.
    pub fn observe(&mut self, status: &DeviceStatus) -> Observation {
        let suspicious = status.state == DeviceState::Idle && status.progress_percent.is_some_and(|p| p < 10.0);
        if !suspicious {
            self.suspicious_idle = 0;
        }

        match status.state {
            DeviceState::Finish => Observation::Finished,
            DeviceState::Idle => match status.progress_percent {
                Some(p) if p >= 99.0 => Observation::CompletedIdle,
                Some(p) if p < 10.0 => {
                    self.suspicious_idle += 1;
                    if self.suspicious_idle > self.stall_threshold {
                        Observation::Stalled
                    } else {
                        Observation::Pending
                    }
                }
                _ => Observation::Pending,
            },
            state if state.is_fatal() => Observation::Fatal(state),
            _ => Observation::Pending,
        }
    }
}

/// How monitoring of one job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The job finished.
    Completed,
    /// The printer stayed IDLE at low progress.
    Stalled,
    /// The printer reported a fatal state.
    Failed {
        /// The state it reported.
        state: DeviceState,
    },
    /// Polling kept failing until the retry policy gave up.
    Unreachable {
        /// Consecutive failed polls.
        attempts: u32,
    },
    /// The job outlived its monitoring timeout.
    TimedOut {
        /// The timeout.
        after: Duration,
    },
}

impl Verdict {
    /// Only a completed job gets ejected.
    pub fn is_success(&self) -> bool {
        matches!(self, Verdict::Completed)
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Completed => write!(f, "completed"),
            Verdict::Stalled => write!(f, "stalled"),
            Verdict::Failed { state } => write!(f, "failed ({})", state),
            Verdict::Unreachable { attempts } => write!(f, "unreachable after {} attempts", attempts),
            Verdict::TimedOut { after } => write!(f, "timed out after {:?}", after),
        }
    }
}

/// Settings for [ProgressMonitor].
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Pause after FINISH before the confirming re-poll.
    pub settle: Duration,
    /// See [ProgressTracker::new].
    pub stall_threshold: u32,
    /// Backoff for failed polls.
    pub retry: RetryPolicy,
    /// Upper bound on monitoring one job, grace delay excluded.
    pub job_timeout: Option<Duration>,
}

impl From<&TimingConfig> for MonitorSettings {
    fn from(timing: &TimingConfig) -> Self {
        Self {
            settle: Duration::from_secs(timing.settle_secs),
            stall_threshold: timing.stall_threshold,
            retry: timing.poll_retry.clone(),
            job_timeout: timing.job_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Polls one printer until its current job reaches a verdict.
pub struct ProgressMonitor {
    backend: Arc<dyn Backend>,
    settings: MonitorSettings,
}

impl ProgressMonitor {
    /// A monitor polling through `backend`.
    pub fn new(backend: Arc<dyn Backend>, settings: MonitorSettings) -> Self {
        Self { backend, settings }
    }

    /// Wait out `grace`, then poll `printer` until the job completes, fails
    /// or stalls. Every successful poll is passed to `on_status`.
    #[tracing::instrument(skip(self, on_status))]
    pub async fn watch<F>(&self, printer: &str, id: DeviceId, grace: Duration, mut on_status: F) -> Verdict
    where
        F: FnMut(&DeviceStatus) + Send,
    {
        tokio::time::sleep(grace).await;

        let polling = self.poll_until_verdict(printer, id, &mut on_status);
        match self.settings.job_timeout {
            Some(after) => match tokio::time::timeout(after, polling).await {
                Ok(verdict) => verdict,
                Err(_) => {
                    tracing::error!(printer = printer, timeout = ?after, "job monitoring timed out");
                    Verdict::TimedOut { after }
                }
            },
            None => polling.await,
        }
    }

    async fn poll_until_verdict<F>(&self, printer: &str, id: DeviceId, on_status: &mut F) -> Verdict
    where
        F: FnMut(&DeviceStatus) + Send,
    {
        let mut tracker = ProgressTracker::new(self.settings.stall_threshold);
        let mut backoff = self.settings.retry.backoff();

        loop {
            let status = match self.backend.printer_status(id).await {
                Ok(status) => status,
                Err(err) => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::warn!(
                            printer = printer,
                            error = format!("{:#}", err),
                            attempt = backoff.attempts(),
                            retry_in = ?delay,
                            "status poll failed"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    None => {
                        tracing::error!(
                            printer = printer,
                            error = format!("{:#}", err),
                            attempts = backoff.attempts(),
                            "giving up on status polls"
                        );
                        return Verdict::Unreachable {
                            attempts: backoff.attempts(),
                        };
                    }
                },
            };
            backoff.reset();
            on_status(&status);

            tracing::info!(
                printer = printer,
                state = %status.state,
                stage = status.stage.as_deref().unwrap_or("N/A"),
                progress = ?status.progress_percent,
                remaining_minutes = ?status.remaining_minutes,
                "status"
            );

            match tracker.observe(&status) {
                Observation::Finished => {
                    tracing::info!(printer = printer, "printer reported FINISH");
                    self.confirm_finish(printer, id).await;
                    return Verdict::Completed;
                }
                Observation::CompletedIdle => {
                    tracing::info!(printer = printer, progress = ?status.progress_percent, "idle at full progress, assuming complete");
                    return Verdict::Completed;
                }
                Observation::Stalled => {
                    tracing::error!(printer = printer, progress = ?status.progress_percent, "idle with low progress, aborting job");
                    return Verdict::Stalled;
                }
                Observation::Fatal(state) => {
                    tracing::error!(printer = printer, state = %state, "printer entered a fatal state");
                    return Verdict::Failed { state };
                }
                Observation::Pending => {
                    if tracker.suspicious_idle() > 0 {
                        tracing::warn!(
                            printer = printer,
                            check = tracker.suspicious_idle(),
                            threshold = self.settings.stall_threshold,
                            "idle with low progress"
                        );
                    }
                    tokio::time::sleep(poll_interval(status.remaining_minutes)).await;
                }
            }
        }
    }

    /// Re-poll once after the settle delay. Whatever comes back, the job is
    /// done; anything other than FINISH or IDLE only earns a warning.
    async fn confirm_finish(&self, printer: &str, id: DeviceId) {
        tokio::time::sleep(self.settings.settle).await;
        match self.backend.printer_status(id).await {
            Ok(status) if status.state.is_ready() => {
                tracing::info!(printer = printer, state = %status.state, "finish confirmed");
            }
            Ok(status) => {
                tracing::warn!(printer = printer, state = %status.state, "unexpected state after FINISH");
            }
            Err(err) => {
                tracing::warn!(printer = printer, error = format!("{:#}", err), "could not re-poll after FINISH");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use testresult::TestResult;

    use super::*;
    use crate::{PrinterControl, SimulatedBackend};

    fn idle(progress: f64) -> DeviceStatus {
        DeviceStatus::new(DeviceState::Idle).with_progress(progress)
    }

    fn settings() -> MonitorSettings {
        MonitorSettings::from(&TimingConfig::default())
    }

    async fn monitor_with(statuses: Vec<DeviceStatus>) -> anyhow::Result<(Arc<SimulatedBackend>, ProgressMonitor)> {
        let sim = Arc::new(SimulatedBackend::new());
        sim.add_printer(1, DeviceStatus::new(DeviceState::Idle)).await;
        sim.script_job(1, statuses).await?;
        sim.start_print(1, "a.3mf").await?;
        let monitor = ProgressMonitor::new(sim.clone(), settings());
        Ok((sim, monitor))
    }

    #[test]
    fn test_poll_interval() {
        assert_eq!(poll_interval(Some(45)), Duration::from_secs(60));
        assert_eq!(poll_interval(Some(11)), Duration::from_secs(60));
        assert_eq!(poll_interval(Some(10)), Duration::from_secs(30));
        assert_eq!(poll_interval(Some(3)), Duration::from_secs(30));
        assert_eq!(poll_interval(Some(2)), Duration::from_secs(10));
        assert_eq!(poll_interval(Some(0)), Duration::from_secs(10));
        assert_eq!(poll_interval(None), Duration::from_secs(30));
    }

    #[test]
    fn test_stall_needs_more_than_threshold() {
        for n in 1..=12u32 {
            let mut tracker = ProgressTracker::new(6);
            let observations: Vec<Observation> = (0..n).map(|_| tracker.observe(&idle(0.0))).collect();
            let stalled = observations.contains(&Observation::Stalled);
            assert_eq!(stalled, n >= 7, "{} consecutive idle polls", n);
            if n >= 7 {
                assert_eq!(observations.iter().position(|o| *o == Observation::Stalled), Some(6));
            }
        }
    }

    #[test]
    fn test_other_status_resets_stall_count() {
        let mut tracker = ProgressTracker::new(6);
        for _ in 0..6 {
            assert_eq!(tracker.observe(&idle(5.0)), Observation::Pending);
        }
        assert_eq!(tracker.observe(&DeviceStatus::new(DeviceState::Running)), Observation::Pending);
        assert_eq!(tracker.suspicious_idle(), 0);
        for _ in 0..6 {
            assert_eq!(tracker.observe(&idle(5.0)), Observation::Pending);
        }
        assert_eq!(tracker.observe(&DeviceStatus::new(DeviceState::Idle)), Observation::Pending);
        assert_eq!(tracker.suspicious_idle(), 0);
        assert_eq!(tracker.observe(&idle(50.0)), Observation::Pending);
    }

    #[test]
    fn test_terminal_observations() {
        let mut tracker = ProgressTracker::new(6);
        assert_eq!(tracker.observe(&DeviceStatus::new(DeviceState::Finish)), Observation::Finished);
        assert_eq!(tracker.observe(&idle(99.0)), Observation::CompletedIdle);
        assert_eq!(
            tracker.observe(&DeviceStatus::new(DeviceState::Paused)),
            Observation::Fatal(DeviceState::Paused)
        );
        assert_eq!(
            tracker.observe(&DeviceStatus::new(DeviceState::Failed)),
            Observation::Fatal(DeviceState::Failed)
        );
        assert_eq!(tracker.observe(&DeviceStatus::new(DeviceState::Offline)), Observation::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_finish_stops_polling() -> TestResult {
        let (sim, monitor) = monitor_with(vec![
            DeviceStatus::new(DeviceState::Running).with_remaining(30),
            DeviceStatus::new(DeviceState::Running).with_remaining(1),
            DeviceStatus::new(DeviceState::Finish),
        ])
        .await?;

        let mut seen = Vec::new();
        let verdict = monitor
            .watch("p1", 1, Duration::from_secs(10), |s| seen.push(s.state))
            .await;
        assert_eq!(verdict, Verdict::Completed);
        assert_eq!(seen, vec![DeviceState::Running, DeviceState::Running, DeviceState::Finish]);
        // Three polls plus the confirming re-poll, then nothing more.
        assert_eq!(sim.polls(1).await, 4);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(sim.polls(1).await, 4);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_paused_fails() -> TestResult {
        let (_sim, monitor) = monitor_with(vec![
            DeviceStatus::new(DeviceState::Running),
            DeviceStatus::new(DeviceState::Paused),
        ])
        .await?;
        let verdict = monitor.watch("p1", 1, Duration::ZERO, |_| {}).await;
        assert_eq!(
            verdict,
            Verdict::Failed {
                state: DeviceState::Paused
            }
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_stalls_on_seventh_idle_poll() -> TestResult {
        let (sim, monitor) = monitor_with(vec![idle(0.0)]).await?;
        let verdict = monitor.watch("p1", 1, Duration::ZERO, |_| {}).await;
        assert_eq!(verdict, Verdict::Stalled);
        assert_eq!(sim.polls(1).await, 7);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_survives_transient_poll_errors() -> TestResult {
        let (sim, monitor) = monitor_with(vec![DeviceStatus::new(DeviceState::Finish)]).await?;
        sim.fail_polls(1, 3).await?;

        let start = tokio::time::Instant::now();
        let verdict = monitor.watch("p1", 1, Duration::ZERO, |_| {}).await;
        assert_eq!(verdict, Verdict::Completed);
        // 15 + 30 + 60 seconds of backoff, then the 3 second settle delay.
        assert_eq!(start.elapsed(), Duration::from_secs(108));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_gives_up_when_unreachable() -> TestResult {
        let sim = Arc::new(SimulatedBackend::new());
        sim.add_printer(1, DeviceStatus::new(DeviceState::Running)).await;
        sim.fail_polls(1, u32::MAX).await?;
        let monitor = ProgressMonitor::new(
            sim.clone(),
            MonitorSettings {
                retry: RetryPolicy {
                    max_attempts: 4,
                    ..Default::default()
                },
                ..settings()
            },
        );
        let verdict = monitor.watch("p1", 1, Duration::ZERO, |_| {}).await;
        assert_eq!(verdict, Verdict::Unreachable { attempts: 4 });
        assert_eq!(sim.polls(1).await, 5);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_job_timeout() -> TestResult {
        let (_sim, monitor) = monitor_with(vec![DeviceStatus::new(DeviceState::Running)]).await?;
        let monitor = ProgressMonitor::new(
            monitor.backend.clone(),
            MonitorSettings {
                job_timeout: Some(Duration::from_secs(3600)),
                ..settings()
            },
        );
        let verdict = monitor.watch("p1", 1, Duration::ZERO, |_| {}).await;
        assert_eq!(
            verdict,
            Verdict::TimedOut {
                after: Duration::from_secs(3600)
            }
        );
        Ok(())
    }
}
