/// Single-trigger timeout window.
///
/// Two periodic signals run while the window is armed: a coarse expiry check
/// and a fine progress report. Both recompute `now - trigger` from the clock
/// on every tick, so a suspended process catches up on resume instead of
/// drifting. At most one window is live; `start` supersedes any previous one.
///
/// The window stays active after expiry (timers stopped, trigger kept) until
/// `reset`, so a late expected line can still clear it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDateTime;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock::{seconds_between, Clock};
use crate::events::{EventSink, TimeoutProgress, WatchdogEvent};
use crate::{TIMEOUT_CHECK_INTERVAL_MS, TIMEOUT_PROGRESS_INTERVAL_MS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPhase {
    Idle,
    Running,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Running,
    /// The trigger was already older than the duration; expiry was
    /// published immediately and no timers were started.
    AlreadyExpired,
}

struct WindowState {
    trigger: Option<NaiveDateTime>,
    duration_secs: f64,
    phase: WindowPhase,
    timers: Option<CancellationToken>,
}

struct Shared {
    clock: Arc<dyn Clock>,
    sink: EventSink,
    check_interval: Duration,
    progress_interval: Duration,
    state: Mutex<WindowState>,
}

/// Cheaply cloneable handle; all clones drive the same window.
#[derive(Clone)]
pub struct TimeoutWindow {
    shared: Arc<Shared>,
}

impl TimeoutWindow {
    pub fn new(clock: Arc<dyn Clock>, sink: EventSink) -> Self {
        Self::with_intervals(
            clock,
            sink,
            Duration::from_millis(TIMEOUT_CHECK_INTERVAL_MS),
            Duration::from_millis(TIMEOUT_PROGRESS_INTERVAL_MS),
        )
    }

    pub fn with_intervals(
        clock: Arc<dyn Clock>,
        sink: EventSink,
        check_interval: Duration,
        progress_interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                clock,
                sink,
                check_interval,
                progress_interval,
                state: Mutex::new(WindowState {
                    trigger: None,
                    duration_secs: 0.0,
                    phase: WindowPhase::Idle,
                    timers: None,
                }),
            }),
        }
    }

    /// Arm the window. Outside a tokio runtime no timers are spawned and the
    /// caller is expected to drive `check_expiry`/`progress` itself.
    pub fn start(&self, trigger: NaiveDateTime, duration: Duration) -> StartOutcome {
        let now = self.shared.clock.now();
        let duration_secs = duration.as_secs_f64();
        let elapsed = seconds_between(trigger, now);

        let mut state = self.shared.state.lock().unwrap();
        if let Some(previous) = state.timers.take() {
            previous.cancel();
        }
        state.trigger = Some(trigger);
        state.duration_secs = duration_secs;

        if elapsed < duration_secs {
            state.phase = WindowPhase::Running;
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let token = CancellationToken::new();
                state.timers = Some(token.clone());
                handle.spawn(self.clone().run_timers(token));
            } else {
                debug!("No runtime, timeout timers must be driven manually");
            }
            drop(state);
            debug!(elapsed, duration_secs, "Timeout window armed");
            StartOutcome::Running
        } else {
            state.phase = WindowPhase::Expired;
            drop(state);
            info!(elapsed, duration_secs, "Timeout already exceeded at start");
            self.shared.sink.emit(WatchdogEvent::TimeoutExpired);
            StartOutcome::AlreadyExpired
        }
    }

    /// Stop both signals, clear the trigger and tell observers to clear
    /// their trigger indicator.
    pub fn reset(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if let Some(timers) = state.timers.take() {
                timers.cancel();
            }
            state.trigger = None;
            state.phase = WindowPhase::Idle;
        }
        self.shared.sink.emit(WatchdogEvent::TriggerReset);
    }

    /// Coarse tick. Publishes expiry and returns true exactly once per
    /// episode.
    pub fn check_expiry(&self) -> bool {
        let now = self.shared.clock.now();
        {
            let mut state = self.shared.state.lock().unwrap();
            let Some(trigger) = state.trigger else {
                return false;
            };
            if state.phase != WindowPhase::Running
                || seconds_between(trigger, now) < state.duration_secs
            {
                return false;
            }
            state.phase = WindowPhase::Expired;
            if let Some(timers) = state.timers.take() {
                timers.cancel();
            }
        }
        info!("Timeout window expired");
        self.shared.sink.emit(WatchdogEvent::TimeoutExpired);
        true
    }

    /// Current progress, or `None` when no trigger is set.
    pub fn progress(&self) -> Option<TimeoutProgress> {
        let now = self.shared.clock.now();
        let state = self.shared.state.lock().unwrap();
        let trigger = state.trigger?;
        let elapsed = seconds_between(trigger, now);
        let duration = state.duration_secs;

        let percentage = if duration > 0.0 {
            (elapsed / duration * 100.0).clamp(0.0, 100.0)
        } else {
            100.0
        };
        Some(TimeoutProgress {
            percentage,
            remaining_secs: (duration - elapsed).max(0.0),
        })
    }

    pub fn is_active(&self) -> bool {
        self.shared.state.lock().unwrap().trigger.is_some()
    }

    pub fn phase(&self) -> WindowPhase {
        self.shared.state.lock().unwrap().phase
    }

    pub fn trigger_instant(&self) -> Option<NaiveDateTime> {
        self.shared.state.lock().unwrap().trigger
    }

    async fn run_timers(self, token: CancellationToken) {
        let start = tokio::time::Instant::now();
        let mut check = tokio::time::interval_at(
            start + self.shared.check_interval,
            self.shared.check_interval,
        );
        let mut progress = tokio::time::interval_at(
            start + self.shared.progress_interval,
            self.shared.progress_interval,
        );
        check.set_missed_tick_behavior(MissedTickBehavior::Skip);
        progress.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = check.tick() => {
                    if self.check_expiry() {
                        break;
                    }
                }
                _ = progress.tick() => {
                    if self.phase() == WindowPhase::Running {
                        if let Some(p) = self.progress() {
                            self.shared.sink.emit(WatchdogEvent::TimeoutProgress(p));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::NaiveDate;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn base() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn window() -> (Arc<ManualClock>, TimeoutWindow, UnboundedReceiver<WatchdogEvent>) {
        let clock = Arc::new(ManualClock::new(base()));
        let (sink, rx) = EventSink::channel();
        let window = TimeoutWindow::new(clock.clone(), sink);
        (clock, window, rx)
    }

    #[test]
    fn overdue_trigger_expires_immediately() {
        let (_clock, window, mut rx) = window();
        let trigger = base() - chrono::Duration::seconds(30 + 5);

        assert_eq!(
            window.start(trigger, Duration::from_secs(30)),
            StartOutcome::AlreadyExpired
        );
        assert_eq!(rx.try_recv().unwrap(), WatchdogEvent::TimeoutExpired);
        assert!(window.is_active());
        assert_eq!(window.phase(), WindowPhase::Expired);
    }

    #[test]
    fn progress_at_half_time() {
        let (clock, window, _rx) = window();
        assert_eq!(window.start(base(), Duration::from_secs(60)), StartOutcome::Running);

        clock.advance(chrono::Duration::seconds(30));
        let p = window.progress().unwrap();
        assert!((p.percentage - 50.0).abs() < 1e-9);
        assert!((p.remaining_secs - 30.0).abs() < 1e-9);
    }

    #[test]
    fn progress_is_monotonic_and_clamped() {
        let (clock, window, _rx) = window();
        window.start(base(), Duration::from_secs(10));

        let mut last = -1.0;
        for _ in 0..30 {
            clock.advance(chrono::Duration::milliseconds(500));
            let p = window.progress().unwrap();
            assert!(p.percentage >= last);
            assert!(p.percentage <= 100.0);
            assert!(p.remaining_secs >= 0.0);
            last = p.percentage;
        }
        assert_eq!(last, 100.0);
    }

    #[test]
    fn expiry_fires_once() {
        let (clock, window, mut rx) = window();
        window.start(base(), Duration::from_secs(5));

        clock.advance(chrono::Duration::seconds(4));
        assert!(!window.check_expiry());
        clock.advance(chrono::Duration::seconds(1));
        assert!(window.check_expiry());
        assert!(!window.check_expiry());
        assert_eq!(rx.try_recv().unwrap(), WatchdogEvent::TimeoutExpired);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn reset_clears_and_notifies() {
        let (clock, window, mut rx) = window();
        window.start(base(), Duration::from_secs(5));
        window.reset();

        assert!(!window.is_active());
        assert!(window.progress().is_none());
        assert_eq!(rx.try_recv().unwrap(), WatchdogEvent::TriggerReset);

        clock.advance(chrono::Duration::seconds(10));
        assert!(!window.check_expiry());
    }

    #[test]
    fn start_supersedes_previous_window() {
        let (clock, window, _rx) = window();
        window.start(base(), Duration::from_secs(5));
        clock.advance(chrono::Duration::seconds(4));

        window.start(clock.now(), Duration::from_secs(5));
        clock.advance(chrono::Duration::seconds(2));
        assert!(!window.check_expiry());
        assert_eq!(window.trigger_instant(), Some(base() + chrono::Duration::seconds(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn timers_publish_progress_then_expiry() {
        let (clock, window, mut rx) = window();
        window.start(base(), Duration::from_secs(3));

        match rx.recv().await {
            Some(WatchdogEvent::TimeoutProgress(p)) => assert_eq!(p.percentage, 0.0),
            other => panic!("expected progress, got {other:?}"),
        }

        clock.advance(chrono::Duration::seconds(3));
        loop {
            match rx.recv().await {
                Some(WatchdogEvent::TimeoutProgress(_)) => continue,
                Some(WatchdogEvent::TimeoutExpired) => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(window.phase(), WindowPhase::Expired);
    }
}
