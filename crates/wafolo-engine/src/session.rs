/// One monitoring session: wires the engine components together and runs the
/// live trigger/expected loop.
///
/// Every component publishes into one internal event stream. The session
/// reacts to the events that drive it (new lines, file creation, expiry,
/// process detection) and forwards all of them, unchanged and in order, to
/// the caller.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::auto_close::AutoCloseCountdown;
use crate::clock::{seconds_between, Clock, SystemClock};
use crate::config::{ConfigError, WatchdogConfig};
use crate::escalation::{EscalationController, RestartTiming};
use crate::events::{EventSink, WatchdogEvent};
use crate::orchestrator::WatchdogOrchestrator;
use crate::process::{
    ProcessControl, ProcessLifecycleProbe, SessionThreshold, SysinfoProcessControl,
};
use crate::reboot::{ChainedReboot, RebootBackend, RebootError, RebootManager};
use crate::scanner::{contains_ignore_case, ScanStatus, SessionScanner};
use crate::timeout::TimeoutWindow;
use crate::timestamp::is_timestamp_recent;
use crate::{ACTIVITY_TIME_FORMAT, DEFAULT_POLL_INTERVAL_MS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    AbortReboot,
    Shutdown,
}

/// The OS-facing collaborators of a session.
pub struct SessionDeps {
    pub clock: Arc<dyn Clock>,
    pub processes: Arc<dyn ProcessControl>,
    pub reboot: Arc<dyn RebootBackend>,
    pub poll_interval: Duration,
    /// Overrides the restart timings derived from the configuration.
    pub restart_timing: Option<RestartTiming>,
}

impl SessionDeps {
    /// Real clock, sysinfo process table, native-then-command reboot chain.
    pub fn system() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            processes: Arc::new(SysinfoProcessControl::new()),
            reboot: Arc::new(ChainedReboot::platform()),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            restart_timing: None,
        }
    }
}

pub struct WatchdogSession {
    config: WatchdogConfig,
    clock: Arc<dyn Clock>,
    sink: EventSink,
    events: mpsc::UnboundedReceiver<WatchdogEvent>,
    orchestrator: WatchdogOrchestrator,
    probe: Arc<ProcessLifecycleProbe>,
    window: TimeoutWindow,
    reboot: Arc<RebootManager>,
    escalation: Arc<EscalationController>,
    auto_close: AutoCloseCountdown,
    threshold: Option<SessionThreshold>,
    process_wait: CancellationToken,
}

impl WatchdogSession {
    pub fn new(config: WatchdogConfig, deps: SessionDeps) -> Result<Self, ConfigError> {
        config.validate()?;

        let (sink, events) = EventSink::channel();
        let clock = deps.clock;
        let orchestrator = WatchdogOrchestrator::new(sink.clone(), &config.log_timestamp_format)
            .with_poll_interval(deps.poll_interval);
        let probe = Arc::new(ProcessLifecycleProbe::new(
            deps.processes,
            clock.clone(),
            sink.clone(),
        ));
        let window = TimeoutWindow::new(clock.clone(), sink.clone());
        let reboot = Arc::new(
            RebootManager::new(deps.reboot, window.clone(), sink.clone())
                .with_schedule(config.reboot_delay_seconds, config.reboot_message.clone()),
        );
        let mut escalation = EscalationController::new(
            &config,
            probe.clone(),
            window.clone(),
            reboot.clone(),
            clock.clone(),
            sink.clone(),
        );
        if let Some(timing) = deps.restart_timing {
            escalation = escalation.with_timing(timing);
        }

        Ok(Self {
            auto_close: AutoCloseCountdown::new(sink.clone()),
            escalation: Arc::new(escalation),
            config,
            clock,
            sink,
            events,
            orchestrator,
            probe,
            window,
            reboot,
            threshold: None,
            process_wait: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    pub fn threshold(&self) -> Option<&SessionThreshold> {
        self.threshold.as_ref()
    }

    pub fn window(&self) -> &TimeoutWindow {
        &self.window
    }

    pub fn is_reboot_pending(&self) -> bool {
        self.reboot.is_pending()
    }

    /// Run until shutdown, close request, or the command channel closes.
    /// Every event is forwarded to `outbound`.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        outbound: mpsc::UnboundedSender<WatchdogEvent>,
    ) -> anyhow::Result<()> {
        self.start();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::AbortReboot) => {
                        let _ = self.abort_reboot();
                    }
                    Some(SessionCommand::Shutdown) | None => {
                        info!("Session shutting down");
                        break;
                    }
                },
                Some(event) = self.events.recv() => {
                    self.handle_event(&event);
                    let close = event == WatchdogEvent::CloseRequested;
                    if outbound.send(event).is_err() {
                        debug!("Event receiver dropped, stopping session");
                        break;
                    }
                    if close {
                        break;
                    }
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Startup sequence: wait for the monitored process if required,
    /// otherwise resolve the threshold and begin monitoring.
    pub fn start(&mut self) {
        if self.config.wait_for_monitored_process {
            if let Some(name) = self.config.monitored_process() {
                if !self.probe.is_running(name) {
                    self.probe.wait_for_start(
                        name,
                        self.config.process_check_interval(),
                        self.process_wait.clone(),
                    );
                    return;
                }
            }
        }
        self.begin_session();
    }

    fn begin_session(&mut self) {
        let threshold = self
            .probe
            .resolve_session_threshold(self.config.monitored_process());
        self.threshold = Some(threshold);
        self.start_log_monitoring();
    }

    fn start_log_monitoring(&mut self) {
        // The orchestrator has already published the Error status.
        if let Err(e) = self.orchestrator.start_monitoring(&self.config.log_file_path) {
            self.sink
                .activity(format!("Failed to start monitoring: {}", e));
            return;
        }
        if self.config.log_file_path.exists() {
            self.scan_existing_lines();
        }
    }

    fn scan_existing_lines(&mut self) {
        let Some(threshold) = self.threshold.clone() else {
            return;
        };

        self.sink.activity("Scanning existing log lines...");
        self.sink.activity(format!(
            "Session threshold: {} ({})",
            threshold.instant.format(ACTIVITY_TIME_FORMAT),
            threshold.describe()
        ));

        let mut lines = self.orchestrator.read_all_lines();
        let result = SessionScanner::new(self.orchestrator.extractor())
            .with_activity(self.sink.clone())
            .scan(
                &mut lines,
                threshold.instant,
                &self.config.trigger_line_pattern,
                &self.config.expected_line_pattern,
            );

        match result.status {
            ScanStatus::NoTriggerFound => {}
            ScanStatus::SequenceCompleted => {
                self.sink.emit(WatchdogEvent::SequenceCompleted);
                self.on_success();
            }
            ScanStatus::IncompleteSequence => {
                let Some(trigger) = result.last_trigger else {
                    return;
                };
                let now = self.clock.now();
                let at = trigger.timestamp.unwrap_or(now);
                let elapsed = seconds_between(at, now);
                let remaining = self.config.timeout_seconds as f64 - elapsed;

                self.sink.emit(WatchdogEvent::TriggerDetected {
                    line: trigger.content,
                    at,
                });
                if remaining > 0.0 {
                    self.sink.activity(format!(
                        "Time elapsed since trigger: {:.1}s, remaining: {:.1}s",
                        elapsed, remaining
                    ));
                } else {
                    self.sink
                        .activity(format!("TIMEOUT already exceeded! Elapsed: {:.1}s", elapsed));
                }
                // An overdue window publishes expiry immediately.
                self.window.start(at, self.config.timeout());
            }
        }
    }

    /// Live handling of one appended line.
    pub fn process_line(&mut self, line: &str) {
        if contains_ignore_case(line, &self.config.trigger_line_pattern) {
            let timestamp = self.orchestrator.extract_timestamp(line);
            let threshold = self.threshold.as_ref().map(|t| t.instant);

            // Undated triggers count as recent here, unlike in the scanner.
            if is_timestamp_recent(timestamp, threshold) {
                let at = timestamp.unwrap_or_else(|| self.clock.now());
                self.sink.activity(format!("TRIGGER DETECTED: {}", line));
                self.sink.emit(WatchdogEvent::TriggerDetected {
                    line: line.to_string(),
                    at,
                });
                self.window.start(at, self.config.timeout());
            } else {
                debug!(line, "Ignoring trigger from before the session threshold");
            }
        }

        if !self.window.is_active() {
            return;
        }
        if contains_ignore_case(line, &self.config.expected_line_pattern) {
            let elapsed = self
                .window
                .trigger_instant()
                .map(|t| seconds_between(t, self.clock.now()))
                .unwrap_or(0.0);
            self.sink.activity(format!(
                "EXPECTED LINE FOUND after {:.1}s: {}",
                elapsed, line
            ));
            self.window.reset();
            self.sink.emit(WatchdogEvent::SequenceCompleted);
            self.on_success();
        } else {
            debug!("Waiting for expected pattern, line does not match");
        }
    }

    fn on_success(&mut self) {
        self.escalation.reset_attempts();
        if self.config.auto_close_on_success {
            self.auto_close.start(self.config.auto_close_delay_seconds);
        }
    }

    /// React to an internally published event.
    pub fn handle_event(&mut self, event: &WatchdogEvent) {
        match event {
            WatchdogEvent::NewLine(line) => self.process_line(line),
            WatchdogEvent::FileCreated(_) => self.start_log_monitoring(),
            WatchdogEvent::ProcessDetected(_) => self.begin_session(),
            WatchdogEvent::TimeoutExpired => self.on_timeout(),
            _ => {}
        }
    }

    fn on_timeout(&mut self) {
        self.sink.activity(format!(
            "TIMEOUT! Expected line not found within {} seconds.",
            self.config.timeout_seconds
        ));
        let escalation = Arc::clone(&self.escalation);
        tokio::spawn(async move {
            let outcome = escalation.handle_timeout().await;
            info!(?outcome, "Escalation finished");
        });
    }

    pub fn abort_reboot(&self) -> Result<(), RebootError> {
        self.reboot.abort_reboot()
    }

    fn shutdown(&mut self) {
        self.process_wait.cancel();
        self.auto_close.stop();
        self.orchestrator.dispose();
        if self.window.is_active() {
            self.window.reset();
        }
    }
}
