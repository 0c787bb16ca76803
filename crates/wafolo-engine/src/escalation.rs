/// Restart-then-reboot escalation.
///
/// On expiry the controller first tries bounded restarts of the monitored
/// process and only then hands off to the reboot gateway. A restart sequence
/// suspends for several seconds; sequences are serialized so a second expiry
/// waits for the first sequence to finish instead of overlapping it.
///
/// The attempt counter belongs to one timeout episode. It survives a
/// successful restart (the episode continues with a fresh window) and is
/// cleared when the episode ends: on reboot escalation or when the expected
/// line finally arrives.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::WatchdogConfig;
use crate::events::EventSink;
use crate::process::{ProcessControl, ProcessLifecycleProbe};
use crate::reboot::RebootManager;
use crate::timeout::TimeoutWindow;
use crate::ACTIVITY_TIME_FORMAT;

/// Graceful stop wait per instance before forcing.
const STOP_WAIT: Duration = Duration::from_secs(5);

/// Liveness poll cadence while waiting for an instance to exit.
const STOP_POLL: Duration = Duration::from_millis(100);

/// Pause between stopping instances and relaunching.
const CLEANUP_PAUSE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartTiming {
    pub stop_wait: Duration,
    pub stop_poll: Duration,
    pub cleanup_pause: Duration,
    pub stabilization: Duration,
}

impl RestartTiming {
    pub fn from_config(config: &WatchdogConfig) -> Self {
        Self {
            stop_wait: STOP_WAIT,
            stop_poll: STOP_POLL,
            cleanup_pause: CLEANUP_PAUSE,
            stabilization: Duration::from_secs(config.restart_process_delay_seconds),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartState {
    pub attempt_count: u32,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationOutcome {
    /// The process came back; a fresh window anchored at the restart runs.
    Restarted { attempt: u32 },
    /// Test mode: reboot described, window reset.
    RebootSimulated,
    RebootScheduled,
    RebootFailed(String),
}

pub struct EscalationController {
    config: WatchdogConfig,
    probe: Arc<ProcessLifecycleProbe>,
    window: TimeoutWindow,
    reboot: Arc<RebootManager>,
    clock: Arc<dyn Clock>,
    sink: EventSink,
    timing: RestartTiming,
    restart: Mutex<RestartState>,
    sequence: tokio::sync::Mutex<()>,
}

impl EscalationController {
    pub fn new(
        config: &WatchdogConfig,
        probe: Arc<ProcessLifecycleProbe>,
        window: TimeoutWindow,
        reboot: Arc<RebootManager>,
        clock: Arc<dyn Clock>,
        sink: EventSink,
    ) -> Self {
        Self {
            timing: RestartTiming::from_config(config),
            restart: Mutex::new(RestartState {
                attempt_count: 0,
                max_attempts: config.max_restart_attempts,
            }),
            config: config.clone(),
            probe,
            window,
            reboot,
            clock,
            sink,
            sequence: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_timing(mut self, timing: RestartTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn restart_state(&self) -> RestartState {
        *self.restart.lock().unwrap()
    }

    /// End of episode without escalation.
    pub fn reset_attempts(&self) {
        self.restart.lock().unwrap().attempt_count = 0;
    }

    pub async fn handle_timeout(&self) -> EscalationOutcome {
        let _sequence = self.sequence.lock().await;

        if let Some(name) = self.restart_candidate() {
            let attempt = {
                let mut state = self.restart.lock().unwrap();
                state.attempt_count += 1;
                state.attempt_count
            };
            self.sink.activity(format!(
                "Attempting to restart process '{}' (attempt {}/{})...",
                name, attempt, self.config.max_restart_attempts
            ));

            match self.restart_process(&name).await {
                Ok(true) => {
                    self.sink.activity(format!(
                        "Process '{}' detected running after restart.",
                        name
                    ));
                    self.window.reset();
                    let restarted_at = self.clock.now();
                    self.sink.activity(format!(
                        "Resuming monitoring from process restart time: {}",
                        restarted_at.format(ACTIVITY_TIME_FORMAT)
                    ));
                    self.window.start(restarted_at, self.config.timeout());
                    info!(attempt, process = %name, "Monitored process restarted");
                    return EscalationOutcome::Restarted { attempt };
                }
                Ok(false) => {
                    self.sink
                        .activity(format!("ERROR: Process '{}' did not restart.", name));
                }
                Err(e) => {
                    warn!(error = %e, process = %name, "Restart sequence failed");
                    self.sink
                        .activity(format!("ERROR restarting process: {}", e));
                }
            }
            self.sink.activity("Proceeding to reboot...");
        }

        self.reset_attempts();
        self.escalate_to_reboot()
    }

    fn restart_candidate(&self) -> Option<String> {
        if !self.config.restart_process_on_timeout {
            return None;
        }
        let name = self.config.monitored_process()?;
        let state = self.restart.lock().unwrap();
        (state.attempt_count < state.max_attempts).then(|| name.to_string())
    }

    /// Stop every instance, relaunch (or wait for an external restart) and
    /// re-probe. `Ok(false)` means the process did not come back.
    async fn restart_process(&self, name: &str) -> anyhow::Result<bool> {
        let control = self.probe.control();
        let instances = control.instances(name);

        if instances.is_empty() {
            self.sink
                .activity(format!("WARNING: Process '{}' not found.", name));
        }
        for instance in instances {
            self.sink
                .activity(format!("Stopping process PID {}...", instance.pid));
            self.terminate(control.as_ref(), instance.pid).await?;
            self.sink.activity("Process stopped.");
        }

        tokio::time::sleep(self.timing.cleanup_pause).await;

        match self.config.restart_command() {
            Some(command) => {
                self.sink.activity(format!(
                    "Restarting process using command: {}",
                    command
                ));
                control.launch_detached(command)?;
                self.sink.activity("Process restart command executed.");
            }
            None => self
                .sink
                .activity("No restart command configured. Waiting for external restart..."),
        }

        self.sink.activity(format!(
            "Waiting {} seconds for process to stabilize...",
            self.timing.stabilization.as_secs()
        ));
        tokio::time::sleep(self.timing.stabilization).await;

        Ok(self.probe.is_running(name))
    }

    async fn terminate(&self, control: &dyn ProcessControl, pid: u32) -> anyhow::Result<()> {
        if control.request_stop(pid) {
            let deadline = tokio::time::Instant::now() + self.timing.stop_wait;
            while tokio::time::Instant::now() < deadline {
                if !control.is_alive(pid) {
                    return Ok(());
                }
                tokio::time::sleep(self.timing.stop_poll).await;
            }
            warn!(pid, "Process ignored stop request, forcing");
        }

        if control.is_alive(pid) && !control.force_kill(pid) && control.is_alive(pid) {
            anyhow::bail!("could not stop PID {}", pid);
        }
        Ok(())
    }

    fn escalate_to_reboot(&self) -> EscalationOutcome {
        let test_mode = self.config.test_mode;
        let result = self.reboot.handle_timeout(
            test_mode,
            self.window.trigger_instant(),
            self.config.timeout_seconds,
        );

        match result {
            Ok(()) if test_mode => {
                self.window.reset();
                EscalationOutcome::RebootSimulated
            }
            Ok(()) => EscalationOutcome::RebootScheduled,
            Err(e) => EscalationOutcome::RebootFailed(e.to_string()),
        }
    }
}
