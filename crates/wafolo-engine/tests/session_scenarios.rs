//! End-to-end session scenarios against a real log file, a scripted process
//! table and a simulated reboot backend. Tokio time is paused; the wall clock
//! is driven by hand.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use wafolo_engine::clock::ManualClock;
use wafolo_engine::config::WatchdogConfig;
use wafolo_engine::escalation::RestartTiming;
use wafolo_engine::events::{MonitoringStatus, WatchdogEvent};
use wafolo_engine::process::fake::FakeProcessControl;
use wafolo_engine::reboot::{SimulatedCall, SimulatedReboot};
use wafolo_engine::session::{SessionCommand, SessionDeps, WatchdogSession};

const TRIGGER: &str = "Starting critical operation";
const EXPECTED: &str = "Operation completed successfully";

fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 1)
        .unwrap()
        .and_hms_opt(h, m, s)
        .unwrap()
}

fn stamp(instant: NaiveDateTime, text: &str) -> String {
    format!("{} {}", instant.format("%Y-%m-%d %H:%M:%S"), text)
}

fn append(path: &Path, line: &str) {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    writeln!(file, "{}", line).unwrap();
}

struct Scenario {
    _dir: tempfile::TempDir,
    path: PathBuf,
    clock: Arc<ManualClock>,
    control: Arc<FakeProcessControl>,
    backend: Arc<SimulatedReboot>,
    commands: UnboundedSender<SessionCommand>,
    events: UnboundedReceiver<WatchdogEvent>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Scenario {
    /// Builds the session with the clock at 12:00:00 and hands it to a task.
    /// `prepare` sees the log path and process table before startup.
    fn launch(
        configure: impl FnOnce(&mut WatchdogConfig),
        prepare: impl FnOnce(&Path, &FakeProcessControl),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");

        let mut config = WatchdogConfig::sample();
        config.log_file_path = path.clone();
        config.trigger_line_pattern = TRIGGER.into();
        config.expected_line_pattern = EXPECTED.into();
        config.timeout_seconds = 5;
        config.test_mode = true;
        config.monitored_process_name = String::new();
        config.process_restart_command = None;
        configure(&mut config);

        let clock = Arc::new(ManualClock::new(at(12, 0, 0)));
        let control = Arc::new(FakeProcessControl::new());
        let backend = Arc::new(SimulatedReboot::new());
        prepare(&path, &control);

        let deps = SessionDeps {
            clock: clock.clone(),
            processes: control.clone(),
            reboot: backend.clone(),
            poll_interval: Duration::from_millis(50),
            restart_timing: Some(RestartTiming {
                stop_wait: Duration::from_millis(500),
                stop_poll: Duration::from_millis(50),
                cleanup_pause: Duration::from_millis(10),
                stabilization: Duration::from_millis(100),
            }),
        };
        let session = WatchdogSession::new(config, deps).unwrap();

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let task = tokio::spawn(session.run(command_rx, event_tx));

        Self {
            _dir: dir,
            path,
            clock,
            control,
            backend,
            commands,
            events,
            task,
        }
    }

    /// Everything published up to and including the first match.
    async fn until(&mut self, pred: impl Fn(&WatchdogEvent) -> bool) -> Vec<WatchdogEvent> {
        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                let event = self.events.recv().await.expect("session ended");
                let done = pred(&event);
                seen.push(event);
                if done {
                    return;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out; saw {:?}", seen));
        seen
    }

    async fn shutdown(self) {
        let _ = self.commands.send(SessionCommand::Shutdown);
        self.task.await.unwrap().unwrap();
    }
}

fn activity(events: &[WatchdogEvent], text: &str) -> bool {
    events
        .iter()
        .any(|e| matches!(e, WatchdogEvent::Activity(m) if m.contains(text)))
}

#[tokio::test(start_paused = true)]
async fn completed_sequence_at_startup_auto_closes() {
    let mut scenario = Scenario::launch(
        |c| {
            c.auto_close_on_success = true;
            c.auto_close_delay_seconds = 2;
        },
        |path, _| {
            append(path, &stamp(at(11, 0, 0), EXPECTED));
            append(path, &stamp(at(12, 0, 5), TRIGGER));
            append(path, &stamp(at(12, 0, 6), EXPECTED));
        },
    );
    scenario.clock.set(at(12, 0, 10));

    let events = scenario
        .until(|e| *e == WatchdogEvent::SequenceCompleted)
        .await;
    assert!(activity(
        &events,
        "Session threshold: 2024-03-01 12:00:00 (application start)"
    ));
    assert!(!events
        .iter()
        .any(|e| matches!(e, WatchdogEvent::TriggerDetected { .. })));

    let events = scenario
        .until(|e| *e == WatchdogEvent::CloseRequested)
        .await;
    assert!(events.contains(&WatchdogEvent::AutoCloseCountdown(2)));
    scenario.task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn live_trigger_times_out_in_test_mode() {
    let mut scenario = Scenario::launch(|_| {}, |path, _| std::fs::write(path, "").unwrap());
    scenario
        .until(|e| {
            matches!(e, WatchdogEvent::Status { status: MonitoringStatus::Active, .. })
        })
        .await;

    // Dated before the session threshold: ignored.
    append(&scenario.path, &stamp(at(11, 59, 0), TRIGGER));
    append(&scenario.path, &stamp(at(12, 0, 1), "warming up"));
    let events = scenario
        .until(|e| matches!(e, WatchdogEvent::NewLine(l) if l.contains("warming up")))
        .await;
    assert!(!events
        .iter()
        .any(|e| matches!(e, WatchdogEvent::TriggerDetected { .. })));

    append(&scenario.path, &stamp(at(12, 0, 1), TRIGGER));
    let events = scenario
        .until(|e| matches!(e, WatchdogEvent::TriggerDetected { .. }))
        .await;
    assert_eq!(
        events.last(),
        Some(&WatchdogEvent::TriggerDetected {
            line: stamp(at(12, 0, 1), TRIGGER),
            at: at(12, 0, 1),
        })
    );

    scenario.clock.set(at(12, 0, 7));
    scenario
        .until(|e| *e == WatchdogEvent::TimeoutExpired)
        .await;
    let events = scenario
        .until(|e| *e == WatchdogEvent::TriggerReset)
        .await;
    assert!(events
        .iter()
        .any(|e| matches!(e, WatchdogEvent::RebootSimulated(_))));
    assert!(activity(&events, "TEST MODE: Reboot would be triggered now."));
    assert!(scenario.backend.calls().is_empty());

    scenario.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn expected_line_inside_window_completes_sequence() {
    let mut scenario = Scenario::launch(
        |_| {},
        |path, _| append(path, &stamp(at(12, 0, 1), TRIGGER)),
    );
    scenario.clock.set(at(12, 0, 2));

    let events = scenario
        .until(|e| matches!(e, WatchdogEvent::Activity(m) if m.contains("remaining")))
        .await;
    assert!(activity(&events, "Time elapsed since trigger: 1.0s, remaining: 4.0s"));
    assert!(events
        .iter()
        .any(|e| matches!(e, WatchdogEvent::TriggerDetected { at: t, .. } if *t == at(12, 0, 1))));

    append(&scenario.path, &stamp(at(12, 0, 3), EXPECTED));
    scenario.clock.set(at(12, 0, 3));
    let events = scenario
        .until(|e| *e == WatchdogEvent::SequenceCompleted)
        .await;
    assert!(events.contains(&WatchdogEvent::TriggerReset));
    assert!(activity(&events, "EXPECTED LINE FOUND after 2.0s"));

    scenario.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn overdue_trigger_at_startup_expires_immediately() {
    let mut scenario = Scenario::launch(
        |_| {},
        |path, _| append(path, &stamp(at(12, 0, 1), TRIGGER)),
    );
    scenario.clock.set(at(12, 0, 30));

    let events = scenario
        .until(|e| *e == WatchdogEvent::TimeoutExpired)
        .await;
    assert!(activity(&events, "TIMEOUT already exceeded! Elapsed: 29.0s"));
    scenario
        .until(|e| matches!(e, WatchdogEvent::RebootSimulated(_)))
        .await;

    scenario.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn waits_for_monitored_process_before_monitoring() {
    let mut scenario = Scenario::launch(
        |c| {
            c.monitored_process_name = "worker".into();
            c.wait_for_monitored_process = true;
            c.process_check_interval_seconds = 1;
        },
        |path, _| append(path, &stamp(at(11, 0, 0), TRIGGER)),
    );
    scenario
        .until(|e| {
            matches!(
                e,
                WatchdogEvent::Status { status: MonitoringStatus::WaitingForProcess, .. }
            )
        })
        .await;

    scenario.control.spawn("worker", at(12, 0, 20));
    scenario
        .until(|e| *e == WatchdogEvent::ProcessDetected("worker".into()))
        .await;
    let events = scenario
        .until(|e| {
            matches!(e, WatchdogEvent::Status { status: MonitoringStatus::Active, .. })
        })
        .await;
    assert!(activity(&events, "Process started at: 2024-03-01 12:00:20"));

    scenario.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn pending_reboot_can_be_aborted() {
    let mut scenario = Scenario::launch(
        |c| {
            c.test_mode = false;
            c.reboot_delay_seconds = 45;
            c.reboot_message = "log watchdog".into();
        },
        |path, _| append(path, &stamp(at(12, 0, 1), TRIGGER)),
    );
    scenario.clock.set(at(12, 0, 30));

    scenario
        .until(|e| *e == WatchdogEvent::RebootPending { delay_secs: 45 })
        .await;

    scenario.commands.send(SessionCommand::AbortReboot).unwrap();
    let events = scenario
        .until(|e| *e == WatchdogEvent::RebootAborted)
        .await;
    assert!(activity(&events, "Shutdown aborted by user."));
    scenario
        .until(|e| *e == WatchdogEvent::TriggerReset)
        .await;

    assert_eq!(
        scenario.backend.calls(),
        vec![
            SimulatedCall::Schedule {
                delay_secs: 45,
                message: "log watchdog".into(),
            },
            SimulatedCall::Abort,
        ]
    );
    scenario.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn timeout_restarts_monitored_process_before_rebooting() {
    let mut scenario = Scenario::launch(
        |c| {
            c.monitored_process_name = "worker".into();
            c.restart_process_on_timeout = true;
            c.max_restart_attempts = 1;
            c.process_restart_command = Some("/opt/worker/worker --serve".into());
        },
        |path, control| {
            control.spawn("worker", at(11, 59, 0));
            control.relaunch_as("worker", at(12, 0, 31));
            append(path, &stamp(at(12, 0, 1), TRIGGER));
        },
    );
    scenario.clock.set(at(12, 0, 30));

    let events = scenario
        .until(|e| *e == WatchdogEvent::TimeoutExpired)
        .await;
    assert!(activity(&events, "process 'worker' start"));

    let events = scenario
        .until(|e| matches!(e, WatchdogEvent::Activity(m) if m.starts_with("Resuming monitoring")))
        .await;
    assert!(activity(&events, "Attempting to restart process 'worker' (attempt 1/1)..."));
    assert_eq!(scenario.control.launches(), vec!["/opt/worker/worker --serve"]);
    assert_eq!(scenario.control.running(), 1);

    append(&scenario.path, &stamp(at(12, 0, 33), EXPECTED));
    scenario.clock.set(at(12, 0, 33));
    scenario
        .until(|e| *e == WatchdogEvent::SequenceCompleted)
        .await;
    assert!(scenario.backend.calls().is_empty());

    scenario.shutdown().await;
}
