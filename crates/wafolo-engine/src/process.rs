/// Monitored-process lifecycle: enumeration, start time, liveness, stop and
/// relaunch.
///
/// All OS access goes through `ProcessControl`, which never raises: denied or
/// failed enumeration reads as "no instances". The probe layers the session
/// threshold logic and the wait-for-start poll on top of it.

#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime};
use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::events::{EventSink, MonitoringStatus, WatchdogEvent};
use crate::ACTIVITY_TIME_FORMAT;

#[cfg(target_os = "windows")]
const DETACHED_PROCESS: u32 = 0x0000_0008;
#[cfg(target_os = "windows")]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessInstance {
    pub pid: u32,
    /// Local wall-clock start, when the OS reports one.
    pub started_at: Option<NaiveDateTime>,
}

/// OS process boundary.
pub trait ProcessControl: Send + Sync {
    fn instances(&self, name: &str) -> Vec<ProcessInstance>;
    fn is_alive(&self, pid: u32) -> bool;
    /// Ask the process to exit. False if the request could not be delivered.
    fn request_stop(&self, pid: u32) -> bool;
    fn force_kill(&self, pid: u32) -> bool;
    /// Launch a detached command line and return the child's pid.
    fn launch_detached(&self, command: &str) -> anyhow::Result<u32>;
    fn executable_path(&self, name: &str) -> Option<PathBuf>;
}

/// `App` matches `App` and `App.exe`.
pub fn matches_process_name(actual: &str, wanted: &str) -> bool {
    let actual = strip_exe(actual);
    let wanted = strip_exe(wanted.trim());
    if cfg!(target_os = "windows") {
        actual.eq_ignore_ascii_case(wanted)
    } else {
        actual == wanted
    }
}

fn strip_exe(name: &str) -> &str {
    let len = name.len();
    if len > 4 && name.is_char_boundary(len - 4) && name[len - 4..].eq_ignore_ascii_case(".exe") {
        &name[..len - 4]
    } else {
        name
    }
}

/// Split a configured command line into program and arguments.
///
/// A command naming an existing file is taken whole, so unquoted paths with
/// spaces keep working.
pub fn split_command(command: &str) -> Option<(String, Vec<String>)> {
    let command = command.trim();
    if command.is_empty() {
        return None;
    }
    if Path::new(command).is_file() {
        return Some((command.to_string(), Vec::new()));
    }

    let mut parts = split_words(command)?.into_iter();
    let program = parts.next()?;
    Some((program, parts.collect()))
}

#[cfg(not(target_os = "windows"))]
fn split_words(command: &str) -> Option<Vec<String>> {
    shlex::split(command)
}

// Backslashes are path separators here, so only double quotes group words.
#[cfg(target_os = "windows")]
fn split_words(command: &str) -> Option<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_word = false;

    for c in command.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_word = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_word {
                    words.push(std::mem::take(&mut current));
                    has_word = false;
                }
            }
            c => {
                current.push(c);
                has_word = true;
            }
        }
    }
    if in_quotes {
        return None;
    }
    if has_word {
        words.push(current);
    }
    Some(words)
}

fn local_from_epoch(secs: u64) -> Option<NaiveDateTime> {
    let secs = i64::try_from(secs).ok()?;
    if secs == 0 {
        return None;
    }
    DateTime::from_timestamp(secs, 0).map(|utc| utc.with_timezone(&Local).naive_local())
}

/// `ProcessControl` backed by `sysinfo`.
pub struct SysinfoProcessControl {
    system: Mutex<System>,
}

impl Default for SysinfoProcessControl {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoProcessControl {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn refreshed(&self) -> std::sync::MutexGuard<'_, System> {
        let mut sys = self.system.lock().unwrap();
        sys.refresh_processes(ProcessesToUpdate::All, true);
        sys
    }
}

impl ProcessControl for SysinfoProcessControl {
    fn instances(&self, name: &str) -> Vec<ProcessInstance> {
        let sys = self.refreshed();
        let mut found: Vec<ProcessInstance> = sys
            .processes()
            .iter()
            .filter(|(_, p)| matches_process_name(&p.name().to_string_lossy(), name))
            .map(|(pid, p)| ProcessInstance {
                pid: pid.as_u32(),
                started_at: local_from_epoch(p.start_time()),
            })
            .collect();
        found.sort_by_key(|p| p.pid);
        found
    }

    fn is_alive(&self, pid: u32) -> bool {
        let mut sys = self.system.lock().unwrap();
        let pid = Pid::from_u32(pid);
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        sys.process(pid).is_some()
    }

    fn request_stop(&self, pid: u32) -> bool {
        let sys = self.system.lock().unwrap();
        match sys.process(Pid::from_u32(pid)) {
            // None means the platform has no graceful signal.
            Some(process) => process.kill_with(Signal::Term).unwrap_or(false),
            None => false,
        }
    }

    fn force_kill(&self, pid: u32) -> bool {
        let sys = self.system.lock().unwrap();
        sys.process(Pid::from_u32(pid))
            .map(|process| process.kill())
            .unwrap_or(false)
    }

    fn launch_detached(&self, command: &str) -> anyhow::Result<u32> {
        let (program, args) = split_command(command)
            .ok_or_else(|| anyhow::anyhow!("cannot parse restart command {:?}", command))?;

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(target_os = "windows")]
        cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);

        let mut child = cmd.spawn()?;
        let pid = child.id();
        info!(pid, program = %program, "Launched restart command");
        // Reap the child whenever it exits.
        std::thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(pid)
    }

    fn executable_path(&self, name: &str) -> Option<PathBuf> {
        let sys = self.refreshed();
        let mut matching: Vec<_> = sys
            .processes()
            .iter()
            .filter(|(_, p)| matches_process_name(&p.name().to_string_lossy(), name))
            .collect();
        matching.sort_by_key(|(pid, _)| pid.as_u32());
        matching
            .first()
            .and_then(|(_, p)| p.exe().map(Path::to_path_buf))
    }
}

/// Where the session threshold came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThresholdSource {
    MonitoredProcess(String),
    ApplicationStart,
    Now,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionThreshold {
    pub instant: NaiveDateTime,
    pub source: ThresholdSource,
}

impl SessionThreshold {
    pub fn describe(&self) -> String {
        match &self.source {
            ThresholdSource::MonitoredProcess(name) => format!("process '{}' start", name),
            ThresholdSource::ApplicationStart => "application start".to_string(),
            ThresholdSource::Now => "current time".to_string(),
        }
    }
}

pub struct ProcessLifecycleProbe {
    control: Arc<dyn ProcessControl>,
    clock: Arc<dyn Clock>,
    sink: EventSink,
    application_start: Option<NaiveDateTime>,
}

impl ProcessLifecycleProbe {
    /// The application start is taken from the clock at construction.
    pub fn new(control: Arc<dyn ProcessControl>, clock: Arc<dyn Clock>, sink: EventSink) -> Self {
        let application_start = Some(clock.now());
        Self {
            control,
            clock,
            sink,
            application_start,
        }
    }

    /// Drop the application start so resolution falls through to "now".
    pub fn without_application_start(mut self) -> Self {
        self.application_start = None;
        self
    }

    pub fn control(&self) -> Arc<dyn ProcessControl> {
        self.control.clone()
    }

    pub fn application_start(&self) -> Option<NaiveDateTime> {
        self.application_start
    }

    /// Ordered fallback: monitored process start, application start, now.
    pub fn resolve_session_threshold(&self, name: Option<&str>) -> SessionThreshold {
        let name = name.map(str::trim).filter(|n| !n.is_empty());

        match name {
            None => self.sink.activity(concat!(
                "No monitored process configured. ",
                "Using application start time as session threshold."
            )),
            Some(name) => {
                let instances = self.control.instances(name);
                let earliest = instances.iter().filter_map(|p| p.started_at).min();
                if let Some(started) = earliest {
                    let count = instances.len();
                    self.sink
                        .activity(format!("Monitored process '{}' detected.", name));
                    self.sink.activity(format!(
                        "Process started at: {}",
                        started.format(ACTIVITY_TIME_FORMAT)
                    ));
                    self.sink
                        .activity(format!("Found {} instance(s) of the process.", count));
                    return SessionThreshold {
                        instant: started,
                        source: ThresholdSource::MonitoredProcess(name.to_string()),
                    };
                }
                if instances.is_empty() {
                    self.sink.activity(format!(
                        "Monitored process '{}' is not currently running.",
                        name
                    ));
                } else {
                    warn!(process = name, "Process running but start time unavailable");
                    self.sink.activity(format!(
                        "Monitored process '{}' is running but its start time is unavailable.",
                        name
                    ));
                }
                self.sink
                    .activity("Using application start time as session threshold.");
            }
        }

        match self.application_start {
            Some(instant) => SessionThreshold {
                instant,
                source: ThresholdSource::ApplicationStart,
            },
            None => SessionThreshold {
                instant: self.clock.now(),
                source: ThresholdSource::Now,
            },
        }
    }

    /// Earliest start across all instances, falling back to the application
    /// start (or now).
    pub fn detect_start_time(&self, name: &str) -> NaiveDateTime {
        self.resolve_session_threshold(Some(name)).instant
    }

    pub fn is_running(&self, name: &str) -> bool {
        !name.trim().is_empty() && !self.control.instances(name).is_empty()
    }

    pub fn instance_count(&self, name: &str) -> usize {
        if name.trim().is_empty() {
            return 0;
        }
        self.control.instances(name).len()
    }

    pub fn executable_path(&self, name: &str) -> Option<PathBuf> {
        if name.trim().is_empty() {
            return None;
        }
        self.control.executable_path(name)
    }

    /// Poll every `interval` until `name` is running, then publish
    /// `ProcessDetected` once and stop.
    pub fn wait_for_start(
        &self,
        name: &str,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let name = name.trim().to_string();
        let control = self.control.clone();
        let sink = self.sink.clone();

        sink.status(MonitoringStatus::WaitingForProcess, "Waiting for monitored process...");
        sink.activity(format!("Waiting for monitored process '{}' to start...", name));
        sink.activity(format!(
            "Process check interval: {} seconds",
            interval.as_secs()
        ));

        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(process = %name, "Process wait cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        if !control.instances(&name).is_empty() {
                            sink.activity(format!("Monitored process '{}' detected!", name));
                            sink.emit(WatchdogEvent::ProcessDetected(name.clone()));
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// In-memory `ProcessControl` for tests.
#[cfg(any(test, feature = "test-support"))]
#[doc(hidden)]
pub mod fake {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone)]
    struct FakeProcess {
        name: String,
        started_at: NaiveDateTime,
        /// Ignores graceful stop requests.
        stubborn: bool,
    }

    #[derive(Default)]
    struct FakeState {
        next_pid: u32,
        processes: BTreeMap<u32, FakeProcess>,
        launches: Vec<String>,
        /// Name and start instant of the process a launch brings up.
        on_launch: Option<(String, NaiveDateTime)>,
        fail_launch: bool,
        /// Report instances without a start time.
        hide_start_times: bool,
    }

    /// Scriptable process table.
    #[derive(Default)]
    pub struct FakeProcessControl {
        state: Mutex<FakeState>,
    }

    impl FakeProcessControl {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn spawn(&self, name: &str, started_at: NaiveDateTime) -> u32 {
            self.insert(name, started_at, false)
        }

        pub fn spawn_stubborn(&self, name: &str, started_at: NaiveDateTime) -> u32 {
            self.insert(name, started_at, true)
        }

        fn insert(&self, name: &str, started_at: NaiveDateTime, stubborn: bool) -> u32 {
            let mut state = self.state.lock().unwrap();
            state.next_pid += 1;
            let pid = 1000 + state.next_pid;
            state.processes.insert(
                pid,
                FakeProcess {
                    name: name.to_string(),
                    started_at,
                    stubborn,
                },
            );
            pid
        }

        /// Launching any command starts a process with this name.
        pub fn relaunch_as(&self, name: &str, started_at: NaiveDateTime) {
            self.state.lock().unwrap().on_launch = Some((name.to_string(), started_at));
        }

        /// Mimic an OS that refuses to report process start times.
        pub fn hide_start_times(&self) {
            self.state.lock().unwrap().hide_start_times = true;
        }

        pub fn fail_launches(&self) {
            self.state.lock().unwrap().fail_launch = true;
        }

        pub fn launches(&self) -> Vec<String> {
            self.state.lock().unwrap().launches.clone()
        }

        pub fn running(&self) -> usize {
            self.state.lock().unwrap().processes.len()
        }
    }

    impl ProcessControl for FakeProcessControl {
        fn instances(&self, name: &str) -> Vec<ProcessInstance> {
            let state = self.state.lock().unwrap();
            let found = state
                .processes
                .iter()
                .filter(|(_, p)| matches_process_name(&p.name, name))
                .map(|(pid, p)| ProcessInstance {
                    pid: *pid,
                    started_at: (!state.hide_start_times).then_some(p.started_at),
                })
                .collect();
            found
        }

        fn is_alive(&self, pid: u32) -> bool {
            self.state.lock().unwrap().processes.contains_key(&pid)
        }

        fn request_stop(&self, pid: u32) -> bool {
            let mut state = self.state.lock().unwrap();
            match state.processes.get(&pid) {
                Some(p) if p.stubborn => true,
                Some(_) => {
                    state.processes.remove(&pid);
                    true
                }
                None => false,
            }
        }

        fn force_kill(&self, pid: u32) -> bool {
            self.state.lock().unwrap().processes.remove(&pid).is_some()
        }

        fn launch_detached(&self, command: &str) -> anyhow::Result<u32> {
            let (name, started_at) = {
                let mut state = self.state.lock().unwrap();
                state.launches.push(command.to_string());
                if state.fail_launch {
                    anyhow::bail!("launch of {:?} failed", command);
                }
                match state.on_launch.clone() {
                    Some(spec) => spec,
                    None => return Ok(0),
                }
            };
            Ok(self.spawn(&name, started_at))
        }

        fn executable_path(&self, name: &str) -> Option<PathBuf> {
            self.instances(name)
                .first()
                .map(|_| PathBuf::from(format!("/opt/{}/{}", name, name)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeProcessControl;
    use super::*;
    use crate::clock::ManualClock;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn lifecycle(
        control: Arc<FakeProcessControl>,
    ) -> (
        ProcessLifecycleProbe,
        tokio::sync::mpsc::UnboundedReceiver<WatchdogEvent>,
    ) {
        let clock = Arc::new(ManualClock::new(at(12, 0)));
        let (sink, rx) = EventSink::channel();
        (ProcessLifecycleProbe::new(control, clock, sink), rx)
    }

    #[test]
    fn name_matching_strips_exe() {
        assert!(matches_process_name("Worker.exe", "Worker"));
        assert!(matches_process_name("Worker", "Worker.exe"));
        assert!(matches_process_name("Worker", " Worker "));
        assert!(!matches_process_name("Worker2", "Worker"));
        assert!(!matches_process_name(".exe", "x"));
    }

    #[test]
    fn earliest_instance_sets_threshold() {
        let control = Arc::new(FakeProcessControl::new());
        control.spawn("worker", at(9, 30));
        control.spawn("worker", at(8, 15));
        control.spawn("other", at(7, 0));
        let (lifecycle, _rx) = lifecycle(control);

        let threshold = lifecycle.resolve_session_threshold(Some("worker"));
        assert_eq!(threshold.instant, at(8, 15));
        assert_eq!(threshold.source, ThresholdSource::MonitoredProcess("worker".into()));
        assert_eq!(lifecycle.instance_count("worker"), 2);
    }

    #[test]
    fn absent_process_falls_back_to_application_start() {
        let (lifecycle, mut rx) = lifecycle(Arc::new(FakeProcessControl::new()));

        let threshold = lifecycle.resolve_session_threshold(Some("worker"));
        assert_eq!(threshold.source, ThresholdSource::ApplicationStart);
        assert_eq!(threshold.instant, at(12, 0));
        assert_eq!(
            rx.try_recv().unwrap(),
            WatchdogEvent::Activity("Monitored process 'worker' is not currently running.".into())
        );
    }

    #[test]
    fn running_process_without_start_time_is_not_reported_absent() {
        let control = Arc::new(FakeProcessControl::new());
        control.spawn("worker", at(9, 0));
        control.hide_start_times();
        let (lifecycle, mut rx) = lifecycle(control);

        let threshold = lifecycle.resolve_session_threshold(Some("worker"));
        assert_eq!(threshold.source, ThresholdSource::ApplicationStart);
        assert!(lifecycle.is_running("worker"));

        let log: Vec<WatchdogEvent> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(
            log.first(),
            Some(&WatchdogEvent::Activity(
                "Monitored process 'worker' is running but its start time is unavailable."
                    .into()
            ))
        );
        assert!(!log.iter().any(
            |e| matches!(e, WatchdogEvent::Activity(m) if m.contains("not currently running"))
        ));
    }

    #[test]
    fn no_name_and_no_application_start_uses_now() {
        let (lifecycle, _rx) = lifecycle(Arc::new(FakeProcessControl::new()));
        let lifecycle = lifecycle.without_application_start();

        let threshold = lifecycle.resolve_session_threshold(None);
        assert_eq!(threshold.source, ThresholdSource::Now);
        assert_eq!(threshold.describe(), "current time");
    }

    #[test]
    fn blank_name_is_never_running() {
        let control = Arc::new(FakeProcessControl::new());
        control.spawn("", at(9, 0));
        let (lifecycle, _rx) = lifecycle(control);
        assert!(!lifecycle.is_running("  "));
        assert_eq!(lifecycle.instance_count(""), 0);
        assert!(lifecycle.executable_path("").is_none());
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn splits_quoted_command() {
        let (program, args) = split_command("/usr/bin/worker --name 'night shift'").unwrap();
        assert_eq!(program, "/usr/bin/worker");
        assert_eq!(args, vec!["--name", "night shift"]);
        assert!(split_command("   ").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_start_detects_once() {
        let control = Arc::new(FakeProcessControl::new());
        let (lifecycle, mut rx) = lifecycle(control.clone());

        let handle =
            lifecycle.wait_for_start("worker", Duration::from_secs(5), CancellationToken::new());
        tokio::time::sleep(Duration::from_secs(12)).await;
        control.spawn("worker", at(12, 0));
        handle.await.unwrap();

        let detections: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| matches!(e, WatchdogEvent::ProcessDetected(_)))
            .collect();
        assert_eq!(detections, vec![WatchdogEvent::ProcessDetected("worker".into())]);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_start_can_be_cancelled() {
        let (lifecycle, _rx) = lifecycle(Arc::new(FakeProcessControl::new()));
        let cancel = CancellationToken::new();
        let handle = lifecycle.wait_for_start("worker", Duration::from_secs(1), cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
    }
}
