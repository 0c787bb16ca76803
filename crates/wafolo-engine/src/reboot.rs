/// Reboot gateway.
///
/// `RebootBackend` is the OS capability: schedule a delayed reboot or abort a
/// pending one. Backends are interchangeable (native API, shutdown command,
/// simulated) and `ChainedReboot` tries them in order. `RebootManager` owns
/// the Idle/Pending state and turns outcomes into activity and alerts.

use std::process::Command;
use std::sync::{Arc, Mutex};

use chrono::NaiveDateTime;
use thiserror::Error;
use tracing::{info, warn};

use crate::events::{EventSink, WatchdogEvent};
use crate::timeout::TimeoutWindow;
use crate::{ACTIVITY_TIME_FORMAT, DEFAULT_REBOOT_DELAY_SECS, DEFAULT_REBOOT_MESSAGE};

#[derive(Debug, Error)]
pub enum RebootError {
    #[error("elevated privileges are required ({0})")]
    PrivilegeRequired(String),
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
    #[error("`{command}` failed: {detail}")]
    CommandFailed { command: String, detail: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub trait RebootBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn schedule(&self, delay_secs: u32, message: &str) -> Result<(), RebootError>;
    fn abort(&self) -> Result<(), RebootError>;

    fn has_elevated_privileges(&self) -> bool {
        has_elevated_privileges()
    }
}

/// Whether the current process runs as administrator / root.
pub fn has_elevated_privileges() -> bool {
    #[cfg(target_os = "windows")]
    {
        unsafe { windows_sys::Win32::UI::Shell::IsUserAnAdmin() != 0 }
    }
    #[cfg(unix)]
    {
        unsafe { libc::geteuid() == 0 }
    }
    #[cfg(not(any(unix, target_os = "windows")))]
    {
        false
    }
}

// ── Native ──

/// Privileged OS call. Windows only; elsewhere every call is `Unsupported`
/// so a chain moves on to the shutdown command.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeReboot;

impl RebootBackend for NativeReboot {
    fn name(&self) -> &'static str {
        "native"
    }

    #[cfg(target_os = "windows")]
    fn schedule(&self, delay_secs: u32, message: &str) -> Result<(), RebootError> {
        win32::enable_shutdown_privilege()?;
        win32::initiate_shutdown(delay_secs, message)
    }

    #[cfg(not(target_os = "windows"))]
    fn schedule(&self, _delay_secs: u32, _message: &str) -> Result<(), RebootError> {
        Err(RebootError::Unsupported("native reboot"))
    }

    #[cfg(target_os = "windows")]
    fn abort(&self) -> Result<(), RebootError> {
        win32::enable_shutdown_privilege()?;
        win32::abort_shutdown()
    }

    #[cfg(not(target_os = "windows"))]
    fn abort(&self) -> Result<(), RebootError> {
        Err(RebootError::Unsupported("native reboot abort"))
    }
}

#[cfg(target_os = "windows")]
mod win32 {
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;

    use windows_sys::Win32::Foundation::{
        CloseHandle, GetLastError, ERROR_NOT_ALL_ASSIGNED, HANDLE, LUID,
    };
    use windows_sys::Win32::Security::{
        AdjustTokenPrivileges, LookupPrivilegeValueW, LUID_AND_ATTRIBUTES, SE_PRIVILEGE_ENABLED,
        TOKEN_ADJUST_PRIVILEGES, TOKEN_PRIVILEGES, TOKEN_QUERY,
    };
    use windows_sys::Win32::System::Shutdown::{
        AbortSystemShutdownW, InitiateSystemShutdownExW, SHTDN_REASON_FLAG_PLANNED,
        SHTDN_REASON_MAJOR_APPLICATION, SHTDN_REASON_MINOR_HUNG,
    };
    use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

    use super::RebootError;

    fn wide(text: &str) -> Vec<u16> {
        OsStr::new(text).encode_wide().chain(Some(0)).collect()
    }

    fn last_error(call: &str) -> RebootError {
        RebootError::Io(std::io::Error::other(format!(
            "{} failed: {}",
            call,
            std::io::Error::last_os_error()
        )))
    }

    pub fn enable_shutdown_privilege() -> Result<(), RebootError> {
        let name = wide("SeShutdownPrivilege");
        unsafe {
            let mut token: HANDLE = std::ptr::null_mut();
            if OpenProcessToken(
                GetCurrentProcess(),
                TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY,
                &mut token,
            ) == 0
            {
                return Err(last_error("OpenProcessToken"));
            }

            let mut luid = LUID {
                LowPart: 0,
                HighPart: 0,
            };
            if LookupPrivilegeValueW(std::ptr::null(), name.as_ptr(), &mut luid) == 0 {
                let err = last_error("LookupPrivilegeValueW");
                CloseHandle(token);
                return Err(err);
            }

            let privileges = TOKEN_PRIVILEGES {
                PrivilegeCount: 1,
                Privileges: [LUID_AND_ATTRIBUTES {
                    Luid: luid,
                    Attributes: SE_PRIVILEGE_ENABLED,
                }],
            };
            let adjusted = AdjustTokenPrivileges(
                token,
                0,
                &privileges,
                0,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            );
            // Success with ERROR_NOT_ALL_ASSIGNED means the account lacks it.
            let status = GetLastError();
            CloseHandle(token);

            if adjusted == 0 || status == ERROR_NOT_ALL_ASSIGNED {
                return Err(RebootError::PrivilegeRequired(
                    "SeShutdownPrivilege could not be enabled".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn initiate_shutdown(delay_secs: u32, message: &str) -> Result<(), RebootError> {
        let message = wide(message);
        let reason =
            SHTDN_REASON_MAJOR_APPLICATION | SHTDN_REASON_MINOR_HUNG | SHTDN_REASON_FLAG_PLANNED;
        let ok = unsafe {
            InitiateSystemShutdownExW(
                std::ptr::null(),
                message.as_ptr(),
                delay_secs,
                0, // let applications close on their own
                1, // reboot after shutdown
                reason,
            )
        };
        if ok == 0 {
            return Err(last_error("InitiateSystemShutdownExW"));
        }
        Ok(())
    }

    pub fn abort_shutdown() -> Result<(), RebootError> {
        if unsafe { AbortSystemShutdownW(std::ptr::null()) } == 0 {
            return Err(last_error("AbortSystemShutdownW"));
        }
        Ok(())
    }
}

// ── Shutdown command ──

/// Non-privileged fallback through the OS `shutdown` command.
#[derive(Debug, Clone)]
pub struct CommandReboot {
    program: String,
}

impl Default for CommandReboot {
    fn default() -> Self {
        Self {
            program: if cfg!(target_os = "windows") {
                "shutdown.exe".to_string()
            } else {
                "shutdown".to_string()
            },
        }
    }
}

impl CommandReboot {
    /// Use a different executable with the same argument conventions.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn schedule_args(delay_secs: u32, message: &str) -> Vec<String> {
        if cfg!(target_os = "windows") {
            vec![
                "/r".into(),
                "/t".into(),
                delay_secs.to_string(),
                "/c".into(),
                message.to_string(),
            ]
        } else {
            // Unix shutdown takes whole minutes.
            let when = match delay_secs {
                0 => "now".to_string(),
                secs => format!("+{}", secs.div_ceil(60)),
            };
            vec!["-r".into(), when, message.to_string()]
        }
    }

    pub fn abort_args() -> Vec<String> {
        if cfg!(target_os = "windows") {
            vec!["/a".into()]
        } else {
            vec!["-c".into()]
        }
    }

    fn run(&self, args: &[String]) -> Result<(), RebootError> {
        let command = format!("{} {}", self.program, args.join(" "));
        let output = Command::new(&self.program).args(args).output()?;
        if output.status.success() {
            info!(command = %command, "Shutdown command accepted");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let detail = if stderr.is_empty() {
            format!("exit status {}", output.status)
        } else {
            stderr
        };
        Err(RebootError::CommandFailed { command, detail })
    }
}

impl RebootBackend for CommandReboot {
    fn name(&self) -> &'static str {
        "shutdown command"
    }

    fn schedule(&self, delay_secs: u32, message: &str) -> Result<(), RebootError> {
        self.run(&Self::schedule_args(delay_secs, message))
    }

    fn abort(&self) -> Result<(), RebootError> {
        self.run(&Self::abort_args())
    }
}

// ── Simulated ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulatedCall {
    Schedule { delay_secs: u32, message: String },
    Abort,
}

#[derive(Debug, Default)]
struct SimulatedState {
    calls: Vec<SimulatedCall>,
    fail_schedule: bool,
    fail_abort: bool,
    elevated: bool,
}

/// Records requests and never touches the OS.
#[derive(Debug, Default)]
pub struct SimulatedReboot {
    state: Mutex<SimulatedState>,
}

impl SimulatedReboot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_schedule(&self, fail: bool) {
        self.state.lock().unwrap().fail_schedule = fail;
    }

    pub fn fail_abort(&self, fail: bool) {
        self.state.lock().unwrap().fail_abort = fail;
    }

    pub fn set_elevated(&self, elevated: bool) {
        self.state.lock().unwrap().elevated = elevated;
    }

    pub fn calls(&self) -> Vec<SimulatedCall> {
        self.state.lock().unwrap().calls.clone()
    }
}

impl RebootBackend for SimulatedReboot {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn schedule(&self, delay_secs: u32, message: &str) -> Result<(), RebootError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(SimulatedCall::Schedule {
            delay_secs,
            message: message.to_string(),
        });
        if state.fail_schedule {
            return Err(RebootError::CommandFailed {
                command: "simulated schedule".into(),
                detail: "configured to fail".into(),
            });
        }
        Ok(())
    }

    fn abort(&self) -> Result<(), RebootError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(SimulatedCall::Abort);
        if state.fail_abort {
            return Err(RebootError::CommandFailed {
                command: "simulated abort".into(),
                detail: "configured to fail".into(),
            });
        }
        Ok(())
    }

    fn has_elevated_privileges(&self) -> bool {
        self.state.lock().unwrap().elevated
    }
}

// ── Chain ──

/// Tries each backend in order; the first success wins.
pub struct ChainedReboot {
    backends: Vec<Arc<dyn RebootBackend>>,
}

impl ChainedReboot {
    pub fn new(backends: Vec<Arc<dyn RebootBackend>>) -> Self {
        Self { backends }
    }

    /// Native call first, shutdown command second.
    pub fn platform() -> Self {
        Self::new(vec![
            Arc::new(NativeReboot),
            Arc::new(CommandReboot::default()),
        ])
    }

    fn attempt(
        &self,
        what: &str,
        mut op: impl FnMut(&dyn RebootBackend) -> Result<(), RebootError>,
    ) -> Result<(), RebootError> {
        let mut last = RebootError::Unsupported("empty reboot chain");
        for backend in &self.backends {
            match op(backend.as_ref()) {
                Ok(()) => {
                    info!(backend = backend.name(), "{} succeeded", what);
                    return Ok(());
                }
                Err(e) => {
                    warn!(backend = backend.name(), error = %e, "{} failed, trying next", what);
                    last = e;
                }
            }
        }
        Err(last)
    }
}

impl RebootBackend for ChainedReboot {
    fn name(&self) -> &'static str {
        "chain"
    }

    fn schedule(&self, delay_secs: u32, message: &str) -> Result<(), RebootError> {
        self.attempt("Reboot schedule", |b| b.schedule(delay_secs, message))
    }

    fn abort(&self) -> Result<(), RebootError> {
        self.attempt("Reboot abort", |b| b.abort())
    }

    fn has_elevated_privileges(&self) -> bool {
        self.backends
            .first()
            .map(|b| b.has_elevated_privileges())
            .unwrap_or_else(has_elevated_privileges)
    }
}

// ── Manager ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootState {
    Idle,
    /// Scheduled with the OS and still abortable.
    Pending { delay_secs: u32 },
}

pub struct RebootManager {
    backend: Arc<dyn RebootBackend>,
    window: TimeoutWindow,
    sink: EventSink,
    delay_secs: u32,
    message: String,
    state: Mutex<RebootState>,
}

impl RebootManager {
    pub fn new(backend: Arc<dyn RebootBackend>, window: TimeoutWindow, sink: EventSink) -> Self {
        Self {
            backend,
            window,
            sink,
            delay_secs: DEFAULT_REBOOT_DELAY_SECS,
            message: DEFAULT_REBOOT_MESSAGE.to_string(),
            state: Mutex::new(RebootState::Idle),
        }
    }

    pub fn with_schedule(mut self, delay_secs: u32, message: impl Into<String>) -> Self {
        self.delay_secs = delay_secs;
        self.message = message.into();
        self
    }

    pub fn state(&self) -> RebootState {
        *self.state.lock().unwrap()
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state(), RebootState::Pending { .. })
    }

    /// Final escalation step. In test mode only a description is published
    /// and the caller is expected to reset the window.
    pub fn handle_timeout(
        &self,
        test_mode: bool,
        trigger: Option<NaiveDateTime>,
        timeout_secs: u64,
    ) -> Result<(), RebootError> {
        if test_mode {
            self.sink
                .activity("TEST MODE: Reboot would be triggered now.");
            let trigger = trigger
                .map(|t| t.format(ACTIVITY_TIME_FORMAT).to_string())
                .unwrap_or_else(|| "unknown".into());
            self.sink.emit(WatchdogEvent::RebootSimulated(format!(
                "TIMEOUT OCCURRED! Trigger time: {}, timeout: {} seconds. \
                 In production mode, the system would reboot now.",
                trigger, timeout_secs
            )));
            return Ok(());
        }

        self.sink.activity(format!(
            "Initiating system reboot in {} seconds...",
            self.delay_secs
        ));
        self.initiate_reboot()
    }

    pub fn initiate_reboot(&self) -> Result<(), RebootError> {
        if let RebootState::Pending { delay_secs } = self.state() {
            info!(delay_secs, "Reboot already pending");
            return Ok(());
        }

        match self.backend.schedule(self.delay_secs, &self.message) {
            Ok(()) => {
                *self.state.lock().unwrap() = RebootState::Pending {
                    delay_secs: self.delay_secs,
                };
                self.sink.activity(format!(
                    "System reboot scheduled in {} seconds. Abort to cancel.",
                    self.delay_secs
                ));
                self.sink.emit(WatchdogEvent::RebootPending {
                    delay_secs: self.delay_secs,
                });
                Ok(())
            }
            Err(e) => {
                self.sink
                    .activity(format!("Failed to initiate reboot: {}", e));
                let alert = if self.backend.has_elevated_privileges() {
                    format!("Failed to initiate reboot: {}", e)
                } else {
                    self.sink
                        .activity("Note: Administrator privileges are required.");
                    format!(
                        "Failed to initiate reboot: {}. {}",
                        e, "This application requires administrator privileges."
                    )
                };
                self.sink.emit(WatchdogEvent::OperatorAlert(alert));
                Err(e)
            }
        }
    }

    /// Cancel a pending reboot. Failure leaves the state untouched.
    pub fn abort_reboot(&self) -> Result<(), RebootError> {
        match self.backend.abort() {
            Ok(()) => {
                *self.state.lock().unwrap() = RebootState::Idle;
                self.sink.activity("Shutdown aborted by user.");
                self.sink.emit(WatchdogEvent::RebootAborted);
                self.window.reset();
                Ok(())
            }
            Err(e) => {
                self.sink
                    .activity(format!("Failed to abort shutdown: {}", e));
                self.sink.emit(WatchdogEvent::OperatorAlert(format!(
                    "Failed to abort shutdown: {}",
                    e
                )));
                Err(e)
            }
        }
    }
}
