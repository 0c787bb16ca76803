/// Outbound notifications.
///
/// Components never call each other back. Each one is handed an `EventSink`
/// (or, for the tailer, its own channel) and publishes typed payloads; the
/// session owns the receiving end and forwards everything to its caller.
/// Delivery is asynchronous with no ordering guarantee relative to commands
/// issued concurrently by the caller.

use std::path::PathBuf;

use chrono::NaiveDateTime;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitoringStatus {
    Idle,
    WaitingForProcess,
    WaitingForLogFile,
    Active,
    Error,
}

/// Fine-grained countdown state published while a timeout window runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutProgress {
    /// `elapsed / duration * 100`, clamped to `[0, 100]`
    pub percentage: f64,
    /// `max(0, duration - elapsed)` in seconds
    pub remaining_secs: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchdogEvent {
    /// Human-readable activity line for the operator's activity log.
    Activity(String),
    Status {
        status: MonitoringStatus,
        text: String,
    },
    FileCreated(PathBuf),
    FileChanged(PathBuf),
    NewLine(String),
    /// A trigger line armed the timeout window.
    TriggerDetected {
        line: String,
        at: NaiveDateTime,
    },
    /// The expected line arrived (or the historical scan found the
    /// sequence completed).
    SequenceCompleted,
    TimeoutProgress(TimeoutProgress),
    TimeoutExpired,
    /// The window was reset; trigger indicators should clear.
    TriggerReset,
    ProcessDetected(String),
    /// A real reboot is scheduled and can still be aborted.
    RebootPending {
        delay_secs: u32,
    },
    RebootAborted,
    /// Test mode: what would have happened instead of a reboot.
    RebootSimulated(String),
    /// A user-visible failure that is not retried automatically.
    OperatorAlert(String),
    AutoCloseCountdown(u32),
    CloseRequested,
}

/// Cloneable publishing handle shared by the engine components.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<WatchdogEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<WatchdogEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink together with its receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WatchdogEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: WatchdogEvent) {
        // A closed receiver means the session is shutting down.
        let _ = self.tx.send(event);
    }

    pub fn activity(&self, message: impl Into<String>) {
        let message = message.into();
        info!(target: "wafolo::activity", "{}", message);
        self.emit(WatchdogEvent::Activity(message));
    }

    pub fn status(&self, status: MonitoringStatus, text: impl Into<String>) {
        self.emit(WatchdogEvent::Status {
            status,
            text: text.into(),
        });
    }
}
