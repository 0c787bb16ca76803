pub mod auto_close;
pub mod clock;
pub mod config;
pub mod escalation;
pub mod events;
pub mod orchestrator;
pub mod process;
pub mod reboot;
pub mod scanner;
pub mod session;
pub mod tailer;
pub mod timeout;
pub mod timestamp;

/// How often the tailer checks the watched file for creation and growth.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;

/// Timeout window expiry check cadence.
pub const TIMEOUT_CHECK_INTERVAL_MS: u64 = 1000;

/// Timeout window progress report cadence.
pub const TIMEOUT_PROGRESS_INTERVAL_MS: u64 = 100;

/// Delay handed to the OS when scheduling a reboot.
pub const DEFAULT_REBOOT_DELAY_SECS: u32 = 30;

/// Message shown to logged-in users when the reboot is scheduled.
pub const DEFAULT_REBOOT_MESSAGE: &str = "Watchdog timeout - expected log entry not found";

/// Display format used for instants in activity messages.
pub const ACTIVITY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
