/// Watchdog configuration record.
///
/// Loaded and persisted by the daemon; the engine only ever reads it. Every
/// field has a default so partially written files still load, and
/// `validate()` is the single place ConfigurationFailure is decided.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{DEFAULT_REBOOT_DELAY_SECS, DEFAULT_REBOOT_MESSAGE};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default)]
    pub log_file_path: PathBuf,
    #[serde(default)]
    pub trigger_line_pattern: String,
    #[serde(default)]
    pub expected_line_pattern: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default)]
    pub show_configuration_on_startup: bool,
    #[serde(default = "default_timestamp_format")]
    pub log_timestamp_format: String,
    /// Only "start" is understood; kept so existing files round-trip.
    #[serde(default = "default_timestamp_position")]
    pub log_timestamp_position: String,
    /// Empty means no monitored process.
    #[serde(default)]
    pub monitored_process_name: String,
    #[serde(default)]
    pub wait_for_monitored_process: bool,
    #[serde(default = "default_process_check_interval")]
    pub process_check_interval_seconds: u64,
    #[serde(default)]
    pub auto_close_on_success: bool,
    #[serde(default = "default_auto_close_delay")]
    pub auto_close_delay_seconds: u32,
    /// Try restarting the monitored process before rebooting.
    #[serde(default)]
    pub restart_process_on_timeout: bool,
    /// Stabilization wait after the restart command before re-probing.
    #[serde(default = "default_restart_delay")]
    pub restart_process_delay_seconds: u64,
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
    #[serde(default)]
    pub process_restart_command: Option<String>,
    #[serde(default = "default_reboot_delay")]
    pub reboot_delay_seconds: u32,
    #[serde(default = "default_reboot_message")]
    pub reboot_message: String,
}

fn default_timeout_seconds() -> u64 { 30 }
fn default_timestamp_format() -> String { "yyyy-MM-dd HH:mm:ss".to_string() }
fn default_timestamp_position() -> String { "start".to_string() }
fn default_process_check_interval() -> u64 { 5 }
fn default_auto_close_delay() -> u32 { 10 }
fn default_restart_delay() -> u64 { 15 }
fn default_max_restart_attempts() -> u32 { 1 }
fn default_reboot_delay() -> u32 { DEFAULT_REBOOT_DELAY_SECS }
fn default_reboot_message() -> String { DEFAULT_REBOOT_MESSAGE.to_string() }

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("log file path is not configured")]
    MissingLogPath,
    #[error("trigger line pattern is not configured")]
    MissingTriggerPattern,
    #[error("expected line pattern is not configured")]
    MissingExpectedPattern,
    #[error("timeout_seconds must be greater than zero")]
    ZeroTimeout,
    #[error("process_check_interval_seconds must be greater than zero")]
    ZeroProcessCheckInterval,
    #[error("unsupported log_timestamp_position {0:?} (only \"start\" is supported)")]
    UnsupportedTimestampPosition(String),
}

impl WatchdogConfig {
    /// The configuration written when no file exists yet.
    pub fn sample() -> Self {
        #[cfg(target_os = "windows")]
        let (log_file_path, restart_command) = (
            PathBuf::from(r"C:\logs\application.log"),
            r"C:\Path\To\YourApplication.exe",
        );
        #[cfg(not(target_os = "windows"))]
        let (log_file_path, restart_command) = (
            PathBuf::from("/var/log/application.log"),
            "/usr/local/bin/your-application",
        );

        Self {
            log_file_path,
            trigger_line_pattern: "Starting critical operation".to_string(),
            expected_line_pattern: "Operation completed successfully".to_string(),
            timeout_seconds: default_timeout_seconds(),
            test_mode: true,
            show_configuration_on_startup: false,
            log_timestamp_format: default_timestamp_format(),
            log_timestamp_position: default_timestamp_position(),
            monitored_process_name: "YourApplication".to_string(),
            wait_for_monitored_process: false,
            process_check_interval_seconds: default_process_check_interval(),
            auto_close_on_success: false,
            auto_close_delay_seconds: default_auto_close_delay(),
            restart_process_on_timeout: false,
            restart_process_delay_seconds: default_restart_delay(),
            max_restart_attempts: default_max_restart_attempts(),
            process_restart_command: Some(restart_command.to_string()),
            reboot_delay_seconds: default_reboot_delay(),
            reboot_message: default_reboot_message(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_file_path.as_os_str().is_empty()
            || self.log_file_path.to_string_lossy().trim().is_empty()
        {
            return Err(ConfigError::MissingLogPath);
        }
        if self.trigger_line_pattern.trim().is_empty() {
            return Err(ConfigError::MissingTriggerPattern);
        }
        if self.expected_line_pattern.trim().is_empty() {
            return Err(ConfigError::MissingExpectedPattern);
        }
        if self.timeout_seconds == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.process_check_interval_seconds == 0 {
            return Err(ConfigError::ZeroProcessCheckInterval);
        }
        let position = self.log_timestamp_position.trim();
        if !position.is_empty() && !position.eq_ignore_ascii_case("start") {
            return Err(ConfigError::UnsupportedTimestampPosition(position.to_string()));
        }
        Ok(())
    }

    /// The monitored process name, if one is configured.
    pub fn monitored_process(&self) -> Option<&str> {
        let name = self.monitored_process_name.trim();
        (!name.is_empty()).then_some(name)
    }

    /// The restart command, if one is configured.
    pub fn restart_command(&self) -> Option<&str> {
        self.process_restart_command
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn process_check_interval(&self) -> Duration {
        Duration::from_secs(self.process_check_interval_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_is_valid() {
        assert_eq!(WatchdogConfig::sample().validate(), Ok(()));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: WatchdogConfig = toml::from_str(
            r#"
            log_file_path = "/tmp/app.log"
            trigger_line_pattern = "begin"
            expected_line_pattern = "done"
            "#,
        )
        .unwrap();

        assert_eq!(config.timeout_seconds, 30);
        assert_eq!(config.process_check_interval_seconds, 5);
        assert_eq!(config.max_restart_attempts, 1);
        assert_eq!(config.restart_process_delay_seconds, 15);
        assert_eq!(config.reboot_delay_seconds, 30);
        assert_eq!(config.log_timestamp_format, "yyyy-MM-dd HH:mm:ss");
        assert!(config.monitored_process().is_none());
        assert!(config.restart_command().is_none());
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn empty_log_path_is_fatal() {
        let config: WatchdogConfig = serde_json::from_str(
            r#"{ "trigger_line_pattern": "a", "expected_line_pattern": "b" }"#,
        )
        .unwrap();
        assert_eq!(config.validate(), Err(ConfigError::MissingLogPath));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut config = WatchdogConfig::sample();
        config.timeout_seconds = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroTimeout));
    }

    #[test]
    fn blank_restart_command_counts_as_none() {
        let mut config = WatchdogConfig::sample();
        config.process_restart_command = Some("   ".into());
        assert!(config.restart_command().is_none());
    }

    #[test]
    fn unknown_timestamp_position_is_rejected() {
        let mut config = WatchdogConfig::sample();
        config.log_timestamp_position = "end".into();
        assert_eq!(
            config.validate(),
            Err(ConfigError::UnsupportedTimestampPosition("end".into()))
        );
    }
}
