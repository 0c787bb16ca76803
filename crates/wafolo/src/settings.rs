/// Configuration file handling.
///
/// `.json` files go through serde_json, everything else is TOML. A missing
/// file is replaced by the sample configuration so a first run leaves an
/// editable file behind.

use std::path::Path;

use anyhow::Context;
use tracing::info;

use wafolo_engine::config::WatchdogConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Toml,
    Json,
}

impl FileFormat {
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => FileFormat::Json,
            _ => FileFormat::Toml,
        }
    }
}

pub fn load(path: &Path) -> anyhow::Result<WatchdogConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config = match FileFormat::for_path(path) {
        FileFormat::Json => serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?,
        FileFormat::Toml => {
            toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
    };
    Ok(config)
}

pub fn save(path: &Path, config: &WatchdogConfig) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let text = match FileFormat::for_path(path) {
        FileFormat::Json => serde_json::to_string_pretty(config)?,
        FileFormat::Toml => toml::to_string_pretty(config)?,
    };
    std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Load `path`, writing the sample configuration there first if it does not
/// exist. The flag reports whether the file was created.
pub fn load_or_create(path: &Path) -> anyhow::Result<(WatchdogConfig, bool)> {
    if path.exists() {
        return Ok((load(path)?, false));
    }
    let config = WatchdogConfig::sample();
    save(path, &config)?;
    info!(path = %path.display(), "Wrote default configuration");
    Ok((config, true))
}

/// Human-readable summary of the effective configuration.
pub fn describe(config: &WatchdogConfig) -> Vec<String> {
    let or_none = |value: Option<&str>| value.unwrap_or("(none)").to_string();
    let mut lines = vec![
        format!("Log file: {}", config.log_file_path.display()),
        format!("Trigger pattern: {}", config.trigger_line_pattern),
        format!("Expected pattern: {}", config.expected_line_pattern),
        format!("Timeout: {} seconds", config.timeout_seconds),
        format!(
            "Mode: {}",
            if config.test_mode { "TEST (no reboot)" } else { "PRODUCTION" }
        ),
        format!("Timestamp format: {}", config.log_timestamp_format),
        format!("Monitored process: {}", or_none(config.monitored_process())),
        format!("Wait for process: {}", config.wait_for_monitored_process),
    ];
    if config.restart_process_on_timeout {
        lines.push(format!(
            "Restart on timeout: up to {} attempt(s), command {}, stabilize {}s",
            config.max_restart_attempts,
            or_none(config.restart_command()),
            config.restart_process_delay_seconds
        ));
    }
    if config.auto_close_on_success {
        lines.push(format!(
            "Auto-close on success after {} seconds",
            config.auto_close_delay_seconds
        ));
    }
    lines.push(format!(
        "Reboot delay: {} seconds ({})",
        config.reboot_delay_seconds, config.reboot_message
    ));
    lines
}
