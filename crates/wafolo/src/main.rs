// WaFoLo log watchdog daemon.
//
// Watches a log file for a trigger line and expects a follow-up line within a
// timeout. On timeout the monitored process is restarted and, failing that,
// the machine is rebooted (or, in test mode, the reboot is only described).
//
// Architecture:
//   - Session task: the engine's WatchdogSession, owning tailer, timeout
//     window and escalation
//   - Main task: prints session events and turns Ctrl+C into commands
//     (abort a pending reboot first, shut down otherwise)
//   - Activity messages are appended to logs/wafolo_<timestamp>.log

mod settings;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use wafolo_engine::events::WatchdogEvent;
use wafolo_engine::reboot::{has_elevated_privileges, ChainedReboot, RebootBackend};
use wafolo_engine::session::{SessionCommand, SessionDeps, WatchdogSession};

pub const GIT_HASH: &str = env!("WAFOLO_GIT_HASH");
pub const GIT_BRANCH: &str = env!("WAFOLO_GIT_BRANCH");

const ACTIVITY_TARGET: &str = "wafolo::activity";

#[derive(Parser, Debug)]
#[command(name = "wafolo", about = "Log watchdog: trigger, expect, restart or reboot")]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file (.toml or .json)
    #[arg(short, long, default_value = "config/wafolo.toml", global = true)]
    config: PathBuf,

    /// Directory for activity log files (default: logs/ next to the executable)
    #[arg(long, env = "WAFOLO_LOG_DIR", global = true)]
    log_dir: Option<PathBuf>,

    /// Never reboot, only describe what would happen
    #[arg(long, global = true)]
    test_mode: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// Monitor the configured log file (default)
    Run,
    /// Cancel a pending system reboot
    Abort,
    /// Validate the configuration file and print it
    CheckConfig,
    /// Write the sample configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn version_string() -> String {
    format!("{} ({}@{})", env!("CARGO_PKG_VERSION"), GIT_HASH, GIT_BRANCH)
}

fn default_log_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.join("logs")))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

/// Console gets everything the filter allows; the activity file gets only
/// the operator-facing activity stream.
fn init_logging(log_dir: &Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::filter::Targets;
    use tracing_subscriber::fmt::time::ChronoLocal;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, Layer};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(filter);

    let (file_layer, guard) = match std::fs::create_dir_all(log_dir) {
        Ok(()) => {
            let name = format!("wafolo_{}.log", chrono::Local::now().format("%Y%m%d_%H%M%S"));
            let appender = tracing_appender::rolling::never(log_dir, name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .with_level(false)
                .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
                .with_filter(Targets::new().with_target(ACTIVITY_TARGET, tracing::Level::INFO));
            (Some(layer), Some(guard))
        }
        Err(e) => {
            eprintln!(
                "Warning: could not create log directory {} ({}), activity file disabled",
                log_dir.display(),
                e
            );
            (None, None)
        }
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let log_dir = args.log_dir.clone().unwrap_or_else(default_log_dir);
    let _log_guard = init_logging(&log_dir);

    match args.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&args).await,
        Commands::Abort => abort(),
        Commands::CheckConfig => check_config(&args.config),
        Commands::InitConfig { force } => init_config(&args.config, force),
    }
}

async fn run(args: &Args) -> anyhow::Result<()> {
    info!(target: ACTIVITY_TARGET, "WaFoLo {} starting", version_string());

    let (mut config, created) = settings::load_or_create(&args.config)?;
    if created {
        info!(target: ACTIVITY_TARGET,
            "Created default configuration at {}. Edit it and restart.",
            args.config.display()
        );
    }
    if args.test_mode {
        config.test_mode = true;
    }
    if let Err(e) = config.validate() {
        error!("Invalid configuration in {}: {}", args.config.display(), e);
        return Err(e.into());
    }

    if config.show_configuration_on_startup {
        for line in settings::describe(&config) {
            info!(target: ACTIVITY_TARGET, "{}", line);
        }
    }
    if !config.test_mode && !has_elevated_privileges() {
        warn!("Not running with administrator privileges; a reboot will likely fail");
    }

    let session = WatchdogSession::new(config, SessionDeps::system())?;
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut session_task = tokio::spawn(session.run(command_rx, event_tx));
    let mut reboot_pending = false;
    let mut abort_sent = false;

    loop {
        tokio::select! {
            result = &mut session_task => {
                result??;
                break;
            }
            Some(event) = event_rx.recv() => {
                match event {
                    WatchdogEvent::RebootPending { .. } => reboot_pending = true,
                    WatchdogEvent::RebootAborted => {
                        reboot_pending = false;
                        abort_sent = false;
                    }
                    _ => {}
                }
                report(&event);
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                let command = ctrl_c_command(reboot_pending, abort_sent);
                match command {
                    SessionCommand::AbortReboot => {
                        info!("Ctrl+C: aborting pending reboot (press again to exit)");
                        abort_sent = true;
                    }
                    SessionCommand::Shutdown => info!("Shutting down..."),
                }
                if command_tx.send(command).is_err() {
                    break;
                }
            }
        }
    }

    while let Ok(event) = event_rx.try_recv() {
        report(&event);
    }
    info!(target: ACTIVITY_TARGET, "WaFoLo stopped");
    Ok(())
}

/// The first Ctrl+C during a pending reboot aborts it. A second press before
/// the abort is confirmed shuts down.
fn ctrl_c_command(reboot_pending: bool, abort_sent: bool) -> SessionCommand {
    if reboot_pending && !abort_sent {
        SessionCommand::AbortReboot
    } else {
        SessionCommand::Shutdown
    }
}

/// Console rendering of session events. Activity lines are already logged
/// by the engine.
fn report(event: &WatchdogEvent) {
    match event {
        WatchdogEvent::Activity(_) | WatchdogEvent::NewLine(_) => {}
        WatchdogEvent::Status { status, text } => info!(?status, "{}", text),
        WatchdogEvent::TriggerDetected { at, .. } => {
            info!(trigger = %at, "Timeout window started")
        }
        WatchdogEvent::TimeoutProgress(p) => debug!(
            percentage = format_args!("{:.1}", p.percentage),
            remaining = format_args!("{:.1}s", p.remaining_secs),
            "Timeout progress"
        ),
        WatchdogEvent::RebootPending { delay_secs } => warn!(
            "System reboot pending in {} seconds. Press Ctrl+C or run `wafolo abort` to cancel.",
            delay_secs
        ),
        WatchdogEvent::RebootSimulated(text) => warn!("{}", text),
        WatchdogEvent::OperatorAlert(text) => error!("{}", text),
        WatchdogEvent::AutoCloseCountdown(remaining) => {
            info!("Closing in {} second(s)", remaining)
        }
        other => debug!(event = ?other, "Session event"),
    }
}

fn abort() -> anyhow::Result<()> {
    let backend = ChainedReboot::platform();
    match backend.abort() {
        Ok(()) => {
            info!(target: ACTIVITY_TARGET, "Shutdown aborted by user.");
            Ok(())
        }
        Err(e) => {
            error!("Failed to abort shutdown: {}", e);
            if !backend.has_elevated_privileges() {
                error!("Administrator privileges are required.");
            }
            Err(e.into())
        }
    }
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = settings::load(path)?;
    config.validate()?;
    println!("{} is valid", path.display());
    for line in settings::describe(&config) {
        println!("  {}", line);
    }
    Ok(())
}

fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    settings::save(path, &wafolo_engine::config::WatchdogConfig::sample())?;
    println!("Wrote sample configuration to {}", path.display());
    Ok(())
}
