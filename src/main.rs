use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use intention_monitor::analysis::{FeedbackKind, HttpInferenceClient};
use intention_monitor::config::{MonitorConfig, ensure_sample_config};
use intention_monitor::engine::{ControlCommand, Monitor, MonitorEvent};
use intention_monitor::logging::{MONITOR_PREFIX, enable_logging};
use intention_monitor::paths::{
    CONFIG_FILE, clarification_dir, default_data_dir, screenshots_root,
};
use intention_monitor::permissions::{Permission, missing_permissions};
use intention_monitor::screenshot::MacOsCaptureProvider;
use intention_monitor::session::Session;
use intention_monitor::storage::{StorageQuotaManager, bytes_to_gb, bytes_to_mb};
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::level_filters::LevelFilter;

#[derive(Debug, Parser)]
#[command(name = "intention-monitor")]
#[command(about = "Watch the screen during a focus session and nudge you back to your task")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a monitoring session.
    Run(RunArgs),
    /// Print capture storage usage against the configured limit.
    Usage,
    /// Evict the oldest captures down to a target size.
    Prune(PruneArgs),
    /// Print the status of the macOS permissions the monitor needs.
    Permissions,
}

#[derive(Debug, Args, Clone)]
struct CommonArgs {
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Defaults to `<data-dir>/config.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    log_level: Option<LevelFilter>,

    /// Mirror log lines to stdout in addition to the log file.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    log_stdout: bool,
}

#[derive(Debug, Args, Clone)]
struct RunArgs {
    #[arg(long)]
    task: Option<String>,

    #[arg(long = "for", value_parser = parse_duration)]
    run_for: Option<Duration>,

    #[arg(long, action = ArgAction::SetTrue)]
    interactive: bool,

    #[arg(long, action = ArgAction::SetTrue)]
    open_settings: bool,
}

#[derive(Debug, Args, Clone)]
struct PruneArgs {
    /// Defaults to the configured eviction target.
    #[arg(long)]
    target_bytes: Option<u64>,
}

fn parse_duration(value: &str) -> std::result::Result<Duration, String> {
    humantime::parse_duration(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let data_dir = cli.common.data_dir.clone().unwrap_or_else(default_data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;
    enable_logging(
        MONITOR_PREFIX,
        &data_dir,
        cli.common.log_level,
        cli.common.log_stdout,
    )?;

    let config_path = cli
        .common
        .config
        .clone()
        .unwrap_or_else(|| data_dir.join(CONFIG_FILE));
    ensure_sample_config(&config_path)?;
    let config = MonitorConfig::load(&config_path)?;

    match cli.command {
        Commands::Run(args) => run_session(config, data_dir, args).await,
        Commands::Usage => print_usage(&config, &data_dir),
        Commands::Prune(args) => prune(&config, &data_dir, args),
        Commands::Permissions => {
            for permission in Permission::ALL {
                println!("{permission}: {:?}", permission.status());
            }
            Ok(())
        }
    }
}

async fn run_session(config: MonitorConfig, data_dir: PathBuf, args: RunArgs) -> Result<()> {
    ensure_permissions(args.open_settings)?;

    let root = screenshots_root(&data_dir);
    let session = Session::start(&config, &root, args.task, chrono::Local::now())
        .with_clarification(&clarification_dir(&data_dir));
    let client = HttpInferenceClient::new(
        config.endpoint.clone(),
        config.analysis.request_timeout,
        config.analysis.feedback_timeout,
    )
    .context("failed to initialize inference client")?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let monitor = Monitor::new(
        config,
        session,
        &root,
        Arc::new(MacOsCaptureProvider),
        Arc::new(client),
    )
    .with_events(event_tx);

    let event_handle = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            print_event(event);
        }
    });

    let (command_tx, command_rx) = if args.interactive {
        let (tx, rx) = mpsc::unbounded_channel();
        let tx_clone = tx.clone();
        tokio::task::spawn_blocking(move || {
            eprintln!("interactive controls: pause | resume | stop | good <id> | bad <id>");
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                let command = match parse_command(&line) {
                    Ok(command) => command,
                    Err(message) => {
                        eprintln!("{message}");
                        None
                    }
                };

                if let Some(command) = command
                    && tx_clone.send(command).is_err()
                {
                    break;
                }
            }
        });
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };

    let summary = monitor.run(args.run_for, command_rx).await?;

    if let Some(tx) = command_tx {
        drop(tx);
    }

    event_handle.await.context("event task failed")?;

    if summary.capture_failures > 0 || summary.analysis_failures > 0 {
        eprintln!(
            "completed with {} capture failures and {} analysis failures",
            summary.capture_failures, summary.analysis_failures
        );
    }

    Ok(())
}

fn parse_command(line: &str) -> std::result::Result<Option<ControlCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let command = match verb.to_ascii_lowercase().as_str() {
        "pause" => ControlCommand::Pause,
        "resume" => ControlCommand::Resume,
        "stop" | "quit" | "exit" => ControlCommand::Stop,
        verb @ ("good" | "bad") => {
            let id = words
                .next()
                .ok_or_else(|| format!("usage: {verb} <notification id>"))?
                .parse()?;
            let kind = if verb == "good" {
                FeedbackKind::Good
            } else {
                FeedbackKind::Bad
            };
            ControlCommand::Feedback { id, kind }
        }
        _ => return Err("unknown command. use: pause | resume | stop | good <id> | bad <id>".into()),
    };
    Ok(Some(command))
}

fn print_event(event: MonitorEvent) {
    match event {
        MonitorEvent::Started {
            session_id,
            task,
            capture_dir,
        } => println!(
            "session {session_id} started for \"{task}\" (captures in {})",
            capture_dir.display()
        ),
        MonitorEvent::Paused => println!("session paused"),
        MonitorEvent::Resumed => println!("session resumed"),
        MonitorEvent::CaptureSaved { path } => println!("capture saved: {}", path.display()),
        MonitorEvent::CaptureSkipped { reason } => println!("capture skipped: {reason}"),
        MonitorEvent::CaptureFailed { message } => eprintln!("capture failed: {message}"),
        MonitorEvent::StorageEvicted {
            deleted_files,
            freed_bytes,
            remaining_bytes,
        } => println!(
            "evicted {deleted_files} captures ({:.1} MB freed, {:.2} GB remaining)",
            bytes_to_mb(freed_bytes),
            bytes_to_gb(remaining_bytes)
        ),
        MonitorEvent::AnalysisDispatched {
            worker,
            image_num,
            app_change,
        } => println!(
            "{worker} analyzing image #{image_num}{}",
            if app_change { " (app changed)" } else { "" }
        ),
        MonitorEvent::AnalysisFailed { worker, message } => {
            eprintln!("{worker} failed: {message}")
        }
        MonitorEvent::StateUpdated {
            state,
            message,
            score,
        } => println!("[{state}] {message} (score {score:.2})"),
        MonitorEvent::Notified(notification) => {
            let feedback = if notification.feedback_enabled {
                format!("  (rate with: good {0} | bad {0})", notification.id)
            } else {
                String::new()
            };
            println!(
                "NOTIFY {} [{}] {}{feedback}",
                notification.id, notification.judgement, notification.message
            );
        }
        MonitorEvent::FeedbackSubmitted { id, kind } => {
            println!("{} feedback sent for {id}", kind.as_str())
        }
        MonitorEvent::FeedbackLearned { id, intention, rule } => {
            println!("learned from {id}: {intention}; rule: {rule}")
        }
        MonitorEvent::FeedbackIgnored { id } => {
            eprintln!("notification {id} is no longer available for feedback")
        }
        MonitorEvent::Stopped => println!("session stopped"),
        MonitorEvent::Completed(summary) => println!(
            "session completed: {} captures, {} analyses, {} notifications",
            summary.captures, summary.results_applied, summary.notifications
        ),
    }
}

fn ensure_permissions(open_settings: bool) -> Result<()> {
    let missing = missing_permissions();
    for permission in &missing {
        eprintln!("{permission} permission is denied. {}", permission.help_message());
        if open_settings && let Err(err) = permission.open_settings() {
            eprintln!("Unable to open System Settings: {err}");
        }
    }
    if missing.contains(&Permission::ScreenRecording) {
        anyhow::bail!("grant Screen Recording permission and re-run");
    }
    Ok(())
}

fn print_usage(config: &MonitorConfig, data_dir: &std::path::Path) -> Result<()> {
    let quota = StorageQuotaManager::new(
        screenshots_root(data_dir),
        config.capture.quota_check_interval,
    );
    let total = quota
        .total_bytes()
        .with_context(|| format!("failed to scan {}", quota.root().display()))?;
    println!(
        "{}: {:.2} GB of {:.2} GB used",
        quota.root().display(),
        bytes_to_gb(total),
        bytes_to_gb(config.capture.storage_limit_bytes)
    );
    Ok(())
}

fn prune(config: &MonitorConfig, data_dir: &std::path::Path, args: PruneArgs) -> Result<()> {
    let target = args
        .target_bytes
        .unwrap_or(config.capture.eviction_target_bytes);
    let mut quota = StorageQuotaManager::new(
        screenshots_root(data_dir),
        config.capture.quota_check_interval,
    );
    let outcome = quota.evict_to_target(target);
    println!(
        "deleted {} captures ({:.1} MB freed, {:.2} GB remaining)",
        outcome.deleted_files,
        bytes_to_mb(outcome.freed_bytes),
        bytes_to_gb(outcome.remaining_bytes)
    );
    Ok(())
}
