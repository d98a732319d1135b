//! Command-line interface for recdeck.
//!
//! Provides commands for running the scheduler, managing jobs and templates, reviewing
//! what happened to each occurrence, and making manual captures.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::capture::devices::pick_device;
use crate::capture::{CaptureKind, SessionOutcome, TaskState};
use crate::config::{self, CaptureSettings, ConfigSource, ResolvedConfig, StoreConfigSource};
use crate::core::{next_occurrence, Control, Decision, Driver, DriverSettings, Host, Recorder, Store};
use crate::domain::{InstanceStatus, JobStatus};
use crate::error::format_bytes;

pub mod job;
pub mod template;

/// recdeck - Unattended audio/video capture scheduler
#[derive(Parser, Debug)]
#[command(name = "recdeck")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the scheduler until interrupted
    Run,

    /// Manage capture jobs
    Job {
        #[command(subcommand)]
        command: job::JobCommands,
    },

    /// Manage job templates
    Template {
        #[command(subcommand)]
        command: template::TemplateCommands,
    },

    /// List occurrences in a date range and what happened to them
    Occurrences {
        /// First date (YYYY-MM-DD), defaults to today
        #[arg(long)]
        from: Option<NaiveDate>,

        /// Last date (YYYY-MM-DD), defaults to two weeks after --from
        #[arg(long)]
        to: Option<NaiveDate>,
    },

    /// Record now, in the foreground (Ctrl-C stops early)
    Capture {
        /// Which lanes to record
        #[arg(short, long, value_enum, default_value = "audio")]
        kind: KindArg,

        /// Capture length ("90m", "1h30m", "5400")
        #[arg(short, long)]
        duration: String,

        /// Allow durations beyond the standard limit
        #[arg(long)]
        allow_override: bool,
    },

    /// List capture devices and the automatic choice
    Devices,

    /// Show jobs due next, recordings in progress and free space
    Status,

    /// Show or change settings
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

/// Capture lanes for CLI (maps to CaptureKind)
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
    /// Dual-mono audio only
    Audio,

    /// Camera stream only
    Video,

    /// Audio and video together
    Both,
}

impl From<KindArg> for CaptureKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Audio => CaptureKind::Audio,
            KindArg::Video => CaptureKind::Video,
            KindArg::Both => CaptureKind::Both,
        }
    }
}

/// Settings stored in the database and re-read on every scheduler tick
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show resolved configuration (default)
    Show,

    /// List stored settings
    List,

    /// Print one stored setting
    Get { key: String },

    /// Store a setting
    Set { key: String, value: String },

    /// Remove a stored setting
    Unset { key: String },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = config::config()?;
        let control = open_control(cfg)?;

        match self.command {
            Commands::Run => run_scheduler(control, cfg).await,
            Commands::Job { command } => job::execute(&control, command).await,
            Commands::Template { command } => template::execute(&control, command),
            Commands::Occurrences { from, to } => list_occurrences(&control, from, to),
            Commands::Capture {
                kind,
                duration,
                allow_override,
            } => {
                let secs = job::parse_duration(&duration)?;
                capture(&control, kind.into(), secs, allow_override).await
            }
            Commands::Devices => list_devices(&control).await,
            Commands::Status => show_status(&control),
            Commands::Config { command } => {
                execute_config(&control, cfg, command.unwrap_or(ConfigCommands::Show))
            }
        }
    }
}

/// Wire the store, settings source and host adapters together
fn open_control(cfg: &ResolvedConfig) -> Result<Control> {
    let store = Arc::new(
        Store::open(&cfg.database)
            .with_context(|| format!("Failed to open database: {}", cfg.database.display()))?,
    );
    let settings: Arc<dyn ConfigSource> = Arc::new(StoreConfigSource::new(
        store.clone(),
        CaptureSettings::from_config(cfg),
    ));
    let host = Host::system(&cfg.capture.ffmpeg_path);
    Ok(Control::new(Recorder::assemble(store, settings, host, cfg)))
}

/// Run the driver until Ctrl-C
async fn run_scheduler(control: Control, cfg: &ResolvedConfig) -> Result<()> {
    let driver = Driver::new(control.recorder().clone(), DriverSettings::from(&cfg.driver));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, stopping"),
            Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    info!(database = %cfg.database.display(), "Scheduler starting");
    driver.run(shutdown_rx).await
}

fn list_occurrences(control: &Control, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Result<()> {
    let from = from.unwrap_or_else(|| Local::now().date_naive());
    let to = to.unwrap_or(from + chrono::Duration::days(13));
    let views = control.list_occurrences(from, to)?;

    if views.is_empty() {
        println!("No occurrences between {} and {}", from, to);
        return Ok(());
    }

    println!(
        "{:<17} {:<24} {:<10} {:<9} {}",
        "START", "JOB", "STATUS", "SOURCE", "NOTES"
    );
    println!("{}", "-".repeat(90));
    for view in views {
        println!(
            "{:<17} {:<24} {:<10} {:<9} {}",
            view.start.format("%Y-%m-%d %H:%M"),
            view.job_name,
            view.status,
            view.provenance.map(|p| p.as_str()).unwrap_or("-"),
            view.notes
        );
    }
    Ok(())
}

/// Foreground manual capture
async fn capture(control: &Control, kind: CaptureKind, duration_secs: u64, allow_override: bool) -> Result<()> {
    let capture = match control
        .start_manual_capture(kind, duration_secs, allow_override)
        .await?
    {
        Decision::Started(capture) => capture,
        Decision::Rejected(reason) => anyhow::bail!("Capture rejected: {}", reason),
    };

    for (lane, reason) in &capture.failures {
        eprintln!("[{} did not start: {}]", lane, reason);
    }
    for session in &capture.sessions {
        eprintln!(
            "[Recording {} for {}s]",
            session.info.lane,
            session.info.duration.as_secs()
        );
        for output in &session.info.outputs {
            eprintln!("  -> {}", output.display());
        }
    }

    let sessions = capture.sessions;
    let waiting = async move {
        let mut outcomes = Vec::with_capacity(sessions.len());
        for session in sessions {
            outcomes.push(session.wait().await);
        }
        outcomes
    };
    tokio::pin!(waiting);

    let outcomes: Vec<SessionOutcome> = tokio::select! {
        outcomes = &mut waiting => outcomes,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\n[Stopping...]");
            control.stop_capture(kind).await;
            waiting.await
        }
    };

    let mut failed = false;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(files) => eprintln!(
                "[{} finished ({}), {} file(s)]",
                outcome.lane,
                outcome.ended_by,
                files.len()
            ),
            Err(e) => {
                failed = true;
                eprintln!("[{} failed ({}): {}]", outcome.lane, outcome.ended_by, e);
            }
        }
    }

    // Keep the process alive until the handed-off transcode ends
    if let Some(task) = control.get_status().video.transcode {
        if !task.state.is_finished() {
            eprintln!("[Transcoding {} ...]", task.source.display());
            let pipeline = control.recorder().pipeline.clone();
            let done = tokio::select! {
                done = pipeline.wait_for(task.id) => done,
                _ = tokio::signal::ctrl_c() => {
                    pipeline.cancel(task.id);
                    pipeline.wait_for(task.id).await
                }
            };
            match done {
                Some(done) if done.state == TaskState::Completed => {
                    eprintln!("[Transcoded -> {}]", done.destination.display())
                }
                Some(done) => {
                    failed = true;
                    eprintln!(
                        "[Transcode {:?}: {}; raw kept at {}]",
                        done.state,
                        done.error.unwrap_or_default(),
                        done.source.display()
                    );
                }
                None => {}
            }
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

async fn list_devices(control: &Control) -> Result<()> {
    let devices = control.list_devices().await?;
    if devices.is_empty() {
        println!("No capture devices found");
        return Ok(());
    }

    let chosen = pick_device(&devices).map(|d| d.device.clone());
    println!("{:<8} {:<10} {:<36} {}", "CARD", "DEVICE", "NAME", "AUTO");
    println!("{}", "-".repeat(60));
    for device in &devices {
        println!(
            "{:<8} {:<10} {:<36} {}",
            device.index,
            device.device,
            device.name,
            if chosen.as_deref() == Some(device.device.as_str()) { "*" } else { "" }
        );
    }
    Ok(())
}

/// What the scheduler will do next and what the store says is running
fn show_status(control: &Control) -> Result<()> {
    let recorder = control.recorder();
    let now = Local::now().naive_local();

    println!("Upcoming:");
    let mut any = false;
    for job in control.list_jobs()? {
        if job.status != JobStatus::Active {
            continue;
        }
        let next = match &job.recurrence {
            Some(pattern) => next_occurrence(pattern, now.max(job.start - chrono::Duration::seconds(1))),
            None => (job.start > now).then_some(job.start),
        };
        if let Some(next) = next {
            any = true;
            println!("  {}  {}", next.format("%Y-%m-%d %H:%M"), job.name);
        }
    }
    if !any {
        println!("  (nothing scheduled)");
    }

    let recording = recorder.ledger.instances_with_status(InstanceStatus::Recording)?;
    println!("\nRecording:");
    if recording.is_empty() {
        println!("  (none)");
    }
    for instance in recording {
        let name = recorder
            .store
            .get_job(instance.job_id)
            .map(|j| j.name)
            .unwrap_or_else(|_| instance.job_id.to_string());
        let since = instance
            .started_at
            .map(|t| t.with_timezone(&Local).format("%H:%M").to_string())
            .unwrap_or_else(|| "?".to_string());
        println!("  {} since {}", name, since);
    }

    let settings = recorder.config.capture_settings()?;
    let limits = recorder.admission.limits();
    println!("\nStorage:");
    for (label, path) in [("audio", &settings.audio_dir), ("video", &settings.video_dir)] {
        match recorder.host.volumes.free_bytes(path) {
            Ok(free) => {
                let extra = if label == "video" {
                    format!(" (~{:.1} h of video)", limits.video_hours_for(free))
                } else {
                    String::new()
                };
                println!("  {:<6} {}  {} free{}", label, path.display(), format_bytes(free), extra);
            }
            Err(e) => println!("  {:<6} {}  unavailable: {:#}", label, path.display(), e),
        }
    }
    Ok(())
}

fn execute_config(control: &Control, cfg: &ResolvedConfig, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => show_config(control, cfg),
        ConfigCommands::List => {
            let settings = control.list_settings()?;
            if settings.is_empty() {
                println!("No stored settings");
            }
            for (key, value) in settings {
                println!("{} = {}", key, mask(&key, &value));
            }
            Ok(())
        }
        ConfigCommands::Get { key } => {
            match control.get_setting(&key)? {
                Some(value) => println!("{}", value),
                None => anyhow::bail!("Setting '{}' is not set", key),
            }
            Ok(())
        }
        ConfigCommands::Set { key, value } => {
            if !config::keys::ALL.contains(&key.as_str()) {
                warn!(key = %key, "Not a setting recdeck reads");
            }
            control.set_setting(&key, &value)?;
            println!("{} = {}", key, mask(&key, &value));
            Ok(())
        }
        ConfigCommands::Unset { key } => {
            if control.unset_setting(&key)? {
                println!("Removed {}", key);
            } else {
                println!("{} was not set", key);
            }
            Ok(())
        }
    }
}

fn show_config(control: &Control, cfg: &ResolvedConfig) -> Result<()> {
    let settings = control.recorder().config.capture_settings()?;

    println!("recdeck configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:     {}", cfg.home.display());
    println!("  Database: {}", cfg.database.display());
    println!("  Audio:    {}", settings.audio_dir.display());
    println!("  Video:    {}", settings.video_dir.display());
    println!();
    println!("Capture:");
    println!("  Device:        {} (fallback {})", settings.audio_device, settings.fallback_device);
    println!(
        "  Channels:      {} / {}",
        settings.channel_suffixes.0, settings.channel_suffixes.1
    );
    println!(
        "  Camera stream: {}",
        settings
            .stream_url
            .as_deref()
            .map(redact_url)
            .unwrap_or_else(|| "(not configured)".to_string())
    );
    println!("  Require mount: {}", settings.require_mount);
    println!();
    println!("Limits:");
    println!("  Max duration:  {}s", cfg.limits.max_duration_secs);
    println!("  Ceiling:       {}s", cfg.limits.ceiling_secs);
    println!("  Space factor:  {}x", cfg.limits.space_multiplier);
    println!();
    println!("Transcode:");
    println!(
        "  Encoder: {} (fallback {}) at {}",
        cfg.transcode.hardware_encoder, cfg.transcode.software_encoder, cfg.transcode.bitrate
    );
    Ok(())
}

fn mask(key: &str, value: &str) -> String {
    if key == config::keys::CAMERA_PASSWORD {
        "********".to_string()
    } else {
        value.to_string()
    }
}

/// Hide credentials in an RTSP URL
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}***{}", &url[..scheme + 3], &url[at..])
        }
        _ => url.to_string(),
    }
}
