//! offsync - capture location samples offline and sync them to an ingest server
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/offsync/samples.db (~/.local/share/offsync/samples.db)
//! - Prefs & credentials: $XDG_DATA_HOME/offsync/prefs/
//! - Logs: $XDG_STATE_HOME/offsync/offsync.log (~/.local/state/offsync/offsync.log)
//! - Config: $XDG_CONFIG_HOME/offsync/config.toml (~/.config/offsync/config.toml)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use offsync_core::credentials::store_credentials;
use offsync_core::prefs::{Preferences, ServerUrlSetting, APP_PREFS_NAMESPACE};
use offsync_core::retention::days_before;
use offsync_core::{
    format_timestamp, Config, EnginePaths, NetworkMonitor, NewSample, SyncEngine, UploadOutcome,
};

/// How often the daemon applies the retention window
const PRUNE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Parser)]
#[command(name = "offsync")]
#[command(about = "Offline-first location sample sync")]
#[command(version)]
struct Args {
    /// Treat the network as unavailable (uploads stay queued)
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show queue and sync state
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Record a location sample
    Capture(CaptureArgs),

    /// Upload pending samples now
    Sync {
        /// Keep uploading until the queue is empty
        #[arg(long)]
        all: bool,
    },

    /// Run in the foreground, syncing in the background until Ctrl-C
    Run,

    /// Delete old samples
    Prune {
        /// Delete samples captured before this RFC 3339 time
        #[arg(long, conflicts_with = "days")]
        before: Option<String>,

        /// Delete samples older than this many days (default: retention.days)
        #[arg(long)]
        days: Option<u32>,
    },

    /// Inspect or change settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Store device credentials issued by the server
    Pair {
        #[arg(long)]
        device_id: String,

        #[arg(long)]
        device_token: String,
    },
}

#[derive(clap::Args)]
struct CaptureArgs {
    /// Latitude in degrees
    #[arg(long, allow_hyphen_values = true)]
    lat: f64,

    /// Longitude in degrees
    #[arg(long, allow_hyphen_values = true)]
    lng: f64,

    /// Horizontal accuracy in meters
    #[arg(long, default_value = "0")]
    accuracy: f64,

    /// Capture time (RFC 3339), defaults to now
    #[arg(long)]
    captured_at: Option<String>,

    /// Location provider (e.g. gps, network)
    #[arg(long)]
    provider: Option<String>,

    /// Battery level, 0-100
    #[arg(long)]
    battery: Option<u8>,

    /// Device was charging
    #[arg(long)]
    charging: bool,

    /// Accuracy mode the fix was taken in
    #[arg(long)]
    accuracy_mode: Option<String>,
}

impl CaptureArgs {
    fn into_sample(self) -> NewSample {
        let captured_at = self
            .captured_at
            .unwrap_or_else(|| format_timestamp(Utc::now()));
        let mut sample = NewSample::new(captured_at, self.lat, self.lng, self.accuracy);
        if let Some(provider) = self.provider {
            sample = sample.with_provider(provider);
        }
        if let Some(pct) = self.battery {
            sample = sample.with_battery(pct, self.charging);
        } else if self.charging {
            sample.is_charging = Some(true);
        }
        if let Some(mode) = self.accuracy_mode {
            sample = sample.with_accuracy_mode(mode);
        }
        sample
    }
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Override the ingest server URL at runtime
    SetUrl { url: String },
    /// Remove the runtime server URL override
    ClearUrl,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let mut config = Config::load().context("failed to load configuration")?;
    if matches!(args.command, Command::Run) {
        config.logging.stderr = true;
    }

    let _log_guard =
        offsync_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!(command = command_name(&args.command), "offsync starting");

    match args.command {
        Command::Config { action } => run_config(&config, action),
        Command::Pair {
            device_id,
            device_token,
        } => {
            let prefs = Preferences::new(Config::prefs_dir());
            store_credentials(&prefs, &device_id, &device_token)
                .context("failed to store credentials")?;
            println!("Paired device {}", device_id);
            Ok(())
        }
        Command::Status { json } => print_status(&open_engine(&config, args.offline)?, json),
        Command::Capture(capture) => {
            let engine = open_engine(&config, args.offline)?;
            let id = engine
                .insert_and_schedule(capture.into_sample())
                .await
                .context("failed to capture sample")?;
            println!("Captured sample {}", id);
            Ok(())
        }
        Command::Sync { all } => run_sync(&open_engine(&config, args.offline)?, all).await,
        Command::Run => run_daemon(&open_engine(&config, args.offline)?).await,
        Command::Prune { before, days } => {
            run_prune(&open_engine(&config, args.offline)?, &config, before, days)
        }
    }
}

fn open_engine(config: &Config, offline: bool) -> Result<SyncEngine> {
    SyncEngine::open(
        config,
        &EnginePaths::from_xdg(),
        NetworkMonitor::new(!offline),
    )
    .context("failed to open sync engine")
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Status { .. } => "status",
        Command::Capture(_) => "capture",
        Command::Sync { .. } => "sync",
        Command::Run => "run",
        Command::Prune { .. } => "prune",
        Command::Config { .. } => "config",
        Command::Pair { .. } => "pair",
    }
}

fn run_prune(
    engine: &SyncEngine,
    config: &Config,
    before: Option<String>,
    days: Option<u32>,
) -> Result<()> {
    let deleted = match (before, days) {
        (Some(before), _) => {
            let cutoff = DateTime::parse_from_rfc3339(&before)
                .with_context(|| format!("invalid --before time {:?}", before))?;
            engine
                .pruner()
                .prune_older_than(&format_timestamp(cutoff.with_timezone(&Utc)))?
        }
        (None, Some(days)) => {
            let cutoff = days_before(Utc::now(), days).context("invalid --days")?;
            engine.pruner().prune_older_than(&format_timestamp(cutoff))?
        }
        (None, None) => engine.prune_expired(Utc::now())?.deleted,
    };
    println!(
        "Pruned {} sample(s) (policy: {:?})",
        deleted, config.retention.policy
    );
    Ok(())
}

fn print_status(engine: &SyncEngine, json: bool) -> Result<()> {
    let status = engine.status().context("failed to read status")?;

    if json {
        let latest = status.latest.as_ref().map(|s| {
            serde_json::json!({
                "id": s.id,
                "capturedAt": s.captured_at,
                "lat": s.lat,
                "lng": s.lng,
                "state": s.delivery_state.as_str(),
            })
        });
        let value = serde_json::json!({
            "pending": status.pending,
            "total": status.total,
            "latest": latest,
            "serverUrl": status.server_url,
            "serverUrlOverridden": status.server_url_overridden,
            "encrypted": status.encrypted,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Database:   {}", Config::database_path().display());
    println!(
        "Server URL: {}{}",
        status.server_url,
        if status.server_url_overridden {
            " (runtime override)"
        } else {
            ""
        }
    );
    println!(
        "Encrypted:  {}",
        if status.encrypted { "yes" } else { "no" }
    );
    println!("Pending:    {}", status.pending);
    println!("Total:      {}", status.total);
    match status.latest {
        Some(latest) => println!(
            "Latest:     {} ({:.5}, {:.5}) {}",
            latest.captured_at,
            latest.lat,
            latest.lng,
            latest.delivery_state.as_str()
        ),
        None => println!("Latest:     none"),
    }
    Ok(())
}

async fn run_sync(engine: &SyncEngine, all: bool) -> Result<()> {
    let (delivered, outcome) = if all {
        engine.drain().await
    } else {
        let outcome = engine.sync_now().await;
        let delivered = match &outcome {
            UploadOutcome::Delivered { count, .. } => *count,
            _ => 0,
        };
        (delivered, outcome)
    };

    match outcome {
        UploadOutcome::Retry { reason } => {
            let pending = engine.status()?.pending;
            bail!(
                "upload failed after {} delivered: {} ({} still pending)",
                delivered,
                reason,
                pending
            );
        }
        UploadOutcome::Idle if delivered == 0 => println!("Nothing to sync"),
        UploadOutcome::Delivered {
            more_pending: true, ..
        } => println!(
            "Delivered {} sample(s), more pending (use --all to drain)",
            delivered
        ),
        _ => println!("Delivered {} sample(s)", delivered),
    }
    Ok(())
}

async fn run_daemon(engine: &SyncEngine) -> Result<()> {
    println!("Syncing to {} (Ctrl-C to stop)", engine.server_url());
    engine.start();

    let mut prune_ticker = tokio::time::interval(PRUNE_INTERVAL);
    loop {
        tokio::select! {
            _ = prune_ticker.tick() => {
                if let Err(e) = engine.prune_expired(Utc::now()) {
                    tracing::warn!(error = %e, "Retention pass failed");
                }
            }
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for Ctrl-C")?;
                break;
            }
        }
    }

    let stats = engine.stats();
    tracing::info!(
        batches = stats.batches_delivered,
        samples = stats.samples_delivered,
        failures = stats.failures,
        "Daemon stopping"
    );
    engine.shutdown();
    println!(
        "Delivered {} sample(s) in {} batch(es), {} failed attempt(s)",
        stats.samples_delivered, stats.batches_delivered, stats.failures
    );
    Ok(())
}

fn run_config(config: &Config, action: ConfigAction) -> Result<()> {
    let prefs = Preferences::new(Config::prefs_dir());
    let setting = ServerUrlSetting::new(Arc::new(prefs.namespace(APP_PREFS_NAMESPACE)));

    match action {
        ConfigAction::Show => {
            let overridden = setting.get().context("failed to read server URL override")?;
            println!("Config file:  {}", Config::config_path().display());
            println!("Data dir:     {}", Config::data_dir().display());
            println!("Log file:     {}", Config::log_path().display());
            println!("Server URL:   {}", setting.resolve(&config.sync));
            println!(
                "  override:   {}",
                overridden.as_deref().unwrap_or("(none)")
            );
            println!(
                "  configured: {}",
                config.sync.server_url.as_deref().unwrap_or("(none)")
            );
            println!("Batch size:   {}", config.sync.batch_size);
            println!("Timeout:      {}s", config.sync.timeout_secs);
            println!("Periodic:     every {}s", config.sync.periodic_interval_secs);
            println!(
                "Retention:    {} days ({:?})",
                config.retention.days, config.retention.policy
            );
            println!("Encryption:   {}", if config.storage.encrypt { "on" } else { "off" });
        }
        ConfigAction::SetUrl { url } => {
            setting.set(&url).context("failed to set server URL")?;
            println!("Server URL set to {}", setting.resolve(&config.sync));
        }
        ConfigAction::ClearUrl => {
            setting.clear().context("failed to clear server URL")?;
            println!(
                "Server URL override cleared, using {}",
                setting.resolve(&config.sync)
            );
        }
    }
    Ok(())
}
