// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use poliigon_sync::config::EngineConfig;
use poliigon_sync::download::{
    Asset, AssetProgress, DownloadCoordinator, DownloadHandle, DownloadHistory, DownloadManager, DownloadOutcome,
    DownloadReport, HttpQualitySink, HttpUrlResolver, QualityTracker, ReqwestTransport, SessionState,
};
use poliigon_sync::error::ErrorReport;
use poliigon_sync::errors::ErrorCategory;
use poliigon_sync::sync::{AssetOutcome, FramedMessageChannel, SidecarJobHandler, SyncHost, SyncWorker};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// Success - operation completed successfully
    pub const SUCCESS: i32 = 0;
    /// General error - unspecified error, or a cancelled download
    pub const ERROR: i32 = 1;
    /// Usage error - invalid command line arguments
    pub const USAGE: i32 = 64;
    /// Data error - invalid asset file or rejected asset
    pub const DATA_ERR: i32 = 65;
    /// Service unavailable - API or sync worker not responding
    pub const SERVICE_UNAVAILABLE: i32 = 69;
    /// I/O error - disk full, permissions
    pub const IO_ERR: i32 = 74;
    /// Temporary failure - try again later
    pub const TEMP_FAIL: i32 = 75;
    /// Configuration error - invalid or missing config
    pub const CONFIG: i32 = 78;
}

use exit_codes::*;

/// poliigon-sync - download Poliigon assets and sync them into a catalog.
#[derive(Parser)]
#[command(name = "poliigon-sync")]
#[command(version = VERSION)]
#[command(about = "Download Poliigon assets and sync them into an asset catalog.")]
#[command(long_about = "poliigon-sync - Poliigon asset downloader\n\n\
    Download an asset:   poliigon-sync download asset.json --size 4K\n\
    Sync into catalog:   poliigon-sync sync --catalog cats.txt --categories categories.json asset.json\n\
    Past downloads:      poliigon-sync history\n\
    Configure:           poliigon-sync config show")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file to use instead of ~/.poliigon-sync/config.json
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Quiet mode: warnings and errors only
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Verbose mode: debug logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Download one asset into the library
    ///
    /// Examples:
    ///   poliigon-sync download Bricks001.json
    ///   poliigon-sync download Bricks001.json --size 4K --dir ./library
    Download {
        /// Asset description (JSON)
        asset: PathBuf,
        /// Size to download
        #[arg(short, long, default_value = "2K")]
        size: String,
        /// Library directory (defaults to the configured library)
        #[arg(short, long)]
        dir: Option<PathBuf>,
        /// Retries after the first attempt
        #[arg(long)]
        retries: Option<u32>,
        /// Do not record the download in the history file
        #[arg(long)]
        no_history: bool,
    },

    /// Save downloaded assets into an asset catalog through a worker process
    ///
    /// Example:
    ///   poliigon-sync sync --catalog blender_assets.cats.txt --categories categories.json a.json b.json
    Sync {
        /// Catalog definition file
        #[arg(long)]
        catalog: PathBuf,
        /// Categories JSON
        #[arg(long)]
        categories: PathBuf,
        /// Where asset sidecars go (defaults to the configured library)
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Seconds to wait for each asset
        #[arg(long, default_value_t = 300)]
        timeout: u64,
        /// Asset descriptions (JSON)
        #[arg(required = true)]
        assets: Vec<PathBuf>,
    },

    /// Worker side of `sync`; speaks the sync protocol on stdin/stdout
    #[command(hide = true)]
    Worker {
        /// <catalog-file> <categories-json>, after `--`
        #[arg(raw = true)]
        paths: Vec<PathBuf>,
    },

    /// Show past downloads
    History {
        /// Only failed or cancelled downloads
        #[arg(long)]
        failed: bool,
    },

    /// Show or create the configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show current configuration (token masked)
    Show,
    /// Print the config file location
    Path,
    /// Write a config file with defaults
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Logs always go to stderr: in worker mode stdout carries protocol frames.
fn init_tracing(verbose: bool, quiet: bool) {
    let level = if verbose {
        LevelFilter::DEBUG
    } else if quiet {
        LevelFilter::WARN
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn load_config(path: Option<&Path>) -> Option<EngineConfig> {
    match EngineConfig::load(path) {
        Ok(config) => Some(config),
        Err(e) => {
            eprintln!(
                "{}",
                ErrorReport::new("Invalid configuration")
                    .cause(format!("{:#}", e))
                    .fix("Inspect the file: poliigon-sync config path")
                    .fix("Recreate it with defaults: poliigon-sync config init --force")
            );
            None
        }
    }
}

fn build_coordinator(config: &EngineConfig, retries: Option<u32>) -> Result<DownloadCoordinator> {
    let mut options = config.coordinator_options();
    if let Some(retries) = retries {
        options.max_retries = retries;
    }
    let timeout = config.request_timeout();

    let resolver = HttpUrlResolver::new(config.api_url.clone(), config.api_token.clone(), timeout)
        .context("Failed to create API client")?;
    let transport = ReqwestTransport::new(timeout).context("Failed to create download client")?;
    let tracker = if config.telemetry_enabled {
        let sink = HttpQualitySink::new(&config.api_url, config.api_token.clone(), timeout)
            .context("Failed to create quality client")?;
        QualityTracker::new(Box::new(sink))
    } else {
        QualityTracker::logging()
    };

    Ok(DownloadCoordinator::new(Arc::new(resolver), Arc::new(transport), Arc::new(tracker), options))
}

fn exit_code_for(category: ErrorCategory) -> i32 {
    match category {
        ErrorCategory::Transient => TEMP_FAIL,
        ErrorCategory::Resource => IO_ERR,
        ErrorCategory::Integrity => DATA_ERR,
        ErrorCategory::Protocol => SERVICE_UNAVAILABLE,
        ErrorCategory::User => ERROR,
    }
}

fn progress_message(progress: &AssetProgress) -> String {
    let mut message = progress.message.clone();
    if progress.attempt > 1 {
        message.push_str(&format!(" (attempt {})", progress.attempt));
    }
    if let Some(speed) = progress.speed_string() {
        message.push_str(&format!("  {}", speed));
    }
    if let Some(eta) = progress.eta_string() {
        message.push_str(&format!("  ETA {}", eta));
    }
    message
}

/// Render progress until the download ends.
async fn follow_download(handle: DownloadHandle) -> Option<DownloadReport> {
    let bar = ProgressBar::new(1000);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {percent:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    bar.enable_steady_tick(Duration::from_millis(100));

    loop {
        let progress = handle.progress();
        bar.set_position((progress.fraction * 1000.0) as u64);
        bar.set_message(progress_message(&progress));
        if progress.state.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    bar.finish_and_clear();
    handle.report()
}

fn cmd_download(
    config: &EngineConfig,
    asset_path: &Path,
    size: String,
    dir: Option<PathBuf>,
    retries: Option<u32>,
    no_history: bool,
) -> Result<i32> {
    let asset = match Asset::from_json_file(asset_path) {
        Ok(asset) => asset,
        Err(e) => {
            eprintln!(
                "{}",
                ErrorReport::new("Could not read asset file")
                    .cause(format!("{:#}", e))
                    .fix("Check the path and the JSON in the asset file")
            );
            return Ok(DATA_ERR);
        }
    };
    if config.api_token.is_none() {
        eprintln!(
            "{} No API token configured; set {} or api_token in the config",
            "[!]".yellow(),
            poliigon_sync::config::TOKEN_ENV_VAR
        );
    }

    let library = dir.unwrap_or_else(|| config.library_dir.clone());
    // Blocking HTTP clients must be created and dropped outside the runtime.
    let coordinator = build_coordinator(config, retries)?;
    let mut manager = DownloadManager::new(coordinator, &library, config.max_parallel_assets);
    if !no_history {
        manager = manager.with_history(DownloadHistory::default_path());
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    let report = runtime.block_on(async {
        let handle = manager.queue_download(asset, size);
        let interrupt = handle.clone();
        if let Err(e) = ctrlc::set_handler(move || interrupt.cancel()) {
            tracing::warn!(error = %e, "Could not install Ctrl-C handler");
        }
        follow_download(handle).await
    });
    drop(runtime);
    drop(manager);

    let Some(report) = report else {
        eprintln!("{}", ErrorReport::new("Download ended without a result"));
        return Ok(ERROR);
    };

    match report.state {
        SessionState::Done => {
            println!(
                "{} {} downloaded: {} files in {}",
                "[OK]".green(),
                report.asset_name.bold(),
                report.files.len(),
                library.join(&report.asset_name).display()
            );
            Ok(SUCCESS)
        }
        SessionState::Cancelled => {
            println!("{} Download of {} cancelled", "[!]".yellow(), report.asset_name);
            Ok(ERROR)
        }
        _ => match &report.error {
            Some(error) => {
                eprintln!("{}", ErrorReport::download(error));
                Ok(exit_code_for(error.category))
            }
            None => {
                eprintln!("{}", ErrorReport::new(format!("Download of {} failed", report.asset_name)));
                Ok(ERROR)
            }
        },
    }
}

fn cmd_sync(
    config: &EngineConfig,
    catalog: &Path,
    categories: &Path,
    output_dir: Option<PathBuf>,
    timeout: u64,
    assets: &[PathBuf],
) -> Result<i32> {
    let exe = std::env::current_exe().context("Could not locate the poliigon-sync executable")?;
    let base_dir = output_dir.unwrap_or_else(|| config.library_dir.clone());

    let mut host = SyncHost::spawn(&exe, catalog, categories, config.channel_options(), Duration::from_secs(timeout))
        .context("Failed to start sync worker")?;
    if let Err(e) = host.hello() {
        eprintln!("{}", ErrorReport::sync("Sync worker did not respond", &e));
        return Ok(SERVICE_UNAVAILABLE);
    }

    let mut failed = 0usize;
    for path in assets {
        let asset = match Asset::from_json_file(path) {
            Ok(asset) => asset,
            Err(e) => {
                eprintln!("{} {:#}", "[X]".red(), e);
                failed += 1;
                continue;
            }
        };
        let params = json!({ "output_dir": base_dir.join(&asset.asset_name) });
        match host.submit_asset(&asset, Some(params)) {
            Ok(AssetOutcome::Built { .. }) => println!("{} {}", "[OK]".green(), asset.asset_name),
            Ok(AssetOutcome::Failed { message }) => {
                println!("{} {}: {}", "[X]".red(), asset.asset_name, message);
                failed += 1;
            }
            Err(e) => {
                eprintln!("{}", ErrorReport::sync(format!("Sync stopped at {}", asset.asset_name), &e));
                return Ok(SERVICE_UNAVAILABLE);
            }
        }
    }

    if let Err(e) = host.exit() {
        tracing::warn!(error = %e, "Sync worker did not exit cleanly");
    }
    Ok(if failed > 0 { DATA_ERR } else { SUCCESS })
}

fn cmd_worker(config: &EngineConfig, paths: &[PathBuf]) -> Result<i32> {
    let [catalog, categories] = paths else {
        eprintln!("usage: poliigon-sync worker -- <catalog-file> <categories-json>");
        return Ok(USAGE);
    };
    let handler = match SidecarJobHandler::open(catalog, categories) {
        Ok(handler) => handler,
        Err(e) => {
            tracing::error!(error = %e, "Could not load catalog or categories");
            return Ok(DATA_ERR);
        }
    };

    let channel = FramedMessageChannel::spawn("worker", io::stdin(), io::stdout(), config.channel_options())
        .context("Failed to start sync channel")?;
    match SyncWorker::new(channel, handler, config.idle_probe_interval()).run() {
        Ok(summary) => {
            tracing::info!(built = summary.built, failed = summary.failed, "Worker finished");
            Ok(SUCCESS)
        }
        Err(e) => {
            tracing::error!(error = %e, "Worker lost the host");
            Ok(SERVICE_UNAVAILABLE)
        }
    }
}

fn cmd_history(failed_only: bool) -> Result<i32> {
    let history = DownloadHistory::load()?;
    let entries = if failed_only {
        history.retryable()
    } else {
        history.recent()
    };
    if entries.is_empty() {
        println!("No downloads recorded yet.");
        return Ok(SUCCESS);
    }

    for entry in entries {
        let outcome = format!("{:<12}", entry.outcome.to_string());
        let outcome = match entry.outcome {
            DownloadOutcome::Completed => outcome.green(),
            DownloadOutcome::Failed => outcome.red(),
            DownloadOutcome::Cancelled => outcome.yellow(),
            DownloadOutcome::InProgress => outcome.cyan(),
        };
        println!(
            "{:>8}  {:<28} {:<5} {} attempts {}  {}",
            entry.asset_id,
            entry.asset_name,
            entry.size,
            outcome,
            entry.attempts,
            entry.started_at.format("%Y-%m-%d %H:%M")
        );
        if let Some(error) = &entry.error {
            println!("          {} ({})", error.label.dimmed(), error.reference);
        }
    }

    let (running, completed, failed, cancelled) = history.outcome_counts();
    println!();
    println!(
        "{} completed, {} failed, {} cancelled, {} in progress",
        completed, failed, cancelled, running
    );
    Ok(SUCCESS)
}

fn cmd_config(command: ConfigCommands, path_override: Option<&Path>) -> Result<i32> {
    let path = match path_override {
        Some(p) => p.to_path_buf(),
        None => EngineConfig::default_path()?,
    };
    match command {
        ConfigCommands::Show => {
            let Some(config) = load_config(Some(&path)) else {
                return Ok(CONFIG);
            };
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
        }
        ConfigCommands::Path => println!("{}", path.display()),
        ConfigCommands::Init { force } => {
            if path.exists() && !force {
                eprintln!("{} {} already exists (use --force to overwrite)", "[!]".yellow(), path.display());
                return Ok(ERROR);
            }
            EngineConfig::default().save(&path)?;
            println!("{} Wrote {}", "[OK]".green(), path.display());
        }
    }
    Ok(SUCCESS)
}

fn run(cli: Cli) -> Result<i32> {
    if let Commands::Config { command } = cli.command {
        return cmd_config(command, cli.config.as_deref());
    }
    let Some(config) = load_config(cli.config.as_deref()) else {
        return Ok(CONFIG);
    };

    match cli.command {
        Commands::Download {
            asset,
            size,
            dir,
            retries,
            no_history,
        } => cmd_download(&config, &asset, size, dir, retries, no_history),
        Commands::Sync {
            catalog,
            categories,
            output_dir,
            timeout,
            assets,
        } => cmd_sync(&config, &catalog, &categories, output_dir, timeout, &assets),
        Commands::Worker { paths } => cmd_worker(&config, &paths),
        Commands::History { failed } => cmd_history(failed),
        Commands::Config { .. } => Ok(SUCCESS),
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", ErrorReport::new(format!("{:#}", e)));
            ERROR
        }
    };
    std::process::exit(code);
}
