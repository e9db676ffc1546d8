#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::perf)]
#![warn(clippy::complexity)]
#![warn(clippy::style)]
#![allow(clippy::multiple_crate_versions)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::pipeline::{Pipeline, UpdateMode};
use crate::store::annex::GitAnnexStore;
use crate::store::{ArchiveStore, TrackingRules};
use crate::youtube::YouTubeClient;

pub mod config;
pub mod discovery;
pub mod error;
pub mod export;
pub mod inspect;
pub mod model;
pub mod organize;
pub mod paths;
pub mod pipeline;
pub mod platform;
pub mod quota;
pub mod state;
pub mod store;
pub mod tsv;
pub mod youtube;

const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_INTERRUPTED: i32 = 2;
const EXIT_CONFIG: i32 = 3;
const EXIT_QUOTA_GAVE_UP: i32 = 4;

/// Archives YouTube channels, playlists and videos into a git-annex backed
/// repository
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Archive root (defaults to the current directory)
    #[arg(long, global = true)]
    archive: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an archive: repository, tracking rules, template config
    Init {
        /// Where to create it (defaults to the current directory)
        path: Option<PathBuf>,
    },
    /// Run the archival pipeline
    Backup {
        /// Update mode
        #[arg(long, value_enum, default_value_t = ModeArg::AllIncremental)]
        mode: ModeArg,
    },
    /// Incrementally update the archive (same as `backup` in its default
    /// mode)
    Update,
    /// Regenerate the TSV indices from the per-video JSON
    Export {
        #[arg(value_enum, default_value_t = ExportTarget::All)]
        target: ExportTarget,
    },
    /// Print archive statistics
    Info,
    /// Verify archive invariants
    Check,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    VideosIncremental,
    AllIncremental,
    Social,
    AllForce,
    Playlists,
}

impl From<ModeArg> for UpdateMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::VideosIncremental => Self::VideosIncremental,
            ModeArg::AllIncremental => Self::AllIncremental,
            ModeArg::Social => Self::Social,
            ModeArg::AllForce => Self::AllForce,
            ModeArg::Playlists => Self::Playlists,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExportTarget {
    Videos,
    Playlists,
    Authors,
    All,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            EXIT_FAILURE
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let archive_root = match &cli.archive {
        Some(path) => path.clone(),
        None => std::env::current_dir().context("resolving current directory")?,
    };

    match cli.command {
        Command::Init { path } => {
            let root = path.unwrap_or(archive_root);
            init_archive(&root).await?;
            Ok(EXIT_OK)
        }
        Command::Backup { mode } => backup(&archive_root, mode.into()).await,
        Command::Update => backup(&archive_root, UpdateMode::AllIncremental).await,
        Command::Export { target } => {
            let store = GitAnnexStore::new(&archive_root);
            match target {
                ExportTarget::Videos => {
                    export::export_videos(&store).await?;
                }
                ExportTarget::Playlists => {
                    export::export_playlists(&store).await?;
                }
                ExportTarget::Authors => {
                    export::export_authors(&store).await?;
                }
                ExportTarget::All => export::export_all(&store).await?,
            }
            Ok(EXIT_OK)
        }
        Command::Info => {
            print!("{}", inspect::archive_info(&archive_root)?);
            Ok(EXIT_OK)
        }
        Command::Check => {
            let violations = inspect::check_invariants(&archive_root)?;
            if violations.is_empty() {
                println!("ok: all invariants hold");
                Ok(EXIT_OK)
            } else {
                for violation in &violations {
                    println!("violation: {violation}");
                }
                Ok(EXIT_FAILURE)
            }
        }
    }
}

async fn init_archive(root: &Path) -> Result<()> {
    GitAnnexStore::ensure_tools().await?;
    let store = GitAnnexStore::new(root);
    store.init_archive(&TrackingRules::default()).await?;

    let config_dir = root.join(config::CONFIG_DIR);
    tokio::fs::create_dir_all(&config_dir).await?;
    let config_path = config_dir.join(config::CONFIG_FILE);
    if config_path.exists() {
        info!("keeping existing {}", config_path.display());
    } else {
        tokio::fs::write(&config_path, Config::template()).await?;
        info!("wrote template configuration to {}", config_path.display());
    }
    tokio::fs::create_dir_all(root.join("videos")).await?;
    tokio::fs::create_dir_all(root.join("playlists")).await?;

    store.commit("Initialize archive").await?;
    info!("archive ready; edit the configuration and run `tubevault backup`");
    Ok(())
}

async fn backup(archive_root: &Path, mode: UpdateMode) -> Result<i32> {
    let config = match Config::load(archive_root) {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            return Ok(EXIT_CONFIG);
        }
    };

    GitAnnexStore::ensure_tools().await?;
    let client = YouTubeClient::from_config(&config.network)?;
    let store = GitAnnexStore::new(archive_root);

    let ct = CancellationToken::new();
    spawn_interrupt_watcher(ct.clone());

    let pipeline = Pipeline::new(Arc::new(client), Arc::new(store), config, ct);
    let stats = pipeline.run(mode).await?;
    println!("{}", stats.summary());

    if stats.quota_gave_up {
        return Ok(EXIT_QUOTA_GAVE_UP);
    }
    if stats.interrupted {
        return Ok(EXIT_INTERRUPTED);
    }
    Ok(EXIT_OK)
}

/// First Ctrl-C requests a clean checkpoint and exit; a second one aborts
/// on the spot.
fn spawn_interrupt_watcher(ct: CancellationToken) {
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("interrupt: finishing the current video, then checkpointing");
        ct.cancel();
        tokio::signal::ctrl_c().await.ok();
        warn!("second interrupt: aborting immediately");
        std::process::exit(130);
    });
}
