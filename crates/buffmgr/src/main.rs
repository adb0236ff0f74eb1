//! buffmgr command line
//!
//! One binary, one subcommand per component. Every subcommand takes the
//! path of a TOML or YAML configuration file.

use anyhow::{bail, Context, Result};
use buffmgr::backfill::Backfill;
use buffmgr::check::ConsistencyCheck;
use buffmgr::cleaner::Cleaner;
use buffmgr::db::{EventStore, FileStatus};
use buffmgr::report::{render_consistency_table, render_status_table};
use buffmgr::rerun::{rerun_files, rerun_status};
use buffmgr::{BackendRegistry, CancellationToken, Config, Finder, Ingester};
use buffmgr_logging::{init_logging, LogConfig};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[command(name = "buffmgr", version, about = "File lifecycle tracking and batch ingestion")]
struct Cli {
    /// Enable verbose logging (debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Log the effective configuration at startup
    #[arg(long, global = true)]
    dump: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover new files and register them
    Finder {
        config: PathBuf,

        /// Run a single discovery pass and exit
        #[arg(long)]
        once: bool,
    },

    /// Ingest eligible files through the configured backend
    Ingester {
        config: PathBuf,

        /// Target status to select (UNTRIED, RERUN, FAILURE, UNKNOWN, BACKFILL)
        #[arg(long)]
        status: Option<FileStatus>,

        /// Keep cycling until terminated
        #[arg(long, overrides_with = "no_daemon")]
        daemon: bool,

        /// Process currently eligible files once and exit
        #[arg(long)]
        no_daemon: bool,

        /// Files per dispatch; negative for no limit
        #[arg(long, allow_negative_numbers = true)]
        batch_size: Option<i64>,
    },

    /// Register files already in storage without ingesting them
    Backfill { config: PathBuf },

    /// Remove old files and long-empty directories
    Cleaner {
        config: PathBuf,

        /// Sweep once and exit
        #[arg(long)]
        once: bool,
    },

    /// Show file counts per current status
    Status {
        config: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Compare file records with the storage area
    Check {
        config: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check a configuration file without running anything
    Validate { config: PathBuf },

    /// Mark files for another ingestion attempt
    Rerun {
        config: PathBuf,

        /// File ids to mark
        #[arg(long = "file-id", required_unless_present = "status", conflicts_with = "status")]
        file_ids: Vec<i64>,

        /// Mark every file currently in this status
        #[arg(long)]
        status: Option<FileStatus>,
    },
}

impl Commands {
    fn component(&self) -> &'static str {
        match self {
            Commands::Finder { .. } => "finder",
            Commands::Ingester { .. } => "ingester",
            Commands::Backfill { .. } => "backfill",
            Commands::Cleaner { .. } => "cleaner",
            Commands::Status { .. } => "status",
            Commands::Check { .. } => "check",
            Commands::Validate { .. } => "validate",
            Commands::Rerun { .. } => "rerun",
        }
    }

    fn config_path(&self) -> &Path {
        match self {
            Commands::Finder { config, .. }
            | Commands::Ingester { config, .. }
            | Commands::Backfill { config }
            | Commands::Cleaner { config, .. }
            | Commands::Status { config, .. }
            | Commands::Check { config, .. }
            | Commands::Validate { config }
            | Commands::Rerun { config, .. } => config,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.command.config_path()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("buffmgr: {}", e);
            return ExitCode::from(2);
        }
    };
    apply_overrides(&cli.command, &mut config);

    let mut log = LogConfig::new(cli.command.component());
    log.verbose = cli.verbose;
    log.file = config.logging.file.clone();
    log.level = config.logging.level.clone();
    if let Err(e) = init_logging(&log) {
        eprintln!("buffmgr: {:#}", e);
        return ExitCode::from(2);
    }

    match config.to_toml() {
        Ok(rendered) if cli.dump => info!(config = %rendered, "Effective configuration"),
        Ok(rendered) => debug!(config = %rendered, "Effective configuration"),
        Err(e) => debug!(error = %e, "Cannot render configuration"),
    }

    let backends = BackendRegistry::with_builtins();
    if let Err(e) = config.validate(&backends) {
        error!(error = %e, "Invalid configuration");
        return ExitCode::from(2);
    }

    match run(cli.command, config, backends).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Command-line flags win over the configuration file.
fn apply_overrides(command: &Commands, config: &mut Config) {
    if let Commands::Ingester {
        status,
        daemon,
        no_daemon,
        batch_size,
        ..
    } = command
    {
        if let Some(ingester) = config.ingester.as_mut() {
            if let Some(status) = status {
                ingester.file_status = *status;
            }
            if *daemon {
                ingester.daemon = true;
            } else if *no_daemon {
                ingester.daemon = false;
            }
            if let Some(batch_size) = batch_size {
                ingester.batch_size = *batch_size;
            }
        }
    }
}

async fn open_store(config: &Config) -> Result<EventStore> {
    EventStore::open(config.database.store_options())
        .await
        .with_context(|| format!("Failed to open database {}", config.database.url))
}

fn shutdown_token() -> Result<CancellationToken> {
    let cancel = CancellationToken::new();
    cancel
        .cancel_on_signals()
        .context("Failed to install signal handlers")?;
    Ok(cancel)
}

async fn run(command: Commands, config: Config, backends: BackendRegistry) -> Result<ExitCode> {
    match command {
        Commands::Validate { config: path } => {
            println!("{}: configuration is valid", path.display());
            Ok(ExitCode::SUCCESS)
        }

        Commands::Finder { once, .. } => {
            let store = open_store(&config).await?;
            let finder = Finder::from_config(config.finder()?, store.clone())?;
            if once {
                let stats = finder.run_once().await?;
                info!(?stats, "Finder pass complete");
            } else {
                finder.run(&shutdown_token()?).await?;
            }
            store.close().await;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Ingester { .. } => {
            let store = open_store(&config).await?;
            let mut ingester =
                Ingester::from_config(&config, store.clone(), &backends, shutdown_token()?)?;
            let summary = ingester.run().await.context("Ingester stopped on error")?;
            info!(
                cycles = summary.cycles,
                recovered = summary.recovered,
                dispatched = summary.ingest.dispatched,
                succeeded = summary.ingest.succeeded,
                failed = summary.ingest.failed,
                "Ingester finished"
            );
            store.close().await;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Backfill { .. } => {
            let store = open_store(&config).await?;
            let summary = Backfill::from_config(config.backfill()?, store.clone())?
                .run()
                .await?;
            store.close().await;
            println!(
                "registered: {}  already tracked: {}  excluded: {}  failed: {}",
                summary.registered, summary.already_tracked, summary.excluded, summary.failed
            );
            Ok(if summary.is_clean() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Commands::Cleaner { once, .. } => {
            let mut cleaner_config = config.cleaner()?.clone();
            if once {
                cleaner_config.daemon = false;
            }
            let stats = Cleaner::from_config(&cleaner_config)?
                .run(&shutdown_token()?)
                .await?;
            Ok(if stats.errors == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Commands::Status { json, .. } => {
            let store = open_store(&config).await?;
            let report = store.status_report().await?;
            store.close().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", render_status_table(&report));
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Check { json, .. } => {
            let store = open_store(&config).await?;
            let report = ConsistencyCheck::from_config(config.check()?, store.clone())?
                .run()
                .await?;
            store.close().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", render_consistency_table(&report));
            }
            Ok(if report.is_consistent() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Commands::Rerun {
            file_ids, status, ..
        } => {
            let store = open_store(&config).await?;
            let summary = match status {
                Some(status) => rerun_status(&store, status).await?,
                None if !file_ids.is_empty() => rerun_files(&store, &file_ids).await?,
                None => bail!("either --file-id or --status is required"),
            };
            store.close().await;
            println!(
                "marked: {}  not found: {}  in progress: {}",
                summary.marked, summary.not_found, summary.in_flight
            );
            Ok(if summary.not_found == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}
