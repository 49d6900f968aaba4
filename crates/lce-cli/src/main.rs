use std::fs::OpenOptions;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lce_core::{artifact_date, SourceName};
use lce_sync::{
    build_fetch_scheduler, connect_pool, grant_read_access, run_fetch_once, run_load,
    DatabaseTarget, EtlConfig, PgCatalogStore,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "lce-cli")]
#[command(about = "Learn catalog ETL command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch today's catalog into the artifact directory
    Fetch,
    /// Load one fetched artifact into the database
    Load {
        /// Artifact file name inside the artifact directory
        source_file: String,
        #[arg(long, value_enum, default_value_t = TargetArg::Local)]
        target: TargetArg,
    },
    /// Enable row level security with a public read-only policy on every table
    GrantReadAccess {
        #[arg(long, value_enum, default_value_t = PolicyTargetArg::All)]
        target: PolicyTargetArg,
    },
    /// Run the daily fetch on its cron schedule until interrupted
    Schedule,
    /// List stored artifacts
    Artifacts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TargetArg {
    Local,
    Cloud,
}

impl From<TargetArg> for DatabaseTarget {
    fn from(value: TargetArg) -> Self {
        match value {
            TargetArg::Local => DatabaseTarget::Local,
            TargetArg::Cloud => DatabaseTarget::Cloud,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PolicyTargetArg {
    Local,
    Cloud,
    All,
}

impl PolicyTargetArg {
    fn targets(self) -> &'static [DatabaseTarget] {
        match self {
            Self::Local => &[DatabaseTarget::Local],
            Self::Cloud => &[DatabaseTarget::Cloud],
            Self::All => &[DatabaseTarget::Local, DatabaseTarget::Cloud],
        }
    }
}

fn init_tracing(config: &EtlConfig) -> Result<()> {
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.log_file)
        .with_context(|| format!("opening log file {}", config.log_file.display()))?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(true))
        .with(
            fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(Arc::new(log_file)),
        )
        .try_init()
        .context("installing tracing subscriber")
}

async fn run(command: Commands, config: &EtlConfig) -> Result<()> {
    match command {
        Commands::Fetch => {
            let summary = run_fetch_once(config).await?;
            println!("saved: {}", summary.path);
        }
        Commands::Load {
            source_file,
            target,
        } => {
            let source_name = SourceName::parse(source_file)?;
            let pool = connect_pool(config, target.into()).await?;
            let store = PgCatalogStore::new(pool, config.db_schema.clone());
            let summary = run_load(&store, &config.artifact_store(), &source_name).await?;
            info!(
                source_name = %summary.source_name,
                total_rows = summary.total_rows,
                "load complete"
            );
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("serializing load summary")?
            );
        }
        Commands::GrantReadAccess { target } => {
            let mut failed = Vec::new();
            for db_target in target.targets() {
                let outcome = async {
                    let pool = connect_pool(config, *db_target).await?;
                    grant_read_access(&pool, &config.db_schema, db_target.label()).await
                }
                .await;
                match outcome {
                    Ok(tables) => println!("{}: {} tables", db_target.label(), tables.len()),
                    Err(err) => {
                        error!(db_target = db_target.label(), error = %err, "grant failed");
                        failed.push(db_target.label());
                    }
                }
            }
            if !failed.is_empty() {
                anyhow::bail!("granting read access failed for: {}", failed.join(", "));
            }
        }
        Commands::Schedule => {
            let mut sched = build_fetch_scheduler(config.clone()).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.fetch_cron, "fetch scheduler started");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("fetch scheduler stopped");
        }
        Commands::Artifacts => {
            let store = config.artifact_store();
            info!(dir = %store.root().display(), "listing artifacts");
            for name in store.list().await? {
                match artifact_date(&name) {
                    Some(date) => println!("{name}\t{date}"),
                    None => println!("{name}"),
                }
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = EtlConfig::from_env();

    if let Err(err) = init_tracing(&config) {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    match run(cli.command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "run failed");
            ExitCode::FAILURE
        }
    }
}
