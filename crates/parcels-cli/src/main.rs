use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use parcels_storage::PgRawStore;
use parcels_sync::{
    summary_line, LoadPolicy, LoaderConfig, Pipeline, PipelineConfig, RunOptions, CURRENT_DATE,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "parcels-cli")]
#[command(about = "Load daily parcel ownership and geometry batches into PostGIS")]
struct Cli {
    /// Load only the most recent batch directory.
    #[arg(short, long)]
    latest: bool,

    /// Batch to load as yyyy-mm-dd, or `all` for every batch directory.
    #[arg(short, long, default_value = CURRENT_DATE)]
    date: String,

    /// Replace raw rows of batches that were already loaded.
    #[arg(short, long)]
    overwrite: bool,

    /// Rebuild the analytic tables after loading.
    #[arg(short, long)]
    rebuild: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let loader = LoaderConfig::from_env();
    info!(
        data_dir = %loader.data_dir.display(),
        reports = loader.write_reports,
        stage_chunk = loader.stage_chunk,
        "configuration loaded"
    );
    let database_url = loader.resolve_database_url()?;
    let store = PgRawStore::connect(&database_url)
        .await
        .context("connecting to postgres")?;

    let config = PipelineConfig {
        loader,
        run: RunOptions {
            policy: LoadPolicy::from_flags(cli.latest, &cli.date),
            overwrite: cli.overwrite,
            rebuild: cli.rebuild,
        },
    };
    let today = chrono::Local::now().date_naive();
    let summary = Pipeline::new(&store, config).run(today).await?;

    println!("{}", summary_line(&summary));
    Ok(if summary.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
