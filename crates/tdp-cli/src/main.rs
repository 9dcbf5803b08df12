use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tdp_adapters::DecodeMode;
use tdp_storage::LoadStrategy;
use tdp_sync::{build_pipeline, build_postgres_store, file_source, IngestConfig, IngestPipeline};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "tdp-cli")]
#[command(about = "Tender notice ingestion backend")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion and exit.
    Ingest {
        /// Ingest a local CSV snapshot instead of the configured URL.
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long)]
        decode_mode: Option<DecodeMode>,
        #[arg(long)]
        load_strategy: Option<LoadStrategy>,
    },
    Migrate,
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Ingest {
            file,
            decode_mode,
            load_strategy,
        } => {
            let mut config = IngestConfig::from_env();
            if let Some(mode) = decode_mode {
                config.decode_mode = mode;
            }
            if let Some(strategy) = load_strategy {
                config.load_strategy = strategy;
            }

            let store = Arc::new(build_postgres_store(&config)?);
            store.migrate().await?;
            let pipeline = match file {
                Some(path) => IngestPipeline::new(
                    Arc::new(file_source(&path).await?),
                    store,
                    config.options(),
                ),
                None => build_pipeline(&config, store)?,
            };

            let summary = pipeline.run_once().await?;
            info!(
                run_id = %summary.run_id,
                decode = %summary.decode_mode,
                strategy = %summary.load_strategy,
                loaded = summary.rows_loaded,
                cleared = summary.rows_cleared,
                skipped = summary.skipped_records,
                sha256 = %summary.source_sha256,
                "{}",
                summary.message()
            );
        }
        Commands::Migrate => {
            let config = IngestConfig::from_env();
            build_postgres_store(&config)?.migrate().await?;
            info!("migrations applied");
        }
        Commands::Serve => tdp_web::serve_from_env().await?,
    }

    Ok(())
}
