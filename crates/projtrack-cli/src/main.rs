use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use projtrack_sync::{connect_store, ForecastStore, Pipeline, PipelineConfig};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "projtrack-cli")]
#[command(about = "Forecast projections tracker command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, merge and load in one pass.
    Run {
        /// Lower bound on model_date; defaults to PROJTRACK_MIN_MODEL_DATE.
        #[arg(long)]
        since: Option<NaiveDate>,
    },
    /// Download provider files and write compiled snapshots.
    Fetch,
    /// Normalize compiled snapshots and write the merged snapshot.
    Merge,
    /// Load the merged snapshot into the target table.
    Load {
        #[arg(long)]
        since: Option<NaiveDate>,
    },
    /// Create the target table if needed and check its columns.
    Migrate,
    /// Serve the read-only query API.
    Serve,
}

fn init_logging(config: &PipelineConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_log_filter()));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = PipelineConfig::from_env()?;
    init_logging(&config);

    match cli.command.unwrap_or(Commands::Run { since: None }) {
        Commands::Run { since } => {
            let store = connect_store(&config).await?;
            let pipeline = Pipeline::new(config)?;
            let summary = pipeline.run_once(&store, since).await?;
            println!(
                "run complete: run_id={} rows_inserted={} reports={}",
                summary.run_id,
                summary.load.as_ref().map_or(0, |l| l.rows_inserted),
                summary.reports_dir
            );
        }
        Commands::Fetch => {
            let pipeline = Pipeline::new(config)?;
            let reports = pipeline.fetch_all(Uuid::new_v4()).await;
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
        Commands::Merge => {
            let pipeline = Pipeline::new(config)?;
            let mut reports = Vec::new();
            let merge = pipeline.merge(Uuid::new_v4(), &mut reports).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "sources": reports,
                    "merge": merge,
                }))?
            );
        }
        Commands::Load { since } => {
            let store = connect_store(&config).await?;
            let pipeline = Pipeline::new(config)?;
            let summary = pipeline.load(&store, since).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Migrate => {
            let store = connect_store(&config).await?;
            store.ensure_table().await?;
            store.validate_table().await?;
            println!(
                "table {} ready: {} rows",
                store.table(),
                store.row_count().await?
            );
        }
        Commands::Serve => {
            projtrack_web::serve(&config).await?;
        }
    }

    Ok(())
}
