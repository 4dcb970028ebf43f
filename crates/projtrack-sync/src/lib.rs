//! Merge, load and run orchestration for the forecast projections tracker.

use anyhow::{Context, Result};

pub mod config;
pub mod export;
pub mod load;
pub mod merge;
pub mod pipeline;
pub mod rules;
pub mod store;

pub use config::{ConfigError, PipelineConfig, RunMode};
pub use load::{load_batch, LoadError, LoadSummary, PartitionSummary};
pub use merge::{merge_frames, MergeSummary, MergedBatch};
pub use pipeline::{Pipeline, RunSummary, SourceRunReport};
pub use rules::{PipelineRules, SourceRegistry};
pub use store::{
    ForecastReader, ForecastStore, InMemoryForecastStore, PgForecastStore, SeriesPoint,
    SeriesQuery, StoreError,
};

pub const CRATE_NAME: &str = "projtrack-sync";

pub async fn connect_store(config: &PipelineConfig) -> Result<PgForecastStore> {
    PgForecastStore::connect(&config.database_url, &config.table_name)
        .await
        .with_context(|| format!("connecting to table {}", config.table_name))
}

pub async fn run_once_from_env() -> Result<RunSummary> {
    let config = PipelineConfig::from_env()?;
    let store = connect_store(&config).await?;
    let pipeline = Pipeline::new(config)?;
    pipeline.run_once(&store, None).await
}
