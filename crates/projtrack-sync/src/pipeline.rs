//! Run orchestration: fetch every enabled provider, normalize, merge, load, report.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use projtrack_adapters::{
    adapter_for_source, AdapterContext, FetchReport, SkippedBatch, SourceAdapter, SourceConfig,
};
use projtrack_core::{CanonicalSchema, ForecastFrame};
use projtrack_storage::{HttpFetcher, SnapshotStore};
use serde::Serialize;
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::export::export_merged;
use crate::load::{load_batch, LoadError, LoadSummary};
use crate::merge::{merge_frames, read_merged_snapshot, write_merged_snapshot, MergeSummary};
use crate::rules::{load_source_registry, PipelineRules, SourceRegistry};
use crate::store::ForecastStore;

pub const RUN_SUMMARY_FILE: &str = "run_summary.json";

#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceRunReport {
    pub source_id: String,
    pub fetch: Option<FetchReport>,
    pub fetch_error: Option<String>,
    pub normalized_rows: usize,
    pub skipped_batches: Vec<SkippedBatch>,
    pub clamped_increments: usize,
    pub dropped_rows: usize,
    pub unknown_columns: Vec<String>,
    pub normalize_error: Option<String>,
}

impl SourceRunReport {
    fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub summary: MergeSummary,
    pub merged_snapshot: String,
    pub merged_sha256: String,
    pub parquet_snapshot: String,
    pub manifest: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: String,
    pub lower_bound: NaiveDate,
    pub sources: Vec<SourceRunReport>,
    pub merge: Option<MergeReport>,
    pub load: Option<LoadSummary>,
    pub load_error: Option<String>,
    pub reports_dir: String,
}

pub struct Pipeline {
    config: PipelineConfig,
    registry: SourceRegistry,
    rules: PipelineRules,
    schema: CanonicalSchema,
    snapshots: SnapshotStore,
    fetcher: HttpFetcher,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let registry = load_source_registry(&config.workspace_root)?;
        let rules = PipelineRules::from_workspace_root(&config.workspace_root)?;
        let fetcher = HttpFetcher::new(config.http_client_config())?;
        Ok(Self {
            snapshots: config.snapshot_store(),
            config,
            registry,
            rules,
            schema: CanonicalSchema::standard(),
            fetcher,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    fn enabled_sources(&self) -> Vec<SourceConfig> {
        self.registry
            .enabled()
            .cloned()
            .map(|mut source| {
                if source.source_id == projtrack_adapters::cu::SOURCE_ID {
                    if let Some(dir) = &self.config.cu_dir {
                        source.local_dir = Some(dir.clone());
                    }
                }
                source
            })
            .collect()
    }

    fn adapters(&self) -> Vec<Box<dyn SourceAdapter>> {
        self.enabled_sources()
            .iter()
            .filter_map(|source| {
                let adapter = adapter_for_source(source);
                if adapter.is_none() {
                    warn!(source_id = %source.source_id, "no adapter registered; source skipped");
                }
                adapter
            })
            .collect()
    }

    fn context(&self, run_id: Uuid, source_id: &str) -> AdapterContext {
        AdapterContext {
            run_id,
            min_model_date: self.config.min_model_date,
            today: Utc::now().date_naive(),
            transient_columns: self.rules.transient_columns(source_id),
        }
    }

    /// Fetch every enabled provider; one provider failing never stops the others.
    pub async fn fetch_all(&self, run_id: Uuid) -> Vec<SourceRunReport> {
        let mut reports = Vec::new();
        for adapter in self.adapters() {
            let source_id = adapter.source_id();
            let ctx = self.context(run_id, source_id);
            let span = info_span!("fetch_source", %run_id, source_id);
            let mut report = SourceRunReport::new(source_id);
            match adapter
                .fetch(&self.fetcher, &self.snapshots, &ctx)
                .instrument(span)
                .await
            {
                Ok(fetch) => {
                    if !fetch.empty.is_empty() {
                        error!(source_id, empty = ?fetch.empty, "no files retrieved for some metrics");
                    }
                    report.fetch = Some(fetch);
                }
                Err(err) => {
                    error!(source_id, error = %err, "fetch failed");
                    report.fetch_error = Some(err.to_string());
                }
            }
            reports.push(report);
        }
        reports
    }

    /// Normalize compiled snapshots, merge them and write the merged snapshot files.
    pub async fn merge(&self, run_id: Uuid, reports: &mut Vec<SourceRunReport>) -> Result<MergeReport> {
        let mut frames: Vec<ForecastFrame> = Vec::new();
        for adapter in self.adapters() {
            let source_id = adapter.source_id();
            let ctx = self.context(run_id, source_id);
            let index = match reports.iter().position(|r| r.source_id == source_id) {
                Some(index) => index,
                None => {
                    reports.push(SourceRunReport::new(source_id));
                    reports.len() - 1
                }
            };
            let report = &mut reports[index];
            let span = info_span!("normalize_source", %run_id, source_id);
            match adapter.normalize(&self.snapshots, &ctx).instrument(span).await {
                Ok(output) => {
                    for skipped in &output.skipped_batches {
                        warn!(source_id, batch = %skipped.batch, reason = %skipped.reason, "batch skipped");
                    }
                    report.normalized_rows = output.frame.len();
                    report.skipped_batches = output.skipped_batches;
                    report.clamped_increments = output.clamped_increments;
                    report.dropped_rows = output.dropped_rows;
                    report.unknown_columns = output.unknown_columns;
                    frames.push(output.frame);
                }
                Err(err) => {
                    error!(source_id, error = %err, "normalization failed; provider left out of merge");
                    report.normalize_error = Some(err.to_string());
                }
            }
        }

        let merged = merge_frames(frames, &self.rules, &self.schema);
        let csv = write_merged_snapshot(&self.snapshots, &merged.rows, &self.schema).await?;
        let (parquet, manifest) =
            export_merged(&self.snapshots, &merged.rows, &self.schema, &csv).await?;
        info!(rows = merged.summary.output_rows, sha256 = %csv.content_hash, "merged snapshot written");

        Ok(MergeReport {
            summary: merged.summary,
            merged_snapshot: csv.absolute_path.display().to_string(),
            merged_sha256: csv.content_hash,
            parquet_snapshot: parquet.absolute_path.display().to_string(),
            manifest: manifest.absolute_path.display().to_string(),
        })
    }

    /// Load the current merged snapshot into `store`.
    pub async fn load(
        &self,
        store: &dyn ForecastStore,
        since: Option<NaiveDate>,
    ) -> Result<LoadSummary, LoadError> {
        let lower_bound = since.unwrap_or(self.config.min_model_date);
        let parsed = read_merged_snapshot(&self.snapshots, &self.schema)
            .await?
            .with_context(|| {
                format!(
                    "no merged snapshot in {}; run merge first",
                    self.snapshots.root().display()
                )
            })?;
        load_batch(store, parsed.rows, lower_bound).await
    }

    /// Fetch, merge and load once. The run summary is written even when loading fails.
    pub async fn run_once(
        &self,
        store: &dyn ForecastStore,
        since: Option<NaiveDate>,
    ) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let lower_bound = since.unwrap_or(self.config.min_model_date);
        info!(%run_id, %lower_bound, "run started");

        let mut sources = self.fetch_all(run_id).await;
        let merge = self.merge(run_id, &mut sources).await?;

        store.ensure_table().await.context("ensuring target table")?;
        let (load, load_error, failure) = match self.load(store, Some(lower_bound)).await {
            Ok(summary) => (Some(summary), None, None),
            Err(LoadError::Partition {
                model_date,
                completed,
                source,
            }) => {
                let message = format!("partition {model_date} failed: {source}");
                (Some(*completed), Some(message.clone()), Some(anyhow::anyhow!(message)))
            }
            Err(err) => {
                let message = err.to_string();
                (None, Some(message), Some(anyhow::Error::new(err)))
            }
        };

        let reports_dir = self.config.reports_dir().join(run_id.to_string());
        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            status: if failure.is_some() { "failed" } else { "completed" }.to_string(),
            lower_bound,
            sources,
            merge: Some(merge),
            load,
            load_error,
            reports_dir: reports_dir.display().to_string(),
        };
        write_run_summary(&reports_dir, &summary).await?;

        match failure {
            Some(err) => Err(err.context(format!(
                "run {run_id} failed; see {}",
                reports_dir.join(RUN_SUMMARY_FILE).display()
            ))),
            None => {
                info!(%run_id, status = %summary.status, "run finished");
                Ok(summary)
            }
        }
    }
}

pub async fn write_run_summary(reports_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;
    let path = reports_dir.join(RUN_SUMMARY_FILE);
    let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
