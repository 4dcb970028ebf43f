//! Incremental insert-or-ignore loader, one model-date partition at a time.

use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDate;
use projtrack_core::{model_date_from_version, ForecastRow};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};

use crate::store::{ForecastStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionSummary {
    pub model_date: NaiveDate,
    pub attempted: usize,
    pub inserted: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub lower_bound: Option<NaiveDate>,
    pub partitions: Vec<PartitionSummary>,
    pub duplicates_dropped: usize,
    pub rows_before_bound: usize,
    pub unparseable_versions: usize,
    pub rows_inserted: u64,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("target table rejected: {0}")]
    Table(#[source] StoreError),
    #[error("partition {model_date} failed after {} committed partitions: {source}", .completed.partitions.len())]
    Partition {
        model_date: NaiveDate,
        /// Partitions committed before the failure; they stay in the table.
        completed: Box<LoadSummary>,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Snapshot(#[from] anyhow::Error),
}

/// Load a merged batch, inserting only partitions with `model_date >= lower_bound`.
///
/// Partitions are committed independently and in ascending order, so a failure
/// leaves every earlier partition in place and the run can simply be repeated.
pub async fn load_batch(
    store: &dyn ForecastStore,
    rows: Vec<ForecastRow>,
    lower_bound: NaiveDate,
) -> Result<LoadSummary, LoadError> {
    store.validate_table().await.map_err(LoadError::Table)?;

    let mut summary = LoadSummary {
        lower_bound: Some(lower_bound),
        ..LoadSummary::default()
    };
    let partitions = partition_rows(rows, lower_bound, &mut summary);

    if summary.duplicates_dropped > 0 {
        warn!(count = summary.duplicates_dropped, "duplicate keys dropped from batch");
    }
    if summary.unparseable_versions > 0 {
        warn!(count = summary.unparseable_versions, "rows with underivable model_version dropped");
    }

    for (model_date, rows) in partitions {
        let span = info_span!("load_partition", %model_date, rows = rows.len());
        match store.insert_ignore(model_date, &rows).instrument(span).await {
            Ok(inserted) => {
                summary.rows_inserted += inserted;
                summary.partitions.push(PartitionSummary {
                    model_date,
                    attempted: rows.len(),
                    inserted,
                });
            }
            Err(source) => {
                error!(%model_date, error = %source, "partition insert failed");
                return Err(LoadError::Partition {
                    model_date,
                    completed: Box::new(summary),
                    source,
                });
            }
        }
    }

    info!(
        partitions = summary.partitions.len(),
        inserted = summary.rows_inserted,
        skipped_before_bound = summary.rows_before_bound,
        "load finished"
    );
    Ok(summary)
}

/// Re-derive `model_date`, drop in-batch duplicate keys (first wins) and
/// group the rows at or after the bound by model date.
fn partition_rows(
    rows: Vec<ForecastRow>,
    lower_bound: NaiveDate,
    summary: &mut LoadSummary,
) -> BTreeMap<NaiveDate, Vec<ForecastRow>> {
    let mut seen = HashSet::with_capacity(rows.len());
    let mut partitions: BTreeMap<NaiveDate, Vec<ForecastRow>> = BTreeMap::new();

    for mut row in rows {
        match model_date_from_version(&row.model_version) {
            Ok(model_date) => row.model_date = model_date,
            Err(_) => {
                summary.unparseable_versions += 1;
                continue;
            }
        }
        if !seen.insert(row.key()) {
            summary.duplicates_dropped += 1;
            continue;
        }
        if row.model_date < lower_bound {
            summary.rows_before_bound += 1;
            continue;
        }
        partitions.entry(row.model_date).or_default().push(row);
    }
    partitions
}
