//! Provider adapters: fetch raw forecast files and normalize them into canonical rows.

use std::collections::HashMap;
use std::hash::Hash;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use projtrack_core::ForecastFrame;
use projtrack_storage::{HttpFetcher, SnapshotStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod cu;
pub mod ihme;
pub mod lanl;

pub const CRATE_NAME: &str = "projtrack-adapters";

/// One entry of the provider registry file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub listing_url: Option<String>,
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub local_dir: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    /// Earliest forecast-issue date to fetch.
    pub min_model_date: NaiveDate,
    pub today: NaiveDate,
    /// Known diagnostic columns for this provider, dropped before normalization.
    pub transient_columns: Vec<String>,
}

impl AdapterContext {
    /// Every calendar date from the lower bound through today, both ends included.
    pub fn model_dates(&self) -> Vec<NaiveDate> {
        let mut dates = Vec::new();
        let mut current = self.min_model_date;
        while current <= self.today {
            dates.push(current);
            match current.checked_add_days(Days::new(1)) {
                Some(next) => current = next,
                None => break,
            }
        }
        dates
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchReport {
    pub source_id: String,
    pub requests: usize,
    pub found: usize,
    pub missing: usize,
    pub failed: usize,
    pub snapshots: Vec<String>,
    /// Metrics (or archives) for which nothing at all was retrieved.
    pub empty: Vec<String>,
}

impl FetchReport {
    pub fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedBatch {
    pub source_id: String,
    pub batch: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizeOutput {
    pub frame: ForecastFrame,
    pub skipped_batches: Vec<SkippedBatch>,
    pub clamped_increments: usize,
    pub dropped_rows: usize,
    pub unknown_columns: Vec<String>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("{source_id}: no data available ({detail})")]
    NoData { source_id: String, detail: String },
    #[error(
        "{source_id} batch {batch}: join changed row count (left {left_rows}, right {right_rows}, joined {joined_rows})"
    )]
    Integrity {
        source_id: String,
        batch: String,
        left_rows: usize,
        right_rows: usize,
        joined_rows: usize,
    },
    #[error("{source_id} batch {batch}: duplicate key {key}")]
    DuplicateKey {
        source_id: String,
        batch: String,
        key: String,
    },
    #[error("{source_id}: required column `{column}` missing from {table}")]
    MissingColumn {
        source_id: String,
        table: String,
        column: String,
    },
    #[error(transparent)]
    Schema(#[from] projtrack_core::SchemaError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    /// Batch-local failures that skip one forecast issue rather than the provider.
    pub fn is_batch_local(&self) -> bool {
        matches!(self, AdapterError::Integrity { .. } | AdapterError::DuplicateKey { .. })
    }

    pub(crate) fn to_skipped(&self, source_id: &str, batch: &str) -> SkippedBatch {
        SkippedBatch {
            source_id: source_id.to_string(),
            batch: batch.to_string(),
            reason: self.to_string(),
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Retrieve raw files and write this provider's compiled snapshot(s).
    async fn fetch(
        &self,
        http: &HttpFetcher,
        store: &SnapshotStore,
        ctx: &AdapterContext,
    ) -> Result<FetchReport, AdapterError>;

    /// Turn the compiled snapshot(s) into canonical rows.
    async fn normalize(
        &self,
        store: &SnapshotStore,
        ctx: &AdapterContext,
    ) -> Result<NormalizeOutput, AdapterError>;
}

pub fn adapter_for_source(config: &SourceConfig) -> Option<Box<dyn SourceAdapter>> {
    match config.source_id.as_str() {
        lanl::SOURCE_ID => Some(Box::new(lanl::LanlAdapter::from_config(config))),
        ihme::SOURCE_ID => Some(Box::new(ihme::IhmeAdapter::from_config(config))),
        cu::SOURCE_ID => Some(Box::new(cu::CuAdapter::from_config(config))),
        _ => None,
    }
}

/// Inner join of two keyed row sets that must not change the row count.
///
/// Succeeds only when every left row matches exactly one right row and
/// vice versa.
pub(crate) fn checked_inner_join<K, L, R>(
    source_id: &str,
    batch: &str,
    left: Vec<(K, L)>,
    right: Vec<(K, R)>,
) -> Result<Vec<(K, L, R)>, AdapterError>
where
    K: Eq + Hash + Clone,
    L: Clone,
    R: Clone,
{
    let left_rows = left.len();
    let right_rows = right.len();
    let mut by_key: HashMap<K, Vec<R>> = HashMap::with_capacity(right_rows);
    for (key, value) in right {
        by_key.entry(key).or_default().push(value);
    }

    let mut joined = Vec::with_capacity(left_rows);
    for (key, l) in left {
        let Some(matches) = by_key.get(&key) else {
            continue;
        };
        for r in matches {
            joined.push((key.clone(), l.clone(), r.clone()));
        }
    }

    if joined.len() != left_rows || joined.len() != right_rows {
        return Err(AdapterError::Integrity {
            source_id: source_id.to_string(),
            batch: batch.to_string(),
            left_rows,
            right_rows,
            joined_rows: joined.len(),
        });
    }
    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(from: (i32, u32, u32), to: (i32, u32, u32)) -> AdapterContext {
        AdapterContext {
            run_id: Uuid::new_v4(),
            min_model_date: NaiveDate::from_ymd_opt(from.0, from.1, from.2).unwrap(),
            today: NaiveDate::from_ymd_opt(to.0, to.1, to.2).unwrap(),
            transient_columns: Vec::new(),
        }
    }

    #[test]
    fn model_dates_include_both_ends() {
        let dates = ctx((2020, 4, 29), (2020, 5, 2)).model_dates();
        assert_eq!(dates.len(), 4);
        assert_eq!(dates[0].to_string(), "2020-04-29");
        assert_eq!(dates[3].to_string(), "2020-05-02");
        assert!(ctx((2020, 5, 3), (2020, 5, 2)).model_dates().is_empty());
    }

    #[test]
    fn checked_join_accepts_one_to_one_matches() {
        let left = vec![(1, "a"), (2, "b")];
        let right = vec![(2, 'y'), (1, 'x')];
        let joined = checked_inner_join("lanl", "2020-04-12", left, right).unwrap();
        assert_eq!(joined, vec![(1, "a", 'x'), (2, "b", 'y')]);
    }

    #[test]
    fn checked_join_rejects_fan_out_and_orphans() {
        let fan_out = checked_inner_join("cu", "b", vec![(1, ())], vec![(1, ()), (1, ())]);
        assert!(matches!(
            fan_out,
            Err(AdapterError::Integrity { joined_rows: 2, .. })
        ));
        let orphan = checked_inner_join("cu", "b", vec![(1, ()), (2, ())], vec![(1, ())]);
        assert!(orphan.unwrap_err().is_batch_local());
    }

    #[test]
    fn registry_resolves_known_sources() {
        let config = |id: &str| SourceConfig {
            source_id: id.to_string(),
            display_name: id.to_string(),
            enabled: true,
            base_url: None,
            listing_url: None,
            metrics: Vec::new(),
            scopes: Vec::new(),
            local_dir: None,
        };
        for id in [lanl::SOURCE_ID, ihme::SOURCE_ID, cu::SOURCE_ID] {
            let adapter = adapter_for_source(&config(id)).expect("registered");
            assert_eq!(adapter.source_id(), id);
        }
        assert!(adapter_for_source(&config("yyg")).is_none());
    }
}
