//! Union of provider frames into one canonical batch, plus the merged snapshot file.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use projtrack_core::{
    canonical_location, location_abbr, model_date_from_version, CanonicalSchema, ForecastFrame,
    ForecastRow, ModelName,
};
use projtrack_storage::{RawTable, SnapshotStore, StoredSnapshot};
use serde::Serialize;
use tracing::{info, warn};

use crate::rules::PipelineRules;

pub const MERGED_SNAPSHOT: &str = "merged_projections.csv";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub input_rows: BTreeMap<String, usize>,
    pub excluded_rows: usize,
    pub excluded_versions: BTreeSet<String>,
    pub discarded_columns: BTreeSet<String>,
    pub output_rows: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedBatch {
    pub rows: Vec<ForecastRow>,
    pub summary: MergeSummary,
}

/// Concatenate provider frames, drop denylisted versions and project every
/// row onto exactly the canonical metric columns.
pub fn merge_frames(
    frames: Vec<ForecastFrame>,
    rules: &PipelineRules,
    schema: &CanonicalSchema,
) -> MergedBatch {
    let denylist = rules.denylist();
    let metric_columns = schema.metric_columns();
    let mut summary = MergeSummary::default();
    let mut rows = Vec::with_capacity(frames.iter().map(ForecastFrame::len).sum());

    for frame in frames {
        *summary.input_rows.entry(frame.source_id.clone()).or_default() += frame.len();
        for column in &frame.columns {
            if !schema.is_metric_column(column) {
                summary.discarded_columns.insert(column.clone());
            }
        }
        for row in frame.rows {
            if denylist.contains(row.model_version.as_str()) {
                summary.excluded_rows += 1;
                summary.excluded_versions.insert(row.model_version);
                continue;
            }
            rows.push(project_row(row, &metric_columns, &mut summary.discarded_columns));
        }
    }

    if summary.excluded_rows > 0 {
        info!(
            rows = summary.excluded_rows,
            versions = ?summary.excluded_versions,
            "denylisted model versions excluded"
        );
    }
    if !summary.discarded_columns.is_empty() {
        warn!(columns = ?summary.discarded_columns, "non-canonical columns discarded at merge");
    }
    summary.output_rows = rows.len();
    MergedBatch { rows, summary }
}

fn project_row(
    row: ForecastRow,
    metric_columns: &[&str],
    discarded: &mut BTreeSet<String>,
) -> ForecastRow {
    let ForecastRow {
        location_name,
        location_abbr: provider_abbr,
        date,
        model_version,
        model_date,
        model_name,
        mut metrics,
    } = row;

    let projected = metric_columns
        .iter()
        .map(|c| (c.to_string(), metrics.remove(*c).flatten()))
        .collect();
    discarded.extend(metrics.into_keys());

    let location_name = canonical_location(&location_name);
    let location_abbr = location_abbr(&location_name)
        .map(str::to_string)
        .or(provider_abbr);
    ForecastRow {
        location_name,
        location_abbr,
        date,
        model_version,
        model_date,
        model_name,
        metrics: projected,
    }
}

/// Render rows in canonical column order.
pub fn rows_to_table(rows: &[ForecastRow], schema: &CanonicalSchema) -> RawTable {
    let mut table = RawTable::new(schema.column_names().iter().map(|c| c.to_string()).collect());
    for row in rows {
        let cells = schema
            .fields()
            .iter()
            .map(|field| match field.name.as_str() {
                "location_name" => row.location_name.clone(),
                "location_abbr" => row.location_abbr.clone().unwrap_or_default(),
                "date" => row.date.to_string(),
                "model_version" => row.model_version.clone(),
                "model_date" => row.model_date.to_string(),
                "model_name" => row.model_name.to_string(),
                column => row.metric(column).map(|v| v.to_string()).unwrap_or_default(),
            })
            .collect();
        table.push_row(cells);
    }
    table
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedRows {
    pub rows: Vec<ForecastRow>,
    pub rejected: usize,
}

/// Read rows back from a merged snapshot, binding columns by name.
pub fn table_to_rows(table: &RawTable, schema: &CanonicalSchema) -> Result<ParsedRows> {
    let missing = schema.missing_from(table.headers());
    if !missing.is_empty() {
        anyhow::bail!("merged snapshot is missing canonical columns: {}", missing.join(", "));
    }
    let metric_columns = schema.metric_columns();

    let mut parsed = ParsedRows::default();
    for record in table.records() {
        let fields = (
            record.get("location_name"),
            record.get("date").and_then(parse_date),
            record.get("model_version"),
            record.get("model_name").and_then(|m| m.parse::<ModelName>().ok()),
        );
        let (Some(location_name), Some(date), Some(model_version), Some(model_name)) = fields
        else {
            parsed.rejected += 1;
            continue;
        };
        let model_date = record
            .get("model_date")
            .and_then(parse_date)
            .or_else(|| model_date_from_version(model_version).ok());
        let Some(model_date) = model_date else {
            parsed.rejected += 1;
            continue;
        };
        parsed.rows.push(ForecastRow {
            location_name: location_name.to_string(),
            location_abbr: record.get("location_abbr").map(str::to_string),
            date,
            model_version: model_version.to_string(),
            model_date,
            model_name,
            metrics: metric_columns
                .iter()
                .map(|c| (c.to_string(), record.get_f64(c)))
                .collect(),
        });
    }
    Ok(parsed)
}

pub async fn write_merged_snapshot(
    store: &SnapshotStore,
    rows: &[ForecastRow],
    schema: &CanonicalSchema,
) -> Result<StoredSnapshot> {
    let table = rows_to_table(rows, schema);
    store
        .store_table(MERGED_SNAPSHOT, &table)
        .await
        .context("writing merged snapshot")
}

pub async fn read_merged_snapshot(
    store: &SnapshotStore,
    schema: &CanonicalSchema,
) -> Result<Option<ParsedRows>> {
    let Some(table) = store.load_table(MERGED_SNAPSHOT).await? else {
        return Ok(None);
    };
    let parsed = table_to_rows(&table, schema)?;
    if parsed.rejected > 0 {
        warn!(rejected = parsed.rejected, "merged snapshot rows without a usable key rejected");
    }
    Ok(Some(parsed))
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use projtrack_core::US_CANONICAL_NAME;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn row(model_name: ModelName, version: &str, location: &str, metrics: &[(&str, f64)]) -> ForecastRow {
        ForecastRow {
            location_name: location.to_string(),
            location_abbr: None,
            date: d(2020, 4, 10),
            model_version: version.to_string(),
            model_date: model_date_from_version(version).unwrap(),
            model_name,
            metrics: metrics
                .iter()
                .map(|(k, v)| (k.to_string(), Some(*v)))
                .collect(),
        }
    }

    fn rules() -> PipelineRules {
        PipelineRules::new(
            vec![crate::rules::ExcludedVersion {
                version: "2020_04_05.05.us".into(),
                reason: "corrupted timestamps".into(),
            }],
            BTreeMap::new(),
        )
    }

    #[test]
    fn denylisted_versions_never_reach_the_merged_batch() {
        let mut ihme = ForecastFrame::new("ihme", vec!["allbed_mean".into()]);
        ihme.rows.push(row(ModelName::Ihme, "2020_04_05.05.us", "Ohio", &[("allbed_mean", 1.0)]));
        ihme.rows.push(row(ModelName::Ihme, "2020_04_05.08.all", "Ohio", &[("allbed_mean", 2.0)]));

        let merged = merge_frames(vec![ihme], &rules(), &CanonicalSchema::standard());
        assert_eq!(merged.rows.len(), 1);
        assert!(merged.rows.iter().all(|r| r.model_version != "2020_04_05.05.us"));
        assert_eq!(merged.summary.excluded_rows, 1);
        assert_eq!(merged.summary.output_rows, 1);
    }

    #[test]
    fn disjoint_provider_columns_converge_on_the_canonical_set() {
        let schema = CanonicalSchema::standard();
        let mut ihme = ForecastFrame::new("ihme", vec!["allbed_mean".into(), "est_infections_mean".into()]);
        ihme.rows.push(row(
            ModelName::Ihme,
            "2020_04_09.04",
            "US",
            &[("allbed_mean", 5.0), ("est_infections_mean", 9.0)],
        ));
        let mut lanl = ForecastFrame::new("lanl", vec!["totcon_mean".into()]);
        lanl.rows.push(row(ModelName::Lanl, "2020_04_12", "New York", &[("totcon_mean", 3.0)]));

        let merged = merge_frames(vec![ihme, lanl], &rules(), &schema);
        let expected = schema.metric_columns();
        for r in &merged.rows {
            let keys = r.metrics.keys().map(String::as_str).collect::<BTreeSet<_>>();
            assert_eq!(keys, expected.iter().copied().collect::<BTreeSet<_>>());
        }
        assert!(merged.summary.discarded_columns.contains("est_infections_mean"));
        assert_eq!(merged.rows[0].location_name, US_CANONICAL_NAME);
        assert_eq!(merged.rows[0].location_abbr.as_deref(), Some("US"));
        assert_eq!(merged.rows[1].metric("allbed_mean"), None);
        assert_eq!(merged.rows[1].location_abbr.as_deref(), Some("NY"));

        let table = rows_to_table(&merged.rows, &schema);
        assert_eq!(table.headers().len(), schema.fields().len());
        assert!(!table.has_column("est_infections_mean"));
    }

    #[test]
    fn column_set_is_stable_across_runs_with_different_diagnostics() {
        let schema = CanonicalSchema::standard();
        let first = {
            let mut f = ForecastFrame::new("ihme", vec!["allbed_mean".into(), "mobility_composite".into()]);
            f.rows.push(row(ModelName::Ihme, "2020_04_09.04", "Ohio", &[("allbed_mean", 1.0), ("mobility_composite", 0.3)]));
            f
        };
        let second = {
            let mut f = ForecastFrame::new("ihme", vec!["allbed_mean".into(), "total_tests".into()]);
            f.rows.push(row(ModelName::Ihme, "2020_04_10", "Ohio", &[("allbed_mean", 1.0), ("total_tests", 10.0)]));
            f
        };
        let a = rows_to_table(&merge_frames(vec![first], &rules(), &schema).rows, &schema);
        let b = rows_to_table(&merge_frames(vec![second], &rules(), &schema).rows, &schema);
        assert_eq!(a.headers(), b.headers());
    }

    #[test]
    fn merged_table_binds_back_by_column_name() {
        let schema = CanonicalSchema::standard();
        let mut frame = ForecastFrame::new("lanl", vec!["totdea_mean".into()]);
        frame.rows.push(row(ModelName::Lanl, "2020_04_12", "Ohio", &[("totdea_mean", 12.5)]));
        let merged = merge_frames(vec![frame], &rules(), &schema);
        let table = rows_to_table(&merged.rows, &schema);

        // Reversed column order must not matter.
        let mut headers = table.headers().to_vec();
        headers.reverse();
        let mut reversed = RawTable::new(headers.clone());
        for record in table.records() {
            reversed.push_row(
                headers
                    .iter()
                    .map(|h| record.get(h).unwrap_or_default().to_string())
                    .collect(),
            );
        }
        let parsed = table_to_rows(&reversed, &schema).unwrap();
        assert_eq!(parsed.rejected, 0);
        assert_eq!(parsed.rows, merged.rows);
    }

    #[test]
    fn snapshot_missing_canonical_columns_is_rejected() {
        let table = RawTable::new(vec!["location_name".into(), "date".into()]);
        assert!(table_to_rows(&table, &CanonicalSchema::standard()).is_err());
    }
}
