//! Columbia University (Shaman lab) county projections, read from a local drop directory.
//!
//! Each release directory `original_format/Projection_<MonthDay>/` holds, per
//! intervention scenario, one `bed_*` file and one `Projection_*` file that
//! are joined on (`county`, `Date`).

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use projtrack_core::{
    location_abbr, metric_column, model_version_for_date, CuScenario, ForecastFrame, ForecastRow,
    ModelName, Quantile,
};
use projtrack_storage::{HttpFetcher, RawTable, SnapshotStore};
use tracing::{debug, info, warn};

use crate::{
    checked_inner_join, AdapterContext, AdapterError, FetchReport, NormalizeOutput, SourceAdapter,
    SourceConfig,
};

pub const SOURCE_ID: &str = "cu-shaman";

const RELEASE_PREFIX: &str = "Projection_";
/// Release with an incompatible layout.
const IGNORED_RELEASE: &str = "_March13";
const RELEASE_YEAR: i32 = 2020;

/// Provider metric stem -> canonical metric.
const METRIC_MAP: &[(&str, &str)] = &[
    ("ICU_need", "ICUbed"),
    ("death", "totdea"),
    ("hosp_need", "allbed"),
    ("vent_need", "InvVen"),
];

/// Provider quantile suffix -> canonical quantile.
const QUANTILE_MAP: &[(&str, Quantile)] = &[
    ("50", Quantile::Mean),
    ("2.5", Quantile::Lower),
    ("97.5", Quantile::Upper),
];

const DATE_FORMATS: &[&str] = &["%m/%d/%y", "%m/%d/%Y", "%Y-%m-%d"];

#[derive(Debug, Clone)]
pub struct CuAdapter {
    root: Option<PathBuf>,
}

impl CuAdapter {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        Self::new(config.local_dir.clone())
    }
}

/// `Projection_April26` -> 2020-04-26.
pub fn release_date(dir_name: &str) -> Option<NaiveDate> {
    let month_day = dir_name.strip_prefix(RELEASE_PREFIX)?;
    NaiveDate::parse_from_str(&format!("{month_day} {RELEASE_YEAR}"), "%B%d %Y").ok()
}

fn parse_cu_date(value: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
}

/// Decode ISO-8859-1 bytes; every byte maps to the code point of the same value.
fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

fn read_latin1_table(path: &Path) -> anyhow::Result<RawTable> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    RawTable::from_csv_bytes(decode_latin1(&bytes).as_bytes())
        .with_context(|| format!("parsing {}", path.display()))
}

fn release_dirs(root: &Path) -> anyhow::Result<Vec<(String, PathBuf)>> {
    let base = root.join("original_format");
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(&base).with_context(|| format!("listing {}", base.display()))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if entry.path().is_dir() && name.contains(RELEASE_PREFIX) && !name.contains(IGNORED_RELEASE) {
            dirs.push((name, entry.path()));
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// The single bed file and single projection file for a scenario, if exactly one of each exists.
fn scenario_files(dir: &Path, scenario: CuScenario) -> anyhow::Result<Option<(PathBuf, PathBuf)>> {
    let token = scenario.file_token();
    let mut beds = Vec::new();
    let mut projections = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.contains(".csv") || !name.contains(token) {
            continue;
        }
        if name.contains("bed_") {
            beds.push(entry.path());
        }
        if name.contains(RELEASE_PREFIX) {
            projections.push(entry.path());
        }
    }
    if beds.len() != 1 || projections.len() != 1 {
        return Ok(None);
    }
    Ok(beds.pop().zip(projections.pop()))
}

/// Join one scenario's projection and bed tables into canonical rows.
pub fn scenario_rows(
    scenario: CuScenario,
    release: NaiveDate,
    projection: &RawTable,
    bed: &RawTable,
) -> Result<Vec<ForecastRow>, AdapterError> {
    let model_name = ModelName::Cu(scenario);
    let batch = format!("{model_name}/{release}");
    for (table, label) in [(projection, "projection"), (bed, "bed")] {
        for column in ["county", "Date"] {
            if !table.has_column(column) {
                return Err(AdapterError::MissingColumn {
                    source_id: SOURCE_ID.to_string(),
                    table: format!("{batch} {label}"),
                    column: column.to_string(),
                });
            }
        }
    }

    let keyed = |table: &RawTable| {
        table
            .records()
            .enumerate()
            .map(|(idx, r)| {
                let key = (
                    r.get("county").unwrap_or_default().to_string(),
                    r.get("Date").unwrap_or_default().to_string(),
                );
                (key, idx)
            })
            .collect::<Vec<_>>()
    };
    let joined = checked_inner_join(SOURCE_ID, &batch, keyed(projection), keyed(bed))?;

    let projection_rows = projection.records().collect::<Vec<_>>();
    let bed_rows = bed.records().collect::<Vec<_>>();
    let model_version = model_version_for_date(release);
    let mut rows = Vec::with_capacity(joined.len());
    let mut undated = 0usize;
    for ((county, raw_date), p, b) in joined {
        let Some(date) = parse_cu_date(&raw_date) else {
            undated += 1;
            continue;
        };
        let mut metrics = std::collections::BTreeMap::new();
        for (stem, canonical) in METRIC_MAP {
            for (suffix, quantile) in QUANTILE_MAP {
                let column = format!("{stem}_{suffix}");
                let value = projection_rows[p]
                    .get_f64(&column)
                    .or_else(|| bed_rows[b].get_f64(&column));
                metrics.insert(metric_column(canonical, *quantile), value);
            }
        }
        rows.push(ForecastRow {
            location_abbr: location_abbr(&county).map(str::to_string),
            location_name: county,
            date,
            model_version: model_version.clone(),
            model_date: release,
            model_name,
            metrics,
        });
    }
    if undated > 0 {
        warn!(batch = %batch, undated, "rows with unparseable Date dropped");
    }
    Ok(rows)
}

/// Read and join one scenario of one release; `Ok(None)` when its files are absent or ambiguous.
fn scenario_batch(
    dir: &Path,
    scenario: CuScenario,
    release: NaiveDate,
) -> Result<Option<Vec<ForecastRow>>, AdapterError> {
    let Some((bed_path, projection_path)) = scenario_files(dir, scenario)? else {
        return Ok(None);
    };
    let bed = read_latin1_table(&bed_path)?;
    let projection = read_latin1_table(&projection_path)?;
    scenario_rows(scenario, release, &projection, &bed).map(Some)
}

fn frame_columns() -> Vec<String> {
    METRIC_MAP
        .iter()
        .flat_map(|(_, canonical)| QUANTILE_MAP.iter().map(move |(_, q)| metric_column(canonical, *q)))
        .collect()
}

#[async_trait]
impl SourceAdapter for CuAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    /// Releases are dropped into the local directory out of band; nothing to download.
    async fn fetch(
        &self,
        _http: &HttpFetcher,
        _store: &SnapshotStore,
        _ctx: &AdapterContext,
    ) -> Result<FetchReport, AdapterError> {
        let mut report = FetchReport::new(SOURCE_ID);
        if self.root.is_none() {
            report.empty.push("local_dir".to_string());
        }
        Ok(report)
    }

    async fn normalize(
        &self,
        _store: &SnapshotStore,
        ctx: &AdapterContext,
    ) -> Result<NormalizeOutput, AdapterError> {
        let Some(root) = &self.root else {
            return Err(AdapterError::NoData {
                source_id: SOURCE_ID.to_string(),
                detail: "no local directory configured".to_string(),
            });
        };

        let mut releases = Vec::new();
        for (name, dir) in release_dirs(root)? {
            match release_date(&name) {
                Some(release) if release >= ctx.min_model_date => releases.push((name, dir, release)),
                Some(_) => {}
                None => warn!(release = %name, "release directory name has no month/day"),
            }
        }

        let mut output = NormalizeOutput::default();
        let mut frame = ForecastFrame::new(SOURCE_ID, frame_columns());
        for scenario in CuScenario::ALL {
            for (name, dir, release) in &releases {
                let batch = format!("{}/{release}", ModelName::Cu(scenario));
                match scenario_batch(dir, scenario, *release) {
                    Ok(Some(rows)) => frame.rows.extend(rows),
                    Ok(None) => {
                        debug!(release = %name, scenario = scenario.file_token(), "scenario not found");
                    }
                    Err(err) => {
                        warn!(batch = %batch, error = %err, "CU batch skipped");
                        output.skipped_batches.push(err.to_skipped(SOURCE_ID, &batch));
                    }
                }
            }
        }
        info!(rows = frame.len(), "normalized CU frame");
        output.frame = frame;
        Ok(output)
    }
}
