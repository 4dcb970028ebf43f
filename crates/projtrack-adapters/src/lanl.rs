//! LANL quantile forecasts: per-date, per-metric, per-scope CSV files.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use projtrack_core::{
    canonical_location, location_abbr, metric_column, model_version_for_date, ForecastFrame,
    ForecastRow, ModelName, Quantile,
};
use projtrack_storage::{FetchOutcome, HttpFetcher, RawTable, SnapshotStore};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    checked_inner_join, AdapterContext, AdapterError, FetchReport, NormalizeOutput, SkippedBatch,
    SourceAdapter, SourceConfig,
};

pub const SOURCE_ID: &str = "lanl";
pub const DEFAULT_BASE_URL: &str = "https://covid-19.bsvgateway.org/forecast";

const ISSUE_COLUMN: &str = "fcst_date";
const DATE_COLUMN: &str = "dates";
const LOCATION_COLUMN: &str = "location_name";

/// A span of forecast-issue dates sharing one file naming convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamingEra {
    pub name: &'static str,
    /// First issue date covered; `None` is open-ended.
    pub from: Option<(i32, u32, u32)>,
    /// First issue date no longer covered.
    pub until: Option<(i32, u32, u32)>,
    /// Filename suffixes to try, in order.
    pub suffixes: &'static [&'static str],
}

impl NamingEra {
    fn covers(&self, date: NaiveDate) -> bool {
        let after_start = self.from.and_then(ymd).map_or(true, |from| date >= from);
        let before_end = self.until.and_then(ymd).map_or(true, |until| date < until);
        after_start && before_end
    }
}

fn ymd((y, m, d): (i32, u32, u32)) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(y, m, d)
}

pub const NAMING_ERAS: &[NamingEra] = &[
    NamingEra {
        name: "legacy",
        from: None,
        until: Some((2020, 4, 26)),
        suffixes: &[""],
    },
    NamingEra {
        name: "transition",
        from: Some((2020, 4, 26)),
        until: Some((2020, 5, 3)),
        suffixes: &["", "_website"],
    },
    NamingEra {
        name: "website",
        from: Some((2020, 5, 3)),
        until: None,
        suffixes: &["_website"],
    },
];

pub fn naming_era(date: NaiveDate) -> &'static NamingEra {
    NAMING_ERAS
        .iter()
        .find(|era| era.covers(date))
        .unwrap_or(&NAMING_ERAS[NAMING_ERAS.len() - 1])
}

pub fn file_url(base: &str, scope: &str, date: NaiveDate, metric: &str, suffix: &str) -> String {
    let base = base.trim_end_matches('/');
    format!("{base}/{scope}/files/{date}/{metric}/{date}_{metric}_quantiles_{scope}{suffix}.csv")
}

/// Column names for one quantile-level convention (after `.` is stripped from headers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantileConvention {
    pub name: &'static str,
    pub lower: &'static str,
    pub median: &'static str,
    pub upper: &'static str,
}

/// Preference order: the newer 90% interval first, then the 95% interval.
pub const QUANTILE_CONVENTIONS: &[QuantileConvention] = &[
    QuantileConvention {
        name: "90%",
        lower: "q05",
        median: "q50",
        upper: "q95",
    },
    QuantileConvention {
        name: "95%",
        lower: "q025",
        median: "q50",
        upper: "q975",
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LanlMetric {
    Deaths,
    Confirmed,
}

impl LanlMetric {
    pub const ALL: [LanlMetric; 2] = [LanlMetric::Deaths, LanlMetric::Confirmed];

    pub const fn as_str(self) -> &'static str {
        match self {
            LanlMetric::Deaths => "deaths",
            LanlMetric::Confirmed => "confirmed",
        }
    }

    /// Canonical metric holding the running total.
    pub const fn cumulative(self) -> &'static str {
        match self {
            LanlMetric::Deaths => "totdea",
            LanlMetric::Confirmed => "totcon",
        }
    }

    /// Canonical metric holding the per-day increment.
    pub const fn daily(self) -> &'static str {
        match self {
            LanlMetric::Deaths => "deaths",
            LanlMetric::Confirmed => "confirmed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == value)
    }

    pub fn snapshot_name(self) -> String {
        format!("lanl_{}_compiled.csv", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanlScope {
    pub name: &'static str,
    pub location_column: &'static str,
    pub simple_column: &'static str,
}

pub const SCOPES: &[LanlScope] = &[
    LanlScope {
        name: "us",
        location_column: "state",
        simple_column: "simple_state",
    },
    LanlScope {
        name: "global",
        location_column: "countries",
        simple_column: "simple_countries",
    },
];

#[derive(Debug, Clone)]
pub struct LanlAdapter {
    base_url: String,
    metrics: Vec<LanlMetric>,
    scopes: Vec<LanlScope>,
}

impl LanlAdapter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            metrics: LanlMetric::ALL.to_vec(),
            scopes: SCOPES.to_vec(),
        }
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        let mut adapter = Self::new(
            config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        );
        let metrics = config
            .metrics
            .iter()
            .filter_map(|m| LanlMetric::parse(m))
            .collect::<Vec<_>>();
        if !metrics.is_empty() {
            adapter.metrics = metrics;
        }
        let scopes = SCOPES
            .iter()
            .copied()
            .filter(|s| config.scopes.iter().any(|c| c == s.name))
            .collect::<Vec<_>>();
        if !scopes.is_empty() {
            adapter.scopes = scopes;
        }
        adapter
    }

    async fn fetch_metric(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        metric: LanlMetric,
        report: &mut FetchReport,
    ) -> Vec<RawTable> {
        let mut tables = Vec::new();
        for date in ctx.model_dates() {
            let era = naming_era(date);
            for scope in &self.scopes {
                for suffix in era.suffixes {
                    let url = file_url(&self.base_url, scope.name, date, metric.as_str(), suffix);
                    report.requests += 1;
                    let resp = match http.fetch(ctx.run_id, SOURCE_ID, &url).await {
                        Ok(FetchOutcome::Found(resp)) => resp,
                        Ok(FetchOutcome::Missing { status, .. }) => {
                            debug!(%date, scope = scope.name, suffix, status, "no file published");
                            report.missing += 1;
                            continue;
                        }
                        Err(err) => {
                            warn!(%date, scope = scope.name, error = %err, "fetch failed; skipping date");
                            report.failed += 1;
                            continue;
                        }
                    };
                    match RawTable::from_csv_bytes(&resp.body) {
                        Ok(table) => {
                            report.found += 1;
                            tables.push(clean_raw_table(
                                table,
                                scope,
                                metric,
                                date,
                                &ctx.transient_columns,
                            ));
                            // First matching naming convention wins for this date.
                            break;
                        }
                        Err(err) => {
                            warn!(%date, scope = scope.name, error = %err, "unreadable csv; skipping");
                            report.failed += 1;
                        }
                    }
                }
            }
        }
        tables
    }
}

/// Align one raw LANL file with the compiled layout.
///
/// The scope's simplified location column is always dropped, along with any
/// configured transient columns.
pub fn clean_raw_table(
    mut table: RawTable,
    scope: &LanlScope,
    metric: LanlMetric,
    issue: NaiveDate,
    transient_columns: &[String],
) -> RawTable {
    table.drop_columns(&[scope.simple_column]);
    let dropped = table.drop_columns(transient_columns);
    if !dropped.is_empty() {
        debug!(columns = ?dropped, "dropped transient LANL columns");
    }
    table.rename_column(scope.location_column, LOCATION_COLUMN);
    table.set_constant_column("metric", metric.as_str());
    table.map_headers(|h| h.replace('.', ""));
    if !table.has_column(ISSUE_COLUMN) {
        table.set_constant_column(ISSUE_COLUMN, &issue.to_string());
    }
    table
}

#[async_trait]
impl SourceAdapter for LanlAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        store: &SnapshotStore,
        ctx: &AdapterContext,
    ) -> Result<FetchReport, AdapterError> {
        let mut report = FetchReport::new(SOURCE_ID);
        for metric in &self.metrics {
            let span = info_span!("lanl_fetch_metric", run_id = %ctx.run_id, metric = metric.as_str());
            let tables = self
                .fetch_metric(http, ctx, *metric, &mut report)
                .instrument(span)
                .await;
            if tables.is_empty() {
                error!(
                    metric = metric.as_str(),
                    from = %ctx.min_model_date,
                    to = %ctx.today,
                    "no LANL files retrieved for metric"
                );
                report.empty.push(metric.as_str().to_string());
                continue;
            }
            let files = tables.len();
            let compiled = RawTable::concat(tables);
            let name = metric.snapshot_name();
            let stored = store.store_table(&name, &compiled).await?;
            info!(
                metric = metric.as_str(),
                files,
                rows = compiled.len(),
                sha256 = %stored.content_hash,
                "compiled LANL snapshot"
            );
            report.snapshots.push(name);
        }
        Ok(report)
    }

    async fn normalize(
        &self,
        store: &SnapshotStore,
        _ctx: &AdapterContext,
    ) -> Result<NormalizeOutput, AdapterError> {
        let mut per_metric = Vec::new();
        let mut failed_issues = BTreeSet::new();
        let mut output = NormalizeOutput::default();
        for metric in &self.metrics {
            let name = metric.snapshot_name();
            let Some(table) = store.load_table(&name).await? else {
                warn!(snapshot = %name, "compiled LANL snapshot missing; metric skipped");
                continue;
            };
            let series = MetricSeries::from_table(&table, *metric)?;
            output.dropped_rows += series.dropped_rows;
            let (increments, failed) = series.into_increments(&mut output.skipped_batches);
            output.clamped_increments += increments.clamped;
            failed_issues.extend(failed);
            per_metric.push(increments);
        }
        // An issue that failed for one metric is dropped for every metric.
        for increments in &mut per_metric {
            for issue in &failed_issues {
                increments.issues.remove(issue);
            }
        }

        if per_metric.is_empty() {
            return Err(AdapterError::NoData {
                source_id: SOURCE_ID.to_string(),
                detail: "no compiled LANL snapshots".to_string(),
            });
        }
        if output.clamped_increments > 0 {
            warn!(
                clamped = output.clamped_increments,
                "negative daily increments clamped to zero"
            );
        }

        let columns = per_metric
            .iter()
            .flat_map(|m| m.metric.columns())
            .collect::<Vec<_>>();
        let mut frame = ForecastFrame::new(SOURCE_ID, columns);
        let mut by_metric = per_metric.into_iter();
        let first = by_metric.next();
        let second = by_metric.next();
        let issues = match (first, second) {
            (Some(a), Some(b)) => join_metrics(a, b, &mut output.skipped_batches),
            (Some(a), None) | (None, Some(a)) => a.issues,
            (None, None) => BTreeMap::new(),
        };

        for (issue, rows) in issues {
            let model_version = model_version_for_date(issue);
            for ((location, date), metrics) in rows {
                frame.rows.push(ForecastRow {
                    location_abbr: location_abbr(&location).map(str::to_string),
                    location_name: location,
                    date,
                    model_version: model_version.clone(),
                    model_date: issue,
                    model_name: ModelName::Lanl,
                    metrics,
                });
            }
        }
        for skipped in &output.skipped_batches {
            warn!(batch = %skipped.batch, reason = %skipped.reason, "LANL forecast issue skipped");
        }
        info!(rows = frame.len(), "normalized LANL frame");
        output.frame = frame;
        Ok(output)
    }
}

type Triple = [Option<f64>; 3];
type MetricValues = BTreeMap<String, Option<f64>>;
type IssueRows = BTreeMap<(String, NaiveDate), MetricValues>;

#[derive(Debug, Clone, PartialEq)]
struct Observation {
    location: String,
    date: NaiveDate,
    values: Triple,
}

/// One compiled metric table grouped by forecast issue.
#[derive(Debug)]
struct MetricSeries {
    metric: LanlMetric,
    issues: BTreeMap<NaiveDate, Vec<Observation>>,
    dropped_rows: usize,
}

impl MetricSeries {
    fn from_table(table: &RawTable, metric: LanlMetric) -> Result<Self, AdapterError> {
        for column in [ISSUE_COLUMN, DATE_COLUMN, LOCATION_COLUMN] {
            if !table.has_column(column) {
                return Err(AdapterError::MissingColumn {
                    source_id: SOURCE_ID.to_string(),
                    table: metric.snapshot_name(),
                    column: column.to_string(),
                });
            }
        }

        let mut issues: BTreeMap<NaiveDate, Vec<Observation>> = BTreeMap::new();
        let mut dropped_rows = 0;
        for record in table.records() {
            let parsed = (
                record.get(ISSUE_COLUMN).and_then(parse_date),
                record.get(DATE_COLUMN).and_then(parse_date),
                record.get(LOCATION_COLUMN),
            );
            let (Some(issue), Some(date), Some(location)) = parsed else {
                dropped_rows += 1;
                continue;
            };
            let values = QUANTILE_CONVENTIONS
                .iter()
                .map(|c| {
                    [
                        record.get_f64(c.median),
                        record.get_f64(c.lower),
                        record.get_f64(c.upper),
                    ]
                })
                .find(|triple| triple.iter().all(Option::is_some))
                .unwrap_or([None; 3]);
            issues.entry(issue).or_default().push(Observation {
                location: canonical_location(location),
                date,
                values,
            });
        }
        if dropped_rows > 0 {
            warn!(
                metric = metric.as_str(),
                dropped_rows, "rows without issue date, date or location dropped"
            );
        }
        Ok(Self {
            metric,
            issues,
            dropped_rows,
        })
    }

    /// Increments for every issue that passes the integrity checks, plus the
    /// issues that failed them.
    fn into_increments(
        self,
        skipped: &mut Vec<SkippedBatch>,
    ) -> (MetricIncrements, BTreeSet<NaiveDate>) {
        let mut out = MetricIncrements {
            metric: self.metric,
            issues: BTreeMap::new(),
            clamped: 0,
        };
        let mut failed = BTreeSet::new();
        for (issue, observations) in self.issues {
            match issue_increments(self.metric, issue, observations) {
                Ok((rows, clamped)) => {
                    out.clamped += clamped;
                    out.issues.insert(issue, rows);
                }
                Err(err) => {
                    skipped.push(err.to_skipped(SOURCE_ID, &issue.to_string()));
                    failed.insert(issue);
                }
            }
        }
        (out, failed)
    }
}

#[derive(Debug)]
struct MetricIncrements {
    metric: LanlMetric,
    issues: BTreeMap<NaiveDate, IssueRows>,
    clamped: usize,
}

impl LanlMetric {
    fn columns(self) -> Vec<String> {
        [self.cumulative(), self.daily()]
            .into_iter()
            .flat_map(|m| Quantile::ALL.into_iter().map(move |q| metric_column(m, q)))
            .collect()
    }
}

/// Cumulative values and daily increments for one forecast issue of one metric.
///
/// Increments are taken against the previous calendar day of the same
/// location; the first day of a location and days after a gap get none.
/// Negative increments become zero and are counted.
fn issue_increments(
    metric: LanlMetric,
    issue: NaiveDate,
    mut observations: Vec<Observation>,
) -> Result<(IssueRows, usize), AdapterError> {
    observations.sort_by(|a, b| (&a.location, a.date).cmp(&(&b.location, b.date)));

    let mut seen = HashSet::with_capacity(observations.len());
    for obs in &observations {
        if !seen.insert((obs.location.as_str(), obs.date)) {
            return Err(AdapterError::DuplicateKey {
                source_id: SOURCE_ID.to_string(),
                batch: format!("{issue}/{}", metric.as_str()),
                key: format!("{} {}", obs.location, obs.date),
            });
        }
    }

    let mut rows = IssueRows::new();
    let mut clamped = 0;
    let mut previous: Option<&Observation> = None;
    for obs in &observations {
        let prior = previous.filter(|p| {
            p.location == obs.location && p.date.checked_add_days(Days::new(1)) == Some(obs.date)
        });
        let mut values = MetricValues::new();
        for (idx, quantile) in Quantile::ALL.into_iter().enumerate() {
            values.insert(metric_column(metric.cumulative(), quantile), obs.values[idx]);
            let delta = match (prior.and_then(|p| p.values[idx]), obs.values[idx]) {
                (Some(before), Some(now)) => {
                    let delta = now - before;
                    if delta < 0.0 {
                        clamped += 1;
                        Some(0.0)
                    } else {
                        Some(delta)
                    }
                }
                _ => None,
            };
            values.insert(metric_column(metric.daily(), quantile), delta);
        }
        rows.insert((obs.location.clone(), obs.date), values);
        previous = Some(obs);
    }
    Ok((rows, clamped))
}

/// Join two metrics issue by issue; issues carried by only one side pass through.
fn join_metrics(
    left: MetricIncrements,
    right: MetricIncrements,
    skipped: &mut Vec<SkippedBatch>,
) -> BTreeMap<NaiveDate, IssueRows> {
    let mut right_issues = right.issues;
    let mut joined = BTreeMap::new();
    for (issue, left_rows) in left.issues {
        let Some(right_rows) = right_issues.remove(&issue) else {
            joined.insert(issue, left_rows);
            continue;
        };
        let batch = issue.to_string();
        match checked_inner_join(
            SOURCE_ID,
            &batch,
            left_rows.into_iter().collect(),
            right_rows.into_iter().collect(),
        ) {
            Ok(rows) => {
                let merged = rows
                    .into_iter()
                    .map(|(key, mut l, r)| {
                        l.extend(r);
                        (key, l)
                    })
                    .collect();
                joined.insert(issue, merged);
            }
            Err(err) => skipped.push(err.to_skipped(SOURCE_ID, &batch)),
        }
    }
    joined.extend(right_issues);
    joined
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn obs(location: &str, date: NaiveDate, median: f64) -> Observation {
        Observation {
            location: location.to_string(),
            date,
            values: [Some(median), Some(median - 1.0), Some(median + 1.0)],
        }
    }

    #[test]
    fn eras_resolve_by_issue_date() {
        assert_eq!(naming_era(d(2020, 4, 4)).suffixes, &[""]);
        assert_eq!(naming_era(d(2020, 4, 25)).name, "legacy");
        assert_eq!(naming_era(d(2020, 4, 26)).suffixes, &["", "_website"]);
        assert_eq!(naming_era(d(2020, 5, 2)).name, "transition");
        assert_eq!(naming_era(d(2020, 5, 3)).suffixes, &["_website"]);
        assert_eq!(naming_era(d(2021, 1, 1)).name, "website");
    }

    #[test]
    fn file_urls_follow_the_published_layout() {
        assert_eq!(
            file_url(DEFAULT_BASE_URL, "us", d(2020, 5, 3), "deaths", "_website"),
            "https://covid-19.bsvgateway.org/forecast/us/files/2020-05-03/deaths/2020-05-03_deaths_quantiles_us_website.csv"
        );
        assert_eq!(
            file_url("http://localhost/", "global", d(2020, 4, 5), "confirmed", ""),
            "http://localhost/global/files/2020-04-05/confirmed/2020-04-05_confirmed_quantiles_global.csv"
        );
    }

    #[test]
    fn clamped_increment_scenario() {
        let issue = d(2020, 4, 12);
        let observations = vec![
            obs("Ohio", d(2020, 4, 13), 10.0),
            obs("Ohio", d(2020, 4, 14), 8.0),
            obs("Ohio", d(2020, 4, 15), 15.0),
        ];
        let (rows, clamped) = issue_increments(LanlMetric::Deaths, issue, observations).unwrap();
        let deltas = rows
            .values()
            .map(|v| v["deaths_mean"])
            .collect::<Vec<_>>();
        assert_eq!(deltas, vec![None, Some(0.0), Some(7.0)]);
        assert!(clamped >= 1);
        assert!(rows
            .values()
            .flat_map(|v| v.iter())
            .filter(|(k, _)| k.starts_with("deaths_"))
            .all(|(_, v)| v.map_or(true, |x| x >= 0.0)));
        assert_eq!(rows.values().next().unwrap()["totdea_mean"], Some(10.0));
    }

    #[test]
    fn increments_restart_per_location_and_after_gaps() {
        let issue = d(2020, 4, 12);
        let observations = vec![
            obs("Ohio", d(2020, 4, 13), 10.0),
            obs("Iowa", d(2020, 4, 14), 3.0),
            obs("Ohio", d(2020, 4, 16), 20.0),
            obs("Iowa", d(2020, 4, 13), 1.0),
        ];
        let (rows, _) = issue_increments(LanlMetric::Deaths, issue, observations).unwrap();
        assert_eq!(rows[&("Iowa".to_string(), d(2020, 4, 13))]["deaths_mean"], None);
        assert_eq!(rows[&("Iowa".to_string(), d(2020, 4, 14))]["deaths_mean"], Some(2.0));
        assert_eq!(rows[&("Ohio".to_string(), d(2020, 4, 16))]["deaths_mean"], None);
    }

    #[test]
    fn duplicate_observation_is_an_integrity_error() {
        let issue = d(2020, 4, 12);
        let observations = vec![obs("Ohio", d(2020, 4, 13), 1.0), obs("Ohio", d(2020, 4, 13), 2.0)];
        let err = issue_increments(LanlMetric::Deaths, issue, observations).unwrap_err();
        assert!(err.is_batch_local());
    }

    #[test]
    fn quantile_convention_prefers_the_narrower_interval() {
        let table = RawTable::from_csv_bytes(
            b"fcst_date,dates,location_name,q025,q05,q50,q95,q975\n\
              2020-05-03,2020-05-04,US,1,2,3,4,5\n\
              2020-05-03,2020-05-05,US,1,,3,,5\n",
        )
        .unwrap();
        let series = MetricSeries::from_table(&table, LanlMetric::Deaths).unwrap();
        let rows = &series.issues[&d(2020, 5, 3)];
        assert_eq!(rows[0].values, [Some(3.0), Some(2.0), Some(4.0)]);
        assert_eq!(rows[1].values, [Some(3.0), Some(1.0), Some(5.0)]);
        assert_eq!(rows[0].location, "United States of America");
    }

    #[test]
    fn raw_tables_are_cleaned_per_scope() {
        let raw = RawTable::from_csv_bytes(
            b"simple_countries,countries,dates,q.025,q.50\nx,US,2020-04-10,1,2\n",
        )
        .unwrap();
        let cleaned = clean_raw_table(
            raw,
            &SCOPES[1],
            LanlMetric::Confirmed,
            d(2020, 4, 9),
            &["q.025".to_string(), "not_there".to_string()],
        );
        assert_eq!(
            cleaned.headers(),
            ["location_name", "dates", "q50", "metric", "fcst_date"]
        );
        let record = cleaned.records().next().unwrap();
        assert_eq!(record.get("fcst_date"), Some("2020-04-09"));
        assert_eq!(record.get("metric"), Some("confirmed"));
    }

    #[tokio::test]
    async fn issue_failing_for_one_metric_is_left_out_entirely() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let deaths = RawTable::from_csv_bytes(
            b"fcst_date,dates,location_name,q05,q50,q95\n\
              2020-04-12,2020-04-13,Ohio,1,2,3\n\
              2020-04-12,2020-04-13,Ohio,1,2,3\n\
              2020-04-19,2020-04-20,Ohio,4,5,6\n",
        )
        .unwrap();
        let confirmed = RawTable::from_csv_bytes(
            b"fcst_date,dates,location_name,q05,q50,q95\n\
              2020-04-12,2020-04-13,Ohio,10,20,30\n\
              2020-04-19,2020-04-20,Ohio,40,50,60\n",
        )
        .unwrap();
        store
            .store_table(&LanlMetric::Deaths.snapshot_name(), &deaths)
            .await
            .unwrap();
        store
            .store_table(&LanlMetric::Confirmed.snapshot_name(), &confirmed)
            .await
            .unwrap();

        let ctx = AdapterContext {
            run_id: uuid::Uuid::new_v4(),
            min_model_date: d(2020, 4, 12),
            today: d(2020, 4, 19),
            transient_columns: Vec::new(),
        };
        let output = LanlAdapter::new(DEFAULT_BASE_URL)
            .normalize(&store, &ctx)
            .await
            .unwrap();

        assert_eq!(output.skipped_batches.len(), 1);
        assert_eq!(output.skipped_batches[0].batch, "2020-04-12");
        assert!(output.frame.rows.iter().all(|r| r.model_date != d(2020, 4, 12)));
        assert_eq!(output.frame.len(), 1);
        let row = &output.frame.rows[0];
        assert_eq!(row.metric("totdea_mean"), Some(5.0));
        assert_eq!(row.metric("totcon_mean"), Some(50.0));
    }

    #[test]
    fn metric_join_skips_mismatched_issue_and_keeps_one_sided_issues() {
        let a = d(2020, 4, 12);
        let b = d(2020, 4, 13);
        let c = d(2020, 4, 14);
        let mut deaths = MetricIncrements {
            metric: LanlMetric::Deaths,
            issues: BTreeMap::new(),
            clamped: 0,
        };
        let mut confirmed = MetricIncrements {
            metric: LanlMetric::Confirmed,
            issues: BTreeMap::new(),
            clamped: 0,
        };
        let row = |loc: &str, day: NaiveDate| ((loc.to_string(), day), MetricValues::new());
        deaths.issues.insert(a, [row("Ohio", a)].into_iter().collect());
        confirmed.issues.insert(a, [row("Ohio", a)].into_iter().collect());
        deaths.issues.insert(b, [row("Ohio", b), row("Iowa", b)].into_iter().collect());
        confirmed.issues.insert(b, [row("Ohio", b)].into_iter().collect());
        confirmed.issues.insert(c, [row("Ohio", c)].into_iter().collect());

        let mut skipped = Vec::new();
        let joined = join_metrics(deaths, confirmed, &mut skipped);
        assert_eq!(joined.keys().copied().collect::<Vec<_>>(), vec![a, c]);
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].batch, b.to_string());
    }
}
