//! IHME projections: zipped per-release archives listed on the downloads page.

use std::collections::BTreeSet;
use std::io::{Cursor, Read};

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use projtrack_core::{
    canonical_location, location_abbr, model_date_from_version, CanonicalSchema, ForecastFrame,
    ForecastRow, ModelName, US_CANONICAL_NAME,
};
use projtrack_storage::{FetchOutcome, HttpFetcher, RawTable, SnapshotStore};
use scraper::{Html, Selector};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{AdapterContext, AdapterError, FetchReport, NormalizeOutput, SourceAdapter, SourceConfig};

pub const SOURCE_ID: &str = "ihme";
pub const DEFAULT_SITE_URL: &str = "http://www.healthdata.org";
pub const DEFAULT_LISTING_URL: &str = "http://www.healthdata.org/covid/data-downloads";
pub const SNAPSHOT_NAME: &str = "ihme_compiled.csv";

const STORAGE_MARKER: &str = "ihmecovid19storage";
const SITE_HOSTED_MARKER: &str = "/sites/default/";
const GENERIC_FOLDER: &str = "ihme-covid19";

/// Columns that break the compiled layout; removed while compiling.
const COMPILE_DROP_COLUMNS: &[&str] = &["V1", "Unnamed: 0", "location", "location_id"];
const ID_COLUMNS: &[&str] = &["location_name", "date", "model_version", "location_abbr"];

#[derive(Debug, Clone)]
pub struct IhmeAdapter {
    site_url: String,
    listing_url: String,
}

impl IhmeAdapter {
    pub fn new(site_url: impl Into<String>, listing_url: impl Into<String>) -> Self {
        Self {
            site_url: site_url.into(),
            listing_url: listing_url.into(),
        }
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        Self::new(
            config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_SITE_URL.to_string()),
            config
                .listing_url
                .clone()
                .unwrap_or_else(|| DEFAULT_LISTING_URL.to_string()),
        )
    }
}

/// Archive links from the downloads page, oldest first.
///
/// The page lists the latest release first and older ones after it, so the
/// first link is moved to the end. Site-hosted links are made absolute.
pub fn discover_archive_urls(html: &str, site_url: &str) -> Result<Vec<String>, AdapterError> {
    let document = Html::parse_document(html);
    let paragraphs = Selector::parse("p").map_err(|e| AdapterError::Message(e.to_string()))?;
    let links = Selector::parse("a[href]").map_err(|e| AdapterError::Message(e.to_string()))?;

    let mut urls = Vec::new();
    for paragraph in document.select(&paragraphs) {
        let hrefs = paragraph
            .select(&links)
            .filter_map(|a| a.value().attr("href"))
            .map(str::trim)
            .collect::<Vec<_>>();
        if !hrefs.iter().any(|h| h.contains(STORAGE_MARKER)) {
            continue;
        }
        urls.extend(hrefs.into_iter().map(str::to_string));
    }

    if !urls.is_empty() {
        let latest = urls.remove(0);
        urls.push(latest);
    }
    let site_url = site_url.trim_end_matches('/');
    Ok(urls
        .into_iter()
        .map(|u| {
            if u.contains(SITE_HOSTED_MARKER) && u.starts_with('/') {
                format!("{site_url}{u}")
            } else {
                u
            }
        })
        .collect())
}

/// Release identifier: the archive's top-level folder, or the URL's parent
/// segment when the folder carries the generic name.
pub fn model_version_for_archive(first_entry: &str, url: &str) -> String {
    let folder = first_entry
        .trim_end_matches('/')
        .split('/')
        .next()
        .unwrap_or_default();
    if folder != GENERIC_FOLDER && !folder.is_empty() {
        return folder.to_string();
    }
    url.trim_end_matches('/')
        .rsplit('/')
        .nth(1)
        .unwrap_or(folder)
        .to_string()
}

/// Read the first CSV of an archive and tag it with the release identifier.
pub fn read_archive(bytes: &[u8], url: &str) -> anyhow::Result<(String, RawTable)> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).context("opening zip archive")?;
    let first_entry = archive
        .by_index(0)
        .context("archive has no entries")?
        .name()
        .to_string();
    let model_version = model_version_for_archive(&first_entry, url);

    for idx in 0..archive.len() {
        let mut entry = archive.by_index(idx)?;
        if !entry.name().to_lowercase().ends_with(".csv") {
            continue;
        }
        let name = entry.name().to_string();
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .with_context(|| format!("reading archive entry {name}"))?;
        let mut table = RawTable::from_csv_bytes(&data)
            .with_context(|| format!("parsing archive entry {name}"))?;
        table.rename_column("date_reported", "date");
        table.set_constant_column("model_version", &model_version);
        return Ok((model_version, table));
    }
    anyhow::bail!("archive from {url} contains no csv file")
}

#[async_trait]
impl SourceAdapter for IhmeAdapter {
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
        let span = info_span!("ihme_fetch", run_id = %ctx.run_id);
        async {
            report.requests += 1;
            let listing = match http.fetch(ctx.run_id, SOURCE_ID, &self.listing_url).await {
                Ok(FetchOutcome::Found(resp)) => resp,
                Ok(FetchOutcome::Missing { status, url }) => {
                    error!(status, %url, "IHME downloads page unavailable");
                    report.missing += 1;
                    report.empty.push("archives".to_string());
                    return Ok(());
                }
                Err(err) => {
                    error!(error = %err, "IHME downloads page fetch failed");
                    report.failed += 1;
                    report.empty.push("archives".to_string());
                    return Ok(());
                }
            };
            report.found += 1;

            let html = String::from_utf8_lossy(&listing.body);
            let urls = discover_archive_urls(&html, &self.site_url)?;
            info!(archives = urls.len(), "discovered IHME archives");

            let mut tables = Vec::new();
            for url in &urls {
                report.requests += 1;
                let resp = match http.fetch(ctx.run_id, SOURCE_ID, url).await {
                    Ok(FetchOutcome::Found(resp)) => resp,
                    Ok(FetchOutcome::Missing { status, .. }) => {
                        debug!(%url, status, "archive not available");
                        report.missing += 1;
                        continue;
                    }
                    Err(err) => {
                        warn!(%url, error = %err, "archive fetch failed; skipping");
                        report.failed += 1;
                        continue;
                    }
                };
                match read_archive(&resp.body, url) {
                    Ok((model_version, table)) => {
                        debug!(%model_version, rows = table.len(), "processed IHME archive");
                        report.found += 1;
                        tables.push(table);
                    }
                    Err(err) => {
                        warn!(%url, error = %err, "unreadable IHME archive; skipping");
                        report.failed += 1;
                    }
                }
            }

            if tables.is_empty() {
                error!("no IHME archives retrieved");
                report.empty.push("archives".to_string());
                return Ok(());
            }
            let compiled = compile_tables(tables);
            let stored = store.store_table(SNAPSHOT_NAME, &compiled).await?;
            info!(
                rows = compiled.len(),
                sha256 = %stored.content_hash,
                "compiled IHME snapshot"
            );
            report.snapshots.push(SNAPSHOT_NAME.to_string());
            Ok::<(), AdapterError>(())
        }
        .instrument(span)
        .await?;
        Ok(report)
    }

    async fn normalize(
        &self,
        store: &SnapshotStore,
        ctx: &AdapterContext,
    ) -> Result<NormalizeOutput, AdapterError> {
        let Some(table) = store.load_table(SNAPSHOT_NAME).await? else {
            return Err(AdapterError::NoData {
                source_id: SOURCE_ID.to_string(),
                detail: format!("{SNAPSHOT_NAME} has not been compiled"),
            });
        };
        normalize_table(table, &ctx.transient_columns)
    }
}

pub fn compile_tables(tables: Vec<RawTable>) -> RawTable {
    let mut compiled = RawTable::concat(tables);
    compiled.drop_columns(COMPILE_DROP_COLUMNS);
    compiled.replace_values("location_name", "US", US_CANONICAL_NAME);
    compiled
}

/// Prune a compiled IHME table to canonical columns and build rows.
pub fn normalize_table(
    mut table: RawTable,
    transient_columns: &[String],
) -> Result<NormalizeOutput, AdapterError> {
    let dropped = table.drop_columns(transient_columns);
    if !dropped.is_empty() {
        debug!(columns = ?dropped, "dropped transient IHME columns");
    }
    for column in ["location_name", "date", "model_version"] {
        if !table.has_column(column) {
            return Err(AdapterError::MissingColumn {
                source_id: SOURCE_ID.to_string(),
                table: SNAPSHOT_NAME.to_string(),
                column: column.to_string(),
            });
        }
    }

    let schema = CanonicalSchema::standard();
    let mut metric_columns = Vec::new();
    let mut unknown_columns = Vec::new();
    for header in table.headers() {
        if schema.is_metric_column(header) {
            metric_columns.push(header.clone());
        } else if !ID_COLUMNS.contains(&header.as_str()) {
            unknown_columns.push(header.clone());
        }
    }
    if !unknown_columns.is_empty() {
        warn!(columns = ?unknown_columns, "unexpected IHME columns discarded");
    }

    let mut output = NormalizeOutput {
        unknown_columns,
        ..NormalizeOutput::default()
    };
    let mut frame = ForecastFrame::new(SOURCE_ID, metric_columns.clone());
    let mut bad_versions = BTreeSet::new();
    for record in table.records() {
        let (Some(location), Some(date), Some(model_version)) = (
            record.get("location_name"),
            record.get("date").and_then(parse_date),
            record.get("model_version"),
        ) else {
            output.dropped_rows += 1;
            continue;
        };
        let Ok(model_date) = model_date_from_version(model_version) else {
            bad_versions.insert(model_version.to_string());
            output.dropped_rows += 1;
            continue;
        };
        let location_name = canonical_location(location);
        frame.rows.push(ForecastRow {
            location_abbr: location_abbr(&location_name).map(str::to_string),
            location_name,
            date,
            model_version: model_version.to_string(),
            model_date,
            model_name: ModelName::Ihme,
            metrics: metric_columns
                .iter()
                .map(|c| (c.clone(), record.get_f64(c)))
                .collect(),
        });
    }
    if !bad_versions.is_empty() {
        warn!(versions = ?bad_versions, "rows with underivable model_version dropped");
    }
    if output.dropped_rows > 0 {
        warn!(dropped = output.dropped_rows, "IHME rows dropped during normalization");
    }
    info!(rows = frame.len(), "normalized IHME frame");
    output.frame = frame;
    Ok(output)
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()
}
