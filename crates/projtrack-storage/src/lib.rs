//! Snapshot storage, delimited-table I/O and HTTP fetch utilities for projtrack.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "projtrack-storage";

/// In-memory delimited table with string cells, addressed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    index: HashMap<String, usize>,
}

/// Borrowed view of one row that resolves cells by column name.
#[derive(Debug, Clone, Copy)]
pub struct RawRecord<'a> {
    table: &'a RawTable,
    cells: &'a [String],
}

impl<'a> RawRecord<'a> {
    /// Non-empty cell value for `column`, or `None` when absent or blank.
    pub fn get(&self, column: &str) -> Option<&'a str> {
        let idx = self.table.column_index(column)?;
        self.cells
            .get(idx)
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn get_f64(&self, column: &str) -> Option<f64> {
        self.get(column)
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|v| v.is_finite())
    }
}

impl RawTable {
    pub fn new(headers: Vec<String>) -> Self {
        let mut table = Self {
            headers,
            rows: Vec::new(),
            index: HashMap::new(),
        };
        table.reindex();
        table
    }

    /// Parse CSV text with a header row.
    ///
    /// Blank header cells are named `Unnamed: {position}`, matching how
    /// spreadsheet exports label their index column.
    pub fn from_csv_reader<R: Read>(reader: R) -> anyhow::Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = rdr
            .headers()
            .context("csv must have a header row")?
            .iter()
            .enumerate()
            .map(|(i, h)| {
                let h = h.trim_start_matches('\u{feff}');
                if h.is_empty() {
                    format!("Unnamed: {i}")
                } else {
                    h.to_string()
                }
            })
            .collect::<Vec<_>>();
        let mut table = Self::new(headers);
        for record in rdr.records() {
            let record = record.context("reading csv record")?;
            table.push_row(record.iter().map(ToString::to_string).collect());
        }
        Ok(table)
    }

    pub fn from_csv_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        Self::from_csv_reader(bytes)
    }

    pub fn to_csv_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(&self.headers)
            .context("writing csv header")?;
        for row in &self.rows {
            writer.write_record(row).context("writing csv row")?;
        }
        writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("flushing csv writer: {e}"))
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Append a row, padding or truncating it to the header width.
    pub fn push_row(&mut self, mut cells: Vec<String>) {
        cells.resize(self.headers.len(), String::new());
        self.rows.push(cells);
    }

    pub fn records(&self) -> impl Iterator<Item = RawRecord<'_>> {
        self.rows.iter().map(move |cells| RawRecord {
            table: self,
            cells,
        })
    }

    /// Rename `from` to `to` unless `from` is absent or `to` already exists.
    pub fn rename_column(&mut self, from: &str, to: &str) -> bool {
        if self.has_column(to) {
            return false;
        }
        let Some(idx) = self.column_index(from) else {
            return false;
        };
        self.headers[idx] = to.to_string();
        self.reindex();
        true
    }

    /// Drop the named columns that exist; returns the ones actually removed.
    pub fn drop_columns<S: AsRef<str>>(&mut self, names: &[S]) -> Vec<String> {
        let keep: Vec<bool> = self
            .headers
            .iter()
            .map(|h| !names.iter().any(|n| n.as_ref() == h))
            .collect();
        let dropped = self
            .headers
            .iter()
            .zip(&keep)
            .filter(|(_, k)| !**k)
            .map(|(h, _)| h.clone())
            .collect::<Vec<_>>();
        if dropped.is_empty() {
            return dropped;
        }
        self.headers = retain_flagged(std::mem::take(&mut self.headers), &keep);
        for row in &mut self.rows {
            *row = retain_flagged(std::mem::take(row), &keep);
        }
        self.reindex();
        dropped
    }

    /// Set `name` to `value` on every row, adding the column when needed.
    pub fn set_constant_column(&mut self, name: &str, value: &str) {
        let idx = match self.column_index(name) {
            Some(idx) => idx,
            None => {
                self.headers.push(name.to_string());
                for row in &mut self.rows {
                    row.push(String::new());
                }
                self.reindex();
                self.headers.len() - 1
            }
        };
        for row in &mut self.rows {
            row[idx] = value.to_string();
        }
    }

    pub fn map_headers(&mut self, f: impl Fn(&str) -> String) {
        self.headers = self.headers.iter().map(|h| f(h)).collect();
        self.reindex();
    }

    /// Replace every cell of `column` equal to `from` with `to`.
    pub fn replace_values(&mut self, column: &str, from: &str, to: &str) -> usize {
        let Some(idx) = self.column_index(column) else {
            return 0;
        };
        let mut replaced = 0;
        for row in &mut self.rows {
            if row[idx] == from {
                row[idx] = to.to_string();
                replaced += 1;
            }
        }
        replaced
    }

    /// Row-wise union; the header is the first-seen-order union of all inputs.
    pub fn concat(tables: Vec<RawTable>) -> RawTable {
        let mut headers: Vec<String> = Vec::new();
        for table in &tables {
            for h in &table.headers {
                if !headers.contains(h) {
                    headers.push(h.clone());
                }
            }
        }
        let mut out = RawTable::new(headers);
        for table in tables {
            let positions = table
                .headers
                .iter()
                .map(|h| out.column_index(h))
                .collect::<Vec<_>>();
            for row in table.rows {
                let mut cells = vec![String::new(); out.headers.len()];
                for (cell, pos) in row.into_iter().zip(&positions) {
                    if let Some(pos) = pos {
                        cells[*pos] = cell;
                    }
                }
                out.rows.push(cells);
            }
        }
        out
    }

    fn reindex(&mut self) {
        self.index = self
            .headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.clone(), i))
            .collect();
    }
}

fn retain_flagged(values: Vec<String>, keep: &[bool]) -> Vec<String> {
    values
        .into_iter()
        .zip(keep)
        .filter(|(_, k)| **k)
        .map(|(v, _)| v)
        .collect()
}

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

/// Directory of named intermediate snapshots (compiled provider files, merged batch).
///
/// Snapshots are regenerated on every run; each write replaces the previous
/// file atomically so a crashed run never leaves a half-written snapshot behind.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn snapshot_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub async fn exists(&self, name: &str) -> anyhow::Result<bool> {
        let path = self.snapshot_path(name);
        fs::try_exists(&path)
            .await
            .with_context(|| format!("checking snapshot path {}", path.display()))
    }

    /// Replace the snapshot `name` using a temp file in the same directory and a rename.
    pub async fn store_bytes(&self, name: &str, bytes: &[u8]) -> anyhow::Result<StoredSnapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = PathBuf::from(name);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        let mut renamed = fs::rename(&temp_path, &absolute_path).await;
        if matches!(&renamed, Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists) {
            // Platforms without replace-on-rename.
            let _ = fs::remove_file(&absolute_path).await;
            renamed = fs::rename(&temp_path, &absolute_path).await;
        }
        if let Err(err) = renamed {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredSnapshot {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
        })
    }

    pub async fn store_table(&self, name: &str, table: &RawTable) -> anyhow::Result<StoredSnapshot> {
        let bytes = table
            .to_csv_bytes()
            .with_context(|| format!("serializing snapshot {name}"))?;
        self.store_bytes(name, &bytes).await
    }

    /// Load a CSV snapshot; `Ok(None)` when it has never been written.
    pub async fn load_table(&self, name: &str) -> anyhow::Result<Option<RawTable>> {
        let path = self.snapshot_path(name);
        if !self.exists(name).await? {
            return Ok(None);
        }
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading snapshot {}", path.display()))?;
        RawTable::from_csv_bytes(&bytes)
            .with_context(|| format!("parsing snapshot {}", path.display()))
            .map(Some)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    /// Minimum spacing between consecutive requests.
    pub courtesy_delay: Option<Duration>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            courtesy_delay: Some(Duration::from_millis(200)),
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every.saturating_sub(elapsed);
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

/// Result of one GET: either a body or the expected "nothing published here".
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Found(FetchedResponse),
    Missing { status: u16, url: String },
}

impl FetchOutcome {
    pub fn into_found(self) -> Option<FetchedResponse> {
        match self {
            FetchOutcome::Found(resp) => Some(resp),
            FetchOutcome::Missing { .. } => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
}

/// Sequential HTTP client with a courtesy throttle and bounded retries.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    throttle: Option<SimpleTokenBucket>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let throttle = config
            .courtesy_delay
            .filter(|d| !d.is_zero())
            .map(|delay| SimpleTokenBucket::new(1, delay));

        Ok(Self {
            client,
            throttle,
            backoff: config.backoff,
        })
    }

    /// GET `url`. A final non-success status is [`FetchOutcome::Missing`], not an error.
    pub async fn fetch(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchOutcome, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchOutcome, FetchError> {
        let mut attempt = 0;
        loop {
            if let Some(throttle) = &self.throttle {
                throttle.take().await;
            }

            let err = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchOutcome::Found(FetchedResponse {
                            status,
                            final_url,
                            body,
                        }));
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying after retryable status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Ok(FetchOutcome::Missing {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => err,
            };

            if classify_reqwest_error(&err) == RetryDisposition::Retryable
                && attempt < self.backoff.max_retries
            {
                debug!(error = %err, attempt, "retrying after transport error");
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                attempt += 1;
                continue;
            }
            return Err(FetchError::Request(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use tempfile::tempdir;

    fn quick_fetcher(max_retries: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("projtrack-test".into()),
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            courtesy_delay: None,
        })
        .unwrap()
    }

    #[test]
    fn snapshot_hashing_is_stable() {
        let hash = SnapshotStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn snapshot_writes_replace_previous_content() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());

        let first = store.store_bytes("lanl_deaths_compiled.csv", b"a\n1\n").await.unwrap();
        let second = store.store_bytes("lanl_deaths_compiled.csv", b"a\n2\n").await.unwrap();

        assert_ne!(first.content_hash, second.content_hash);
        assert_eq!(first.absolute_path, second.absolute_path);
        assert_eq!(std::fs::read(&second.absolute_path).unwrap(), b"a\n2\n");
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn missing_snapshot_loads_as_none() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        assert!(store.load_table("ihme_compiled.csv").await.unwrap().is_none());

        let mut table = RawTable::new(vec!["location_name".into(), "date".into()]);
        table.push_row(vec!["Ohio".into(), "2020-04-10".into()]);
        store.store_table("ihme_compiled.csv", &table).await.unwrap();
        let loaded = store.load_table("ihme_compiled.csv").await.unwrap().unwrap();
        assert_eq!(loaded.headers(), table.headers());
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn csv_parsing_names_blank_headers_and_pads_short_rows() {
        let table = RawTable::from_csv_bytes(b",location_name,q.50\n0,Ohio,12\n1,Iowa\n").unwrap();
        assert_eq!(table.headers(), ["Unnamed: 0", "location_name", "q.50"]);
        let records = table.records().collect::<Vec<_>>();
        assert_eq!(records[0].get_f64("q.50"), Some(12.0));
        assert_eq!(records[1].get("q.50"), None);
        assert_eq!(records[1].get("location_name"), Some("Iowa"));
    }

    #[test]
    fn concat_unions_headers_in_first_seen_order() {
        let mut a = RawTable::new(vec!["state".into(), "q025".into()]);
        a.push_row(vec!["Ohio".into(), "1".into()]);
        let mut b = RawTable::new(vec!["state".into(), "q05".into(), "q025".into()]);
        b.push_row(vec!["Iowa".into(), "2".into(), "3".into()]);

        let merged = RawTable::concat(vec![a, b]);
        assert_eq!(merged.headers(), ["state", "q025", "q05"]);
        let rows = merged.records().collect::<Vec<_>>();
        assert_eq!(rows[0].get("q05"), None);
        assert_eq!(rows[1].get("q025"), Some("3"));
        assert_eq!(rows[1].get("q05"), Some("2"));
    }

    #[test]
    fn column_edits_tolerate_absent_columns() {
        let mut table = RawTable::new(vec!["V1".into(), "state".into(), "simple_state".into()]);
        table.push_row(vec!["1".into(), "US".into(), "x".into()]);

        let dropped = table.drop_columns(&["simple_state", "simple_countries", "V1"]);
        assert_eq!(dropped, vec!["V1".to_string(), "simple_state".to_string()]);
        assert!(table.rename_column("state", "location_name"));
        assert!(!table.rename_column("countries", "location_name"));
        assert_eq!(table.replace_values("location_name", "US", "United States of America"), 1);
        table.set_constant_column("metric", "deaths");
        let row = table.records().next().unwrap();
        assert_eq!(row.get("location_name"), Some("United States of America"));
        assert_eq!(row.get("metric"), Some("deaths"));
    }

    #[tokio::test]
    async fn not_found_is_reported_as_missing_without_retry() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/forecast/us/files/2020-04-10.csv");
                then.status(404);
            })
            .await;

        let fetcher = quick_fetcher(3);
        let outcome = fetcher
            .fetch(Uuid::new_v4(), "lanl", &server.url("/forecast/us/files/2020-04-10.csv"))
            .await
            .unwrap();

        assert!(matches!(outcome, FetchOutcome::Missing { status: 404, .. }));
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn server_errors_are_retried_then_treated_as_missing() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/flaky.csv");
                then.status(503);
            })
            .await;

        let fetcher = quick_fetcher(2);
        let outcome = fetcher
            .fetch(Uuid::new_v4(), "lanl", &server.url("/flaky.csv"))
            .await
            .unwrap();

        assert!(outcome.into_found().is_none());
        mock.assert_hits_async(3).await;
    }

    #[tokio::test]
    async fn success_returns_body() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/ok.csv");
                then.status(200).body("dates,q.50\n2020-04-10,3\n");
            })
            .await;

        let fetcher = quick_fetcher(0);
        let resp = fetcher
            .fetch(Uuid::new_v4(), "lanl", &server.url("/ok.csv"))
            .await
            .unwrap()
            .into_found()
            .expect("found");
        assert_eq!(resp.status, StatusCode::OK);
        assert!(resp.body.starts_with(b"dates"));
    }
}
