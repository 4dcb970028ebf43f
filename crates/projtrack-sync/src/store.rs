//! Persisted forecast table: Postgres implementation and an in-memory twin.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::NaiveDate;
use projtrack_core::{
    CanonicalSchema, FieldKind, ForecastKey, ForecastRow, ModelName, KEY_COLUMNS,
};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::validate_identifier;

/// Rows per `INSERT` statement; 1000 rows of the canonical width stay under
/// the Postgres bind parameter limit.
pub const INSERT_CHUNK_ROWS: usize = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("table {table} does not match the canonical schema: {detail}")]
    SchemaMismatch { table: String, detail: String },
    #[error("invalid table name {table:?}: {reason}")]
    InvalidTable { table: String, reason: String },
    #[error("unknown metric column {0}")]
    UnknownMetric(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ForecastStore: Send + Sync {
    async fn ensure_table(&self) -> Result<(), StoreError>;

    /// Confirm the live table carries every canonical column with the expected type.
    async fn validate_table(&self) -> Result<(), StoreError>;

    /// Insert one model-date partition, ignoring keys already present.
    /// Returns the number of newly stored rows.
    async fn insert_ignore(&self, model_date: NaiveDate, rows: &[ForecastRow]) -> Result<u64, StoreError>;

    async fn row_count(&self) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesQuery {
    pub model_name: ModelName,
    pub location_name: String,
    pub metric: String,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl SeriesQuery {
    fn covers(&self, model_date: NaiveDate) -> bool {
        self.start.map_or(true, |s| model_date >= s) && self.end.map_or(true, |e| model_date <= e)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub model_version: String,
    pub model_date: NaiveDate,
    pub date: NaiveDate,
    pub value: Option<f64>,
}

/// Read side used by the query API.
#[async_trait]
pub trait ForecastReader: Send + Sync {
    async fn locations(&self) -> Result<Vec<String>, StoreError>;

    /// Points ordered by `(model_date, date)`.
    async fn series(&self, query: &SeriesQuery) -> Result<Vec<SeriesPoint>, StoreError>;
}

fn check_metric(schema: &CanonicalSchema, metric: &str) -> Result<(), StoreError> {
    if schema.is_metric_column(metric) {
        Ok(())
    } else {
        Err(StoreError::UnknownMetric(metric.to_string()))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    table_ready: bool,
    rows: BTreeMap<ForecastKey, ForecastRow>,
}

/// Same insert-or-ignore semantics as the Postgres table, kept in a map.
#[derive(Debug)]
pub struct InMemoryForecastStore {
    schema: CanonicalSchema,
    fail_on: BTreeSet<NaiveDate>,
    state: Mutex<MemoryState>,
}

impl Default for InMemoryForecastStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryForecastStore {
    pub fn new() -> Self {
        Self {
            schema: CanonicalSchema::standard(),
            fail_on: BTreeSet::new(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Make every insert into the given partition fail.
    pub fn failing_on(mut self, model_date: NaiveDate) -> Self {
        self.fail_on.insert(model_date);
        self
    }

    pub async fn rows(&self) -> Vec<ForecastRow> {
        self.state.lock().await.rows.values().cloned().collect()
    }
}

#[async_trait]
impl ForecastStore for InMemoryForecastStore {
    async fn ensure_table(&self) -> Result<(), StoreError> {
        self.state.lock().await.table_ready = true;
        Ok(())
    }

    async fn validate_table(&self) -> Result<(), StoreError> {
        if self.state.lock().await.table_ready {
            Ok(())
        } else {
            Err(StoreError::SchemaMismatch {
                table: "memory".to_string(),
                detail: "table has not been created".to_string(),
            })
        }
    }

    async fn insert_ignore(&self, model_date: NaiveDate, rows: &[ForecastRow]) -> Result<u64, StoreError> {
        if self.fail_on.contains(&model_date) {
            return Err(StoreError::Unavailable(format!(
                "injected failure for partition {model_date}"
            )));
        }
        let mut state = self.state.lock().await;
        let mut inserted = 0;
        for row in rows {
            if let std::collections::btree_map::Entry::Vacant(slot) = state.rows.entry(row.key()) {
                slot.insert(row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn row_count(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.rows.len() as u64)
    }
}

#[async_trait]
impl ForecastReader for InMemoryForecastStore {
    async fn locations(&self) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        let names = state
            .rows
            .keys()
            .map(|k| k.location_name.clone())
            .collect::<BTreeSet<_>>();
        Ok(names.into_iter().collect())
    }

    async fn series(&self, query: &SeriesQuery) -> Result<Vec<SeriesPoint>, StoreError> {
        check_metric(&self.schema, &query.metric)?;
        let state = self.state.lock().await;
        let mut points = state
            .rows
            .values()
            .filter(|r| {
                r.model_name == query.model_name
                    && r.location_name == query.location_name
                    && query.covers(r.model_date)
            })
            .map(|r| SeriesPoint {
                model_version: r.model_version.clone(),
                model_date: r.model_date,
                date: r.date,
                value: r.metric(&query.metric),
            })
            .collect::<Vec<_>>();
        points.sort_by_key(|p| (p.model_date, p.date));
        Ok(points)
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_type(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::Text | FieldKind::Category => "TEXT",
        FieldKind::Date => "DATE",
        FieldKind::Float => "DOUBLE PRECISION",
    }
}

/// `information_schema.columns.data_type` for each field kind.
fn information_schema_type(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::Text | FieldKind::Category => "text",
        FieldKind::Date => "date",
        FieldKind::Float => "double precision",
    }
}

pub fn create_table_sql(table: &str, schema: &CanonicalSchema) -> String {
    let columns = schema
        .fields()
        .iter()
        .map(|f| {
            let null = if f.nullable { "" } else { " NOT NULL" };
            format!("    {} {}{}", quote_ident(&f.name), sql_type(f.kind), null)
        })
        .collect::<Vec<_>>()
        .join(",\n");
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{},\n    PRIMARY KEY ({})\n)",
        quote_ident(table),
        columns,
        key_column_list()
    )
}

pub fn create_index_sql(table: &str) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} (\"model_date\")",
        quote_ident(&format!("{table}_model_date_idx")),
        quote_ident(table)
    )
}

fn key_column_list() -> String {
    KEY_COLUMNS
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn insert_prefix_sql(table: &str, schema: &CanonicalSchema) -> String {
    let columns = schema
        .column_names()
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {} ({}) ", quote_ident(table), columns)
}

pub fn on_conflict_sql() -> String {
    format!(" ON CONFLICT ({}) DO NOTHING", key_column_list())
}

pub fn series_sql(table: &str, metric: &str) -> String {
    format!(
        "SELECT \"model_version\", \"model_date\", \"date\", {} AS value FROM {} \
         WHERE \"model_name\" = $1 AND \"location_name\" = $2 \
         AND ($3::date IS NULL OR \"model_date\" >= $3) \
         AND ($4::date IS NULL OR \"model_date\" <= $4) \
         ORDER BY \"model_date\", \"date\"",
        quote_ident(metric),
        quote_ident(table)
    )
}

/// Compare `(column_name, data_type)` pairs from `information_schema` to the schema.
pub fn table_mismatches(schema: &CanonicalSchema, live: &[(String, String)]) -> Vec<String> {
    let live = live.iter().cloned().collect::<BTreeMap<_, _>>();
    schema
        .fields()
        .iter()
        .filter_map(|f| match live.get(&f.name) {
            None => Some(format!("missing column {}", f.name)),
            Some(found) if found != information_schema_type(f.kind) => Some(format!(
                "column {} is {found}, expected {}",
                f.name,
                information_schema_type(f.kind)
            )),
            Some(_) => None,
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct PgForecastStore {
    pool: PgPool,
    table: String,
    schema: CanonicalSchema,
}

impl PgForecastStore {
    pub fn new(pool: PgPool, table: &str) -> Result<Self, StoreError> {
        validate_identifier(table).map_err(|reason| StoreError::InvalidTable {
            table: table.to_string(),
            reason,
        })?;
        Ok(Self {
            pool,
            table: table.to_string(),
            schema: CanonicalSchema::standard(),
        })
    }

    pub async fn connect(database_url: &str, table: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Self::new(pool, table)
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

#[async_trait]
impl ForecastStore for PgForecastStore {
    async fn ensure_table(&self) -> Result<(), StoreError> {
        sqlx::query(&create_table_sql(&self.table, &self.schema))
            .execute(&self.pool)
            .await?;
        sqlx::query(&create_index_sql(&self.table))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn validate_table(&self) -> Result<(), StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT column_name::text AS column_name, data_type::text AS data_type
              FROM information_schema.columns
             WHERE table_schema = current_schema()
               AND table_name = $1
            "#,
        )
        .bind(&self.table)
        .fetch_all(&self.pool)
        .await?;

        let mut live = Vec::with_capacity(rows.len());
        for row in rows {
            live.push((row.try_get("column_name")?, row.try_get("data_type")?));
        }
        let problems = table_mismatches(&self.schema, &live);
        if problems.is_empty() {
            Ok(())
        } else {
            Err(StoreError::SchemaMismatch {
                table: self.table.clone(),
                detail: problems.join("; "),
            })
        }
    }

    async fn insert_ignore(&self, model_date: NaiveDate, rows: &[ForecastRow]) -> Result<u64, StoreError> {
        let prefix = insert_prefix_sql(&self.table, &self.schema);
        let suffix = on_conflict_sql();
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            let mut builder = QueryBuilder::<Postgres>::new(prefix.as_str());
            builder.push_values(chunk, |mut values, row| {
                for field in self.schema.fields() {
                    match field.name.as_str() {
                        "location_name" => values.push_bind(row.location_name.clone()),
                        "location_abbr" => values.push_bind(row.location_abbr.clone()),
                        "date" => values.push_bind(row.date),
                        "model_version" => values.push_bind(row.model_version.clone()),
                        "model_date" => values.push_bind(row.model_date),
                        "model_name" => values.push_bind(row.model_name.to_string()),
                        metric => values.push_bind(row.metric(metric)),
                    };
                }
            });
            builder.push(suffix.as_str());
            let result = builder.build().execute(&mut *tx).await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        debug!(%model_date, attempted = rows.len(), inserted, "partition committed");
        Ok(inserted)
    }

    async fn row_count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {}", quote_ident(&self.table)))
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }
}

#[async_trait]
impl ForecastReader for PgForecastStore {
    async fn locations(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT \"location_name\" FROM {} ORDER BY \"location_name\"",
            quote_ident(&self.table)
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| r.try_get("location_name").map_err(StoreError::from))
            .collect()
    }

    async fn series(&self, query: &SeriesQuery) -> Result<Vec<SeriesPoint>, StoreError> {
        check_metric(&self.schema, &query.metric)?;
        let rows = sqlx::query(&series_sql(&self.table, &query.metric))
            .bind(query.model_name.to_string())
            .bind(&query.location_name)
            .bind(query.start)
            .bind(query.end)
            .fetch_all(&self.pool)
            .await?;

        let mut points = Vec::with_capacity(rows.len());
        for row in rows {
            points.push(SeriesPoint {
                model_version: row.try_get("model_version")?,
                model_date: row.try_get("model_date")?,
                date: row.try_get("date")?,
                value: row.try_get("value")?,
            });
        }
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 4, day).unwrap()
    }

    fn row(location: &str, model_day: u32, date_day: u32, value: f64) -> ForecastRow {
        ForecastRow {
            location_name: location.to_string(),
            location_abbr: None,
            date: d(date_day),
            model_version: format!("2020_04_{model_day:02}"),
            model_date: d(model_day),
            model_name: ModelName::Lanl,
            metrics: BTreeMap::from([("deaths_mean".to_string(), Some(value))]),
        }
    }

    #[test]
    fn ddl_declares_the_composite_key() {
        let sql = create_table_sql("projections", &CanonicalSchema::standard());
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"projections\""));
        assert!(sql.contains("\"location_name\" TEXT NOT NULL"));
        assert!(sql.contains("\"model_date\" DATE NOT NULL"));
        assert!(sql.contains("\"allbed_mean\" DOUBLE PRECISION,"));
        assert!(sql.contains("\"location_abbr\" TEXT,"));
        assert!(sql.contains(
            "PRIMARY KEY (\"location_name\", \"date\", \"model_date\", \"model_name\")"
        ));
    }

    #[test]
    fn insert_statement_ignores_conflicts() {
        let schema = CanonicalSchema::standard();
        let prefix = insert_prefix_sql("projections", &schema);
        assert!(prefix.starts_with("INSERT INTO \"projections\" (\"location_name\", \"date\","));
        assert_eq!(
            on_conflict_sql(),
            " ON CONFLICT (\"location_name\", \"date\", \"model_date\", \"model_name\") DO NOTHING"
        );
        assert!(INSERT_CHUNK_ROWS * schema.fields().len() < u16::MAX as usize);
    }

    #[test]
    fn mismatched_live_tables_are_described() {
        let schema = CanonicalSchema::standard();
        let mut live = schema
            .fields()
            .iter()
            .map(|f| (f.name.clone(), information_schema_type(f.kind).to_string()))
            .collect::<Vec<_>>();
        assert!(table_mismatches(&schema, &live).is_empty());

        live.retain(|(name, _)| name != "location_abbr");
        live.iter_mut()
            .filter(|(name, _)| name == "date")
            .for_each(|(_, ty)| *ty = "text".to_string());
        let problems = table_mismatches(&schema, &live);
        assert_eq!(
            problems,
            vec![
                "column date is text, expected date".to_string(),
                "missing column location_abbr".to_string()
            ]
        );
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(
            create_index_sql("projections"),
            "CREATE INDEX IF NOT EXISTS \"projections_model_date_idx\" ON \"projections\" (\"model_date\")"
        );
    }

    #[tokio::test]
    async fn memory_store_keeps_the_first_write_for_a_key() {
        let store = InMemoryForecastStore::new();
        store.ensure_table().await.unwrap();
        assert_eq!(store.insert_ignore(d(5), &[row("Ohio", 5, 6, 1.0)]).await.unwrap(), 1);
        assert_eq!(
            store
                .insert_ignore(d(5), &[row("Ohio", 5, 6, 99.0), row("Ohio", 5, 7, 2.0)])
                .await
                .unwrap(),
            1
        );
        let rows = store.rows().await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].metric("deaths_mean"), Some(1.0));
    }

    #[tokio::test]
    async fn memory_reader_filters_and_orders_series() {
        let store = InMemoryForecastStore::new();
        store
            .insert_ignore(
                d(6),
                &[row("Ohio", 6, 8, 3.0), row("Ohio", 6, 7, 2.0), row("Utah", 6, 7, 5.0)],
            )
            .await
            .unwrap();
        store.insert_ignore(d(5), &[row("Ohio", 5, 7, 1.0)]).await.unwrap();

        assert_eq!(store.locations().await.unwrap(), vec!["Ohio", "Utah"]);

        let mut query = SeriesQuery {
            model_name: ModelName::Lanl,
            location_name: "Ohio".into(),
            metric: "deaths_mean".into(),
            start: None,
            end: None,
        };
        let values = store
            .series(&query)
            .await
            .unwrap()
            .into_iter()
            .map(|p| (p.model_date, p.date, p.value))
            .collect::<Vec<_>>();
        assert_eq!(
            values,
            vec![
                (d(5), d(7), Some(1.0)),
                (d(6), d(7), Some(2.0)),
                (d(6), d(8), Some(3.0))
            ]
        );

        query.start = Some(d(6));
        assert_eq!(store.series(&query).await.unwrap().len(), 2);

        query.metric = "deaths".into();
        assert!(matches!(store.series(&query).await, Err(StoreError::UnknownMetric(_))));
    }

    #[tokio::test]
    async fn validation_requires_the_table() {
        let store = InMemoryForecastStore::new();
        assert!(store.validate_table().await.is_err());
        store.ensure_table().await.unwrap();
        assert!(store.validate_table().await.is_ok());
    }
}
