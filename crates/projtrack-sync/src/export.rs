//! Parquet mirror of the merged snapshot plus its manifest.

use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, Date32Array, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::Datelike;
use parquet::arrow::ArrowWriter;
use projtrack_core::{CanonicalSchema, FieldKind, ForecastRow};
use projtrack_storage::{SnapshotStore, StoredSnapshot};
use serde::{Deserialize, Serialize};

pub const MERGED_PARQUET: &str = "merged_projections.parquet";
pub const MANIFEST: &str = "manifest.json";

/// `num_days_from_ce` of 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

impl SnapshotManifestFile {
    pub fn from_stored(name: &str, stored: &StoredSnapshot) -> Self {
        Self {
            name: name.to_string(),
            path: stored.relative_path.display().to_string(),
            sha256: stored.content_hash.clone(),
            bytes: stored.byte_size as u64,
        }
    }
}

pub fn arrow_schema(schema: &CanonicalSchema) -> Schema {
    Schema::new(
        schema
            .fields()
            .iter()
            .map(|f| {
                let data_type = match f.kind {
                    FieldKind::Text | FieldKind::Category => DataType::Utf8,
                    FieldKind::Date => DataType::Date32,
                    FieldKind::Float => DataType::Float64,
                };
                ArrowField::new(f.name.as_str(), data_type, f.nullable)
            })
            .collect::<Vec<_>>(),
    )
}

fn days_since_epoch(date: chrono::NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

pub fn rows_to_record_batch(rows: &[ForecastRow], schema: &CanonicalSchema) -> Result<RecordBatch> {
    let columns = schema
        .fields()
        .iter()
        .map(|field| -> ArrayRef {
            match field.name.as_str() {
                "location_name" => Arc::new(StringArray::from_iter_values(
                    rows.iter().map(|r| r.location_name.as_str()),
                )),
                "location_abbr" => Arc::new(StringArray::from(
                    rows.iter()
                        .map(|r| r.location_abbr.as_deref())
                        .collect::<Vec<_>>(),
                )),
                "model_version" => Arc::new(StringArray::from_iter_values(
                    rows.iter().map(|r| r.model_version.as_str()),
                )),
                "model_name" => Arc::new(StringArray::from_iter_values(
                    rows.iter().map(|r| r.model_name.to_string()),
                )),
                "date" => Arc::new(Date32Array::from(
                    rows.iter().map(|r| days_since_epoch(r.date)).collect::<Vec<_>>(),
                )),
                "model_date" => Arc::new(Date32Array::from(
                    rows.iter()
                        .map(|r| days_since_epoch(r.model_date))
                        .collect::<Vec<_>>(),
                )),
                column => Arc::new(Float64Array::from(
                    rows.iter().map(|r| r.metric(column)).collect::<Vec<_>>(),
                )),
            }
        })
        .collect::<Vec<_>>();

    RecordBatch::try_new(Arc::new(arrow_schema(schema)), columns)
        .context("building merged projections record batch")
}

fn parquet_bytes(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), None)
        .context("opening parquet writer")?;
    writer.write(batch).context("writing record batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(buffer)
}

/// Write the parquet mirror and a manifest covering it and the CSV snapshot.
pub async fn export_merged(
    store: &SnapshotStore,
    rows: &[ForecastRow],
    schema: &CanonicalSchema,
    csv_snapshot: &StoredSnapshot,
) -> Result<(StoredSnapshot, StoredSnapshot)> {
    let batch = rows_to_record_batch(rows, schema)?;
    let bytes = parquet_bytes(&batch)?;
    let parquet = store
        .store_bytes(MERGED_PARQUET, &bytes)
        .await
        .with_context(|| format!("writing {MERGED_PARQUET}"))?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        files: vec![
            SnapshotManifestFile::from_stored("merged_projections_csv", csv_snapshot),
            SnapshotManifestFile::from_stored("merged_projections_parquet", &parquet),
        ],
    };
    let manifest_bytes =
        serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    let manifest = store
        .store_bytes(MANIFEST, &manifest_bytes)
        .await
        .with_context(|| format!("writing {MANIFEST}"))?;
    Ok((parquet, manifest))
}
