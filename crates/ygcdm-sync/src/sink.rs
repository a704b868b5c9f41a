//! Fact table sinks: the Postgres append target and the parquet snapshot writer.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::{ArrayRef, Date32Array, Float64Array, RecordBatch, StringArray, TimestampMicrosecondArray};
use arrow_schema::{ArrowError, DataType, Field as ArrowField, Schema, TimeUnit};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use tokio::fs;
use tracing::info;
use uuid::Uuid;
use ygcdm_core::{FactRow, FACT_COLUMNS};

/// Rows per INSERT statement; 22 binds per row stays under the Postgres bind limit.
const INSERT_CHUNK_ROWS: usize = 1000;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("invalid target table `{0}`; expected `table` or `schema.table`")]
    InvalidTable(String),
    #[error("database error on {table}: {source}")]
    Database {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("building arrow batch: {0}")]
    Arrow(#[from] ArrowError),
    #[error("writing parquet: {0}")]
    Parquet(#[from] ParquetError),
    #[error("serializing snapshot manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkReceipt {
    pub rows_written: usize,
    pub location: String,
}

#[async_trait]
pub trait FactSink: Send + Sync {
    fn describe(&self) -> String;

    /// Append one run's rows. Either every row lands or none does.
    async fn persist(&self, run_id: Uuid, rows: &[FactRow]) -> Result<SinkReceipt, SinkError>;
}

/// A `table` or `schema.table` identifier checked to be safe for interpolation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetTable(String);

impl TargetTable {
    pub fn parse(raw: &str) -> Result<Self, SinkError> {
        let parts: Vec<&str> = raw.split('.').collect();
        let valid_part = |part: &&str| {
            !part.is_empty()
                && !part.starts_with(|c: char| c.is_ascii_digit())
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        };
        if parts.len() > 2 || !parts.iter().all(valid_part) {
            return Err(SinkError::InvalidTable(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Plain append into the fact table; no upsert, no truncation.
#[derive(Debug, Clone)]
pub struct PostgresSink {
    pool: PgPool,
    table: TargetTable,
}

impl PostgresSink {
    pub fn new(pool: PgPool, table: TargetTable) -> Self {
        Self { pool, table }
    }

    /// Connections open on first use, so an unreachable database fails the persist stage.
    pub fn connect_lazy(database_url: &str, table: &str) -> Result<Self, SinkError> {
        let table = TargetTable::parse(table)?;
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect_lazy(database_url)
            .map_err(|source| SinkError::Database {
                table: table.to_string(),
                source,
            })?;
        Ok(Self::new(pool, table))
    }

    pub fn insert_prefix(&self) -> String {
        format!("INSERT INTO {} ({}) ", self.table, FACT_COLUMNS.join(", "))
    }

    fn db_error(&self) -> impl FnOnce(sqlx::Error) -> SinkError + '_ {
        move |source| SinkError::Database {
            table: self.table.to_string(),
            source,
        }
    }
}

#[async_trait]
impl FactSink for PostgresSink {
    fn describe(&self) -> String {
        format!("postgres:{}", self.table)
    }

    async fn persist(&self, run_id: Uuid, rows: &[FactRow]) -> Result<SinkReceipt, SinkError> {
        if rows.is_empty() {
            info!(%run_id, table = %self.table, "no rows to insert");
            return Ok(SinkReceipt {
                rows_written: 0,
                location: self.describe(),
            });
        }

        let mut tx = self.pool.begin().await.map_err(self.db_error())?;
        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            let mut builder = QueryBuilder::<Postgres>::new(self.insert_prefix());
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.loaded_ts)
                    .push_bind(row.task_name.clone())
                    .push_bind(row.task_id.clone())
                    .push_bind(row.task_creation_dt)
                    .push_bind(row.board_name.clone())
                    .push_bind(row.column_name.clone())
                    .push_bind(row.task_status.clone())
                    .push_bind(row.subtask_id.clone())
                    .push_bind(row.subtask_name.clone())
                    .push_bind(row.subtask_status.clone())
                    .push_bind(row.quantity_plan)
                    .push_bind(row.quantity_fact)
                    .push_bind(row.delivery_term.clone())
                    .push_bind(row.loading_place.clone())
                    .push_bind(row.loading_start_date)
                    .push_bind(row.loading_end_date)
                    .push_bind(row.ship_name.clone())
                    .push_bind(row.discharging_place.clone())
                    .push_bind(row.deadline_start_date)
                    .push_bind(row.deadline_end_date)
                    .push_bind(row.prov_paid.clone())
                    .push_bind(row.final_paid.clone());
            });
            builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(self.db_error())?;
        }
        tx.commit().await.map_err(self.db_error())?;

        info!(%run_id, table = %self.table, rows = rows.len(), "fact rows inserted");
        Ok(SinkReceipt {
            rows_written: rows.len(),
            location: self.describe(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub rows: usize,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes each run's rows to `<root>/<run_id>/fact_rows.parquet` with a checksummed manifest.
#[derive(Debug, Clone)]
pub struct ParquetSnapshotSink {
    root: PathBuf,
}

impl ParquetSnapshotSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }
}

#[async_trait]
impl FactSink for ParquetSnapshotSink {
    fn describe(&self) -> String {
        format!("parquet:{}", self.root.display())
    }

    async fn persist(&self, run_id: Uuid, rows: &[FactRow]) -> Result<SinkReceipt, SinkError> {
        let run_dir = self.run_dir(run_id);
        fs::create_dir_all(&run_dir).await.map_err(|source| SinkError::Io {
            path: run_dir.clone(),
            source,
        })?;

        let parquet_path = run_dir.join("fact_rows.parquet");
        write_parquet(&parquet_path, fact_batch(rows)?)?;

        let manifest = SnapshotManifest {
            schema_version: 1,
            run_id,
            rows: rows.len(),
            files: vec![manifest_entry("fact_rows", &run_dir, &parquet_path)?],
        };
        let manifest_path = run_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest)?;
        fs::write(&manifest_path, bytes).await.map_err(|source| SinkError::Io {
            path: manifest_path.clone(),
            source,
        })?;

        info!(%run_id, path = %parquet_path.display(), rows = rows.len(), "parquet snapshot written");
        Ok(SinkReceipt {
            rows_written: rows.len(),
            location: manifest_path.display().to_string(),
        })
    }
}

pub fn fact_schema() -> Schema {
    let mut fields = Vec::with_capacity(FACT_COLUMNS.len());
    for name in FACT_COLUMNS {
        let field = match name {
            "loaded_ts" => ArrowField::new(
                name,
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                false,
            ),
            "task_id" => ArrowField::new(name, DataType::Utf8, false),
            "quantity_plan" | "quantity_fact" => ArrowField::new(name, DataType::Float64, true),
            name if name.ends_with("_date") || name.ends_with("_dt") => {
                ArrowField::new(name, DataType::Date32, true)
            }
            _ => ArrowField::new(name, DataType::Utf8, true),
        };
        fields.push(field);
    }
    Schema::new(fields)
}

fn text_column(rows: &[FactRow], get: impl Fn(&FactRow) -> Option<&str>) -> ArrayRef {
    Arc::new(StringArray::from(rows.iter().map(get).collect::<Vec<_>>()))
}

fn date_column(rows: &[FactRow], get: impl Fn(&FactRow) -> Option<NaiveDate>) -> ArrayRef {
    let epoch = DateTime::<Utc>::UNIX_EPOCH.date_naive();
    Arc::new(Date32Array::from(
        rows.iter()
            .map(|row| get(row).map(|d| d.signed_duration_since(epoch).num_days() as i32))
            .collect::<Vec<_>>(),
    ))
}

fn float_column(rows: &[FactRow], get: impl Fn(&FactRow) -> Option<f64>) -> ArrayRef {
    Arc::new(Float64Array::from(rows.iter().map(get).collect::<Vec<_>>()))
}

pub fn fact_batch(rows: &[FactRow]) -> Result<RecordBatch, ArrowError> {
    let loaded_ts = TimestampMicrosecondArray::from(
        rows.iter()
            .map(|row| row.loaded_ts.timestamp_micros())
            .collect::<Vec<_>>(),
    )
    .with_timezone("UTC");

    let columns: Vec<ArrayRef> = vec![
        Arc::new(loaded_ts),
        text_column(rows, |r| r.task_name.as_deref()),
        text_column(rows, |r| Some(r.task_id.as_str())),
        date_column(rows, |r| r.task_creation_dt),
        text_column(rows, |r| r.board_name.as_deref()),
        text_column(rows, |r| r.column_name.as_deref()),
        text_column(rows, |r| r.task_status.as_deref()),
        text_column(rows, |r| r.subtask_id.as_deref()),
        text_column(rows, |r| r.subtask_name.as_deref()),
        text_column(rows, |r| r.subtask_status.as_deref()),
        float_column(rows, |r| r.quantity_plan),
        float_column(rows, |r| r.quantity_fact),
        text_column(rows, |r| r.delivery_term.as_deref()),
        text_column(rows, |r| r.loading_place.as_deref()),
        date_column(rows, |r| r.loading_start_date),
        date_column(rows, |r| r.loading_end_date),
        text_column(rows, |r| r.ship_name.as_deref()),
        text_column(rows, |r| r.discharging_place.as_deref()),
        date_column(rows, |r| r.deadline_start_date),
        date_column(rows, |r| r.deadline_end_date),
        text_column(rows, |r| r.prov_paid.as_deref()),
        text_column(rows, |r| r.final_paid.as_deref()),
    ];
    RecordBatch::try_new(Arc::new(fact_schema()), columns)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<(), SinkError> {
    let file = File::create(path).map_err(|source| SinkError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<SnapshotManifestFile, SinkError> {
    let bytes = std::fs::read(path).map_err(|source| SinkError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
