//! Durable storage for node telemetry.

use std::future::Future;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use meshspy_common::NodeTelemetry;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS node_data (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id TEXT NOT NULL,
    timestamp DATETIME NOT NULL,
    temperature REAL NOT NULL,
    humidity REAL NOT NULL
)
"#;

const INSERT_RECORD: &str =
    "INSERT INTO node_data (node_id, timestamp, temperature, humidity) VALUES (?, ?, ?, ?)";

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to open store at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Timestamp {0} cannot be stored")]
    InvalidTimestamp(i64),
}

/// A telemetry record as written to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: i64,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub temperature: f32,
    pub humidity: f32,
}

/// Where decoded telemetry ends up.
pub trait TelemetrySink: Send + Sync + 'static {
    /// Durably append one record. Duplicates are stored as new rows.
    fn append(
        &self,
        record: &NodeTelemetry,
    ) -> impl Future<Output = Result<StoredRecord, StorageError>> + Send;
}

/// SQLite-backed sink.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl SqliteStore {
    /// Open or create the database file and make sure the table exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);

        // A single writer keeps ids in arrival order
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|source| StorageError::Open {
                path: path.clone(),
                source,
            })?;

        sqlx::query(CREATE_TABLE)
            .execute(&pool)
            .await
            .map_err(|source| StorageError::Open {
                path: path.clone(),
                source,
            })?;

        info!(path = %path.display(), "Telemetry store opened");
        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of stored records.
    pub async fn count(&self) -> Result<i64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM node_data")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    /// All records in insertion order.
    pub async fn records(&self) -> Result<Vec<StoredRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, node_id, timestamp, temperature, humidity FROM node_data ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(StoredRecord {
                    id: row.try_get("id")?,
                    node_id: row.try_get("node_id")?,
                    timestamp: row.try_get("timestamp")?,
                    temperature: row.try_get::<f64, _>("temperature")? as f32,
                    humidity: row.try_get::<f64, _>("humidity")? as f32,
                })
            })
            .collect()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl TelemetrySink for SqliteStore {
    async fn append(&self, record: &NodeTelemetry) -> Result<StoredRecord, StorageError> {
        let timestamp = DateTime::<Utc>::from_timestamp(record.timestamp, 0)
            .ok_or(StorageError::InvalidTimestamp(record.timestamp))?;

        let result = sqlx::query(INSERT_RECORD)
            .bind(&record.node_id)
            .bind(timestamp)
            .bind(f64::from(record.temperature))
            .bind(f64::from(record.humidity))
            .execute(&self.pool)
            .await?;

        let id = result.last_insert_rowid();
        debug!(id, node_id = %record.node_id, "Telemetry stored");

        Ok(StoredRecord {
            id,
            node_id: record.node_id.clone(),
            timestamp,
            temperature: record.temperature,
            humidity: record.humidity,
        })
    }
}
