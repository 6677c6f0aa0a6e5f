//! Finished-mission catalog
//!
//! Completed downloads leave the ledger-backed store and are recorded here.
//! The manager only depends on the [`FinishedCatalog`] contract; the SQLite
//! implementation is what the CLI uses.

use crate::error::EngineError;
use async_trait::async_trait;
use blockget_types::FinishedRecord;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::Row;
use std::path::{Path, PathBuf};

/// Persistence contract for finished missions
#[async_trait]
pub trait FinishedCatalog: Send + Sync {
    /// Load every finished mission; an empty catalog yields an empty vector
    async fn load_missions(&self) -> Result<Vec<FinishedRecord>, EngineError>;

    async fn add_mission(&self, record: &FinishedRecord) -> Result<(), EngineError>;

    /// Replace the record stored for the same (location, name)
    async fn update_mission(&self, record: &FinishedRecord) -> Result<(), EngineError>;

    async fn delete_mission(&self, record: &FinishedRecord) -> Result<(), EngineError>;
}

/// SQLite-backed catalog
#[derive(Clone, Debug)]
pub struct SqliteCatalog {
    pool: SqlitePool,
}

impl SqliteCatalog {
    /// Open (and create if missing) the catalog database
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, EngineError> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS finished_missions (
                location TEXT NOT NULL,
                name TEXT NOT NULL,
                url TEXT NOT NULL,
                length INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE(location, name)
            );

            CREATE INDEX IF NOT EXISTS idx_finished_created ON finished_missions(created_at);
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    async fn upsert(&self, record: &FinishedRecord) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO finished_missions (location, name, url, length, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(location, name) DO UPDATE SET
                url = excluded.url,
                length = excluded.length,
                created_at = excluded.created_at
            "#,
        )
        .bind(record.location.to_string_lossy().to_string())
        .bind(&record.name)
        .bind(&record.url)
        .bind(record.length as i64)
        .bind(record.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl FinishedCatalog for SqliteCatalog {
    async fn load_missions(&self) -> Result<Vec<FinishedRecord>, EngineError> {
        let rows = sqlx::query("SELECT * FROM finished_missions ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let millis: i64 = row.get("created_at");
                let created_at = Utc
                    .timestamp_millis_opt(millis)
                    .single()
                    .ok_or_else(|| {
                        EngineError::Serialization(format!("invalid timestamp {}", millis))
                    })?;
                Ok(FinishedRecord {
                    url: row.get("url"),
                    location: PathBuf::from(row.get::<String, _>("location")),
                    name: row.get("name"),
                    length: row.get::<i64, _>("length") as u64,
                    created_at,
                })
            })
            .collect()
    }

    async fn add_mission(&self, record: &FinishedRecord) -> Result<(), EngineError> {
        self.upsert(record).await
    }

    async fn update_mission(&self, record: &FinishedRecord) -> Result<(), EngineError> {
        self.upsert(record).await
    }

    async fn delete_mission(&self, record: &FinishedRecord) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM finished_missions WHERE location = ? AND name = ?")
            .bind(record.location.to_string_lossy().to_string())
            .bind(&record.name)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

/// In-process catalog, lost when the process exits
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    records: Mutex<Vec<FinishedRecord>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<FinishedRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    pub fn records(&self) -> Vec<FinishedRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl FinishedCatalog for MemoryCatalog {
    async fn load_missions(&self) -> Result<Vec<FinishedRecord>, EngineError> {
        Ok(self.records.lock().clone())
    }

    async fn add_mission(&self, record: &FinishedRecord) -> Result<(), EngineError> {
        self.update_mission(record).await
    }

    async fn update_mission(&self, record: &FinishedRecord) -> Result<(), EngineError> {
        let mut records = self.records.lock();
        records.retain(|r| !(r.location == record.location && r.name == record.name));
        records.push(record.clone());
        Ok(())
    }

    async fn delete_mission(&self, record: &FinishedRecord) -> Result<(), EngineError> {
        self.records
            .lock()
            .retain(|r| !(r.location == record.location && r.name == record.name));
        Ok(())
    }
}
