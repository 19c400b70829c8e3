//! Persistence for bidwatch: JSON snapshot files on disk and the
//! document-store upsert seam backed by Postgres JSONB.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bidwatch_core::{Opportunity, OpportunityType};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "bidwatch-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document store unreachable: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("document store query failed: {0}")]
    Query(#[source] sqlx::Error),
    #[error("record {document_id} could not be serialized: {source}")]
    Encode {
        document_id: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot at {path} is not valid JSON: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Write a pretty-printed JSON snapshot, creating parent directories and
/// overwriting any previous run's file at the same path.
pub async fn write_snapshot<T: Serialize>(path: &Path, value: &T) -> Result<(), SnapshotError> {
    let io_err = |source| SnapshotError::Io {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let body = serde_json::to_vec_pretty(value).map_err(|source| SnapshotError::Decode {
        path: path.display().to_string(),
        source,
    })?;
    tokio::fs::write(path, body).await.map_err(io_err)?;
    debug!(path = %path.display(), "snapshot written");
    Ok(())
}

pub async fn read_snapshot<T: DeserializeOwned>(path: &Path) -> Result<T, SnapshotError> {
    let body = tokio::fs::read(path).await.map_err(|source| SnapshotError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_slice(&body).map_err(|source| SnapshotError::Decode {
        path: path.display().to_string(),
        source,
    })
}

/// Outcome of one upsert batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
}

impl UpsertReport {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.failed
    }
}

/// Replace-on-conflict document sink keyed by `_document_id`.
#[async_trait]
pub trait OpportunityStore: Send + Sync {
    async fn upsert(&self, records: &[Opportunity]) -> Result<UpsertReport, StoreError>;

    /// Number of stored documents for one section.
    async fn count(&self, kind: OpportunityType) -> Result<i64, StoreError>;
}

/// Postgres-backed store. Each record lands as one JSONB document in the
/// `opportunities` table, keyed by its document id; a conflict replaces the
/// stored body wholesale.
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

const SCHEMA_SQL: &str = "\
CREATE TABLE IF NOT EXISTS opportunities (
    document_id      TEXT PRIMARY KEY,
    opportunity_type TEXT NOT NULL,
    body             JSONB NOT NULL,
    first_seen_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at       TIMESTAMPTZ NOT NULL DEFAULT now()
)";

const UPSERT_SQL: &str = "\
INSERT INTO opportunities (document_id, opportunity_type, body)
VALUES ($1, $2, $3)
ON CONFLICT (document_id) DO UPDATE
    SET opportunity_type = EXCLUDED.opportunity_type,
        body = EXCLUDED.body,
        updated_at = now()
RETURNING (xmax = 0) AS inserted";

impl PgDocumentStore {
    /// Connect and make sure the schema exists. A refused connection is the
    /// fatal-to-upload case, so it gets its own error variant.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .map_err(StoreError::Connect)?;
        sqlx::query(SCHEMA_SQL)
            .execute(&pool)
            .await
            .map_err(StoreError::Query)?;
        info!("document store ready");
        Ok(Self { pool })
    }

}

#[async_trait]
impl OpportunityStore for PgDocumentStore {
    async fn upsert(&self, records: &[Opportunity]) -> Result<UpsertReport, StoreError> {
        let mut report = UpsertReport::default();

        for record in records {
            let body = match serde_json::to_value(record) {
                Ok(body) => body,
                Err(source) => {
                    warn!(document_id = %record.document_id, error = %source, "skipping unencodable record");
                    report.failed += 1;
                    continue;
                }
            };

            let result = sqlx::query(UPSERT_SQL)
                .bind(&record.document_id)
                .bind(record.opportunity_type.as_str())
                .bind(&body)
                .fetch_one(&self.pool)
                .await;

            match result {
                Ok(row) => {
                    let inserted: bool = row.try_get("inserted").map_err(StoreError::Query)?;
                    if inserted {
                        report.inserted += 1;
                    } else {
                        report.updated += 1;
                    }
                }
                Err(err) => {
                    warn!(document_id = %record.document_id, error = %err, "upsert failed");
                    report.failed += 1;
                }
            }
        }

        debug!(
            inserted = report.inserted,
            updated = report.updated,
            failed = report.failed,
            "upsert batch done"
        );
        Ok(report)
    }

    async fn count(&self, kind: OpportunityType) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT count(*) AS n FROM opportunities WHERE opportunity_type = $1")
            .bind(kind.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::Query)?;
        row.try_get("n").map_err(StoreError::Query)
    }
}

/// In-memory store with the same replace semantics, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<String, Opportunity>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.documents.lock().await.len()
    }

    pub async fn get(&self, document_id: &str) -> Option<Opportunity> {
        self.documents.lock().await.get(document_id).cloned()
    }
}

#[async_trait]
impl OpportunityStore for MemoryStore {
    async fn upsert(&self, records: &[Opportunity]) -> Result<UpsertReport, StoreError> {
        let mut documents = self.documents.lock().await;
        let mut report = UpsertReport::default();
        for record in records {
            match documents.insert(record.document_id.clone(), record.clone()) {
                None => report.inserted += 1,
                Some(_) => report.updated += 1,
            }
        }
        Ok(report)
    }

    async fn count(&self, kind: OpportunityType) -> Result<i64, StoreError> {
        let documents = self.documents.lock().await;
        Ok(documents
            .values()
            .filter(|record| record.opportunity_type == kind)
            .count() as i64)
    }
}
