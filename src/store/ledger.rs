//! Processed ledger: durable record of messages whose side effect completed.
//!
//! Append-only. Callers check `seen()` before any side effect and call
//! `record()` only after it succeeded.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::pipeline::types::{ProcessedRecord, VerdictKind};
use crate::store::migrations;

#[async_trait]
pub trait ProcessedLedger: Send + Sync {
    /// Whether a record exists for `id`.
    async fn seen(&self, id: &str) -> Result<bool, DatabaseError>;

    /// Append a record. Recording an id twice keeps the first record.
    async fn record(
        &self,
        id: &str,
        verdict: VerdictKind,
        reason: &str,
    ) -> Result<(), DatabaseError>;

    async fn get(&self, id: &str) -> Result<Option<ProcessedRecord>, DatabaseError>;

    /// Number of records.
    async fn count(&self) -> Result<u64, DatabaseError>;
}

/// libSQL-backed ledger.
///
/// Reads share one connection; writes are serialized through `write_lock`.
pub struct LibSqlLedger {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlLedger {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create ledger directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let ledger = Self::from_database(db).await?;

        // WAL lets readers proceed while the single writer commits.
        ledger
            .conn
            .query("PRAGMA journal_mode=WAL", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable WAL: {e}")))?;

        info!(path = %path.display(), "Ledger opened");
        Ok(ledger)
    }

    /// Create an in-memory ledger (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }
}

/// Parse an RFC 3339 or SQLite datetime string.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

#[async_trait]
impl ProcessedLedger for LibSqlLedger {
    async fn seen(&self, id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM processed_messages WHERE message_id = ?1",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("seen: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("seen: {e}")))?;
        Ok(row.is_some())
    }

    async fn record(
        &self,
        id: &str,
        verdict: VerdictKind,
        reason: &str,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO processed_messages (message_id, verdict, reason, processed_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, verdict.as_str(), reason, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record: {e}")))?;

        if inserted == 0 {
            debug!(id, "Ledger already had a record, keeping the first");
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ProcessedRecord>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT message_id, verdict, reason, processed_at
                 FROM processed_messages WHERE message_id = ?1",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get: {e}")))?
        else {
            return Ok(None);
        };

        let message_id: String = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("get message_id: {e}")))?;
        let verdict: String = row
            .get(1)
            .map_err(|e| DatabaseError::Query(format!("get verdict: {e}")))?;
        let reason: String = row
            .get(2)
            .map_err(|e| DatabaseError::Query(format!("get reason: {e}")))?;
        let processed_at: String = row
            .get(3)
            .map_err(|e| DatabaseError::Query(format!("get processed_at: {e}")))?;

        Ok(Some(ProcessedRecord {
            message_id,
            verdict: verdict.parse().map_err(DatabaseError::Query)?,
            reason,
            processed_at: parse_datetime(&processed_at),
        }))
    }

    async fn count(&self) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM processed_messages", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("count: {e}")))?;
        match row {
            Some(row) => {
                let n: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("count: {e}")))?;
                Ok(n.max(0) as u64)
            }
            None => Ok(0),
        }
    }
}
