//! Append-only audit sink for PII disclosures. Every response that
//! carries decrypted personal fields must leave a record here saying
//! which principal read what.

use std::time::Duration;

use amani_contracts::canonical;
use sqlx::postgres::PgPoolOptions;
use ulid::Ulid;

pub const ACTION_PII_RECORD_READ: &str = "PII_RECORD_READ";
pub const ACTION_PII_LIST_READ: &str = "PII_LIST_READ";
pub const ACTION_SYNC_PULL: &str = "SYNC_PULL";

#[derive(Debug)]
pub enum AuditError {
    Timeout,
    Sqlx(sqlx::Error),
}

impl std::fmt::Display for AuditError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditError::Timeout => write!(f, "audit write timed out"),
            AuditError::Sqlx(err) => write!(f, "audit sql error: {}", err),
        }
    }
}

impl std::error::Error for AuditError {}

impl From<sqlx::Error> for AuditError {
    fn from(value: sqlx::Error) -> Self {
        AuditError::Sqlx(value)
    }
}

#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub principal_id: String,
    pub action: &'static str,
    pub description: String,
    pub details: serde_json::Value,
}

#[derive(Clone)]
pub struct AuditWriter {
    pool: sqlx::PgPool,
    write_timeout: Duration,
}

impl AuditWriter {
    pub async fn connect(db_url: &str, write_timeout: Duration) -> Result<Self, AuditError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new().max_connections(4).connect(db_url),
        )
        .await
        .map_err(|_| AuditError::Timeout)??;

        Ok(Self {
            pool,
            write_timeout,
        })
    }

    pub async fn connect_and_migrate(
        db_url: &str,
        write_timeout: Duration,
    ) -> Result<Self, AuditError> {
        let writer = Self::connect(db_url, write_timeout).await?;
        writer.migrate().await?;
        Ok(writer)
    }

    pub async fn migrate(&self) -> Result<(), AuditError> {
        tokio::time::timeout(Duration::from_secs(10), migrate(&self.pool))
            .await
            .map_err(|_| AuditError::Timeout)??;
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), AuditError> {
        tokio::time::timeout(
            self.write_timeout.max(Duration::from_millis(200)),
            sqlx::query("SELECT 1").execute(&self.pool),
        )
        .await
        .map_err(|_| AuditError::Timeout)??;
        Ok(())
    }

    /// Write one entry and return its id. The details hash binds the
    /// stored JSON so later tampering is detectable.
    pub async fn record(&self, record: AuditRecord) -> Result<String, AuditError> {
        let entry_id = Ulid::new().to_string();
        let details_hash = canonical::hash_canonical_json(&record.details);

        tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "INSERT INTO amani_audit_log (entry_id, principal_id, action, description, details_json, details_hash) VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(&entry_id)
            .bind(&record.principal_id)
            .bind(record.action)
            .bind(&record.description)
            .bind(&record.details)
            .bind(details_hash)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| AuditError::Timeout)??;

        Ok(entry_id)
    }

    /// Fire-and-forget variant for list/sync reads where the record
    /// describes counts rather than a specific disclosure. Failures are
    /// logged, not surfaced.
    pub fn record_detached(&self, record: AuditRecord) {
        let writer = self.clone();
        tokio::spawn(async move {
            let action = record.action;
            if let Err(err) = writer.record(record).await {
                tracing::warn!(action, error = %err, "audit write dropped");
            }
        });
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
