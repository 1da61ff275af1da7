// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persistent certificate storage.
//!
//! Stores issued client certificates keyed by target URL so a restart does
//! not re-enrol against every CA. Backed by SQLite in WAL mode; certs are
//! tiny and written once per host, so a low-concurrency pool is plenty.
//!
//! # Uniqueness
//!
//! `add` requires the key to be absent and fails with a conflict
//! otherwise; enrolment races are surfaced instead of silently
//! overwriting an issued certificate.
//!
//! # Contention
//!
//! A second process holding the database file makes SQLite report
//! busy/locked. Certificate writes are rare and tiny, so a short fixed
//! retry schedule rides out the contention; anything still failing after
//! that surfaces to the caller.

use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};

/// Retry schedule for writes against a contended database file.
struct RetryPolicy {
    /// Total attempts, including the first.
    tries: u32,
    /// Delay before the first retry; doubles per attempt.
    base: Duration,
    /// Ceiling for the doubled delay.
    cap: Duration,
}

/// Five tries, 10 ms doubling to a 500 ms ceiling.
const WRITE_RETRY: RetryPolicy = RetryPolicy {
    tries: 5,
    base: Duration::from_millis(10),
    cap: Duration::from_millis(500),
};

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.cap)
    }

    /// Run `op`, retrying while SQLite reports the file as contended.
    async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> std::result::Result<T, sqlx::Error>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if file_contended(&e) && attempt + 1 < self.tries => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation = what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Certificate store contended, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// True for SQLITE_BUSY (5) and SQLITE_LOCKED (6); nothing else is worth
/// retrying.
fn file_contended(e: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db) = e else {
        return false;
    };
    if matches!(db.code().as_deref(), Some("5") | Some("6")) {
        return true;
    }
    let message = db.message().to_lowercase();
    message.contains("database is locked") || message.contains("database is busy")
}

/// Normalize a store key: the target URL with any trailing `/` trimmed.
pub fn store_key(url: &str) -> &str {
    url.trim_end_matches('/')
}

/// Persistent URL → certificate-PEM store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a certificate. The key must be unique; an existing entry is
    /// a conflict.
    async fn add(&self, url: &str, cert_pem: &str) -> Result<()>;

    /// Fetch a certificate, or `NotFound` when the key is absent.
    ///
    /// `NotFound` is the only outcome that permits fresh enrolment.
    async fn fetch(&self, url: &str) -> Result<String>;

    /// Delete a certificate, or `NotFound` when the key is absent.
    async fn delete(&self, url: &str) -> Result<()>;
}

/// SQLite-backed certificate store.
pub struct SqliteCertStore {
    pool: SqlitePool,
}

impl SqliteCertStore {
    /// Open (or create) the store at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Opening certificate store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| SyncError::Config(format!("invalid certificate store path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS certificates (
                url TEXT PRIMARY KEY,
                cert_pem TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Close the connection pool gracefully.
    pub async fn close(&self) {
        if let Err(e) = WRITE_RETRY
            .run("cert_checkpoint", || async {
                sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                    .execute(&self.pool)
                    .await
            })
            .await
        {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Certificate store closed");
    }
}

#[async_trait]
impl Store for SqliteCertStore {
    async fn add(&self, url: &str, cert_pem: &str) -> Result<()> {
        let key = store_key(url).to_string();

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT url FROM certificates WHERE url = ?")
                .bind(&key)
                .fetch_optional(&self.pool)
                .await?;
        if existing.is_some() {
            return Err(SyncError::AlreadyExists(format!(
                "certificate for {} already stored",
                key
            )));
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        let pem = cert_pem.to_string();
        let pool = &self.pool;

        WRITE_RETRY
            .run("cert_add", || async {
                sqlx::query("INSERT INTO certificates (url, cert_pem, created_at) VALUES (?, ?, ?)")
                    .bind(&key)
                    .bind(&pem)
                    .bind(now)
                    .execute(pool)
                    .await
            })
            .await?;

        debug!(url = %key, "Stored certificate");
        Ok(())
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let key = store_key(url);
        let row: Option<(String,)> =
            sqlx::query_as("SELECT cert_pem FROM certificates WHERE url = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((pem,)) => Ok(pem),
            None => Err(SyncError::NotFound(format!("no certificate for {}", key))),
        }
    }

    async fn delete(&self, url: &str) -> Result<()> {
        let key = store_key(url).to_string();
        let pool = &self.pool;

        let result = WRITE_RETRY
            .run("cert_delete", || async {
                sqlx::query("DELETE FROM certificates WHERE url = ?")
                    .bind(&key)
                    .execute(pool)
                    .await
            })
            .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::NotFound(format!("no certificate for {}", key)));
        }
        debug!(url = %key, "Deleted certificate");
        Ok(())
    }
}
