//! SQLite request log store.
//!
//! Appends go through a single-connection writer pool, so concurrent calls
//! never interleave partial writes. Reads use a separate pool; with WAL they
//! run alongside the writer and only ever see committed rows.

pub mod filter;
pub mod logs;
pub mod record;
pub mod stats;

pub use filter::RequestFilter;
pub use logs::{PageTotals, Pagination, RequestDetail, RequestPage, RequestSummary};
pub use record::{
    format_timestamp, PendingRecord, RecordOutcome, RequestRecord, ABANDONED_ERROR, UNKNOWN_PROVIDER,
};
pub use stats::{DateRange, DayBucket, HourBucket, StatsReport};

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

/// Handle to the request log. Cheap to clone.
#[derive(Clone, Debug)]
pub struct LogStore {
    writer: SqlitePool,
    reader: SqlitePool,
    write_failures: Arc<AtomicU64>,
}

fn connect_options(db_path: &str) -> Result<SqliteConnectOptions, sqlx::Error> {
    Ok(SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path))?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5)))
}

impl LogStore {
    /// Open (creating if needed) the database file and run migrations.
    ///
    /// The database file is created automatically if it doesn't exist.
    /// WAL journal mode lets readers proceed while a write is in progress.
    pub async fn open(db_path: &str) -> Result<Self, sqlx::Error> {
        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options(db_path)?.create_if_missing(true))
            .await?;

        // Apply embedded migrations
        sqlx::migrate!().run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(connect_options(db_path)?)
            .await?;

        Ok(Self {
            writer,
            reader,
            write_failures: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Durably append one finalized record.
    ///
    /// Returns only after the row is committed. A failure is logged and
    /// counted before being returned, so it is never silent.
    pub async fn append(&self, record: &RequestRecord) -> Result<(), sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO requests (
                id, timestamp, model, provider, streaming,
                incoming_request, outbound_request, response,
                prompt_tokens, completion_tokens, total_tokens,
                cost, unpriced, estimated, incomplete, duration_ms, error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.timestamp)
        .bind(&record.model)
        .bind(&record.provider)
        .bind(record.streaming)
        .bind(&record.incoming_request)
        .bind(record.outbound_request.as_deref())
        .bind(record.response.as_deref())
        .bind(record.usage.map(|u| i64::from(u.prompt_tokens)))
        .bind(record.usage.map(|u| i64::from(u.completion_tokens)))
        .bind(record.total_tokens().map(i64::from))
        .bind(record.cost)
        .bind(record.unpriced)
        .bind(record.estimated)
        .bind(record.incomplete)
        .bind(record.duration_ms)
        .bind(record.error.as_deref())
        .execute(&self.writer)
        .await;

        if let Err(e) = &result {
            let failures = self.write_failures.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::error!(
                request_id = %record.id,
                model = %record.model,
                error = %e,
                write_failures = failures,
                "Failed to write request record"
            );
        }
        result.map(|_| ())
    }

    /// Append from a spawned task and wait for it.
    ///
    /// The write completes even if the caller is dropped mid-await.
    pub async fn append_detached(&self, record: RequestRecord) -> bool {
        let store = self.clone();
        tokio::spawn(async move { store.append(&record).await.is_ok() })
            .await
            .unwrap_or(false)
    }

    /// Queue an append without waiting, for use from synchronous code such
    /// as `Drop`.
    pub fn spawn_append(&self, record: RequestRecord) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.clone();
                handle.spawn(async move {
                    // Failures are logged and counted by append
                    let _ = store.append(&record).await;
                });
            }
            Err(_) => {
                let failures = self.write_failures.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::error!(
                    request_id = %record.id,
                    write_failures = failures,
                    "No async runtime available, request record not written"
                );
            }
        }
    }

    /// Number of appends that failed since the process started.
    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    /// Close both pools, waiting for in-progress writes.
    pub async fn close(&self) {
        self.writer.close().await;
        self.reader.close().await;
    }

    pub(crate) fn reader(&self) -> &SqlitePool {
        &self.reader
    }

    pub(crate) fn writer(&self) -> &SqlitePool {
        &self.writer
    }
}
