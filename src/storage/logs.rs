//! Filtered, paginated reads and error deletion.

use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite};

use super::{LogStore, RequestFilter};

/// Default page size for request listings.
pub const DEFAULT_PAGE_SIZE: u32 = 50;
/// Largest page a caller may request.
pub const MAX_PAGE_SIZE: u32 = 200;

/// Offset/limit window over a filtered, newest-first result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Pagination {
    /// Clamp `limit` to `1..=MAX_PAGE_SIZE`, defaulting to `DEFAULT_PAGE_SIZE`.
    pub fn new(offset: Option<u32>, limit: Option<u32>) -> Self {
        Self {
            offset: offset.unwrap_or(0),
            limit: limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Summary projection: everything except the payload columns.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct RequestSummary {
    pub id: String,
    pub timestamp: String,
    pub model: String,
    pub provider: String,
    pub streaming: bool,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub cost: f64,
    pub unpriced: bool,
    pub estimated: bool,
    pub incomplete: bool,
    pub duration_ms: i64,
    pub error: Option<String>,
}

/// Full record including the raw request and response payloads.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct RequestDetail {
    pub id: String,
    pub timestamp: String,
    pub model: String,
    pub provider: String,
    pub streaming: bool,
    pub incoming_request: String,
    pub outbound_request: Option<String>,
    pub response: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub cost: f64,
    pub unpriced: bool,
    pub estimated: bool,
    pub incomplete: bool,
    pub duration_ms: i64,
    pub error: Option<String>,
}

/// Aggregates over the whole filtered set, independent of the page window.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct PageTotals {
    pub total: i64,
    pub total_tokens: i64,
    pub total_cost: f64,
    pub avg_cost: f64,
}

/// One page of summaries plus the whole-set totals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestPage {
    pub requests: Vec<RequestSummary>,
    #[serde(flatten)]
    pub totals: PageTotals,
    pub offset: u32,
    pub limit: u32,
}

const SUMMARY_COLUMNS: &str = "SELECT id, timestamp, model, provider, streaming, \
     prompt_tokens, completion_tokens, total_tokens, cost, unpriced, estimated, \
     incomplete, duration_ms, error FROM requests";

impl LogStore {
    /// Page through matching records, newest first; rows with equal
    /// timestamps come latest-inserted first.
    ///
    /// The page and the totals are read in one transaction, so they always
    /// describe the same set of rows.
    pub async fn query(
        &self,
        filter: &RequestFilter,
        page: Pagination,
    ) -> Result<RequestPage, sqlx::Error> {
        let mut tx = self.reader().begin().await?;

        let mut totals_qb = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(*) AS total, \
             COALESCE(SUM(total_tokens), 0) AS total_tokens, \
             TOTAL(cost) AS total_cost, \
             COALESCE(AVG(cost), 0.0) AS avg_cost \
             FROM requests",
        );
        filter.push_where(&mut totals_qb);
        let totals = totals_qb
            .build_query_as::<PageTotals>()
            .fetch_one(&mut *tx)
            .await?;

        let mut page_qb = QueryBuilder::<Sqlite>::new(SUMMARY_COLUMNS);
        filter.push_where(&mut page_qb);
        page_qb
            .push(" ORDER BY timestamp DESC, seq DESC LIMIT ")
            .push_bind(i64::from(page.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(page.offset));
        let requests = page_qb
            .build_query_as::<RequestSummary>()
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(RequestPage {
            requests,
            totals,
            offset: page.offset,
            limit: page.limit,
        })
    }

    /// Fetch one record with its payloads.
    pub async fn get(&self, id: &str) -> Result<Option<RequestDetail>, sqlx::Error> {
        sqlx::query_as::<_, RequestDetail>(
            "SELECT id, timestamp, model, provider, streaming, incoming_request, \
             outbound_request, response, prompt_tokens, completion_tokens, total_tokens, \
             cost, unpriced, estimated, incomplete, duration_ms, error \
             FROM requests WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.reader())
        .await
    }

    /// Delete every error record. Returns the number removed.
    pub async fn delete_errors(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM requests WHERE error IS NOT NULL")
            .execute(self.writer())
            .await?;
        tracing::info!(deleted = result.rows_affected(), "Deleted error records");
        Ok(result.rows_affected())
    }
}
