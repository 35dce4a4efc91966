//! Aggregate statistics over the request log.
//!
//! Every aggregate is computed fresh from the table. Multi-query reports run
//! inside one read transaction so their sections agree with each other.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite};

use super::{LogStore, RequestFilter};

/// Whole-set totals.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Totals {
    pub request_count: i64,
    pub error_count: i64,
    pub total_cost: f64,
    pub total_prompt_tokens: i64,
    pub total_completion_tokens: i64,
    pub total_tokens: i64,
    pub avg_duration_ms: f64,
}

/// Totals for one model or provider.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct GroupRow {
    pub key: String,
    pub request_count: i64,
    pub cost: f64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub tokens: i64,
}

/// Throughput and latency of successful calls for one model.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct PerformanceRow {
    pub model: String,
    pub request_count: i64,
    pub avg_duration_ms: f64,
    /// None when no call had both a duration and completion tokens.
    pub avg_tokens_per_sec: Option<f64>,
}

/// A recent failed call.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ErrorRow {
    pub id: String,
    pub timestamp: String,
    pub model: String,
    pub provider: String,
    pub error: String,
    pub duration_ms: i64,
}

/// Everything `GET /stats` reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsReport {
    pub totals: Totals,
    pub by_model: Vec<GroupRow>,
    pub by_provider: Vec<GroupRow>,
    pub performance: Vec<PerformanceRow>,
    pub recent_errors: Vec<ErrorRow>,
}

/// Cost of one model inside a time bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelCost {
    pub model: String,
    pub requests: i64,
    pub cost: f64,
    pub total_tokens: i64,
}

/// One calendar day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayBucket {
    pub date: String,
    pub requests: i64,
    pub cost: f64,
    pub total_tokens: i64,
    pub by_model: Vec<ModelCost>,
}

/// One hour of a day, `0..=23`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourBucket {
    pub hour: u32,
    pub requests: i64,
    pub cost: f64,
    pub total_tokens: i64,
    pub by_model: Vec<ModelCost>,
}

/// Earliest and latest record timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct DateRange {
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(sqlx::FromRow)]
struct BucketRow {
    bucket: String,
    model: String,
    requests: i64,
    cost: f64,
    total_tokens: i64,
}

/// SQLite modifier shifting UTC into the caller's local time.
fn offset_modifier(timezone_offset_minutes: i32) -> String {
    format!("{:+} minutes", timezone_offset_minutes)
}

const GROUP_COLUMNS: &str = "COUNT(*) AS request_count, \
     TOTAL(cost) AS cost, \
     COALESCE(SUM(prompt_tokens), 0) AS prompt_tokens, \
     COALESCE(SUM(completion_tokens), 0) AS completion_tokens, \
     COALESCE(SUM(total_tokens), 0) AS tokens";

impl LogStore {
    /// Totals, breakdowns, performance and the `error_limit` most recent errors.
    pub async fn stats(
        &self,
        filter: &RequestFilter,
        error_limit: u32,
    ) -> Result<StatsReport, sqlx::Error> {
        let mut tx = self.reader().begin().await?;

        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(*) AS request_count, \
             COUNT(error) AS error_count, \
             TOTAL(cost) AS total_cost, \
             COALESCE(SUM(prompt_tokens), 0) AS total_prompt_tokens, \
             COALESCE(SUM(completion_tokens), 0) AS total_completion_tokens, \
             COALESCE(SUM(total_tokens), 0) AS total_tokens, \
             COALESCE(AVG(duration_ms), 0.0) AS avg_duration_ms \
             FROM requests",
        );
        filter.push_where(&mut qb);
        let totals = qb.build_query_as::<Totals>().fetch_one(&mut *tx).await?;

        let mut by_model = Vec::new();
        let mut by_provider = Vec::new();
        for (column, out) in [("model", &mut by_model), ("provider", &mut by_provider)] {
            let mut qb = QueryBuilder::<Sqlite>::new(format!(
                "SELECT {column} AS key, {GROUP_COLUMNS} FROM requests"
            ));
            filter.push_where(&mut qb);
            qb.push(format!(" GROUP BY {column} ORDER BY cost DESC, key ASC"));
            *out = qb.build_query_as::<GroupRow>().fetch_all(&mut *tx).await?;
        }

        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT model, COUNT(*) AS request_count, \
             COALESCE(AVG(duration_ms), 0.0) AS avg_duration_ms, \
             AVG(CASE WHEN duration_ms > 0 AND completion_tokens IS NOT NULL \
                 THEN completion_tokens * 1000.0 / duration_ms END) AS avg_tokens_per_sec \
             FROM requests",
        );
        filter.push_where(&mut qb);
        qb.push(" AND error IS NULL GROUP BY model ORDER BY model ASC");
        let performance = qb
            .build_query_as::<PerformanceRow>()
            .fetch_all(&mut *tx)
            .await?;

        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT id, timestamp, model, provider, error, duration_ms FROM requests",
        );
        filter.push_where(&mut qb);
        qb.push(" AND error IS NOT NULL ORDER BY timestamp DESC, seq DESC LIMIT ")
            .push_bind(i64::from(error_limit));
        let recent_errors = qb.build_query_as::<ErrorRow>().fetch_all(&mut *tx).await?;

        tx.commit().await?;

        Ok(StatsReport {
            totals,
            by_model,
            by_provider,
            performance,
            recent_errors,
        })
    }

    /// Per-day cost by model for every day in `start..=end` (local dates).
    ///
    /// The filter should already bound the matching UTC range; days with no
    /// traffic are returned with zeros.
    pub async fn daily(
        &self,
        filter: &RequestFilter,
        start: NaiveDate,
        end: NaiveDate,
        timezone_offset_minutes: i32,
    ) -> Result<Vec<DayBucket>, sqlx::Error> {
        let rows = self
            .bucket_rows(filter, "date(timestamp, ", timezone_offset_minutes)
            .await?;
        Ok(fill_days(rows, start, end))
    }

    /// Per-hour cost by model; always 24 buckets.
    pub async fn hourly(
        &self,
        filter: &RequestFilter,
        timezone_offset_minutes: i32,
    ) -> Result<Vec<HourBucket>, sqlx::Error> {
        let rows = self
            .bucket_rows(filter, "strftime('%H', timestamp, ", timezone_offset_minutes)
            .await?;
        Ok(fill_hours(rows))
    }

    async fn bucket_rows(
        &self,
        filter: &RequestFilter,
        bucket_expr_prefix: &str,
        timezone_offset_minutes: i32,
    ) -> Result<Vec<BucketRow>, sqlx::Error> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT ");
        qb.push(bucket_expr_prefix)
            .push_bind(offset_modifier(timezone_offset_minutes))
            .push(
                ") AS bucket, model, COUNT(*) AS requests, TOTAL(cost) AS cost, \
                 COALESCE(SUM(total_tokens), 0) AS total_tokens FROM requests",
            );
        filter.push_where(&mut qb);
        qb.push(" GROUP BY bucket, model ORDER BY bucket ASC, cost DESC, model ASC");
        qb.build_query_as::<BucketRow>()
            .fetch_all(self.reader())
            .await
    }

    /// Earliest and latest timestamps among matching records.
    pub async fn date_range(&self, filter: &RequestFilter) -> Result<DateRange, sqlx::Error> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT MIN(timestamp) AS \"start\", MAX(timestamp) AS \"end\" FROM requests",
        );
        filter.push_where(&mut qb);
        qb.build_query_as::<DateRange>()
            .fetch_one(self.reader())
            .await
    }
}

#[derive(Default)]
struct Accumulator {
    requests: i64,
    cost: f64,
    total_tokens: i64,
    by_model: Vec<ModelCost>,
}

impl Accumulator {
    fn add(&mut self, row: BucketRow) {
        self.requests += row.requests;
        self.cost += row.cost;
        self.total_tokens += row.total_tokens;
        self.by_model.push(ModelCost {
            model: row.model,
            requests: row.requests,
            cost: row.cost,
            total_tokens: row.total_tokens,
        });
    }
}

fn group_rows(rows: Vec<BucketRow>) -> BTreeMap<String, Accumulator> {
    let mut buckets: BTreeMap<String, Accumulator> = BTreeMap::new();
    for row in rows {
        buckets.entry(row.bucket.clone()).or_default().add(row);
    }
    buckets
}

fn fill_days(rows: Vec<BucketRow>, start: NaiveDate, end: NaiveDate) -> Vec<DayBucket> {
    let mut buckets = group_rows(rows);
    start
        .iter_days()
        .take_while(|day| *day <= end)
        .map(|day| {
            let date = day.format("%Y-%m-%d").to_string();
            let acc = buckets.remove(&date).unwrap_or_default();
            DayBucket {
                date,
                requests: acc.requests,
                cost: acc.cost,
                total_tokens: acc.total_tokens,
                by_model: acc.by_model,
            }
        })
        .collect()
}

fn fill_hours(rows: Vec<BucketRow>) -> Vec<HourBucket> {
    let mut buckets = group_rows(rows);
    (0..24)
        .map(|hour| {
            let acc = buckets.remove(&format!("{:02}", hour)).unwrap_or_default();
            HourBucket {
                hour,
                requests: acc.requests,
                cost: acc.cost,
                total_tokens: acc.total_tokens,
                by_model: acc.by_model,
            }
        })
        .collect()
}
