//! Analytics query parameters, time range resolution, and handlers.

use axum::{
    extract::State,
    Json,
};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::extract::ApiQuery;
use super::server::AppState;
use crate::error::Error;
use crate::storage::{DateRange, DayBucket, HourBucket, RequestFilter, StatsReport};

/// Days covered by `/stats/daily` when no range is given.
const DEFAULT_DAILY_DAYS: i64 = 30;
/// Longest range `/stats/daily` will zero-fill.
const MAX_DAILY_DAYS: i64 = 3660;
/// Largest accepted timezone offset, in minutes either side of UTC.
const MAX_OFFSET_MINUTES: i32 = 14 * 60;
const DEFAULT_ERROR_LIMIT: u32 = 10;
const MAX_ERROR_LIMIT: u32 = 100;

/// Filters shared by every analytics endpoint.
///
/// Time bounds, in order of precedence:
/// 1. `since` / `until` (RFC 3339)
/// 2. `hours` back from now
/// 3. `start_date` / `end_date` (local dates, shifted by `timezone_offset`)
#[derive(Debug, Default, Deserialize)]
pub struct FilterParams {
    pub since: Option<String>,
    pub until: Option<String>,
    pub hours: Option<u32>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    /// Minutes east of UTC, e.g. -480 for PST.
    pub timezone_offset: Option<i32>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub min_cost: Option<f64>,
    pub max_cost: Option<f64>,
    pub search: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_instant(name: &str, value: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Validation(format!("Invalid '{}' timestamp: {}", name, e)))
}

fn parse_date(name: &str, value: &str) -> Result<NaiveDate, Error> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|e| {
        Error::Validation(format!(
            "Invalid '{}' date '{}', expected YYYY-MM-DD: {}",
            name, value, e
        ))
    })
}

fn out_of_range(what: impl std::fmt::Display) -> Error {
    Error::Validation(format!("{} is outside the supported time range", what))
}

/// UTC instant of local midnight starting `date`.
pub fn local_midnight_utc(
    date: NaiveDate,
    timezone_offset_minutes: i32,
) -> Result<DateTime<Utc>, Error> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::default()))
        .checked_sub_signed(Duration::minutes(i64::from(timezone_offset_minutes)))
        .ok_or_else(|| out_of_range(date))
}

/// Local midnight ending `date`, or `None` past the last representable day.
fn local_day_end_utc(
    date: NaiveDate,
    timezone_offset_minutes: i32,
) -> Result<Option<DateTime<Utc>>, Error> {
    date.succ_opt()
        .map(|next| local_midnight_utc(next, timezone_offset_minutes))
        .transpose()
}

/// The caller's local calendar date at `now`.
pub fn local_today(now: DateTime<Utc>, timezone_offset_minutes: i32) -> NaiveDate {
    (now + Duration::minutes(i64::from(timezone_offset_minutes))).date_naive()
}

impl FilterParams {
    pub fn timezone_offset(&self) -> Result<i32, Error> {
        let offset = self.timezone_offset.unwrap_or(0);
        if offset.abs() > MAX_OFFSET_MINUTES {
            return Err(Error::Validation(format!(
                "timezone_offset must be within +/-{} minutes, got {}",
                MAX_OFFSET_MINUTES, offset
            )));
        }
        Ok(offset)
    }

    fn start_date(&self) -> Result<Option<NaiveDate>, Error> {
        non_empty(&self.start_date)
            .map(|d| parse_date("start_date", &d))
            .transpose()
    }

    fn end_date(&self) -> Result<Option<NaiveDate>, Error> {
        non_empty(&self.end_date)
            .map(|d| parse_date("end_date", &d))
            .transpose()
    }

    /// Non-time filters only.
    fn base_filter(&self) -> RequestFilter {
        RequestFilter {
            model: non_empty(&self.model),
            provider: non_empty(&self.provider),
            min_cost: self.min_cost,
            max_cost: self.max_cost,
            search: non_empty(&self.search),
            ..Default::default()
        }
    }

    /// Resolve every parameter into a storage filter.
    pub fn to_filter(&self, now: DateTime<Utc>) -> Result<RequestFilter, Error> {
        let mut filter = self.base_filter();
        let since = non_empty(&self.since);
        let until = non_empty(&self.until);

        if since.is_some() || until.is_some() {
            filter.since = since.map(|s| parse_instant("since", &s)).transpose()?;
            filter.until = until.map(|u| parse_instant("until", &u)).transpose()?;
        } else if let Some(hours) = self.hours {
            let since = Duration::try_hours(i64::from(hours))
                .and_then(|window| now.checked_sub_signed(window))
                .ok_or_else(|| out_of_range(format!("hours={}", hours)))?;
            filter.since = Some(since);
        } else {
            let offset = self.timezone_offset()?;
            filter.since = self
                .start_date()?
                .map(|d| local_midnight_utc(d, offset))
                .transpose()?;
            filter.until = match self.end_date()? {
                Some(d) => local_day_end_utc(d, offset)?,
                None => None,
            };
        }
        Ok(filter)
    }
}

/// Extra parameters for GET /stats.
#[derive(Debug, Default, Deserialize)]
pub struct StatsOptions {
    /// How many recent errors to include (default 10, max 100).
    pub errors_limit: Option<u32>,
}

/// Handle GET /stats
pub async fn stats(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<FilterParams>,
    ApiQuery(options): ApiQuery<StatsOptions>,
) -> Result<Json<StatsReport>, Error> {
    let filter = params.to_filter(Utc::now())?;
    let limit = options
        .errors_limit
        .unwrap_or(DEFAULT_ERROR_LIMIT)
        .min(MAX_ERROR_LIMIT);
    let report = state.store.stats(&filter, limit).await?;
    Ok(Json(report))
}

/// Response for GET /stats/daily.
#[derive(Debug, Serialize)]
pub struct DailyResponse {
    pub daily: Vec<DayBucket>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub timezone_offset: i32,
    pub total_cost: f64,
    pub total_requests: i64,
}

/// Resolve the local date range for a daily rollup.
///
/// Defaults to the last 30 days ending today (local).
pub fn daily_range(
    params: &FilterParams,
    now: DateTime<Utc>,
) -> Result<(NaiveDate, NaiveDate), Error> {
    let offset = params.timezone_offset()?;
    let end = params
        .end_date()?
        .unwrap_or_else(|| local_today(now, offset));
    let start = match params.start_date()? {
        Some(start) => start,
        None => end
            .checked_sub_signed(Duration::days(DEFAULT_DAILY_DAYS - 1))
            .ok_or_else(|| out_of_range(end))?,
    };

    if start > end {
        return Err(Error::Validation(format!(
            "start_date {} is after end_date {}",
            start, end
        )));
    }
    if (end - start).num_days() >= MAX_DAILY_DAYS {
        return Err(Error::Validation(format!(
            "Date range too long, at most {} days",
            MAX_DAILY_DAYS
        )));
    }
    Ok((start, end))
}

/// Handle GET /stats/daily
pub async fn daily(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<FilterParams>,
) -> Result<Json<DailyResponse>, Error> {
    let offset = params.timezone_offset()?;
    let (start, end) = daily_range(&params, Utc::now())?;

    let mut filter = params.base_filter();
    filter.since = Some(local_midnight_utc(start, offset)?);
    filter.until = local_day_end_utc(end, offset)?;

    let daily = state.store.daily(&filter, start, end, offset).await?;
    let total_cost: f64 = daily.iter().map(|d| d.cost).sum();
    let total_requests: i64 = daily.iter().map(|d| d.requests).sum();

    Ok(Json(DailyResponse {
        daily,
        start_date: start,
        end_date: end,
        timezone_offset: offset,
        total_cost,
        total_requests,
    }))
}

/// Query parameters for GET /stats/hourly.
#[derive(Debug, Deserialize)]
pub struct HourlyParams {
    pub date: Option<String>,
}

/// Response for GET /stats/hourly.
#[derive(Debug, Serialize)]
pub struct HourlyResponse {
    pub hourly: Vec<HourBucket>,
    pub date: NaiveDate,
    pub timezone_offset: i32,
    pub total_cost: f64,
    pub total_requests: i64,
}

/// Handle GET /stats/hourly
pub async fn hourly(
    State(state): State<AppState>,
    ApiQuery(hourly): ApiQuery<HourlyParams>,
    ApiQuery(params): ApiQuery<FilterParams>,
) -> Result<Json<HourlyResponse>, Error> {
    let date = non_empty(&hourly.date)
        .ok_or_else(|| Error::Validation("date parameter is required".to_string()))?;
    let date = parse_date("date", &date)?;
    let offset = params.timezone_offset()?;

    let mut filter = params.base_filter();
    filter.since = Some(local_midnight_utc(date, offset)?);
    filter.until = local_day_end_utc(date, offset)?;

    let buckets = state.store.hourly(&filter, offset).await?;
    let total_cost: f64 = buckets.iter().map(|h| h.cost).sum();
    let total_requests: i64 = buckets.iter().map(|h| h.requests).sum();

    Ok(Json(HourlyResponse {
        hourly: buckets,
        date,
        timezone_offset: offset,
        total_cost,
        total_requests,
    }))
}

/// Handle GET /stats/date-range
pub async fn date_range(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<FilterParams>,
) -> Result<Json<DateRange>, Error> {
    let filter = params.to_filter(Utc::now())?;
    Ok(Json(state.store.date_range(&filter).await?))
}
