//! Request record lifecycle: begun at dispatch, finalized exactly once.

use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};

use super::LogStore;
use crate::catalog::Cost;
use crate::usage::TokenUsage;

/// Provider name recorded when the call never reached a provider.
pub const UNKNOWN_PROVIDER: &str = "unknown";

/// Canonical timestamp format: RFC 3339, microseconds, explicit `+00:00`.
///
/// Fixed width, so lexical order equals chronological order in SQL.
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// A finalized, immutable log entry for one top-level call.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestRecord {
    pub id: String,
    pub timestamp: String,
    pub model: String,
    pub provider: String,
    pub streaming: bool,
    pub incoming_request: String,
    pub outbound_request: Option<String>,
    pub response: Option<String>,
    pub error: Option<String>,
    pub usage: Option<TokenUsage>,
    pub cost: f64,
    pub unpriced: bool,
    pub estimated: bool,
    pub incomplete: bool,
    pub duration_ms: i64,
}

impl RequestRecord {
    pub fn total_tokens(&self) -> Option<u32> {
        self.usage.map(|u| u.total_tokens())
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// How a call ended.
#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub provider: String,
    pub outbound_request: Option<String>,
    /// Response payload on success, error text on failure.
    pub result: Result<String, String>,
    pub usage: Option<TokenUsage>,
    pub cost: Cost,
    pub estimated: bool,
    pub incomplete: bool,
}

impl RecordOutcome {
    /// A failure that happened before any upstream call.
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            provider: UNKNOWN_PROVIDER.to_string(),
            outbound_request: None,
            result: Err(error.into()),
            usage: None,
            cost: Cost::UNPRICED,
            estimated: false,
            incomplete: false,
        }
    }
}

/// Error recorded for a call dropped before it was finalized.
pub const ABANDONED_ERROR: &str = "Client disconnected before the response started";

/// A call in flight. Id, timestamp and start time are fixed at dispatch.
///
/// Once attached to a store with [`PendingRecord::log_if_abandoned`], a
/// pending record that is dropped without being finalized writes an
/// incomplete error record, so a cancelled call is still accounted for.
#[derive(Debug)]
pub struct PendingRecord {
    id: String,
    timestamp: String,
    started: Instant,
    model: String,
    incoming_request: String,
    streaming: bool,
    provider: String,
    abandon_store: Option<LogStore>,
}

impl PendingRecord {
    pub fn begin(
        model: impl Into<String>,
        incoming_request: impl Into<String>,
        streaming: bool,
    ) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            timestamp: format_timestamp(&Utc::now()),
            started: Instant::now(),
            model: model.into(),
            incoming_request: incoming_request.into(),
            streaming,
            provider: UNKNOWN_PROVIDER.to_string(),
            abandon_store: None,
        }
    }

    /// Write an incomplete record to `store` if this call is dropped unfinalized.
    pub fn log_if_abandoned(mut self, store: &LogStore) -> Self {
        self.abandon_store = Some(store.clone());
        self
    }

    /// Provider named on the record if the call is abandoned.
    pub fn set_provider(&mut self, provider: impl Into<String>) {
        self.provider = provider.into();
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn elapsed_ms(&self) -> i64 {
        i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX)
    }

    /// Consume the pending record; a call can only be finalized once.
    pub fn finalize(mut self, outcome: RecordOutcome) -> RequestRecord {
        self.abandon_store = None;
        self.build(outcome)
    }

    fn build(&mut self, outcome: RecordOutcome) -> RequestRecord {
        let duration_ms = self.elapsed_ms();
        let (response, error) = match outcome.result {
            Ok(body) => (Some(body), None),
            Err(message) => (None, Some(message)),
        };
        RequestRecord {
            id: std::mem::take(&mut self.id),
            timestamp: std::mem::take(&mut self.timestamp),
            model: std::mem::take(&mut self.model),
            provider: outcome.provider,
            streaming: self.streaming,
            incoming_request: std::mem::take(&mut self.incoming_request),
            outbound_request: outcome.outbound_request,
            response,
            error,
            usage: outcome.usage,
            cost: outcome.cost.amount,
            unpriced: !outcome.cost.priced,
            estimated: outcome.estimated,
            incomplete: outcome.incomplete,
            duration_ms,
        }
    }
}

impl Drop for PendingRecord {
    fn drop(&mut self) {
        let Some(store) = self.abandon_store.take() else {
            return;
        };
        let mut outcome = RecordOutcome::rejected(ABANDONED_ERROR);
        outcome.provider = std::mem::take(&mut self.provider);
        outcome.incomplete = true;
        let record = self.build(outcome);
        tracing::warn!(
            request_id = %record.id,
            model = %record.model,
            provider = %record.provider,
            duration_ms = record.duration_ms,
            "Chat completion abandoned by client"
        );
        store.spawn_append(record);
    }
}
