//! Row filter shared by listing and aggregation queries.

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite};

use super::record::format_timestamp;

/// Which records a read covers. Every field is optional and ANDed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestFilter {
    /// Inclusive lower bound.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub until: Option<DateTime<Utc>>,
    /// Case-insensitive exact match on the logical model.
    pub model: Option<String>,
    /// Case-insensitive exact match on the provider.
    pub provider: Option<String>,
    pub min_cost: Option<f64>,
    pub max_cost: Option<f64>,
    /// Substring match over model, request, response and error text.
    pub search: Option<String>,
}

impl RequestFilter {
    /// Append ` WHERE ...` for this filter. Always emits a WHERE clause so
    /// callers can keep chaining `AND` terms.
    pub(crate) fn push_where(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        qb.push(" WHERE 1 = 1");

        if let Some(since) = &self.since {
            qb.push(" AND timestamp >= ").push_bind(format_timestamp(since));
        }
        if let Some(until) = &self.until {
            qb.push(" AND timestamp < ").push_bind(format_timestamp(until));
        }
        if let Some(model) = &self.model {
            qb.push(" AND LOWER(model) = LOWER(")
                .push_bind(model.clone())
                .push(")");
        }
        if let Some(provider) = &self.provider {
            qb.push(" AND LOWER(provider) = LOWER(")
                .push_bind(provider.clone())
                .push(")");
        }
        if let Some(min_cost) = self.min_cost {
            qb.push(" AND cost >= ").push_bind(min_cost);
        }
        if let Some(max_cost) = self.max_cost {
            qb.push(" AND cost <= ").push_bind(max_cost);
        }
        if let Some(search) = self.search.as_deref().filter(|s| !s.is_empty()) {
            let pattern = format!("%{}%", escape_like(search));
            qb.push(" AND (");
            for (i, column) in ["model", "incoming_request", "response", "error"]
                .iter()
                .enumerate()
            {
                if i > 0 {
                    qb.push(" OR ");
                }
                qb.push(*column)
                    .push(" LIKE ")
                    .push_bind(pattern.clone())
                    .push(" ESCAPE '\\'");
            }
            qb.push(")");
        }
    }
}

/// Escape LIKE wildcards so user text matches literally.
fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
