//! Retry walk across a model's deployments.
//!
//! - `num_retries + 1` total attempts
//! - attempt `n` goes to deployment `n % len`, so retries advance through the
//!   fallback order and wrap around
//! - a fixed, configurable pause between attempts (zero by default)
//! - failed attempts are recorded for the `x-tollgate-retries` header

use std::time::Duration;

use crate::catalog::Deployment;
use crate::error::UpstreamFailure;

/// Record of a single failed attempt for building the `x-tollgate-retries` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub provider_name: String,
    pub failure: UpstreamFailure,
}

/// Anything an attempt can be sent to.
pub trait Candidate {
    fn name(&self) -> &str;
}

impl Candidate for Deployment {
    fn name(&self) -> &str {
        &self.provider.name
    }
}

/// Error side of one attempt.
pub trait AttemptError {
    fn failure(&self) -> UpstreamFailure;

    /// Whether another attempt may follow this one.
    fn is_retryable(&self) -> bool {
        true
    }
}

/// Attempt budget and pacing for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub num_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn total_attempts(&self) -> u32 {
        self.num_retries.saturating_add(1)
    }
}

/// Format attempt records into the `x-tollgate-retries` header value.
///
/// Format: `"2/provider-alpha, 1/provider-beta"` -- count of failed attempts
/// per provider, preserving first-appearance order.
///
/// Returns `None` if the attempts slice is empty (no retries occurred).
pub fn format_retries_header(attempts: &[AttemptRecord]) -> Option<String> {
    if attempts.is_empty() {
        return None;
    }
    // Preserve order of first appearance
    let mut counts: Vec<(&str, u32)> = Vec::new();
    for attempt in attempts {
        if let Some(entry) = counts
            .iter_mut()
            .find(|(name, _)| *name == attempt.provider_name)
        {
            entry.1 += 1;
        } else {
            counts.push((&attempt.provider_name, 1));
        }
    }
    Some(
        counts
            .iter()
            .map(|(name, count)| format!("{}/{}", count, name))
            .collect::<Vec<_>>()
            .join(", "),
    )
}

/// Run `send` until it succeeds or the attempt budget is spent.
///
/// On success returns the index of the candidate that served the request
/// with its value. On failure returns the last error. Every failed attempt,
/// including the last, is pushed onto `attempts`.
pub async fn retry_across<C, T, E, F, Fut>(
    candidates: &[C],
    policy: RetryPolicy,
    attempts: &mut Vec<AttemptRecord>,
    mut send: F,
) -> Result<(usize, T), E>
where
    C: Candidate,
    E: AttemptError + std::fmt::Display,
    F: FnMut(&C) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    assert!(
        !candidates.is_empty(),
        "retry_across requires at least one candidate"
    );

    let total = policy.total_attempts();
    let mut attempt: u32 = 0;
    loop {
        if attempt > 0 && !policy.backoff.is_zero() {
            tokio::time::sleep(policy.backoff).await;
        }

        let index = attempt as usize % candidates.len();
        let candidate = &candidates[index];
        match send(candidate).await {
            Ok(value) => return Ok((index, value)),
            Err(err) => {
                attempts.push(AttemptRecord {
                    provider_name: candidate.name().to_string(),
                    failure: err.failure(),
                });
                attempt += 1;

                if !err.is_retryable() || attempt >= total {
                    return Err(err);
                }
                tracing::warn!(
                    provider = %candidate.name(),
                    attempt = attempt,
                    of = total,
                    error = %err,
                    "Upstream attempt failed, retrying"
                );
            }
        }
    }
}
