//! Completion dispatch: resolve, call upstream, account, log.
//!
//! Every call to the completion endpoint produces exactly one log record,
//! whether it was rejected up front, failed upstream, completed, or was cut
//! short by the client.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, HeaderName, HeaderValue},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use secrecy::ExposeSecret;
use serde_json::{Map, Value};

use super::retry::{format_retries_header, retry_across, AttemptError, RetryPolicy};
use super::server::AppState;
use super::stream::{RelayStream, StreamEnd, StreamResult};
use super::types::{build_outbound, parse_request, sniff_model, sniff_stream};
use crate::catalog::{Cost, Deployment, Snapshot};
use crate::error::{Error, UpstreamFailure};
use crate::storage::{LogStore, PendingRecord, RecordOutcome};
use crate::usage::{completion_text, extract_usage, resolve_usage};

/// Response header: id of the log record for this call.
pub const REQUEST_ID_HEADER: &str = "x-tollgate-request-id";
/// Response header: provider that served (or last failed) the call.
pub const PROVIDER_HEADER: &str = "x-tollgate-provider";
/// Response header: wall-clock latency in milliseconds (integer).
pub const LATENCY_MS_HEADER: &str = "x-tollgate-latency-ms";
/// Response header: cost in USD, present when the model is priced.
pub const COST_HEADER: &str = "x-tollgate-cost";
/// Response header: "true" when token counts were estimated.
pub const ESTIMATED_HEADER: &str = "x-tollgate-estimated";
/// Response header: failed attempts per provider, e.g. "2/alpha, 1/beta".
pub const RETRIES_HEADER: &str = "x-tollgate-retries";
/// Response header: present with value "true" on streaming responses.
pub const STREAMING_HEADER: &str = "x-tollgate-streaming";
/// Response header: "false" when the log record could not be written.
pub const LOGGED_HEADER: &str = "x-tollgate-logged";

/// Model name recorded when the request body has none.
const UNKNOWN_MODEL: &str = "unknown";

/// Upstream error bodies are truncated to this many characters.
const MAX_ERROR_BODY: usize = 2000;

/// Metadata attached to a completion response.
#[derive(Debug, Default)]
pub struct ResponseMeta<'a> {
    pub request_id: &'a str,
    pub provider: Option<&'a str>,
    pub latency_ms: Option<i64>,
    pub cost: Option<Cost>,
    pub estimated: bool,
    pub retries: Option<String>,
    pub streaming: bool,
    pub logged: bool,
}

/// Attach tollgate metadata headers to a response.
///
/// Latency and cost are only known for buffered responses. Values that
/// cannot be represented as a header are skipped.
pub fn attach_gateway_headers(response: &mut Response, meta: &ResponseMeta<'_>) {
    let headers = response.headers_mut();
    let mut set = |name: &'static str, value: &str| {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    };

    set(REQUEST_ID_HEADER, meta.request_id);
    if let Some(provider) = meta.provider {
        set(PROVIDER_HEADER, provider);
    }
    if meta.streaming {
        set(STREAMING_HEADER, "true");
    }
    if let Some(latency_ms) = meta.latency_ms {
        set(LATENCY_MS_HEADER, &latency_ms.to_string());
    }
    if let Some(cost) = meta.cost.filter(|c| c.priced) {
        set(COST_HEADER, &cost.amount.to_string());
    }
    if meta.estimated {
        set(ESTIMATED_HEADER, "true");
    }
    if let Some(retries) = &meta.retries {
        set(RETRIES_HEADER, retries);
    }
    if !meta.logged {
        set(LOGGED_HEADER, "false");
    }
}

/// One failed upstream attempt.
#[derive(Debug)]
struct AttemptFailure {
    provider: String,
    failure: UpstreamFailure,
    message: String,
    outbound: String,
    retryable: bool,
}

impl AttemptFailure {
    fn new(
        deployment: &Deployment,
        failure: UpstreamFailure,
        message: String,
        outbound: &str,
    ) -> Self {
        Self {
            provider: deployment.provider.name.clone(),
            failure,
            message,
            outbound: outbound.to_string(),
            retryable: true,
        }
    }

    fn into_error(self) -> Error {
        Error::Upstream {
            provider: self.provider,
            failure: self.failure,
            message: self.message,
        }
    }
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.failure, self.message)
    }
}

impl AttemptError for AttemptFailure {
    fn failure(&self) -> UpstreamFailure {
        self.failure
    }

    fn is_retryable(&self) -> bool {
        self.retryable
    }
}

enum UpstreamReply {
    Buffered { body: Bytes, value: Value },
    Streaming(reqwest::Response),
}

struct Delivered {
    outbound: String,
    reply: UpstreamReply,
}

/// Send one attempt to `deployment`.
///
/// The timeout bounds the whole exchange for buffered calls and the time to
/// response headers for streams.
async fn send_attempt(
    client: &reqwest::Client,
    deployment: Deployment,
    incoming: &Map<String, Value>,
    defaults: &Map<String, Value>,
    streaming: bool,
    timeout: Option<Duration>,
) -> Result<Delivered, AttemptFailure> {
    let provider = &deployment.provider;
    let outbound = Value::Object(build_outbound(
        incoming,
        &deployment.upstream_model,
        defaults,
        streaming,
    ))
    .to_string();
    let timeout = timeout.unwrap_or(provider.timeout);

    let mut request = client
        .post(provider.chat_completions_url())
        .headers(provider.headers.clone())
        .header(header::CONTENT_TYPE, "application/json")
        .body(outbound.clone());
    if let Some(api_key) = &provider.api_key {
        request = request.bearer_auth(api_key.expose_secret());
    }

    let exchange = async {
        let response = request.send().await.map_err(|e| {
            let mut failure = AttemptFailure::new(
                &deployment,
                UpstreamFailure::from_reqwest(&e),
                e.to_string(),
                &outbound,
            );
            failure.retryable = !e.is_builder();
            failure
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AttemptFailure::new(
                &deployment,
                UpstreamFailure::Status(status.as_u16()),
                truncate(body.trim(), MAX_ERROR_BODY),
                &outbound,
            ));
        }

        if streaming {
            return Ok(UpstreamReply::Streaming(response));
        }

        let body = response.bytes().await.map_err(|e| {
            AttemptFailure::new(
                &deployment,
                UpstreamFailure::from_reqwest(&e),
                e.to_string(),
                &outbound,
            )
        })?;
        let value = serde_json::from_slice::<Value>(&body).map_err(|e| {
            AttemptFailure::new(
                &deployment,
                UpstreamFailure::InvalidResponse,
                format!("Response is not valid JSON: {}", e),
                &outbound,
            )
        })?;
        Ok::<_, AttemptFailure>(UpstreamReply::Buffered { body, value })
    };

    let outcome = tokio::time::timeout(timeout, exchange).await;
    let reply = match outcome {
        Ok(result) => result?,
        Err(_) => {
            return Err(AttemptFailure::new(
                &deployment,
                UpstreamFailure::Timeout,
                format!("No response within {:?}", timeout),
                &outbound,
            ))
        }
    };
    Ok(Delivered { outbound, reply })
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Positive, finite seconds from a model default such as `timeout = 30`.
fn param_seconds(params: &Map<String, Value>, key: &str) -> Option<f64> {
    params
        .get(key)
        .and_then(Value::as_f64)
        .filter(|s| s.is_finite() && *s > 0.0)
}

fn param_u32(params: &Map<String, Value>, key: &str) -> Option<u32> {
    params
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
}

/// Handle one completion call end to end.
pub async fn dispatch(state: &AppState, body: Bytes) -> Response {
    let incoming_text = String::from_utf8_lossy(&body).into_owned();

    let (incoming, request) = match parse_request(&body) {
        Ok(parsed) => parsed,
        Err(err) => {
            let model = sniff_model(&body).unwrap_or_else(|| UNKNOWN_MODEL.to_string());
            let pending = PendingRecord::begin(model, incoming_text, sniff_stream(&body));
            return reject(&state.store, pending, err).await;
        }
    };

    let streaming = request.is_streaming();
    let mut pending = PendingRecord::begin(&request.model, incoming_text, streaming)
        .log_if_abandoned(&state.store);

    // One snapshot for resolution and costing, even if a reload lands mid-call
    let snapshot = state.catalog.snapshot();
    let binding = match snapshot.registry.resolve(&request.model) {
        Ok(binding) => binding,
        Err(err) => return reject(&state.store, pending, err).await,
    };
    pending.set_provider(binding.primary().provider.name.as_str());

    tracing::debug!(
        request_id = %pending.id(),
        model = %binding.model,
        streaming = streaming,
        deployments = binding.deployments.len(),
        "Dispatching chat completion"
    );

    let policy = RetryPolicy {
        num_retries: request
            .num_retries
            .or_else(|| param_u32(&binding.params, "num_retries"))
            .unwrap_or(binding.primary().provider.num_retries),
        backoff: snapshot.retry_backoff,
    };
    let timeout = request
        .timeout
        .or_else(|| param_seconds(&binding.params, "timeout"))
        .map(Duration::from_secs_f64);

    let mut attempts = Vec::new();
    let client = &state.http_client;
    let result = retry_across(&binding.deployments, policy, &mut attempts, |deployment| {
        send_attempt(
            client,
            deployment.clone(),
            &incoming,
            &binding.params,
            streaming,
            timeout,
        )
    })
    .await;

    let messages = incoming.get("messages").cloned().unwrap_or(Value::Null);
    let retries = match &result {
        // Only the failed attempts before the one that served the call
        Ok(_) => format_retries_header(&attempts),
        Err(_) => format_retries_header(&attempts[..attempts.len().saturating_sub(1)]),
    };

    let (index, delivered) = match result {
        Ok(served) => served,
        Err(failure) => {
            let provider = failure.provider.clone();
            let outbound = failure.outbound.clone();
            let err = failure.into_error();
            tracing::error!(
                request_id = %pending.id(),
                model = %binding.model,
                attempts = attempts.len(),
                error = %err,
                "Upstream call failed after all attempts"
            );
            let record = pending.finalize(RecordOutcome {
                provider: provider.clone(),
                outbound_request: Some(outbound),
                result: Err(err.to_string()),
                usage: None,
                cost: Cost::UNPRICED,
                estimated: false,
                incomplete: false,
            });
            let logged = state.store.append_detached(record.clone()).await;

            let mut response = err.into_response();
            attach_gateway_headers(
                &mut response,
                &ResponseMeta {
                    request_id: &record.id,
                    provider: Some(&provider),
                    latency_ms: Some(record.duration_ms),
                    retries,
                    streaming,
                    logged,
                    ..Default::default()
                },
            );
            return response;
        }
    };

    let provider = binding.deployments[index].provider.name.clone();
    match delivered.reply {
        UpstreamReply::Buffered { body, value } => {
            let (usage, estimated) =
                resolve_usage(extract_usage(&value), &messages, &completion_text(&value));
            let cost = snapshot.pricing.cost(&binding.model, usage);
            let record = pending.finalize(RecordOutcome {
                provider: provider.clone(),
                outbound_request: Some(delivered.outbound),
                result: Ok(String::from_utf8_lossy(&body).into_owned()),
                usage: Some(usage),
                cost,
                estimated,
                incomplete: false,
            });
            let logged = state.store.append_detached(record.clone()).await;

            tracing::info!(
                request_id = %record.id,
                model = %record.model,
                provider = %provider,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                cost = cost.amount,
                estimated = estimated,
                duration_ms = record.duration_ms,
                streaming = false,
                "Chat completion finished"
            );

            let mut response = Response::new(Body::from(body));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            attach_gateway_headers(
                &mut response,
                &ResponseMeta {
                    request_id: &record.id,
                    provider: Some(&provider),
                    latency_ms: Some(record.duration_ms),
                    cost: Some(cost),
                    estimated,
                    retries,
                    streaming: false,
                    logged,
                },
            );
            response
        }
        UpstreamReply::Streaming(upstream) => {
            let request_id = pending.id().to_string();
            let accounting = StreamAccounting {
                pending,
                store: state.store.clone(),
                snapshot: Arc::clone(&snapshot),
                model: binding.model.clone(),
                provider: provider.clone(),
                outbound: delivered.outbound,
                messages,
            };
            let relay = RelayStream::new(
                Box::pin(upstream.bytes_stream()),
                Box::new(move |end, result| accounting.finish(end, result)),
            );

            let mut response = Response::new(Body::from_stream(relay));
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/event-stream"),
            );
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            attach_gateway_headers(
                &mut response,
                &ResponseMeta {
                    request_id: &request_id,
                    provider: Some(&provider),
                    retries,
                    streaming: true,
                    // The record is written when the stream ends
                    logged: true,
                    ..Default::default()
                },
            );
            response
        }
    }
}

/// Log and answer a call that never reached a provider.
async fn reject(store: &LogStore, pending: PendingRecord, err: Error) -> Response {
    tracing::warn!(
        request_id = %pending.id(),
        model = %pending.model(),
        error = %err,
        "Rejected chat completion"
    );
    let record = pending.finalize(RecordOutcome::rejected(err.to_string()));
    let logged = store.append_detached(record.clone()).await;

    let mut response = err.into_response();
    attach_gateway_headers(
        &mut response,
        &ResponseMeta {
            request_id: &record.id,
            streaming: record.streaming,
            logged,
            ..Default::default()
        },
    );
    response
}

/// Everything needed to write the record once a relayed stream ends.
struct StreamAccounting {
    pending: PendingRecord,
    store: LogStore,
    snapshot: Arc<Snapshot>,
    model: String,
    provider: String,
    outbound: String,
    messages: Value,
}

impl StreamAccounting {
    fn finish(self, end: StreamEnd, result: StreamResult) {
        let (usage, estimated) = resolve_usage(result.usage, &self.messages, &result.content);
        let cost = self.snapshot.pricing.cost(&self.model, usage);

        let (outcome, incomplete) = match (&end, &result.upstream_error) {
            (StreamEnd::Failed(message), _) => (Err(message.clone()), true),
            (StreamEnd::Completed, Some(message)) => (
                Err(format!("Provider '{}' stream error: {}", self.provider, message)),
                false,
            ),
            (StreamEnd::Completed, None) => (
                Ok(result.assembled_response(&self.model).to_string()),
                !result.done_received,
            ),
            (StreamEnd::Cancelled, _) => {
                (Ok(result.assembled_response(&self.model).to_string()), true)
            }
        };

        let record = self.pending.finalize(RecordOutcome {
            provider: self.provider,
            outbound_request: Some(self.outbound),
            result: outcome,
            usage: Some(usage),
            cost,
            estimated,
            incomplete,
        });

        tracing::info!(
            request_id = %record.id,
            model = %record.model,
            provider = %record.provider,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            cost = cost.amount,
            estimated = estimated,
            incomplete = incomplete,
            end = ?end,
            duration_ms = record.duration_ms,
            streaming = true,
            "Chat completion finished"
        );

        self.store.spawn_append(record);
    }
}
