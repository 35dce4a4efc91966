//! HTTP request handlers.

use axum::{extract::State, response::Response, Json};
use bytes::Bytes;
use serde_json::{json, Value};

use super::dispatch;
use super::server::AppState;
use crate::catalog::ReloadSummary;
use crate::error::Error;

/// Handle POST /v1/chat/completions
///
/// The raw body is taken so malformed requests can still be logged.
pub async fn chat_completions(State(state): State<AppState>, body: Bytes) -> Response {
    dispatch::dispatch(&state, body).await
}

/// Handle GET /v1/models - logical models with provider, context length and prices
pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.catalog.snapshot();
    let models: Vec<Value> = snapshot
        .registry
        .bindings()
        .map(|binding| {
            let primary = binding.primary();
            let pricing = snapshot.pricing.get(&binding.model).map(|entry| {
                json!({
                    "prompt_per_million": entry.prompt_per_million(),
                    "completion_per_million": entry.completion_per_million(),
                })
            });
            json!({
                "id": binding.model,
                "object": "model",
                "created": snapshot.loaded_at.timestamp(),
                "owned_by": primary.provider.name,
                "provider": primary.provider.name,
                "upstream_model": primary.upstream_model,
                "fallbacks": binding.deployments[1..]
                    .iter()
                    .map(|d| d.provider.name.as_str())
                    .collect::<Vec<_>>(),
                "context_length": binding.context_length,
                "pricing": pricing,
            })
        })
        .collect();

    Json(json!({
        "object": "list",
        "data": models
    }))
}

/// Default parameters echoed by GET /v1/model/info.
const INFO_PARAMS: [&str; 5] = ["temperature", "top_p", "max_tokens", "timeout", "num_retries"];

/// Handle GET /v1/model/info - per-model limits, per-token prices and defaults
pub async fn model_info(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.catalog.snapshot();
    let models: Vec<Value> = snapshot
        .registry
        .bindings()
        .map(|binding| {
            let primary = binding.primary();
            let mut info = json!({ "provider": primary.provider.name });
            if let Some(context_length) = binding.context_length {
                info["max_input_tokens"] = json!(context_length);
            }
            if let Some(entry) = snapshot.pricing.get(&binding.model) {
                info["input_cost_per_token"] = json!(entry.prompt_per_million() / 1_000_000.0);
                info["output_cost_per_token"] =
                    json!(entry.completion_per_million() / 1_000_000.0);
            }

            let mut params = json!({ "model": primary.upstream_model });
            for key in INFO_PARAMS {
                if let Some(value) = binding.params.get(key).filter(|v| !v.is_null()) {
                    params[key] = value.clone();
                }
            }

            json!({
                "model_name": binding.model,
                "model_info": info,
                "model_params": params,
            })
        })
        .collect();

    Json(json!({ "data": models }))
}

/// Handle GET /health
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.catalog.snapshot();
    Json(json!({
        "status": "ok",
        "service": "tollgate",
        "config_version": snapshot.version,
        "models": snapshot.registry.models_count(),
        "log_write_failures": state.store.write_failures(),
    }))
}

/// Handle POST /admin/reload
///
/// Returns the new version and counts, or a 422 naming the configuration
/// problem. A failed reload leaves the running configuration untouched.
pub async fn admin_reload(State(state): State<AppState>) -> Result<Json<ReloadSummary>, Error> {
    let summary = state.reloader.reload().await?;
    Ok(Json(summary))
}
