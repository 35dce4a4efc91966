//! OpenAI-compatible request view and outbound payload construction.
//!
//! Payloads are relayed as opaque JSON. Only the fields the gateway acts on
//! are read into typed form; everything else passes through untouched.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::Error;

/// Fields that steer the gateway and are never forwarded upstream.
pub const GATEWAY_FIELDS: [&str; 3] = ["timeout", "num_retries", "retries"];

const ROLES: [&str; 6] = ["system", "developer", "user", "assistant", "tool", "function"];

/// Typed view of a chat completion request.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub stream: Option<bool>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    pub n: Option<u32>,
    /// Per-request upstream timeout in seconds.
    pub timeout: Option<f64>,
    /// Retries after the first failed attempt.
    #[serde(alias = "retries")]
    pub num_retries: Option<u32>,
}

/// A chat message. `content` may be a string, an array of parts, or null.
#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(default)]
    pub content: Value,
}

impl ChatCompletionRequest {
    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Reject payloads that no provider could accept.
    pub fn validate(&self) -> Result<(), Error> {
        if self.model.trim().is_empty() {
            return Err(Error::Validation("Model is required".to_string()));
        }
        if self.messages.is_empty() {
            return Err(Error::Validation(
                "messages must contain at least one message".to_string(),
            ));
        }
        for (i, message) in self.messages.iter().enumerate() {
            if !ROLES.contains(&message.role.as_str()) {
                return Err(Error::Validation(format!(
                    "messages[{}] has unsupported role '{}'",
                    i, message.role
                )));
            }
            if !matches!(
                message.content,
                Value::String(_) | Value::Array(_) | Value::Null
            ) {
                return Err(Error::Validation(format!(
                    "messages[{}].content must be a string or an array",
                    i
                )));
            }
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(Error::Validation(format!(
                    "temperature must be between 0 and 2, got {}",
                    t
                )));
            }
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(Error::Validation(format!(
                    "top_p must be between 0 and 1, got {}",
                    p
                )));
            }
        }
        if self.max_tokens == Some(0) {
            return Err(Error::Validation("max_tokens must be positive".to_string()));
        }
        if self.n == Some(0) {
            return Err(Error::Validation("n must be positive".to_string()));
        }
        if let Some(timeout) = self.timeout {
            if !(timeout.is_finite() && timeout > 0.0) {
                return Err(Error::Validation(format!(
                    "timeout must be a positive number of seconds, got {}",
                    timeout
                )));
            }
        }
        Ok(())
    }
}

/// Parse and validate a raw request body.
///
/// Returns the JSON object (for relay) alongside its typed view.
pub fn parse_request(body: &[u8]) -> Result<(Map<String, Value>, ChatCompletionRequest), Error> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| Error::Validation(format!("Request body is not valid JSON: {}", e)))?;
    let Value::Object(object) = value else {
        return Err(Error::Validation(
            "Request body must be a JSON object".to_string(),
        ));
    };
    let request: ChatCompletionRequest = serde_json::from_value(Value::Object(object.clone()))
        .map_err(|e| Error::Validation(e.to_string()))?;
    request.validate()?;
    Ok((object, request))
}

/// Best-effort model name from a body that may not parse, for logging.
pub fn sniff_model(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    value
        .get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.trim().is_empty())
        .map(str::to_string)
}

/// Best-effort streaming flag from a body that may not parse.
pub fn sniff_stream(body: &[u8]) -> bool {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("stream").and_then(Value::as_bool))
        .unwrap_or(false)
}

/// Build the payload sent to one deployment.
///
/// - `model` is replaced with the deployment's upstream id
/// - model defaults fill fields the client omitted or sent as null
/// - gateway control fields are removed
/// - top-level nulls are stripped
/// - streamed requests ask for a usage chunk
pub fn build_outbound(
    incoming: &Map<String, Value>,
    upstream_model: &str,
    defaults: &Map<String, Value>,
    streaming: bool,
) -> Map<String, Value> {
    let mut payload = incoming.clone();
    for (key, value) in defaults {
        if payload.get(key).map_or(true, Value::is_null) {
            payload.insert(key.clone(), value.clone());
        }
    }
    for field in GATEWAY_FIELDS {
        payload.remove(field);
    }
    payload.retain(|_, v| !v.is_null());
    payload.insert("model".to_string(), Value::String(upstream_model.to_string()));
    if streaming {
        ensure_stream_options(&mut payload);
    }
    payload
}

/// Ensure stream_options includes `include_usage: true` for streaming requests.
///
/// Merges with any existing client-provided stream_options rather than overwriting.
/// Only adds `include_usage: true` if the field is not already set.
pub fn ensure_stream_options(payload: &mut Map<String, Value>) {
    let options = payload
        .entry("stream_options")
        .or_insert_with(|| Value::Object(Map::new()));
    if !options.is_object() {
        *options = Value::Object(Map::new());
    }
    if let Value::Object(options) = options {
        if options.get("include_usage").map_or(true, Value::is_null) {
            options.insert("include_usage".to_string(), Value::Bool(true));
        }
    }
}
