//! Token usage extraction and estimation.
//!
//! Providers normally report usage. When they don't, tokens are estimated
//! from text length and the resulting record is flagged as estimated.

use serde_json::Value;

/// Prompt and completion token counts for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    /// Always derived, never read from the provider.
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// Extract token usage from a provider response or stream chunk.
///
/// Returns None if usage is missing, null, or lacks either count.
pub fn extract_usage(response: &Value) -> Option<TokenUsage> {
    let usage = response.get("usage").filter(|u| !u.is_null())?;
    let prompt = usage.get("prompt_tokens")?.as_u64()?;
    let completion = usage.get("completion_tokens")?.as_u64()?;
    Some(TokenUsage::new(clamp_u32(prompt), clamp_u32(completion)))
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// Per-message framing overhead: one token for the role, three for formatting.
const MESSAGE_OVERHEAD: u32 = 4;

/// Estimate tokens for a piece of text: `ceil(chars / 4)`.
pub fn estimate_text_tokens(text: &str) -> u32 {
    clamp_u32((text.chars().count() as u64).div_ceil(4))
}

/// Estimate prompt tokens for an OpenAI-style `messages` array.
pub fn estimate_prompt_tokens(messages: &Value) -> u32 {
    let Some(messages) = messages.as_array() else {
        return 0;
    };
    messages
        .iter()
        .map(|m| {
            let content = m.get("content").map(content_text).unwrap_or_default();
            estimate_text_tokens(&content).saturating_add(MESSAGE_OVERHEAD)
        })
        .fold(0u32, u32::saturating_add)
}

/// Flatten a message `content` value (string or array of parts) into text.
pub fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Concatenate the assistant text of every choice in a chat completion.
pub fn completion_text(response: &Value) -> String {
    response
        .get("choices")
        .and_then(Value::as_array)
        .map(|choices| {
            choices
                .iter()
                .filter_map(|c| c.get("message").and_then(|m| m.get("content")))
                .map(content_text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

/// Use reported usage when present, otherwise estimate.
///
/// The boolean is true when the counts are an estimate.
pub fn resolve_usage(
    reported: Option<TokenUsage>,
    messages: &Value,
    completion: &str,
) -> (TokenUsage, bool) {
    match reported {
        Some(usage) => (usage, false),
        None => (
            TokenUsage::new(
                estimate_prompt_tokens(messages),
                estimate_text_tokens(completion),
            ),
            true,
        ),
    }
}
