//! SSE stream observation and relay.
//!
//! [`SseObserver`] does line-buffered extraction of usage, finish_reason and
//! assistant text from OpenAI-compatible SSE responses, reassembling lines
//! across TCP chunk boundaries. [`RelayStream`] forwards upstream bytes to
//! the client unchanged while feeding the observer, and reports how the
//! stream ended exactly once.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};

use crate::error::error_envelope;
use crate::usage::{extract_usage, TokenUsage};

/// Lines longer than this without a newline are discarded.
const MAX_LINE_BUFFER: usize = 64 * 1024;

/// Result of observing an SSE stream.
#[derive(Debug, Clone, Default)]
pub struct StreamResult {
    /// Token usage from the final chunk's usage object, if present.
    pub usage: Option<TokenUsage>,
    /// The finish_reason from the last chunk with a non-null finish_reason.
    pub finish_reason: Option<String>,
    /// Whether `data: [DONE]` was received.
    pub done_received: bool,
    pub id: Option<String>,
    pub model: Option<String>,
    /// Concatenated `delta.content` of the first choice.
    pub content: String,
    /// Number of JSON data events seen.
    pub chunk_count: usize,
    /// Message of an in-band `{"error": ...}` event, if the provider sent one.
    pub upstream_error: Option<String>,
}

impl StreamResult {
    /// Assemble the observed stream into a single chat completion object.
    pub fn assembled_response(&self, fallback_model: &str) -> Value {
        let mut response = json!({
            "id": self.id,
            "object": "chat.completion",
            "model": self.model.as_deref().unwrap_or(fallback_model),
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": self.content},
                "finish_reason": self.finish_reason,
            }],
        });
        if let Some(usage) = self.usage {
            response["usage"] = json!({
                "prompt_tokens": usage.prompt_tokens,
                "completion_tokens": usage.completion_tokens,
                "total_tokens": usage.total_tokens(),
            });
        }
        response
    }
}

/// Internal state for SSE line buffering and extraction.
///
/// Buffers raw bytes across chunk boundaries, reassembles complete SSE lines,
/// and extracts usage, finish_reason and text from `data:` lines.
#[derive(Debug, Default)]
pub(crate) struct SseObserver {
    buffer: Vec<u8>,
    result: StreamResult,
}

impl SseObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a chunk of bytes from the SSE stream.
    pub fn process_chunk(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            self.process_line(line.trim_end_matches('\r'));
        }

        if self.buffer.len() > MAX_LINE_BUFFER {
            tracing::warn!(
                buffered = self.buffer.len(),
                "SSE line exceeded buffer cap, discarding"
            );
            self.buffer.clear();
        }
    }

    /// Flush any remaining content in the buffer as a final line.
    fn flush_buffer(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let rest = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&rest);
        self.process_line(line.trim_end_matches('\r'));
    }

    /// Process a single complete SSE line. Non-data fields are ignored.
    fn process_line(&mut self, line: &str) {
        if let Some(data) = line.strip_prefix("data:") {
            self.process_data(data.trim_start());
        }
    }

    fn process_data(&mut self, data: &str) {
        if data == "[DONE]" {
            self.result.done_received = true;
            return;
        }
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            tracing::debug!("Skipping malformed SSE data line");
            return;
        };
        let result = &mut self.result;
        result.chunk_count += 1;

        if let Some(error) = event.get("error").filter(|e| !e.is_null()) {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            result.upstream_error = Some(message);
        }
        if result.id.is_none() {
            result.id = event.get("id").and_then(Value::as_str).map(str::to_string);
        }
        if result.model.is_none() {
            result.model = event.get("model").and_then(Value::as_str).map(str::to_string);
        }
        if let Some(usage) = extract_usage(&event) {
            result.usage = Some(usage);
        }

        let Some(choices) = event.get("choices").and_then(Value::as_array) else {
            return;
        };
        if let Some(text) = choices
            .first()
            .and_then(|c| c.pointer("/delta/content"))
            .and_then(Value::as_str)
        {
            result.content.push_str(text);
        }
        for choice in choices {
            if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                result.finish_reason = Some(reason.to_string());
            }
        }
    }

    /// Consume the observer and produce whatever was observed.
    pub fn into_result(mut self) -> StreamResult {
        self.flush_buffer();
        self.result
    }
}

/// How a relayed stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// Upstream closed the stream normally.
    Completed,
    /// Upstream failed mid-stream; the client received an error event.
    Failed(String),
    /// The client went away before the upstream finished.
    Cancelled,
}

/// Callback run once when a relayed stream ends, however it ends.
pub type OnFinish = Box<dyn FnOnce(StreamEnd, StreamResult) + Send>;

/// Relays upstream SSE bytes to the client while observing them.
///
/// Upstream errors are turned into a final error event followed by
/// `data: [DONE]`, so the client always sees a well-formed stream. If the
/// relay is dropped before the upstream finishes, the finish callback runs
/// with [`StreamEnd::Cancelled`].
pub struct RelayStream<S> {
    upstream: S,
    observer: Option<SseObserver>,
    on_finish: Option<OnFinish>,
    done: bool,
}

impl<S> RelayStream<S> {
    pub fn new(upstream: S, on_finish: OnFinish) -> Self {
        Self {
            upstream,
            observer: Some(SseObserver::new()),
            on_finish: Some(on_finish),
            done: false,
        }
    }

    fn finish(&mut self, end: StreamEnd) {
        let result = self
            .observer
            .take()
            .map(SseObserver::into_result)
            .unwrap_or_default();
        if let Some(on_finish) = self.on_finish.take() {
            on_finish(end, result);
        }
    }
}

/// SSE bytes for a terminal error event followed by `[DONE]`.
pub fn error_event(message: &str) -> Bytes {
    let envelope = error_envelope(message, "api_error", "upstream_stream_error");
    Bytes::from(format!("data: {}\n\ndata: [DONE]\n\n", envelope))
}

impl<S, E> Stream for RelayStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        match this.upstream.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                if let Some(observer) = this.observer.as_mut() {
                    observer.process_chunk(&bytes);
                }
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(e))) => {
                let message = format!("Upstream stream failed: {}", e);
                tracing::warn!(error = %e, "Upstream stream failed mid-response");
                this.done = true;
                this.finish(StreamEnd::Failed(message.clone()));
                Poll::Ready(Some(Ok(error_event(&message))))
            }
            Poll::Ready(None) => {
                this.done = true;
                this.finish(StreamEnd::Completed);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> Drop for RelayStream<S> {
    fn drop(&mut self) {
        if self.on_finish.is_some() {
            self.finish(StreamEnd::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Build SSE data from event lines, then split at the given byte positions.
    ///
    /// Each event string is appended with `\n\n` (SSE event delimiter).
    /// The resulting byte buffer is split at the specified positions to
    /// simulate TCP chunk boundaries.
    fn split_sse_at_positions(events: &[&str], split_positions: &[usize]) -> Vec<Vec<u8>> {
        let full: Vec<u8> = events
            .iter()
            .flat_map(|e| format!("{}\n\n", e).into_bytes())
            .collect();

        let mut chunks = Vec::new();
        let mut prev = 0;
        for &pos in split_positions {
            if pos > prev && pos < full.len() {
                chunks.push(full[prev..pos].to_vec());
                prev = pos;
            }
        }
        chunks.push(full[prev..].to_vec());
        chunks
    }

    #[test]
    fn test_single_chunk_full_stream() {
        let events = [
            r#"data: {"id":"abc","model":"gpt-4o","choices":[{"index":0,"delta":{"role":"assistant"},"finish_reason":null}],"usage":null}"#,
            r#"data: {"id":"abc","choices":[{"index":0,"delta":{"content":"Hello"},"finish_reason":null}],"usage":null}"#,
            r#"data: {"id":"abc","choices":[{"index":0,"delta":{"content":" world"},"finish_reason":"stop"}],"usage":null}"#,
            r#"data: {"id":"abc","choices":[],"usage":{"prompt_tokens":6,"completion_tokens":10,"total_tokens":16}}"#,
            "data: [DONE]",
        ];

        let chunks = split_sse_at_positions(&events, &[]);
        assert_eq!(chunks.len(), 1, "Should be a single chunk");

        let mut observer = SseObserver::new();
        observer.process_chunk(&chunks[0]);
        let result = observer.into_result();

        assert!(result.done_received);
        assert_eq!(result.usage, Some(TokenUsage::new(6, 10)));
        assert_eq!(result.finish_reason, Some("stop".to_string()));
        assert_eq!(result.content, "Hello world");
        assert_eq!(result.id.as_deref(), Some("abc"));
        assert_eq!(result.model.as_deref(), Some("gpt-4o"));
        assert_eq!(result.chunk_count, 4);
    }

    #[test]
    fn test_usage_split_across_chunks() {
        let events = [
            r#"data: {"id":"abc","choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":"stop"}],"usage":null}"#,
            r#"data: {"id":"abc","choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#,
            "data: [DONE]",
        ];

        // Split at multiple positions inside the usage JSON line
        let chunks = split_sse_at_positions(&events, &[50, 120, 180]);
        assert!(chunks.len() > 1, "Should be split into multiple chunks");

        let mut observer = SseObserver::new();
        for chunk in &chunks {
            observer.process_chunk(chunk);
        }
        let result = observer.into_result();

        assert!(result.done_received);
        assert_eq!(result.usage, Some(TokenUsage::new(10, 5)));
        assert_eq!(result.finish_reason, Some("stop".to_string()));
    }

    #[test]
    fn test_no_usage_with_done() {
        let events = [
            r#"data: {"id":"abc","choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":"stop"}],"usage":null}"#,
            "data: [DONE]",
        ];

        let chunks = split_sse_at_positions(&events, &[]);

        let mut observer = SseObserver::new();
        observer.process_chunk(&chunks[0]);
        let result = observer.into_result();

        assert!(result.done_received);
        assert!(result.usage.is_none());
        assert_eq!(result.finish_reason, Some("stop".to_string()));
    }

    #[test]
    fn test_no_done_keeps_partial_data() {
        // Stream ends without [DONE]: what was seen is still reported
        let events = [
            r#"data: {"id":"abc","choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}],"usage":null}"#,
        ];

        let chunks = split_sse_at_positions(&events, &[]);

        let mut observer = SseObserver::new();
        observer.process_chunk(&chunks[0]);
        let result = observer.into_result();

        assert!(!result.done_received);
        assert!(result.usage.is_none());
        assert!(result.finish_reason.is_none());
        assert_eq!(result.content, "Hi");
    }

    #[test]
    fn test_malformed_json_skipped() {
        let events = [
            "data: {this is not valid json}",
            r#"data: {"id":"abc","choices":[],"usage":{"prompt_tokens":8,"completion_tokens":3,"total_tokens":11}}"#,
            "data: [DONE]",
        ];

        let chunks = split_sse_at_positions(&events, &[]);

        let mut observer = SseObserver::new();
        observer.process_chunk(&chunks[0]);
        let result = observer.into_result();

        assert!(result.done_received);
        assert_eq!(result.usage, Some(TokenUsage::new(8, 3)));
        assert_eq!(result.chunk_count, 1);
    }

    #[test]
    fn test_non_data_sse_fields_skipped() {
        // Mix in event:, id:, retry:, and comment lines
        let raw = b"event: message\nid: 123\nretry: 5000\n: this is a comment\ndata: {\"id\":\"abc\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"},\"finish_reason\":\"stop\"}],\"usage\":null}\n\ndata: [DONE]\n\n";

        let mut observer = SseObserver::new();
        observer.process_chunk(raw);
        let result = observer.into_result();

        assert!(result.done_received);
        assert_eq!(result.finish_reason, Some("stop".to_string()));
    }

    #[test]
    fn test_crlf_line_endings() {
        let raw = b"data: {\"id\":\"abc\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"},\"finish_reason\":\"stop\"}],\"usage\":null}\r\n\r\ndata: {\"id\":\"abc\",\"choices\":[],\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":2,\"total_tokens\":6}}\r\n\r\ndata: [DONE]\r\n\r\n";

        let mut observer = SseObserver::new();
        observer.process_chunk(raw);
        let result = observer.into_result();

        assert!(result.done_received);
        assert_eq!(result.usage, Some(TokenUsage::new(4, 2)));
        assert_eq!(result.finish_reason, Some("stop".to_string()));
    }

    #[test]
    fn test_data_without_space() {
        // data:{...} without space after colon
        let raw = b"data:{\"id\":\"abc\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"},\"finish_reason\":\"stop\"}],\"usage\":null}\n\ndata:[DONE]\n\n";

        let mut observer = SseObserver::new();
        observer.process_chunk(raw);
        let result = observer.into_result();

        assert!(result.done_received);
        assert_eq!(result.finish_reason, Some("stop".to_string()));
    }

    #[test]
    fn test_done_without_trailing_newline() {
        // [DONE] is the last bytes without a trailing newline
        let raw = b"data: {\"id\":\"abc\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"},\"finish_reason\":\"stop\"}],\"usage\":null}\n\ndata: [DONE]";

        let mut observer = SseObserver::new();
        observer.process_chunk(raw);
        let result = observer.into_result();

        // flush_buffer in into_result should handle this
        assert!(result.done_received);
        assert_eq!(result.finish_reason, Some("stop".to_string()));
    }

    #[test]
    fn test_empty_stream() {
        let observer = SseObserver::new();
        let result = observer.into_result();

        assert!(!result.done_received);
        assert!(result.usage.is_none());
        assert!(result.finish_reason.is_none());
        assert_eq!(result.chunk_count, 0);
    }

    #[test]
    fn test_in_band_error_captured() {
        let raw = b"data: {\"error\":{\"message\":\"overloaded\",\"type\":\"server_error\"}}\n\ndata: [DONE]\n\n";

        let mut observer = SseObserver::new();
        observer.process_chunk(raw);
        let result = observer.into_result();

        assert_eq!(result.upstream_error.as_deref(), Some("overloaded"));
    }

    #[test]
    fn test_buffer_cap() {
        // Create a chunk exceeding 64KB without any newlines
        let huge_chunk = vec![b'x'; 65 * 1024];

        let mut observer = SseObserver::new();
        observer.process_chunk(&huge_chunk);

        // After exceeding 64KB, the buffer should be drained.
        // Then we can still process normal data.
        let normal = b"data: {\"id\":\"abc\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"ok\"},\"finish_reason\":\"stop\"}],\"usage\":null}\n\ndata: [DONE]\n\n";
        observer.process_chunk(normal);
        let result = observer.into_result();

        assert!(result.done_received);
        assert_eq!(result.finish_reason, Some("stop".to_string()));
        assert_eq!(result.content, "ok");
    }

    #[test]
    fn test_assembled_response_shape() {
        let result = StreamResult {
            id: Some("abc".to_string()),
            content: "Hello".to_string(),
            finish_reason: Some("stop".to_string()),
            usage: Some(TokenUsage::new(3, 1)),
            ..Default::default()
        };
        let response = result.assembled_response("gpt-4o");
        assert_eq!(response["object"], "chat.completion");
        assert_eq!(response["model"], "gpt-4o");
        assert_eq!(response["choices"][0]["message"]["content"], "Hello");
        assert_eq!(response["usage"]["total_tokens"], 4);
    }

    type Captured = Arc<Mutex<Option<(StreamEnd, StreamResult)>>>;

    fn capture() -> (Captured, OnFinish) {
        let slot: Captured = Arc::new(Mutex::new(None));
        let writer = Arc::clone(&slot);
        let on_finish: OnFinish = Box::new(move |end, result| {
            *writer.lock().unwrap() = Some((end, result));
        });
        (slot, on_finish)
    }

    fn chunk(text: &str) -> Result<Bytes, String> {
        Ok(Bytes::from(format!(
            "data: {{\"choices\":[{{\"index\":0,\"delta\":{{\"content\":\"{}\"}}}}]}}\n\n",
            text
        )))
    }

    #[tokio::test]
    async fn test_relay_completed() {
        let (slot, on_finish) = capture();
        let upstream = futures::stream::iter(vec![
            chunk("a"),
            chunk("b"),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ]);

        let relayed: Vec<Bytes> = RelayStream::new(upstream, on_finish)
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(relayed.len(), 3);
        let (end, result) = slot.lock().unwrap().take().unwrap();
        assert_eq!(end, StreamEnd::Completed);
        assert_eq!(result.content, "ab");
        assert!(result.done_received);
    }

    #[tokio::test]
    async fn test_relay_upstream_error_emits_terminal_event() {
        let (slot, on_finish) = capture();
        let upstream = futures::stream::iter(vec![chunk("a"), Err("connection reset".to_string())]);

        let relayed: Vec<Bytes> = RelayStream::new(upstream, on_finish)
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(relayed.len(), 2);
        let last = String::from_utf8(relayed[1].to_vec()).unwrap();
        assert!(last.contains("\"error\""));
        assert!(last.contains("connection reset"));
        assert!(last.ends_with("data: [DONE]\n\n"));

        let (end, result) = slot.lock().unwrap().take().unwrap();
        assert!(matches!(end, StreamEnd::Failed(ref m) if m.contains("connection reset")));
        assert_eq!(result.content, "a");
    }

    #[tokio::test]
    async fn test_relay_dropped_early_reports_cancelled() {
        let (slot, on_finish) = capture();
        let upstream = futures::stream::iter(vec![chunk("a"), chunk("b"), chunk("c")]);

        let mut relay = RelayStream::new(upstream, on_finish);
        let first = relay.next().await.unwrap().unwrap();
        assert!(!first.is_empty());
        drop(relay);

        let (end, result) = slot.lock().unwrap().take().unwrap();
        assert_eq!(end, StreamEnd::Cancelled);
        assert_eq!(result.content, "a");
    }

    #[tokio::test]
    async fn test_relay_finishes_once() {
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        let on_finish: OnFinish = Box::new(move |_, _| {
            *counter.lock().unwrap() += 1;
        });
        let upstream = futures::stream::iter(vec![chunk("a")]);

        let mut relay = RelayStream::new(upstream, on_finish);
        while relay.next().await.is_some() {}
        drop(relay);

        assert_eq!(*calls.lock().unwrap(), 1);
    }
}
