//! HTTP gateway.
//!
//! This module provides the OpenAI-compatible API that accepts completion
//! requests and forwards them to configured providers, plus the analytics
//! and administration endpoints over the request log.

mod auth;
pub mod dispatch;
mod extract;
mod handlers;
pub mod logs;
pub mod retry;
mod server;
pub mod stats;
pub mod stream;
pub mod types;

pub use server::{build_http_client, create_router, run_server, AppState};
pub use stream::StreamResult;
pub use types::{build_outbound, ensure_stream_options, ChatCompletionRequest, Message};
