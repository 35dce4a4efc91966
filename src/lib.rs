//! tollgate - local OpenAI-compatible LLM gateway
//!
//! Routes chat completions to configured providers, prices every call from
//! a live pricing table, and keeps an append-only SQLite log that the
//! analytics endpoints aggregate.

pub mod catalog;
pub mod config;
pub mod error;
pub mod proxy;
pub mod storage;
pub mod usage;

pub use config::Config;
pub use error::{Error, Result};
