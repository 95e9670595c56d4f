//! Text generation client for HITL workflows.
//!
//! Provides the `ProviderAdapter` trait, `DynProvider` wrapper, middleware chain,
//! retry with backoff, an OpenAI-compatible adapter (OpenAI and Ollama), a
//! deterministic `ScriptedProvider`, and `LlmClient` for routing requests.

mod client;
mod config;
mod openai;
mod provider;
mod retry;
mod scripted;
mod types;

pub use client::*;
pub use config::{LlmConfig, ProviderKind};
pub use openai::OpenAiAdapter;
pub use provider::*;
pub use retry::{execute_with_retry, BackoffPolicy};
pub use scripted::{ScriptedProvider, ScriptedReply};
pub use types::*;
