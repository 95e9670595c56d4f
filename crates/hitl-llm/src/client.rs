use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hitl_types::HitlError;
use tokio_stream::StreamExt;

use crate::{
    execute_with_retry, BackoffPolicy, DynProvider, EventStream, ProviderAdapter, Request,
    Response, StreamEvent, Usage,
};

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

pub trait Middleware: Send + Sync {
    fn before(&self, _request: &mut Request) {}
    fn after(&self, _request: &Request, _response: &mut Response) {}
    /// Called once a streamed response reports its final usage.
    fn after_stream(&self, _request: &Request, _usage: &Usage) {}
}

// ---------------------------------------------------------------------------
// Built-in middleware: LoggingMiddleware
// ---------------------------------------------------------------------------

pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn before(&self, request: &mut Request) {
        tracing::info!(
            model = %request.model,
            messages = request.messages.len(),
            "LLM request"
        );
    }

    fn after(&self, _request: &Request, response: &mut Response) {
        tracing::info!(
            model = %response.model,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            finish = ?response.finish_reason,
            "LLM response"
        );
    }

    fn after_stream(&self, request: &Request, usage: &Usage) {
        tracing::info!(
            model = %request.model,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "LLM stream finished"
        );
    }
}

// ---------------------------------------------------------------------------
// Built-in middleware: UsageTrackingMiddleware
// ---------------------------------------------------------------------------

/// Accumulates token totals. Clones share the same counters, so keep one
/// handle and register another.
#[derive(Clone, Default)]
pub struct UsageTrackingMiddleware {
    requests: Arc<AtomicU64>,
    total_input: Arc<AtomicU64>,
    total_output: Arc<AtomicU64>,
}

impl UsageTrackingMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn total_input_tokens(&self) -> u64 {
        self.total_input.load(Ordering::Relaxed)
    }

    pub fn total_output_tokens(&self) -> u64 {
        self.total_output.load(Ordering::Relaxed)
    }

    fn record(&self, usage: &Usage) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.total_input
            .fetch_add(usage.input_tokens, Ordering::Relaxed);
        self.total_output
            .fetch_add(usage.output_tokens, Ordering::Relaxed);
    }
}

impl Middleware for UsageTrackingMiddleware {
    fn after(&self, _request: &Request, response: &mut Response) {
        self.record(&response.usage);
    }

    fn after_stream(&self, _request: &Request, usage: &Usage) {
        self.record(usage);
    }
}

// ---------------------------------------------------------------------------
// LlmClient
// ---------------------------------------------------------------------------

pub struct LlmClient {
    providers: HashMap<String, DynProvider>,
    default_provider: Option<String>,
    default_model: Option<String>,
    middleware: Vec<Box<dyn Middleware>>,
    max_retries: usize,
    backoff: BackoffPolicy,
}

impl LlmClient {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: None,
            default_model: None,
            middleware: Vec::new(),
            max_retries: 0,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Register a provider. The first one registered becomes the default.
    pub fn register_provider(&mut self, provider: impl ProviderAdapter + 'static) {
        let name = provider.name().to_string();
        if self.default_provider.is_none() {
            self.default_provider = Some(name.clone());
        }
        self.providers.insert(name, DynProvider::new(provider));
    }

    pub fn with_provider(mut self, provider: impl ProviderAdapter + 'static) -> Self {
        self.register_provider(provider);
        self
    }

    pub fn with_middleware(mut self, m: impl Middleware + 'static) -> Self {
        self.middleware.push(Box::new(m));
        self
    }

    pub fn with_retry(mut self, max_retries: usize, backoff: BackoffPolicy) -> Self {
        self.max_retries = max_retries;
        self.backoff = backoff;
        self
    }

    /// Model used when a request leaves `model` empty (overrides the provider default).
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn provider_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub async fn complete(&self, request: &Request) -> Result<Response, HitlError> {
        let provider = self.resolve_provider(request)?;
        let req = self.prepare(provider, request);

        let mut resp = execute_with_retry(
            || provider.complete(&req),
            self.max_retries,
            &self.backoff,
            provider.name(),
        )
        .await?;

        for m in &self.middleware {
            m.after(&req, &mut resp);
        }

        Ok(resp)
    }

    /// Stream a response as incremental events. Providers without native
    /// streaming are completed (with retry) and replayed as a single delta.
    pub async fn stream(&self, request: &Request) -> Result<EventStream<'_>, HitlError> {
        let provider = self.resolve_provider(request)?;
        let req = self.prepare(provider, request);

        if !provider.supports_streaming() {
            let mut resp = execute_with_retry(
                || provider.complete(&req),
                self.max_retries,
                &self.backoff,
                provider.name(),
            )
            .await?;
            for m in &self.middleware {
                m.after(&req, &mut resp);
            }
            let events = vec![
                StreamEvent::MessageStart {
                    id: resp.id.clone(),
                    model: resp.model.clone(),
                },
                StreamEvent::ContentDelta { text: resp.text },
                StreamEvent::MessageEnd {
                    usage: resp.usage,
                    finish_reason: resp.finish_reason,
                },
            ];
            return Ok(Box::pin(tokio_stream::iter(events)));
        }

        let middleware = &self.middleware;
        let inner = provider.stream(&req);
        let stream = inner.map(move |event| {
            if let StreamEvent::MessageEnd { usage, .. } = &event {
                for m in middleware {
                    m.after_stream(&req, usage);
                }
            }
            event
        });
        Ok(Box::pin(stream))
    }

    fn prepare(&self, provider: &DynProvider, request: &Request) -> Request {
        let mut req = request.clone();
        if req.model.is_empty() {
            req.model = self
                .default_model
                .clone()
                .unwrap_or_else(|| provider.default_model().to_string());
        }
        for m in &self.middleware {
            m.before(&mut req);
        }
        req
    }

    fn resolve_provider(&self, request: &Request) -> Result<&DynProvider, HitlError> {
        if let Some(ref provider_name) = request.provider {
            return self.providers.get(provider_name).ok_or_else(|| {
                HitlError::Other(format!("Provider '{}' not registered", provider_name))
            });
        }

        self.default_provider
            .as_ref()
            .and_then(|name| self.providers.get(name))
            .ok_or_else(|| HitlError::Other("No providers registered".to_string()))
    }
}

impl Default for LlmClient {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
