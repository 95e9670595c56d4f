use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::{EventStream, FinishReason, ProviderAdapter, Request, Response, StreamEvent, Usage};
use hitl_types::HitlError;

// ---------------------------------------------------------------------------
// OpenAiAdapter
// ---------------------------------------------------------------------------

/// Chat Completions adapter. Works against api.openai.com and any server
/// exposing the same API (Ollama serves it under `/v1`).
#[derive(Debug, Clone)]
pub struct OpenAiAdapter {
    name: String,
    api_key: Option<String>,
    client: reqwest::Client,
    base_url: String,
    default_model: String,
    timeout: Option<Duration>,
}

impl OpenAiAdapter {
    pub fn new(api_key: String) -> Self {
        Self {
            name: "openai".to_string(),
            api_key: Some(api_key),
            client: reqwest::Client::new(),
            base_url: "https://api.openai.com".to_string(),
            default_model: "gpt-4o-mini".to_string(),
            timeout: None,
        }
    }

    /// A local Ollama server; no API key required.
    pub fn ollama(base_url: impl Into<String>) -> Self {
        Self {
            name: "ollama".to_string(),
            api_key: None,
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            default_model: "llama3.2".to_string(),
            timeout: None,
        }
    }

    pub fn from_env() -> Result<Self, HitlError> {
        let key = std::env::var("OPENAI_API_KEY").map_err(|_| HitlError::AuthError {
            provider: "openai".into(),
        })?;
        Ok(Self::new(key))
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// Per-request timeout. Applies to the whole request, including a streamed body.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, HitlError> {
        self.client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HitlError::Other(format!("failed to build HTTP client: {e}")))?;
        self.timeout = Some(timeout);
        Ok(self)
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn build_request_body(&self, request: &Request, stream: bool) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|msg| json!({ "role": msg.role.as_str(), "content": msg.content }))
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
        });

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }
        if !request.stop_sequences.is_empty() {
            body["stop"] = json!(request.stop_sequences);
        }
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({ "include_usage": true });
        }

        body
    }

    fn send_error(&self, e: reqwest::Error) -> HitlError {
        if e.is_timeout() {
            return HitlError::RequestTimeout {
                provider: self.name.clone(),
                timeout_ms: self.timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
            };
        }
        HitlError::ProviderError {
            provider: self.name.clone(),
            status: 0,
            message: e.to_string(),
            retryable: true,
        }
    }

    fn post(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .post(self.endpoint())
            .header("Content-Type", "application/json")
            .json(body);
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {key}")),
            None => builder,
        }
    }
}

fn parse_response(body: &serde_json::Value) -> Response {
    let choice = &body["choices"][0];
    let usage_obj = &body["usage"];
    Response {
        id: body["id"].as_str().unwrap_or("").to_string(),
        text: choice["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string(),
        usage: Usage::new(
            usage_obj["prompt_tokens"].as_u64().unwrap_or(0),
            usage_obj["completion_tokens"].as_u64().unwrap_or(0),
        ),
        model: body["model"].as_str().unwrap_or("").to_string(),
        finish_reason: FinishReason::from_openai(choice["finish_reason"].as_str()),
    }
}

// ---------------------------------------------------------------------------
// Streaming (server-sent events)
// ---------------------------------------------------------------------------

/// Splits complete lines off the front of `buffer`, leaving any partial line.
/// Works on bytes so a UTF-8 sequence split across chunks stays intact.
fn drain_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let raw: Vec<u8> = buffer.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&raw);
        let line = line.trim_end_matches(['\r', '\n']);
        if !line.is_empty() {
            lines.push(line.to_string());
        }
    }
    lines
}

/// Outcome of parsing one SSE line from a chat completion stream.
#[derive(Debug, PartialEq)]
enum Chunk {
    Delta(String),
    Finish(FinishReason),
    Usage(Usage),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Vec<Chunk> {
    let Some(data) = line.strip_prefix("data:") else {
        return vec![Chunk::Skip];
    };
    let data = data.trim();
    if data == "[DONE]" {
        return vec![Chunk::Done];
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
        return vec![Chunk::Skip];
    };

    let mut chunks = Vec::new();
    let choice = &value["choices"][0];
    if let Some(text) = choice["delta"]["content"].as_str() {
        if !text.is_empty() {
            chunks.push(Chunk::Delta(text.to_string()));
        }
    }
    if let Some(reason) = choice["finish_reason"].as_str() {
        chunks.push(Chunk::Finish(FinishReason::from_openai(Some(reason))));
    }
    if value["usage"].is_object() {
        chunks.push(Chunk::Usage(Usage::new(
            value["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            value["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        )));
    }
    chunks
}

async fn pump_stream(
    adapter: OpenAiAdapter,
    body: serde_json::Value,
    model: String,
    tx: mpsc::Sender<StreamEvent>,
) {
    let resp = match adapter.post(&body).send().await {
        Ok(resp) => resp,
        Err(e) => {
            let _ = tx.send(StreamEvent::Error(Arc::new(adapter.send_error(e)))).await;
            return;
        }
    };

    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let err = map_error(&adapter.name, status, &text);
        let _ = tx.send(StreamEvent::Error(Arc::new(err))).await;
        return;
    }

    if tx
        .send(StreamEvent::MessageStart {
            id: String::new(),
            model,
        })
        .await
        .is_err()
    {
        return;
    }

    let mut usage = Usage::default();
    let mut finish_reason = FinishReason::EndTurn;
    let mut buffer: Vec<u8> = Vec::new();
    let mut bytes = Box::pin(resp.bytes_stream());

    while let Some(chunk) = bytes.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx.send(StreamEvent::Error(Arc::new(adapter.send_error(e)))).await;
                return;
            }
        };
        buffer.extend_from_slice(&chunk);

        for line in drain_lines(&mut buffer) {
            for parsed in parse_sse_line(&line) {
                match parsed {
                    Chunk::Delta(text) => {
                        // Receiver dropped: stop reading and let the connection close.
                        if tx.send(StreamEvent::ContentDelta { text }).await.is_err() {
                            return;
                        }
                    }
                    Chunk::Finish(reason) => finish_reason = reason,
                    Chunk::Usage(u) => usage = u,
                    Chunk::Done => {
                        let _ = tx
                            .send(StreamEvent::MessageEnd {
                                usage,
                                finish_reason,
                            })
                            .await;
                        return;
                    }
                    Chunk::Skip => {}
                }
            }
        }
    }

    let _ = tx
        .send(StreamEvent::MessageEnd {
            usage,
            finish_reason,
        })
        .await;
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn map_error(provider: &str, status: reqwest::StatusCode, body: &str) -> HitlError {
    let status_u16 = status.as_u16();
    match status_u16 {
        429 => {
            let retry_ms = serde_json::from_str::<serde_json::Value>(body)
                .ok()
                .and_then(|v| v["error"]["retry_after"].as_f64())
                .map(|s| (s * 1000.0) as u64)
                .unwrap_or(1000);
            HitlError::RateLimited {
                provider: provider.into(),
                retry_after_ms: retry_ms,
            }
        }
        401 | 403 => HitlError::AuthError {
            provider: provider.into(),
        },
        500 | 502 | 503 | 504 => HitlError::ProviderError {
            provider: provider.into(),
            status: status_u16,
            message: extract_error_message(body),
            retryable: true,
        },
        _ => HitlError::ProviderError {
            provider: provider.into(),
            status: status_u16,
            message: extract_error_message(body),
            retryable: false,
        },
    }
}

fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(String::from))
        .unwrap_or_else(|| body.to_string())
}

// ---------------------------------------------------------------------------
// ProviderAdapter implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    async fn complete(&self, request: &Request) -> Result<Response, HitlError> {
        let body = self.build_request_body(request, false);

        let resp = self
            .post(&body)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;

        let status = resp.status();
        let response_body = resp.text().await.map_err(|e| self.send_error(e))?;

        if !status.is_success() {
            return Err(map_error(&self.name, status, &response_body));
        }

        let json: serde_json::Value =
            serde_json::from_str(&response_body).map_err(|e| HitlError::ProviderError {
                provider: self.name.clone(),
                status: status.as_u16(),
                message: format!("Failed to parse response JSON: {e}"),
                retryable: false,
            })?;

        Ok(parse_response(&json))
    }

    fn stream(&self, request: &Request) -> EventStream<'_> {
        let body = self.build_request_body(request, true);
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(pump_stream(self.clone(), body, request.model.clone(), tx));
        Box::pin(ReceiverStream::new(rx))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
