//! Deterministic provider that replays queued replies.
//!
//! Used by tests and by the `scripted` provider setting for offline dry runs.
//! Every request is recorded so callers can assert on the prompts a workflow
//! actually sent.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hitl_types::HitlError;

use crate::{EventStream, FinishReason, ProviderAdapter, Request, Response, StreamEvent, Usage};

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    /// Permanent failure (not retried).
    Fail(String),
    /// Transient failure (retryable).
    Transient(String),
}

#[derive(Default)]
struct ScriptedInner {
    queue: Mutex<VecDeque<ScriptedReply>>,
    rules: Mutex<Vec<(String, String)>>,
    requests: Mutex<Vec<Request>>,
}

/// Cloning yields another handle to the same script and request log.
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    inner: Arc<ScriptedInner>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, reply: ScriptedReply) -> Self {
        self.push(reply);
        self
    }

    pub fn with_reply(self, text: impl Into<String>) -> Self {
        self.with(ScriptedReply::Text(text.into()))
    }

    /// When the queue is empty, answer requests whose prompt contains
    /// `needle` with `reply`. Rules are checked in registration order.
    pub fn with_rule(self, needle: impl Into<String>, reply: impl Into<String>) -> Self {
        if let Ok(mut rules) = self.inner.rules.lock() {
            rules.push((needle.into(), reply.into()));
        }
        self
    }

    pub fn push(&self, reply: ScriptedReply) {
        if let Ok(mut queue) = self.inner.queue.lock() {
            queue.push_back(reply);
        }
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<Request> {
        self.inner
            .requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.inner.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    fn next_reply(&self, request: &Request) -> ScriptedReply {
        if let Ok(mut log) = self.inner.requests.lock() {
            log.push(request.clone());
        }
        if let Some(reply) = self.inner.queue.lock().ok().and_then(|mut q| q.pop_front()) {
            return reply;
        }
        let prompt: String = request
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if let Ok(rules) = self.inner.rules.lock() {
            if let Some((_, reply)) = rules.iter().find(|(needle, _)| prompt.contains(needle)) {
                return ScriptedReply::Text(reply.clone());
            }
        }
        let subject: String = request
            .last_user_text()
            .unwrap_or_default()
            .chars()
            .take(80)
            .collect();
        ScriptedReply::Text(format!("Generated response for: {subject}"))
    }

    fn respond(&self, request: &Request) -> Result<Response, HitlError> {
        match self.next_reply(request) {
            ScriptedReply::Text(text) => {
                let input = request
                    .messages
                    .iter()
                    .map(|m| word_count(&m.content))
                    .sum();
                Ok(Response {
                    id: format!("scripted-{}", uuid::Uuid::new_v4()),
                    usage: Usage::new(input, word_count(&text)),
                    text,
                    model: request.model.clone(),
                    finish_reason: FinishReason::EndTurn,
                })
            }
            ScriptedReply::Fail(message) => Err(HitlError::ProviderError {
                provider: "scripted".into(),
                status: 400,
                message,
                retryable: false,
            }),
            ScriptedReply::Transient(message) => Err(HitlError::ProviderError {
                provider: "scripted".into(),
                status: 503,
                message,
                retryable: true,
            }),
        }
    }
}

fn word_count(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    async fn complete(&self, request: &Request) -> Result<Response, HitlError> {
        self.respond(request)
    }

    fn stream(&self, request: &Request) -> EventStream<'_> {
        let events = match self.respond(request) {
            Ok(resp) => {
                let mut events = vec![StreamEvent::MessageStart {
                    id: resp.id.clone(),
                    model: resp.model.clone(),
                }];
                events.extend(resp.text.split_inclusive(' ').map(|word| {
                    StreamEvent::ContentDelta {
                        text: word.to_string(),
                    }
                }));
                events.push(StreamEvent::MessageEnd {
                    usage: resp.usage,
                    finish_reason: resp.finish_reason,
                });
                events
            }
            Err(e) => vec![StreamEvent::Error(Arc::new(e))],
        };
        Box::pin(tokio_stream::iter(events))
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn default_model(&self) -> &str {
        "scripted"
    }
}
