//! Stage and router traits, plus the per-execution context handed to stages.

use std::sync::Arc;

use async_trait::async_trait;
use hitl_llm::{LlmClient, Request, StreamEvent};
use hitl_types::{HitlError, Result, StageOutput, StateUpdate, WorkflowState};
use tokio_stream::StreamExt;

use crate::events::{EventSink, StageEvent};

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// One unit of pipeline work: reads the current state and returns the fields
/// to merge. Stages never mutate state directly.
#[async_trait]
pub trait Stage: Send + Sync {
    async fn run(&self, state: &WorkflowState, ctx: &StageContext) -> Result<StateUpdate>;
}

/// Adapts a synchronous closure into a [`Stage`].
pub struct FnStage<F>(pub F);

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: Fn(&WorkflowState) -> Result<StateUpdate> + Send + Sync,
{
    async fn run(&self, state: &WorkflowState, _ctx: &StageContext) -> Result<StateUpdate> {
        (self.0)(state)
    }
}

/// A stage that changes nothing. Review points are pass-through stages: the
/// human's input arrives through the resume update, not the stage itself.
pub struct PassThrough;

#[async_trait]
impl Stage for PassThrough {
    async fn run(&self, _state: &WorkflowState, _ctx: &StageContext) -> Result<StateUpdate> {
        Ok(StateUpdate::new())
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Picks the next stage at a branch point. Must return one of the branch's
/// declared targets.
pub trait Router: Send + Sync {
    fn route(&self, state: &WorkflowState) -> String;
}

impl<F> Router for F
where
    F: Fn(&WorkflowState) -> String + Send + Sync,
{
    fn route(&self, state: &WorkflowState) -> String {
        self(state)
    }
}

// ---------------------------------------------------------------------------
// StageContext
// ---------------------------------------------------------------------------

/// Handed to a stage for one execution. Carries the generation client and the
/// output sink; output from stages that are not streamed is dropped here.
pub struct StageContext {
    stage: String,
    thread_id: String,
    llm: Arc<LlmClient>,
    sink: EventSink,
    streamed: bool,
}

impl StageContext {
    pub fn new(
        stage: impl Into<String>,
        thread_id: impl Into<String>,
        llm: Arc<LlmClient>,
        sink: EventSink,
        streamed: bool,
    ) -> Self {
        Self {
            stage: stage.into(),
            thread_id: thread_id.into(),
            llm,
            sink,
            streamed,
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn llm(&self) -> &LlmClient {
        &self.llm
    }

    /// Surface incremental output. Returns `false` once the consumer is gone;
    /// the stage may keep working, the engine stops at the next boundary.
    pub async fn emit(&self, output: StageOutput) -> bool {
        if !self.streamed {
            return !self.sink.is_closed();
        }
        self.sink
            .emit(StageEvent {
                stage: self.stage.clone(),
                output,
            })
            .await
    }

    /// Run a generation request, forwarding deltas as they arrive, and return
    /// the full text. The response is read to the end even if the consumer
    /// disconnects, so the stage still completes.
    pub async fn generate(&self, request: &Request) -> Result<String> {
        let mut stream = self.llm.stream(request).await?;
        let mut text = String::new();
        let mut connected = true;

        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::ContentDelta { text: delta } => {
                    if connected {
                        connected = self.emit(StageOutput::text(delta.clone())).await;
                    }
                    text.push_str(&delta);
                }
                StreamEvent::Error(e) => {
                    return Err(Arc::try_unwrap(e)
                        .unwrap_or_else(|shared| HitlError::stage(&self.stage, shared)));
                }
                StreamEvent::MessageStart { .. } | StreamEvent::MessageEnd { .. } => {}
            }
        }

        tracing::debug!(
            stage = %self.stage,
            thread_id = %self.thread_id,
            chars = text.len(),
            "Generation finished"
        );
        Ok(text)
    }

    /// Shorthand for a system prompt plus one user turn.
    pub async fn generate_text(&self, system: &str, user: &str) -> Result<String> {
        self.generate(&Request::prompt(system, user)).await
    }

    /// Non-streamed generation, for output that is parsed rather than shown.
    pub async fn complete(&self, request: &Request) -> Result<String> {
        Ok(self.llm.complete(request).await?.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hitl_llm::{ScriptedProvider, ScriptedReply};

    fn llm(provider: ScriptedProvider) -> Arc<LlmClient> {
        Arc::new(LlmClient::new().with_provider(provider))
    }

    #[tokio::test]
    async fn generate_forwards_deltas_when_streamed() {
        let (sink, mut rx) = EventSink::channel(16);
        let ctx = StageContext::new(
            "draft",
            "t1",
            llm(ScriptedProvider::new().with_reply("Rain falls.")),
            sink,
            true,
        );

        let text = ctx.generate_text("sys", "user").await.unwrap();
        assert_eq!(text, "Rain falls.");
        drop(ctx);

        let mut pieces = Vec::new();
        while let Some(event) = rx.recv().await {
            assert_eq!(event.stage, "draft");
            pieces.push(event.output.value().to_string());
        }
        assert_eq!(pieces.concat(), "Rain falls.");
    }

    #[tokio::test]
    async fn generate_is_silent_when_not_streamed() {
        let (sink, mut rx) = EventSink::channel(16);
        let ctx = StageContext::new(
            "plan",
            "t1",
            llm(ScriptedProvider::new().with_reply("[\"A\"]")),
            sink,
            false,
        );
        assert_eq!(ctx.generate_text("s", "u").await.unwrap(), "[\"A\"]");
        drop(ctx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn generate_completes_after_consumer_drops() {
        let (sink, rx) = EventSink::channel(1);
        drop(rx);
        let ctx = StageContext::new(
            "draft",
            "t1",
            llm(ScriptedProvider::new().with_reply("one two three four")),
            sink,
            true,
        );
        let text = ctx.generate_text("s", "u").await.unwrap();
        assert_eq!(text, "one two three four");
    }

    #[tokio::test]
    async fn generate_propagates_provider_error() {
        let ctx = StageContext::new(
            "draft",
            "t1",
            llm(ScriptedProvider::new().with(ScriptedReply::Fail("model down".into()))),
            EventSink::detached(),
            true,
        );
        let err = ctx.generate_text("s", "u").await.unwrap_err();
        assert!(err.to_string().contains("model down"));
    }

    #[tokio::test]
    async fn fn_stage_and_pass_through() {
        let ctx = StageContext::new(
            "x",
            "t1",
            llm(ScriptedProvider::new()),
            EventSink::detached(),
            false,
        );
        let state = WorkflowState::new();

        let stage = FnStage(|_: &WorkflowState| Ok(StateUpdate::new().text("a", "b")));
        let update = stage.run(&state, &ctx).await.unwrap();
        assert!(update.contains("a"));

        assert!(PassThrough.run(&state, &ctx).await.unwrap().is_empty());
    }

    #[test]
    fn closures_are_routers() {
        let router = |state: &WorkflowState| {
            if state.approval_status().is_approved() {
                "finalize".to_string()
            } else {
                "draft".to_string()
            }
        };
        assert_eq!(Router::route(&router, &WorkflowState::new()), "draft");
    }
}
