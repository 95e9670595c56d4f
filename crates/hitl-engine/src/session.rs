//! Pending run intents.
//!
//! `start` and `resume` requests only record what should happen; the run
//! itself begins when a stream for the thread is opened. An intent is consumed
//! exactly once.

use std::collections::HashMap;

use async_trait::async_trait;
use hitl_types::{Result, StateUpdate};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub struct StartIntent {
    pub workflow: String,
    pub query: String,
    pub file: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResumeIntent {
    pub workflow: String,
    /// Human input to merge before the thread continues.
    pub update: StateUpdate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PendingIntent {
    Start(StartIntent),
    Resume(ResumeIntent),
}

impl PendingIntent {
    pub fn workflow(&self) -> &str {
        match self {
            PendingIntent::Start(i) => &i.workflow,
            PendingIntent::Resume(i) => &i.workflow,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PendingIntent::Start(_) => "start",
            PendingIntent::Resume(_) => "resume",
        }
    }
}

#[async_trait]
pub trait IntentRegistry: Send + Sync {
    /// Record an intent, replacing any earlier one for the same thread.
    async fn register(&self, thread_id: &str, intent: PendingIntent) -> Result<()>;

    /// Remove and return the thread's intent.
    async fn take(&self, thread_id: &str) -> Result<Option<PendingIntent>>;

    async fn contains(&self, thread_id: &str) -> Result<bool>;
}

#[derive(Default)]
pub struct MemoryIntentRegistry {
    pending: Mutex<HashMap<String, PendingIntent>>,
}

impl MemoryIntentRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IntentRegistry for MemoryIntentRegistry {
    async fn register(&self, thread_id: &str, intent: PendingIntent) -> Result<()> {
        let previous = self
            .pending
            .lock()
            .await
            .insert(thread_id.to_string(), intent);
        if let Some(previous) = previous {
            tracing::debug!(thread_id, replaced = previous.kind(), "Pending intent replaced");
        }
        Ok(())
    }

    async fn take(&self, thread_id: &str) -> Result<Option<PendingIntent>> {
        Ok(self.pending.lock().await.remove(thread_id))
    }

    async fn contains(&self, thread_id: &str) -> Result<bool> {
        Ok(self.pending.lock().await.contains_key(thread_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(query: &str) -> PendingIntent {
        PendingIntent::Start(StartIntent {
            workflow: "review".into(),
            query: query.into(),
            file: None,
        })
    }

    #[tokio::test]
    async fn intent_is_taken_once() {
        let registry = MemoryIntentRegistry::new();
        registry.register("t1", start("rain")).await.unwrap();
        assert!(registry.contains("t1").await.unwrap());

        let taken = registry.take("t1").await.unwrap().unwrap();
        assert_eq!(taken.workflow(), "review");
        assert_eq!(taken.kind(), "start");
        assert!(registry.take("t1").await.unwrap().is_none());
        assert!(!registry.contains("t1").await.unwrap());
    }

    #[tokio::test]
    async fn later_intent_replaces_earlier() {
        let registry = MemoryIntentRegistry::new();
        registry.register("t1", start("first")).await.unwrap();
        registry
            .register(
                "t1",
                PendingIntent::Resume(ResumeIntent {
                    workflow: "review".into(),
                    update: StateUpdate::new().text("human_feedback", "more"),
                }),
            )
            .await
            .unwrap();
        let taken = registry.take("t1").await.unwrap().unwrap();
        assert_eq!(taken.kind(), "resume");
    }
}
