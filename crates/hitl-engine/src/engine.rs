//! Workflow execution engine: the resumable traversal loop.
//!
//! A run starts at the graph's start stage (fresh thread) or at the stored
//! cursor (resume), executes stages one at a time, persists a checkpoint after
//! every merge, and halts before interrupt points. Errors returned from
//! [`Executor::run`] mean the run never began; anything that goes wrong once
//! it has begun is reported as [`Disposition::Failed`] with the last good
//! checkpoint left in the store.

use std::sync::Arc;

use hitl_llm::LlmClient;
use hitl_types::{Checkpoint, Cursor, HitlError, Result, WorkflowState};

use crate::checkpoint::CheckpointStore;
use crate::events::EventSink;
use crate::graph::{Transition, WorkflowGraph, END};
use crate::stage::StageContext;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Stage executions allowed in one run before it is aborted.
    pub max_steps: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_steps: 200 }
    }
}

pub enum RunInput {
    /// Fresh thread with its initial state.
    Start(WorkflowState),
    /// Continue from the stored cursor.
    Resume,
}

/// How a run ended.
#[derive(Debug)]
pub enum Disposition {
    /// Halted before this interrupt point.
    Paused(String),
    Completed,
    Failed(HitlError),
    /// The consumer went away; `next` is where a later run picks up.
    Cancelled { next: String },
}

impl Disposition {
    pub fn label(&self) -> &'static str {
        match self {
            Disposition::Paused(_) => "paused",
            Disposition::Completed => "completed",
            Disposition::Failed(_) => "failed",
            Disposition::Cancelled { .. } => "cancelled",
        }
    }
}

/// Drives a [`WorkflowGraph`] over one thread's checkpoint.
pub struct Executor {
    store: Arc<dyn CheckpointStore>,
    llm: Arc<LlmClient>,
    config: EngineConfig,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

impl Executor {
    pub fn new(store: Arc<dyn CheckpointStore>, llm: Arc<LlmClient>) -> Self {
        Self {
            store,
            llm,
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn run(
        &self,
        graph: &WorkflowGraph,
        thread_id: &str,
        input: RunInput,
        sink: &EventSink,
    ) -> Result<Disposition> {
        let (mut checkpoint, mut released) = match input {
            RunInput::Start(state) => {
                let checkpoint =
                    Checkpoint::new(thread_id, &graph.name, state, Cursor::next(graph.start()));
                self.store.put(&checkpoint).await?;
                tracing::info!(thread_id, workflow = %graph.name, "Run started");
                (checkpoint, None)
            }
            RunInput::Resume => {
                let checkpoint = self.store.get(thread_id).await?.ok_or_else(|| {
                    HitlError::ThreadNotFound {
                        thread_id: thread_id.to_string(),
                    }
                })?;
                if checkpoint.workflow != graph.name {
                    return Err(HitlError::UnknownWorkflow {
                        name: checkpoint.workflow,
                    });
                }
                // The stage the thread halted before has now been released.
                let released = match &checkpoint.cursor {
                    Cursor::Next(stage) => Some(stage.clone()),
                    Cursor::Finished => {
                        return Err(HitlError::ThreadFinished {
                            thread_id: thread_id.to_string(),
                        })
                    }
                };
                tracing::info!(
                    thread_id,
                    workflow = %graph.name,
                    from = released.as_deref().unwrap_or_default(),
                    "Run resumed"
                );
                (checkpoint, released)
            }
        };

        let mut steps = 0usize;
        loop {
            let current = match &checkpoint.cursor {
                Cursor::Finished => {
                    tracing::info!(thread_id, workflow = %graph.name, steps, "Run completed");
                    return Ok(Disposition::Completed);
                }
                Cursor::Next(stage) => stage.clone(),
            };

            if graph.is_interrupt(&current) && released.as_deref() != Some(current.as_str()) {
                tracing::info!(thread_id, stage = %current, "Paused before interrupt point");
                return Ok(Disposition::Paused(current));
            }
            released = None;

            if sink.is_closed() {
                tracing::warn!(thread_id, next = %current, "Consumer gone, run cancelled");
                return Ok(Disposition::Cancelled { next: current });
            }

            if steps >= self.config.max_steps {
                return Ok(self.fail(
                    thread_id,
                    &current,
                    HitlError::StepLimitExceeded {
                        limit: self.config.max_steps,
                    },
                ));
            }

            let Some(node) = graph.stage(&current) else {
                return Ok(self.fail(
                    thread_id,
                    &current,
                    HitlError::UnknownStage { stage: current.clone() },
                ));
            };

            tracing::debug!(thread_id, stage = %current, streamed = node.streamed, "Executing stage");
            let ctx = StageContext::new(
                &current,
                thread_id,
                Arc::clone(&self.llm),
                sink.clone(),
                node.streamed,
            );
            let update = match node.stage.run(&checkpoint.state, &ctx).await {
                Ok(update) => update,
                Err(e) => return Ok(self.fail(thread_id, &current, e)),
            };
            if let Err(e) = graph.schema().validate(&update) {
                return Ok(self.fail(thread_id, &current, e));
            }

            // Route against the merged state before committing anything.
            let mut state = checkpoint.state.clone();
            state.apply(update);
            let next = match next_cursor(graph, &current, &state) {
                Ok(next) => next,
                Err(e) => return Ok(self.fail(thread_id, &current, e)),
            };

            checkpoint.state = state;
            checkpoint.cursor = next;
            checkpoint.step += 1;
            checkpoint.touch();
            if let Err(e) = self.store.put(&checkpoint).await {
                return Ok(self.fail(thread_id, &current, e));
            }
            steps += 1;
        }
    }

    fn fail(&self, thread_id: &str, stage: &str, error: HitlError) -> Disposition {
        tracing::warn!(thread_id, stage, error = %error, "Run failed");
        Disposition::Failed(error)
    }
}

/// Follow the single edge out of `from`, or ask its router.
fn next_cursor(graph: &WorkflowGraph, from: &str, state: &WorkflowState) -> Result<Cursor> {
    let target = match graph.transition(from) {
        Some(Transition::Edge(to)) => to.clone(),
        Some(Transition::Branch(branch)) => {
            let target = branch.router.route(state);
            if !branch.targets.contains(&target) {
                return Err(HitlError::InvalidRoute {
                    router: from.to_string(),
                    target,
                });
            }
            tracing::debug!(from, to = %target, "Branch routed");
            target
        }
        None => {
            return Err(HitlError::UnknownStage {
                stage: from.to_string(),
            })
        }
    };
    Ok(if target == END {
        Cursor::Finished
    } else {
        Cursor::Next(target)
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
