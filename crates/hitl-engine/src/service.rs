//! The workflow service: the two-step request protocol over the engine.
//!
//! `start` and `resume` record a pending intent and return immediately; the
//! run happens when [`WorkflowService::stream`] is opened for the thread. The
//! stream emits one handshake, the tokens of streamed stages, and exactly one
//! final status. Dropping the stream cancels the run at the next stage
//! boundary; everything persisted up to that point stays.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hitl_llm::LlmClient;
use hitl_types::{new_thread_id, Checkpoint, HitlError, Result, StateUpdate, WorkflowState};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::checkpoint::CheckpointStore;
use crate::engine::{Disposition, EngineConfig, Executor, RunInput};
use crate::events::{status, EventSink, StreamMode, WireEvent};
use crate::session::{IntentRegistry, MemoryIntentRegistry, PendingIntent, ResumeIntent, StartIntent};
use crate::workflow::{ResumeRequest, StartRequest, Workflow, WorkflowCatalog, WorkflowInfo};

/// Reply to `start`, `resume` and `interrupt`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ack {
    pub thread_id: String,
    pub status: String,
}

impl Ack {
    fn new(thread_id: impl Into<String>, status: &str) -> Self {
        Self {
            thread_id: thread_id.into(),
            status: status.to_string(),
        }
    }
}

/// A thread's stored state and where it will continue.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadSnapshot {
    pub thread_id: String,
    pub workflow: String,
    pub state: WorkflowState,
    pub next: Vec<String>,
    pub step: usize,
    pub updated_at: DateTime<Utc>,
}

impl From<Checkpoint> for ThreadSnapshot {
    fn from(cp: Checkpoint) -> Self {
        Self {
            next: cp.next_stages(),
            thread_id: cp.thread_id,
            workflow: cp.workflow,
            state: cp.state,
            step: cp.step,
            updated_at: cp.updated_at,
        }
    }
}

/// What the stream task does once the handshake is out.
enum RunPlan {
    Start(WorkflowState),
    Resume(StateUpdate),
    /// Nothing to run: report the stored status and stop.
    Report,
}

#[derive(Clone)]
pub struct WorkflowService {
    catalog: Arc<WorkflowCatalog>,
    store: Arc<dyn CheckpointStore>,
    intents: Arc<dyn IntentRegistry>,
    executor: Arc<Executor>,
    llm: Arc<LlmClient>,
    capacity: usize,
}

impl WorkflowService {
    pub fn new(catalog: WorkflowCatalog, store: Arc<dyn CheckpointStore>, llm: Arc<LlmClient>) -> Self {
        let executor = Executor::new(Arc::clone(&store), Arc::clone(&llm));
        Self {
            catalog: Arc::new(catalog),
            store,
            intents: Arc::new(MemoryIntentRegistry::new()),
            executor: Arc::new(executor),
            llm,
            capacity: 64,
        }
    }

    pub fn with_intents(mut self, intents: Arc<dyn IntentRegistry>) -> Self {
        self.intents = intents;
        self
    }

    pub fn with_engine_config(mut self, config: EngineConfig) -> Self {
        let executor = Executor::new(Arc::clone(&self.store), Arc::clone(&self.llm)).with_config(config);
        self.executor = Arc::new(executor);
        self
    }

    /// Buffer size of the event channels.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn catalog(&self) -> &WorkflowCatalog {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn workflows(&self) -> Vec<WorkflowInfo> {
        self.catalog.list()
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    pub async fn start(&self, request: StartRequest) -> Result<Ack> {
        let workflow = self.catalog.get(&request.workflow)?;
        let initial = workflow.initial_state(&request)?;
        workflow.graph().schema().validate(&initial)?;

        let thread_id = new_thread_id();
        self.intents
            .register(
                &thread_id,
                PendingIntent::Start(StartIntent {
                    workflow: request.workflow,
                    query: request.query,
                    file: request.file,
                }),
            )
            .await?;
        tracing::info!(thread_id = %thread_id, workflow = %workflow.name(), "Start registered");
        Ok(Ack::new(thread_id, "pending"))
    }

    pub async fn resume(&self, request: ResumeRequest) -> Result<Ack> {
        let checkpoint = self.checkpoint(&request.thread_id).await?;
        if checkpoint.is_finished() {
            return Err(HitlError::ThreadFinished {
                thread_id: request.thread_id,
            });
        }
        let workflow = self.catalog.get(&checkpoint.workflow)?;
        let update = workflow.resume_update(&request, &checkpoint.state)?;
        workflow.graph().schema().validate(&update)?;

        self.intents
            .register(
                &request.thread_id,
                PendingIntent::Resume(ResumeIntent {
                    workflow: checkpoint.workflow,
                    update,
                }),
            )
            .await?;
        tracing::info!(
            thread_id = %request.thread_id,
            decision = %request.decision,
            "Resume registered"
        );
        Ok(Ack::new(request.thread_id, "pending"))
    }

    /// Record an out-of-band interrupt for the thread's next resume.
    pub async fn interrupt(&self, thread_id: &str, message: &str) -> Result<Ack> {
        let checkpoint = self.checkpoint(thread_id).await?;
        let workflow = self.catalog.get(&checkpoint.workflow)?;
        if !workflow.supports_interrupt() {
            return Err(HitlError::InterruptUnsupported {
                workflow: checkpoint.workflow,
            });
        }
        let update = workflow.interrupt_update(message)?;
        self.update_state(thread_id, update).await?;
        tracing::info!(thread_id, "Interrupt recorded");
        Ok(Ack::new(thread_id, "interrupted"))
    }

    pub async fn get_state(&self, thread_id: &str) -> Result<ThreadSnapshot> {
        Ok(self.checkpoint(thread_id).await?.into())
    }

    /// Merge a validated update into a stored thread without running it.
    pub async fn update_state(&self, thread_id: &str, update: StateUpdate) -> Result<Checkpoint> {
        let checkpoint = self.checkpoint(thread_id).await?;
        let workflow = self.catalog.get(&checkpoint.workflow)?;
        workflow.graph().schema().validate(&update)?;
        self.store.update(thread_id, update).await
    }

    async fn checkpoint(&self, thread_id: &str) -> Result<Checkpoint> {
        self.store
            .get(thread_id)
            .await?
            .ok_or_else(|| HitlError::ThreadNotFound {
                thread_id: thread_id.to_string(),
            })
    }

    // -----------------------------------------------------------------------
    // Streaming
    // -----------------------------------------------------------------------

    /// Open the event stream for a thread, consuming its pending intent.
    ///
    /// With no intent, a thread whose run stopped between stages continues
    /// from its cursor; a thread paused at an interrupt point or finished only
    /// reports its status. A thread with neither intent nor state is not found.
    pub async fn stream(&self, thread_id: &str) -> Result<ReceiverStream<WireEvent>> {
        let (workflow, mode, plan) = match self.intents.take(thread_id).await? {
            Some(PendingIntent::Start(intent)) => {
                let workflow = self.catalog.get(&intent.workflow)?;
                let request = StartRequest {
                    workflow: intent.workflow,
                    query: intent.query,
                    file: intent.file,
                };
                let initial = WorkflowState::from_update(workflow.initial_state(&request)?);
                (workflow, StreamMode::Start, RunPlan::Start(initial))
            }
            Some(PendingIntent::Resume(intent)) => {
                let workflow = self.catalog.get(&intent.workflow)?;
                (workflow, StreamMode::Resume, RunPlan::Resume(intent.update))
            }
            None => {
                let checkpoint = self.checkpoint(thread_id).await?;
                let workflow = self.catalog.get(&checkpoint.workflow)?;
                let halted = checkpoint
                    .cursor
                    .stage()
                    .map_or(true, |stage| workflow.graph().is_interrupt(stage));
                if halted {
                    // Waiting on a human (or done): nothing to run, report where it is.
                    (workflow, StreamMode::Resume, RunPlan::Report)
                } else {
                    tracing::info!(thread_id, "Reconnecting to unfinished thread");
                    (workflow, StreamMode::Resume, RunPlan::Resume(StateUpdate::new()))
                }
            }
        };

        let (tx, rx) = mpsc::channel(self.capacity);
        let service = self.clone();
        let thread_id = thread_id.to_string();
        tokio::spawn(async move {
            service.drive(thread_id, workflow, mode, plan, tx).await;
        });
        Ok(ReceiverStream::new(rx))
    }

    async fn drive(
        self,
        thread_id: String,
        workflow: Arc<dyn Workflow>,
        mode: StreamMode,
        plan: RunPlan,
        tx: mpsc::Sender<WireEvent>,
    ) {
        let handshake = WireEvent::handshake(&thread_id, workflow.name(), mode);
        if tx.send(handshake).await.is_err() {
            return;
        }

        let input = match plan {
            RunPlan::Start(state) => RunInput::Start(state),
            RunPlan::Resume(update) => {
                if !update.is_empty() {
                    if let Err(e) = self.store.update(&thread_id, update).await {
                        send_failure(&tx, &e).await;
                        return;
                    }
                }
                RunInput::Resume
            }
            RunPlan::Report => {
                let _ = tx.send(self.final_status(workflow.as_ref(), &thread_id).await).await;
                return;
            }
        };

        let (sink, mut events) = EventSink::channel(self.capacity);
        let executor = Arc::clone(&self.executor);
        let run_workflow = Arc::clone(&workflow);
        let run_thread = thread_id.clone();
        let run = tokio::spawn(async move {
            executor
                .run(run_workflow.graph(), &run_thread, input, &sink)
                .await
        });

        let mut connected = true;
        while let Some(event) = events.recv().await {
            if tx.send(WireEvent::token(event)).await.is_err() {
                connected = false;
                break;
            }
        }
        // Closing our end makes the engine stop at its next boundary.
        drop(events);

        let outcome = match run.await {
            Ok(outcome) => outcome,
            Err(join) => Err(HitlError::Other(format!("workflow run aborted: {join}"))),
        };
        if !connected {
            tracing::warn!(thread_id = %thread_id, "Stream consumer disconnected");
            return;
        }

        match outcome {
            Ok(Disposition::Paused(_)) | Ok(Disposition::Completed) => {
                let _ = tx.send(self.final_status(workflow.as_ref(), &thread_id).await).await;
            }
            Ok(Disposition::Cancelled { next }) => {
                tracing::warn!(thread_id = %thread_id, next = %next, "Run cancelled");
            }
            Ok(Disposition::Failed(e)) | Err(e) => send_failure(&tx, &e).await,
        }
    }

    /// Final status built from the stored checkpoint.
    async fn final_status(&self, workflow: &dyn Workflow, thread_id: &str) -> WireEvent {
        match self.checkpoint(thread_id).await {
            Ok(cp) => {
                let report = workflow.status(cp.cursor.stage(), &cp.state);
                WireEvent::status(report.status, report.payload)
            }
            Err(e) => error_status(&e),
        }
    }
}

fn error_status(error: &HitlError) -> WireEvent {
    let mut payload = Map::new();
    payload.insert("error".into(), Value::String(error.to_string()));
    WireEvent::status(status::ERROR, payload)
}

async fn send_failure(tx: &mpsc::Sender<WireEvent>, error: &HitlError) {
    if tx.send(WireEvent::error(error.to_string())).await.is_ok() {
        let _ = tx.send(error_status(error)).await;
    }
}
