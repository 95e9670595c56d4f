//! Workflow variants: a graph plus the request/status mapping around it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use hitl_types::{fields, ApprovalStatus, HitlError, Result, StateUpdate, WorkflowState};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::events::status;
use crate::graph::WorkflowGraph;

// ---------------------------------------------------------------------------
// Requests and reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartRequest {
    pub workflow: String,
    pub query: String,
    /// Path of an existing input file (analysis variant).
    #[serde(default)]
    pub file: Option<String>,
}

/// Human input for a paused thread.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeRequest {
    pub thread_id: String,
    pub decision: ApprovalStatus,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub edited_sentences: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub sentence_feedback: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub edited_content: Option<String>,
    #[serde(default)]
    pub updated_plan: Option<Vec<String>>,
}

impl ResumeRequest {
    pub fn new(thread_id: impl Into<String>, decision: ApprovalStatus) -> Self {
        Self {
            thread_id: thread_id.into(),
            decision,
            ..Self::default()
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// The comment, if it has any content.
    pub fn comment_text(&self) -> Option<&str> {
        self.comment
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}

/// Terminal status of a stream: the status string and the variant's payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub status: String,
    pub payload: Map<String, Value>,
}

impl StatusReport {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            payload: Map::new(),
        }
    }

    pub fn finished() -> Self {
        Self::new(status::FINISHED)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Copy `key` from state, or null when absent.
    pub fn with_field(self, state: &WorkflowState, key: &str) -> Self {
        let value = state.get(key).cloned().unwrap_or(Value::Null);
        self.with(key, value)
    }
}

// ---------------------------------------------------------------------------
// Workflow trait
// ---------------------------------------------------------------------------

/// One registered workflow variant.
pub trait Workflow: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn graph(&self) -> &WorkflowGraph;

    /// Initial state for a fresh thread.
    fn initial_state(&self, request: &StartRequest) -> Result<StateUpdate>;

    /// Fields to merge before a paused thread continues. The default records
    /// the decision and replaces `human_feedback` with the comment.
    fn resume_update(&self, request: &ResumeRequest, _state: &WorkflowState) -> Result<StateUpdate> {
        Ok(review_update(request))
    }

    /// Status for a run that halted at `paused_at`, or finished when `None`.
    fn status(&self, paused_at: Option<&str>, state: &WorkflowState) -> StatusReport;

    fn supports_interrupt(&self) -> bool {
        false
    }

    /// Fields recorded by an out-of-band interrupt request.
    fn interrupt_update(&self, _message: &str) -> Result<StateUpdate> {
        Err(HitlError::InterruptUnsupported {
            workflow: self.name().to_string(),
        })
    }
}

/// `approval_status` plus `human_feedback`, cleared when there is no comment.
pub fn review_update(request: &ResumeRequest) -> StateUpdate {
    let update = StateUpdate::new().approval(request.decision);
    match request.comment_text() {
        Some(comment) => update.text(fields::HUMAN_FEEDBACK, comment),
        None => update.clear(fields::HUMAN_FEEDBACK),
    }
}

// ---------------------------------------------------------------------------
// WorkflowCatalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowInfo {
    pub name: String,
    pub description: String,
    pub stages: Vec<String>,
    pub interrupt_points: Vec<String>,
    pub supports_interrupt: bool,
}

/// Registered variants, looked up by name.
#[derive(Default)]
pub struct WorkflowCatalog {
    workflows: HashMap<String, Arc<dyn Workflow>>,
    order: Vec<String>,
}

impl WorkflowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, workflow: impl Workflow + 'static) {
        let name = workflow.name().to_string();
        if self.workflows.insert(name.clone(), Arc::new(workflow)).is_none() {
            self.order.push(name);
        }
    }

    pub fn with(mut self, workflow: impl Workflow + 'static) -> Self {
        self.register(workflow);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Workflow>> {
        self.workflows
            .get(name)
            .cloned()
            .ok_or_else(|| HitlError::UnknownWorkflow {
                name: name.to_string(),
            })
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn list(&self) -> Vec<WorkflowInfo> {
        self.order
            .iter()
            .filter_map(|name| self.workflows.get(name))
            .map(|w| WorkflowInfo {
                name: w.name().to_string(),
                description: w.description().to_string(),
                stages: w.graph().stage_ids().to_vec(),
                interrupt_points: w.graph().interrupt_points().to_vec(),
                supports_interrupt: w.supports_interrupt(),
            })
            .collect()
    }
}
