//! Shared types, errors, workflow state, and checkpoints for the HITL engine.
//!
//! This crate provides the foundational types used across all other HITL crates:
//! - `HitlError`: unified error taxonomy
//! - `WorkflowState` / `StateUpdate`: per-thread data and the partial updates stages return
//! - `StateSchema`: declared field kinds every update is validated against
//! - `StageOutput`: incremental stage output surfaced to streaming consumers
//! - `Checkpoint`: persisted snapshot of a thread (state plus cursor)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

mod state;

pub use state::{fields, FieldKind, StateSchema, StateUpdate, WorkflowState};

/// Unified error type for all HITL subsystems.
#[derive(Debug, thiserror::Error)]
pub enum HitlError {
    // === LLM Provider Errors ===
    #[error("Provider {provider} returned HTTP {status}: {message}")]
    ProviderError {
        provider: String,
        status: u16,
        message: String,
        retryable: bool,
    },

    #[error("Rate limited by {provider}, retry after {retry_after_ms}ms")]
    RateLimited {
        provider: String,
        retry_after_ms: u64,
    },

    #[error("Authentication failed for provider {provider}")]
    AuthError { provider: String },

    #[error("Request to {provider} timed out after {timeout_ms}ms")]
    RequestTimeout { provider: String, timeout_ms: u64 },

    // === Session Errors ===
    #[error("Thread '{thread_id}' not found")]
    ThreadNotFound { thread_id: String },

    #[error("No pending start or resume for thread '{thread_id}'")]
    IntentNotFound { thread_id: String },

    #[error("Unknown workflow '{name}'")]
    UnknownWorkflow { name: String },

    #[error("Thread '{thread_id}' has already finished")]
    ThreadFinished { thread_id: String },

    #[error("Workflow '{workflow}' does not support out-of-band interrupts")]
    InterruptUnsupported { workflow: String },

    // === Engine Errors ===
    #[error("Workflow graph validation failed: {0}")]
    GraphValidation(String),

    #[error("Stage '{stage}' failed: {message}")]
    StageFailed { stage: String, message: String },

    #[error("Unknown stage '{stage}'")]
    UnknownStage { stage: String },

    #[error("Router at '{router}' returned undeclared target '{target}'")]
    InvalidRoute { router: String, target: String },

    #[error("Invalid update for field '{field}': {message}")]
    InvalidUpdate { field: String, message: String },

    #[error("Step limit of {limit} reached without halting")]
    StepLimitExceeded { limit: usize },

    // === Tool Errors ===
    #[error("Tool '{tool}' error: {message}")]
    ToolError { tool: String, message: String },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl HitlError {
    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HitlError::RateLimited { .. }
                | HitlError::RequestTimeout { .. }
                | HitlError::ProviderError {
                    retryable: true,
                    ..
                }
        )
    }

    /// Returns `true` if the caller asked for something that does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            HitlError::ThreadNotFound { .. }
                | HitlError::IntentNotFound { .. }
                | HitlError::UnknownWorkflow { .. }
        )
    }

    /// Maps the error to an HTTP status code for server mode.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            HitlError::ThreadNotFound { .. }
            | HitlError::IntentNotFound { .. }
            | HitlError::UnknownWorkflow { .. } => Some(404),
            HitlError::InvalidUpdate { .. }
            | HitlError::InvalidRoute { .. }
            | HitlError::GraphValidation(_) => Some(400),
            HitlError::ThreadFinished { .. } => Some(409),
            HitlError::InterruptUnsupported { .. } => Some(422),
            HitlError::RateLimited { .. } => Some(429),
            HitlError::RequestTimeout { .. } => Some(504),
            HitlError::AuthError { .. } | HitlError::ProviderError { .. } => Some(502),
            _ => None,
        }
    }

    /// Shorthand for a stage failure with a message.
    pub fn stage(stage: impl Into<String>, message: impl fmt::Display) -> Self {
        HitlError::StageFailed {
            stage: stage.into(),
            message: message.to_string(),
        }
    }
}

/// A convenience alias for `Result<T, HitlError>`.
pub type Result<T> = std::result::Result<T, HitlError>;

/// Mint a fresh opaque thread identifier.
pub fn new_thread_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// ApprovalStatus: the human's decision at a review point
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    #[default]
    Pending,
    Approved,
    Feedback,
    Editing,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Feedback => "feedback",
            ApprovalStatus::Editing => "editing",
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, ApprovalStatus::Approved)
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalStatus {
    type Err = HitlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "feedback" => Ok(ApprovalStatus::Feedback),
            "editing" => Ok(ApprovalStatus::Editing),
            other => Err(HitlError::InvalidUpdate {
                field: fields::APPROVAL_STATUS.into(),
                message: format!("unknown approval status '{other}'"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// ChatMessage: role-tagged conversation history entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({ "role": self.role.as_str(), "content": self.content })
    }
}

// ---------------------------------------------------------------------------
// StageOutput: incremental output surfaced by a running stage
// ---------------------------------------------------------------------------

/// Normalised output fragment. Every stage reports through this one shape so
/// the streaming adapter never has to guess what a stage produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum StageOutput {
    Text(String),
    Error(String),
}

impl StageOutput {
    pub fn text(value: impl Into<String>) -> Self {
        StageOutput::Text(value.into())
    }

    pub fn error(value: impl Into<String>) -> Self {
        StageOutput::Error(value.into())
    }

    pub fn value(&self) -> &str {
        match self {
            StageOutput::Text(v) | StageOutput::Error(v) => v,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StageOutput::Error(_))
    }
}

// ---------------------------------------------------------------------------
// Checkpoint: persisted snapshot of a thread
// ---------------------------------------------------------------------------

/// Where a thread will continue from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "stage", rename_all = "snake_case")]
pub enum Cursor {
    /// Halted before (or failed in) this stage; the next run starts here.
    Next(String),
    /// The graph reached its terminal node.
    Finished,
}

impl Cursor {
    pub fn next(stage: impl Into<String>) -> Self {
        Cursor::Next(stage.into())
    }

    pub fn stage(&self) -> Option<&str> {
        match self {
            Cursor::Next(stage) => Some(stage),
            Cursor::Finished => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: String,
    pub workflow: String,
    pub state: WorkflowState,
    pub cursor: Cursor,
    /// Stage executions over the thread's lifetime.
    pub step: usize,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Checkpoint {
    pub fn new(
        thread_id: impl Into<String>,
        workflow: impl Into<String>,
        state: WorkflowState,
        cursor: Cursor,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            workflow: workflow.into(),
            state,
            cursor,
            step: 0,
            updated_at: chrono::Utc::now(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.cursor == Cursor::Finished
    }

    /// Stages the thread will run next; empty once finished.
    pub fn next_stages(&self) -> Vec<String> {
        self.cursor.stage().map(|s| vec![s.to_owned()]).unwrap_or_default()
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_stage_failed() {
        let err = HitlError::stage("draft", "model unavailable");
        assert_eq!(err.to_string(), "Stage 'draft' failed: model unavailable");
    }

    #[test]
    fn error_display_invalid_route() {
        let err = HitlError::InvalidRoute {
            router: "human_review".into(),
            target: "nowhere".into(),
        };
        assert_eq!(
            err.to_string(),
            "Router at 'human_review' returned undeclared target 'nowhere'"
        );
    }

    #[test]
    fn error_display_rate_limited() {
        let err = HitlError::RateLimited {
            provider: "openai".into(),
            retry_after_ms: 3000,
        };
        assert_eq!(err.to_string(), "Rate limited by openai, retry after 3000ms");
    }

    // --- is_retryable ---

    #[test]
    fn retryable_rate_limited_and_timeout() {
        assert!(HitlError::RateLimited {
            provider: "x".into(),
            retry_after_ms: 1
        }
        .is_retryable());
        assert!(HitlError::RequestTimeout {
            provider: "x".into(),
            timeout_ms: 1
        }
        .is_retryable());
    }

    #[test]
    fn not_retryable_stage_failure() {
        assert!(!HitlError::stage("plan", "bad").is_retryable());
        assert!(!HitlError::AuthError {
            provider: "x".into()
        }
        .is_retryable());
    }

    // --- http_status ---

    #[test]
    fn http_status_mapping() {
        let not_found = HitlError::ThreadNotFound {
            thread_id: "t".into(),
        };
        assert_eq!(not_found.http_status(), Some(404));
        assert!(not_found.is_not_found());

        let finished = HitlError::ThreadFinished {
            thread_id: "t".into(),
        };
        assert_eq!(finished.http_status(), Some(409));

        let unsupported = HitlError::InterruptUnsupported {
            workflow: "review".into(),
        };
        assert_eq!(unsupported.http_status(), Some(422));

        assert_eq!(HitlError::Other("x".into()).http_status(), None);
    }

    // --- ApprovalStatus ---

    #[test]
    fn approval_status_parse_and_display() {
        assert_eq!(
            "Approved".parse::<ApprovalStatus>().unwrap(),
            ApprovalStatus::Approved
        );
        assert_eq!(ApprovalStatus::Editing.to_string(), "editing");
        assert!("maybe".parse::<ApprovalStatus>().is_err());
        assert_eq!(ApprovalStatus::default(), ApprovalStatus::Pending);
    }

    #[test]
    fn approval_status_serde_lowercase() {
        let json = serde_json::to_string(&ApprovalStatus::Feedback).unwrap();
        assert_eq!(json, "\"feedback\"");
    }

    // --- StageOutput ---

    #[test]
    fn stage_output_tagged_shape() {
        let out = StageOutput::text("hello");
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "text", "value": "hello"}));
        assert!(StageOutput::error("boom").is_error());
        assert_eq!(StageOutput::error("boom").value(), "boom");
    }

    // --- Checkpoint ---

    #[test]
    fn checkpoint_next_stages() {
        let cp = Checkpoint::new(
            "t1",
            "review",
            WorkflowState::new(),
            Cursor::next("human_review"),
        );
        assert_eq!(cp.next_stages(), vec!["human_review".to_string()]);
        assert!(!cp.is_finished());

        let done = Checkpoint::new("t1", "review", WorkflowState::new(), Cursor::Finished);
        assert!(done.next_stages().is_empty());
        assert!(done.is_finished());
    }

    #[test]
    fn checkpoint_serde_roundtrip() {
        let mut state = WorkflowState::new();
        state.apply(StateUpdate::new().text("draft_content", "hello"));
        let cp = Checkpoint::new("t1", "review", state, Cursor::next("human_review"));
        let json = serde_json::to_string(&cp).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cp);
    }

    #[test]
    fn thread_ids_are_unique() {
        assert_ne!(new_thread_id(), new_thread_id());
    }
}
