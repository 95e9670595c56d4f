//! Pieces shared by the workflow variants.

use hitl_types::{fields, ApprovalStatus, ChatMessage, HitlError, Result, StateUpdate, WorkflowState};

/// Stage name of the review point in the single-review variants.
pub const HUMAN_REVIEW: &str = "human_review";
pub const FINALIZE: &str = "finalize";

/// `approved` proceeds; every other decision (including none yet) revises.
pub fn approval_route(state: &WorkflowState, approved: &str, otherwise: &str) -> String {
    if state.approval_status().is_approved() {
        approved.to_string()
    } else {
        otherwise.to_string()
    }
}

/// The thread's query, which every variant requires at start.
pub fn require_query(query: &str) -> Result<&str> {
    let query = query.trim();
    if query.is_empty() {
        return Err(HitlError::InvalidUpdate {
            field: fields::USER_QUERY.into(),
            message: "query must not be empty".into(),
        });
    }
    Ok(query)
}

/// Fields every fresh thread starts with.
pub fn seed_state(query: &str) -> StateUpdate {
    StateUpdate::new()
        .text(fields::USER_QUERY, query)
        .messages(&[ChatMessage::user(query)])
        .approval(ApprovalStatus::Pending)
        .count(fields::REVISION_COUNT, 0)
}

/// History with the model's reply appended.
pub fn with_reply(state: &WorkflowState, reply: &str) -> Vec<ChatMessage> {
    let mut history = state.messages();
    history.push(ChatMessage::assistant(reply));
    history
}

/// The reviewer's comment, if the last decision carried one.
pub fn feedback(state: &WorkflowState) -> Option<&str> {
    state.get_nonempty(fields::HUMAN_FEEDBACK)
}

pub fn next_revision(state: &WorkflowState) -> usize {
    state.get_count(fields::REVISION_COUNT) + 1
}
