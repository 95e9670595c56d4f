//! Sentence-level editor.
//!
//! ```text
//! generate_initial -> [interrupt] human_edit -> approved? finalize : incorporate_edits
//! incorporate_edits -> human_edit
//! ```
//!
//! Reviewers replace sentences or comment on them by id. Every revision
//! re-segments the content, so ids only refer to the version they came from.

use std::collections::BTreeMap;

use async_trait::async_trait;
use hitl_engine::{
    review_update, status, GraphBuilder, PassThrough, ResumeRequest, Stage, StageContext,
    StartRequest, StatusReport, Workflow, WorkflowGraph, WorkflowService, END,
};
use hitl_types::{
    fields, ApprovalStatus, FieldKind, HitlError, Result, StateSchema, StateUpdate, WorkflowState,
};
use serde::Serialize;

use crate::common::{self, FINALIZE};
use crate::sentences::{ordered, reconstruct, sentence_map};

pub const NAME: &str = "editor";

pub const INITIAL_CONTENT: &str = "initial_content";
pub const CURRENT_CONTENT: &str = "current_content";
pub const SENTENCES: &str = "sentences";
pub const EDITED_SENTENCES: &str = "edited_sentences";
pub const SENTENCE_FEEDBACK: &str = "sentence_feedback";

const GENERATE_INITIAL: &str = "generate_initial";
const HUMAN_EDIT: &str = "human_edit";
const INCORPORATE_EDITS: &str = "incorporate_edits";

const WRITER_PROMPT: &str = "You are a helpful writing assistant. Write clear prose in complete \
sentences.";

const REVISE_PROMPT: &str = "You revise text according to a reviewer's edits. Keep every \
replacement sentence exactly as given, apply the comments, and reply with the full revised text \
only.";

const POLISH_PROMPT: &str = "You are an editor. Polish the approved text for grammar and flow. \
Keep every sentence's meaning and reply with the final text only.";

struct GenerateInitial;

#[async_trait]
impl Stage for GenerateInitial {
    async fn run(&self, state: &WorkflowState, ctx: &StageContext) -> Result<StateUpdate> {
        let query = state.get_string(fields::USER_QUERY, "");
        let text = ctx.generate_text(WRITER_PROMPT, &query).await?;
        let text = text.trim();
        Ok(StateUpdate::new()
            .text(INITIAL_CONTENT, text)
            .text(CURRENT_CONTENT, text)
            .text_map(SENTENCES, &sentence_map(text))
            .messages(&common::with_reply(state, text)))
    }
}

/// Edits that actually change a known sentence.
fn effective_edits(
    sentences: &BTreeMap<String, String>,
    edits: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    edits
        .iter()
        .filter(|(id, text)| {
            sentences
                .get(*id)
                .is_some_and(|current| current.trim() != text.trim())
        })
        .map(|(id, text)| (id.clone(), text.trim().to_string()))
        .collect()
}

/// Revision request listing replacements and comments in sentence order.
fn revision_prompt(
    current: &str,
    sentences: &BTreeMap<String, String>,
    edits: &BTreeMap<String, String>,
    notes: &BTreeMap<String, String>,
    general: Option<&str>,
) -> String {
    let original = |id: &str| sentences.get(id).map(String::as_str).unwrap_or_default();
    let mut prompt = format!("Current text:\n{current}");
    if !edits.is_empty() {
        prompt.push_str("\n\nReplace these sentences with the reviewer's versions:\n");
        for (id, text) in ordered(edits) {
            prompt.push_str(&format!("- \"{}\" -> \"{text}\"\n", original(id)));
        }
    }
    if !notes.is_empty() {
        prompt.push_str("\n\nComments on specific sentences:\n");
        for (id, note) in ordered(notes) {
            prompt.push_str(&format!("- \"{}\": {note}\n", original(id)));
        }
    }
    if let Some(general) = general {
        prompt.push_str(&format!("\n\nGeneral feedback: {general}\n"));
    }
    prompt
}

struct IncorporateEdits;

#[async_trait]
impl Stage for IncorporateEdits {
    async fn run(&self, state: &WorkflowState, ctx: &StageContext) -> Result<StateUpdate> {
        let mut sentences = state.get_text_map(SENTENCES);
        let edits = effective_edits(&sentences, &state.get_text_map(EDITED_SENTENCES));
        let notes: BTreeMap<String, String> = state
            .get_text_map(SENTENCE_FEEDBACK)
            .into_iter()
            .filter(|(id, note)| sentences.contains_key(id) && !note.trim().is_empty())
            .collect();
        let general = common::feedback(state);

        let cleared = StateUpdate::new()
            .text_map(EDITED_SENTENCES, &BTreeMap::new())
            .text_map(SENTENCE_FEEDBACK, &BTreeMap::new())
            .clear(fields::HUMAN_FEEDBACK)
            .approval(ApprovalStatus::Editing);

        if edits.is_empty() && notes.is_empty() && general.is_none() {
            tracing::debug!(thread_id = ctx.thread_id(), "No edits to incorporate");
            return Ok(cleared);
        }

        let current = state.get_string(CURRENT_CONTENT, "");
        let prompt = revision_prompt(&current, &sentences, &edits, &notes, general);

        // Direct replacements stand on their own if the model drops them.
        sentences.extend(edits);
        let fallback = reconstruct(&sentences);
        let revised = ctx.generate_text(REVISE_PROMPT, &prompt).await?;
        let revised = match revised.trim() {
            "" => fallback,
            text => text.to_string(),
        };

        Ok(cleared
            .text(CURRENT_CONTENT, revised.as_str())
            .text_map(SENTENCES, &sentence_map(&revised))
            .count(fields::REVISION_COUNT, common::next_revision(state)))
    }
}

struct Finalize;

#[async_trait]
impl Stage for Finalize {
    async fn run(&self, state: &WorkflowState, ctx: &StageContext) -> Result<StateUpdate> {
        let approved = state.get_string(CURRENT_CONTENT, "");
        let polished = ctx.generate_text(POLISH_PROMPT, &approved).await?;
        let text = match polished.trim() {
            "" => approved,
            text => text.to_string(),
        };
        Ok(StateUpdate::new().text(fields::FINAL_OUTPUT, text))
    }
}

fn route(state: &WorkflowState) -> String {
    common::approval_route(state, FINALIZE, INCORPORATE_EDITS)
}

pub struct EditorWorkflow {
    graph: WorkflowGraph,
}

impl EditorWorkflow {
    pub fn new() -> Result<Self> {
        let schema = StateSchema::with_review_fields()
            .field(INITIAL_CONTENT, FieldKind::Text)
            .field(CURRENT_CONTENT, FieldKind::Text)
            .field(SENTENCES, FieldKind::TextMap)
            .field(EDITED_SENTENCES, FieldKind::TextMap)
            .field(SENTENCE_FEEDBACK, FieldKind::TextMap);

        let graph = GraphBuilder::new(NAME)
            .schema(schema)
            .stage(GENERATE_INITIAL, GenerateInitial)
            .stage(HUMAN_EDIT, PassThrough)
            .stage(INCORPORATE_EDITS, IncorporateEdits)
            .stage(FINALIZE, Finalize)
            .edge(GENERATE_INITIAL, HUMAN_EDIT)
            .branch(HUMAN_EDIT, route, [FINALIZE, INCORPORATE_EDITS])
            .edge(INCORPORATE_EDITS, HUMAN_EDIT)
            .edge(FINALIZE, END)
            .interrupt_before(HUMAN_EDIT)
            .stream_output([GENERATE_INITIAL, INCORPORATE_EDITS, FINALIZE])
            .build()?;
        Ok(Self { graph })
    }
}

impl Workflow for EditorWorkflow {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Generate text, then revise it from sentence-level edits and comments"
    }

    fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    fn initial_state(&self, request: &StartRequest) -> Result<StateUpdate> {
        let query = common::require_query(&request.query)?;
        Ok(common::seed_state(query)
            .text_map(EDITED_SENTENCES, &BTreeMap::new())
            .text_map(SENTENCE_FEEDBACK, &BTreeMap::new()))
    }

    /// Structured edits in the request are merged over the ones already
    /// recorded through the sentence operations.
    fn resume_update(&self, request: &ResumeRequest, state: &WorkflowState) -> Result<StateUpdate> {
        let mut update = review_update(request);
        if let Some(edits) = &request.edited_sentences {
            let mut merged = state.get_text_map(EDITED_SENTENCES);
            merged.extend(edits.clone());
            update = update.text_map(EDITED_SENTENCES, &merged);
        }
        if let Some(notes) = &request.sentence_feedback {
            let mut merged = state.get_text_map(SENTENCE_FEEDBACK);
            merged.extend(notes.clone());
            update = update.text_map(SENTENCE_FEEDBACK, &merged);
        }
        Ok(update)
    }

    fn status(&self, paused_at: Option<&str>, state: &WorkflowState) -> StatusReport {
        match paused_at {
            None => StatusReport::finished().with_field(state, fields::FINAL_OUTPUT),
            Some(_) => StatusReport::new(status::EDITING)
                .with_field(state, CURRENT_CONTENT)
                .with_field(state, SENTENCES)
                .with(fields::REVISION_COUNT, state.get_count(fields::REVISION_COUNT)),
        }
    }
}

// ---------------------------------------------------------------------------
// Sentence operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SentenceEntry {
    pub id: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

/// The current sentences of an editor thread with any recorded edits.
#[derive(Debug, Clone, Serialize)]
pub struct SentenceView {
    pub thread_id: String,
    pub sentences: Vec<SentenceEntry>,
}

impl SentenceView {
    fn from_state(thread_id: &str, state: &WorkflowState) -> Self {
        let sentences = state.get_text_map(SENTENCES);
        let edits = state.get_text_map(EDITED_SENTENCES);
        let notes = state.get_text_map(SENTENCE_FEEDBACK);
        let entries = ordered(&sentences)
            .into_iter()
            .map(|(id, text)| SentenceEntry {
                id: id.to_string(),
                text: text.to_string(),
                edited: edits.get(id).cloned(),
                feedback: notes.get(id).cloned(),
            })
            .collect();
        Self {
            thread_id: thread_id.to_string(),
            sentences: entries,
        }
    }

    pub fn get(&self, id: &str) -> Option<&SentenceEntry> {
        self.sentences.iter().find(|s| s.id == id)
    }
}

async fn editor_state(service: &WorkflowService, thread_id: &str) -> Result<WorkflowState> {
    let snapshot = service.get_state(thread_id).await?;
    if snapshot.workflow != NAME {
        return Err(HitlError::InvalidUpdate {
            field: SENTENCES.into(),
            message: format!(
                "thread '{thread_id}' runs the '{}' workflow, not '{NAME}'",
                snapshot.workflow
            ),
        });
    }
    Ok(snapshot.state)
}

fn require_sentence(state: &WorkflowState, sentence_id: &str) -> Result<()> {
    if state.get_text_map(SENTENCES).contains_key(sentence_id) {
        Ok(())
    } else {
        Err(HitlError::InvalidUpdate {
            field: SENTENCES.into(),
            message: format!("unknown sentence '{sentence_id}'"),
        })
    }
}

pub async fn sentences(service: &WorkflowService, thread_id: &str) -> Result<SentenceView> {
    let state = editor_state(service, thread_id).await?;
    Ok(SentenceView::from_state(thread_id, &state))
}

/// Record a replacement for one sentence; applied on the next revision.
pub async fn edit_sentence(
    service: &WorkflowService,
    thread_id: &str,
    sentence_id: &str,
    text: &str,
) -> Result<SentenceView> {
    record(service, thread_id, EDITED_SENTENCES, sentence_id, text).await
}

/// Record a comment on one sentence; applied on the next revision.
pub async fn feedback_sentence(
    service: &WorkflowService,
    thread_id: &str,
    sentence_id: &str,
    feedback: &str,
) -> Result<SentenceView> {
    record(service, thread_id, SENTENCE_FEEDBACK, sentence_id, feedback).await
}

async fn record(
    service: &WorkflowService,
    thread_id: &str,
    field: &str,
    sentence_id: &str,
    value: &str,
) -> Result<SentenceView> {
    let state = editor_state(service, thread_id).await?;
    require_sentence(&state, sentence_id)?;
    let mut entries = state.get_text_map(field);
    entries.insert(sentence_id.to_string(), value.to_string());
    let checkpoint = service
        .update_state(thread_id, StateUpdate::new().text_map(field, &entries))
        .await?;
    tracing::debug!(thread_id, sentence_id, field, "Sentence input recorded");
    Ok(SentenceView::from_state(thread_id, &checkpoint.state))
}
