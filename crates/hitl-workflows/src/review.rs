//! Single-draft review loop.
//!
//! ```text
//! draft -> [interrupt] human_review -> approved? finalize : draft
//! ```

use async_trait::async_trait;
use hitl_engine::{
    status, GraphBuilder, PassThrough, Stage, StageContext, StartRequest, StatusReport, Workflow,
    WorkflowGraph, END,
};
use hitl_llm::{Message, Request};
use hitl_types::{fields, FieldKind, Result, StateSchema, StateUpdate, WorkflowState};

use crate::common::{self, FINALIZE, HUMAN_REVIEW};

pub const NAME: &str = "review";
pub const DRAFT_CONTENT: &str = "draft_content";

const DRAFT: &str = "draft";

const WRITER_PROMPT: &str = "You are a helpful writing assistant. Write a clear, well-structured \
response to the user's request.";

const POLISH_PROMPT: &str = "You are an editor. Polish the approved draft: fix grammar and flow \
without changing its meaning. Reply with the final text only.";

struct Draft;

#[async_trait]
impl Stage for Draft {
    async fn run(&self, state: &WorkflowState, ctx: &StageContext) -> Result<StateUpdate> {
        let previous = state.get_nonempty(DRAFT_CONTENT);

        let request = match previous {
            None => {
                let mut messages = vec![Message::system(WRITER_PROMPT)];
                messages.extend(state.messages());
                Request::new(messages)
            }
            Some(previous) => {
                let query = state.get_string(fields::USER_QUERY, "");
                let guidance = common::feedback(state)
                    .unwrap_or("Improve the draft's clarity and structure.");
                Request::prompt(
                    WRITER_PROMPT,
                    format!(
                        "Original request: {query}\n\nPrevious draft:\n{previous}\n\n\
                         Reviewer feedback: {guidance}\n\nWrite a revised draft."
                    ),
                )
            }
        };

        let text = ctx.generate(&request).await?;
        let mut update = StateUpdate::new()
            .text(DRAFT_CONTENT, text.as_str())
            .messages(&common::with_reply(state, &text));
        if previous.is_some() {
            update = update.count(fields::REVISION_COUNT, common::next_revision(state));
        }
        Ok(update)
    }
}

struct Finalize;

#[async_trait]
impl Stage for Finalize {
    async fn run(&self, state: &WorkflowState, ctx: &StageContext) -> Result<StateUpdate> {
        let draft = state.get_string(DRAFT_CONTENT, "");
        let text = ctx.generate_text(POLISH_PROMPT, &draft).await?;
        Ok(StateUpdate::new().text(fields::FINAL_OUTPUT, text))
    }
}

fn route(state: &WorkflowState) -> String {
    common::approval_route(state, FINALIZE, DRAFT)
}

pub struct ReviewWorkflow {
    graph: WorkflowGraph,
}

impl ReviewWorkflow {
    pub fn new() -> Result<Self> {
        let graph = GraphBuilder::new(NAME)
            .schema(StateSchema::with_review_fields().field(DRAFT_CONTENT, FieldKind::Text))
            .stage(DRAFT, Draft)
            .stage(HUMAN_REVIEW, PassThrough)
            .stage(FINALIZE, Finalize)
            .edge(DRAFT, HUMAN_REVIEW)
            .branch(HUMAN_REVIEW, route, [FINALIZE, DRAFT])
            .edge(FINALIZE, END)
            .interrupt_before(HUMAN_REVIEW)
            .stream_output([DRAFT, FINALIZE])
            .build()?;
        Ok(Self { graph })
    }
}

impl Workflow for ReviewWorkflow {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Draft a response, pause for review, revise until approved"
    }

    fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    fn initial_state(&self, request: &StartRequest) -> Result<StateUpdate> {
        let query = common::require_query(&request.query)?;
        Ok(common::seed_state(query))
    }

    fn status(&self, paused_at: Option<&str>, state: &WorkflowState) -> StatusReport {
        match paused_at {
            None => StatusReport::finished().with_field(state, fields::FINAL_OUTPUT),
            Some(_) => StatusReport::new(status::USER_FEEDBACK)
                .with_field(state, DRAFT_CONTENT)
                .with(fields::REVISION_COUNT, state.get_count(fields::REVISION_COUNT)),
        }
    }
}
