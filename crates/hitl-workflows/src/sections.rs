//! Multi-section document writer. Each section is reviewed before the next
//! one is written.
//!
//! ```text
//! research -> plan -> generate_section -> [interrupt] human_review
//! human_review -> approved & more left? advance_section -> generate_section
//!              -> approved & last?      finalize
//!              -> otherwise             generate_section (revise)
//! ```

use async_trait::async_trait;
use hitl_engine::{
    review_update, status, GraphBuilder, PassThrough, ResumeRequest, Stage, StageContext,
    StartRequest, StatusReport, Workflow, WorkflowGraph, END,
};
use hitl_llm::Request;
use hitl_types::{
    fields, ApprovalStatus, FieldKind, HitlError, Result, StageOutput, StateSchema, StateUpdate,
    WorkflowState,
};

use crate::common::{self, FINALIZE, HUMAN_REVIEW};
use crate::plan::parse_plan;

pub const NAME: &str = "sections";

pub const RESEARCH_RESULTS: &str = "research_results";
pub const PLAN: &str = "plan";
pub const CURRENT_SECTION_INDEX: &str = "current_section_index";
pub const GENERATED_SECTIONS: &str = "generated_sections";
pub const EDITED_CONTENT: &str = "edited_content";

const RESEARCH: &str = "research";
const PLAN_STAGE: &str = "plan";
const GENERATE_SECTION: &str = "generate_section";
const ADVANCE_SECTION: &str = "advance_section";

const RESEARCH_PROMPT: &str = "You are a research assistant. Gather the key facts, themes and \
open questions relevant to the user's topic.";

const PLAN_PROMPT: &str = "You plan documents. Reply with a JSON array of section titles and \
nothing else, for example [\"Introduction\", \"Background\", \"Conclusion\"].";

const SECTION_PROMPT: &str = "You are a skilled writer. Write only the requested section, in \
markdown, without repeating its title.";

/// Index of the section under work, clamped to the plan.
fn section_index(state: &WorkflowState, plan_len: usize) -> usize {
    state
        .get_count(CURRENT_SECTION_INDEX)
        .min(plan_len.saturating_sub(1))
}

struct Research;

#[async_trait]
impl Stage for Research {
    async fn run(&self, state: &WorkflowState, ctx: &StageContext) -> Result<StateUpdate> {
        let query = state.get_string(fields::USER_QUERY, "");
        let notes = ctx
            .generate_text(RESEARCH_PROMPT, &format!("Topic: {query}"))
            .await?;
        Ok(StateUpdate::new().text(RESEARCH_RESULTS, notes))
    }
}

struct Plan;

#[async_trait]
impl Stage for Plan {
    async fn run(&self, state: &WorkflowState, ctx: &StageContext) -> Result<StateUpdate> {
        let query = state.get_string(fields::USER_QUERY, "");
        let research = state.get_string(RESEARCH_RESULTS, "");
        let reply = ctx
            .complete(&Request::prompt(
                PLAN_PROMPT,
                format!("Topic: {query}\n\nResearch notes:\n{research}"),
            ))
            .await?;
        let plan = parse_plan(&reply);
        tracing::debug!(sections = plan.len(), "Section plan ready");

        Ok(StateUpdate::new()
            .text_list(PLAN, plan)
            .count(CURRENT_SECTION_INDEX, 0)
            .text_list(GENERATED_SECTIONS, Vec::<String>::new()))
    }
}

struct GenerateSection;

#[async_trait]
impl Stage for GenerateSection {
    async fn run(&self, state: &WorkflowState, ctx: &StageContext) -> Result<StateUpdate> {
        let plan = state.get_text_list(PLAN);
        if plan.is_empty() {
            return Err(HitlError::stage(ctx.stage(), "no section plan"));
        }
        let index = section_index(state, plan.len());
        let title = &plan[index];
        let mut sections = state.get_text_list(GENERATED_SECTIONS);
        let revising = sections.len() > index;

        let prompt = if revising {
            let basis = state
                .get_nonempty(EDITED_CONTENT)
                .unwrap_or(sections[index].as_str());
            let guidance =
                common::feedback(state).unwrap_or("Improve the section's clarity and depth.");
            format!(
                "Revise the section \"{title}\".\n\nCurrent version:\n{basis}\n\n\
                 Reviewer feedback: {guidance}"
            )
        } else {
            let query = state.get_string(fields::USER_QUERY, "");
            let research = state.get_string(RESEARCH_RESULTS, "");
            let outline = plan.join(", ");
            format!(
                "Document topic: {query}\nOutline: {outline}\n\nResearch notes:\n{research}\n\n\
                 Write section {} of {}: \"{title}\".",
                index + 1,
                plan.len()
            )
        };

        let text = ctx.generate_text(SECTION_PROMPT, &prompt).await?;
        // Sections past the index are dropped when a plan edit made them stale.
        sections.truncate(index);
        sections.push(text);

        let mut update = StateUpdate::new()
            .text_list(GENERATED_SECTIONS, sections)
            .count(CURRENT_SECTION_INDEX, index)
            .clear(EDITED_CONTENT);
        if revising {
            update = update.count(fields::REVISION_COUNT, common::next_revision(state));
        }
        Ok(update)
    }
}

struct AdvanceSection;

#[async_trait]
impl Stage for AdvanceSection {
    async fn run(&self, state: &WorkflowState, _ctx: &StageContext) -> Result<StateUpdate> {
        Ok(StateUpdate::new()
            .count(CURRENT_SECTION_INDEX, state.get_count(CURRENT_SECTION_INDEX) + 1)
            .approval(ApprovalStatus::Pending)
            .clear(fields::HUMAN_FEEDBACK)
            .clear(EDITED_CONTENT))
    }
}

struct Finalize;

#[async_trait]
impl Stage for Finalize {
    async fn run(&self, state: &WorkflowState, ctx: &StageContext) -> Result<StateUpdate> {
        let document = compose(&state.get_text_list(PLAN), &state.get_text_list(GENERATED_SECTIONS));
        ctx.emit(StageOutput::text(document.as_str())).await;
        Ok(StateUpdate::new().text(fields::FINAL_OUTPUT, document))
    }
}

/// Sections under `## title` headings, in plan order.
pub fn compose(plan: &[String], sections: &[String]) -> String {
    plan.iter()
        .zip(sections)
        .map(|(title, body)| format!("## {title}\n\n{}", body.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn route(state: &WorkflowState) -> String {
    if !state.approval_status().is_approved() {
        return GENERATE_SECTION.to_string();
    }
    let plan_len = state.get_text_list(PLAN).len();
    if state.get_count(CURRENT_SECTION_INDEX) + 1 < plan_len {
        ADVANCE_SECTION.to_string()
    } else {
        FINALIZE.to_string()
    }
}

pub struct SectionsWorkflow {
    graph: WorkflowGraph,
}

impl SectionsWorkflow {
    pub fn new() -> Result<Self> {
        let schema = StateSchema::with_review_fields()
            .field(RESEARCH_RESULTS, FieldKind::Text)
            .field(PLAN, FieldKind::TextList)
            .field(CURRENT_SECTION_INDEX, FieldKind::Integer)
            .field(GENERATED_SECTIONS, FieldKind::TextList)
            .field(EDITED_CONTENT, FieldKind::Text);

        let graph = GraphBuilder::new(NAME)
            .schema(schema)
            .stage(RESEARCH, Research)
            .stage(PLAN_STAGE, Plan)
            .stage(GENERATE_SECTION, GenerateSection)
            .stage(HUMAN_REVIEW, PassThrough)
            .stage(ADVANCE_SECTION, AdvanceSection)
            .stage(FINALIZE, Finalize)
            .edge(RESEARCH, PLAN_STAGE)
            .edge(PLAN_STAGE, GENERATE_SECTION)
            .edge(GENERATE_SECTION, HUMAN_REVIEW)
            .branch(
                HUMAN_REVIEW,
                route,
                [ADVANCE_SECTION, FINALIZE, GENERATE_SECTION],
            )
            .edge(ADVANCE_SECTION, GENERATE_SECTION)
            .edge(FINALIZE, END)
            .interrupt_before(HUMAN_REVIEW)
            .stream_output([RESEARCH, GENERATE_SECTION, FINALIZE])
            .build()?;
        Ok(Self { graph })
    }
}

impl Workflow for SectionsWorkflow {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Research a topic, plan sections, write and review them one at a time"
    }

    fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    fn initial_state(&self, request: &StartRequest) -> Result<StateUpdate> {
        let query = common::require_query(&request.query)?;
        Ok(common::seed_state(query)
            .count(CURRENT_SECTION_INDEX, 0)
            .text_list(GENERATED_SECTIONS, Vec::<String>::new()))
    }

    /// Besides the decision, a resume may replace the plan or hand in an
    /// edited version of the current section. An approved edit is the final
    /// text of that section; otherwise it is the basis for the revision.
    fn resume_update(&self, request: &ResumeRequest, state: &WorkflowState) -> Result<StateUpdate> {
        let mut update = review_update(request);
        let mut sections = state.get_text_list(GENERATED_SECTIONS);
        let mut index = state.get_count(CURRENT_SECTION_INDEX);
        let mut sections_changed = false;

        if let Some(plan) = &request.updated_plan {
            let plan: Vec<String> = plan
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
            if plan.is_empty() {
                return Err(HitlError::InvalidUpdate {
                    field: PLAN.into(),
                    message: "updated plan must list at least one section".into(),
                });
            }
            index = section_index(state, plan.len());
            sections.truncate(plan.len());
            sections_changed = true;
            update = update
                .count(CURRENT_SECTION_INDEX, index)
                .text_list(PLAN, plan);
        }

        let edited = request
            .edited_content
            .as_deref()
            .filter(|e| !e.trim().is_empty());
        if let Some(edited) = edited {
            if request.decision.is_approved() {
                match sections.len().cmp(&index) {
                    std::cmp::Ordering::Greater => sections[index] = edited.to_string(),
                    std::cmp::Ordering::Equal => sections.push(edited.to_string()),
                    std::cmp::Ordering::Less => {
                        return Err(HitlError::InvalidUpdate {
                            field: EDITED_CONTENT.into(),
                            message: format!("no section {} to replace", index + 1),
                        })
                    }
                }
                sections_changed = true;
            } else {
                update = update.text(EDITED_CONTENT, edited);
            }
        }

        if sections_changed {
            update = update.text_list(GENERATED_SECTIONS, sections);
        }
        Ok(update)
    }

    fn status(&self, paused_at: Option<&str>, state: &WorkflowState) -> StatusReport {
        match paused_at {
            None => StatusReport::finished()
                .with_field(state, fields::FINAL_OUTPUT)
                .with_field(state, PLAN)
                .with_field(state, GENERATED_SECTIONS),
            Some(_) => {
                let sections = state.get_text_list(GENERATED_SECTIONS);
                let index = state.get_count(CURRENT_SECTION_INDEX);
                let chunk = sections.get(index).cloned().unwrap_or_default();
                StatusReport::new(status::USER_FEEDBACK)
                    .with_field(state, PLAN)
                    .with("current_index", index)
                    .with_field(state, GENERATED_SECTIONS)
                    .with("current_chunk", chunk)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(plan: &[&str], index: usize, sections: &[&str]) -> WorkflowState {
        WorkflowState::from_update(
            StateUpdate::new()
                .text_list(PLAN, plan.iter().copied())
                .count(CURRENT_SECTION_INDEX, index)
                .text_list(GENERATED_SECTIONS, sections.iter().copied()),
        )
    }

    #[test]
    fn route_advances_then_finalizes() {
        let mut s = state(&["A", "B"], 0, &["a"]);
        assert_eq!(route(&s), GENERATE_SECTION);

        s.apply(StateUpdate::new().approval(ApprovalStatus::Approved));
        assert_eq!(route(&s), ADVANCE_SECTION);

        s.apply(StateUpdate::new().count(CURRENT_SECTION_INDEX, 1));
        assert_eq!(route(&s), FINALIZE);
    }

    #[test]
    fn compose_uses_headings_in_plan_order() {
        let doc = compose(
            &["Intro".to_string(), "End".to_string()],
            &["Hello.\n".to_string(), "Bye.".to_string()],
        );
        assert_eq!(doc, "## Intro\n\nHello.\n\n## End\n\nBye.");
    }

    #[test]
    fn updated_plan_clamps_index_and_truncates() {
        let wf = SectionsWorkflow::new().unwrap();
        let s = state(&["A", "B", "C"], 2, &["a", "b", "c"]);
        let mut request = ResumeRequest::new("t", ApprovalStatus::Feedback);
        request.updated_plan = Some(vec!["A".into(), " B2 ".into()]);

        let update = wf.resume_update(&request, &s).unwrap();
        let mut merged = s.clone();
        merged.apply(update);
        assert_eq!(merged.get_text_list(PLAN), vec!["A", "B2"]);
        assert_eq!(merged.get_count(CURRENT_SECTION_INDEX), 1);
        assert_eq!(merged.get_text_list(GENERATED_SECTIONS), vec!["a", "b"]);
    }

    #[test]
    fn empty_updated_plan_rejected() {
        let wf = SectionsWorkflow::new().unwrap();
        let mut request = ResumeRequest::new("t", ApprovalStatus::Approved);
        request.updated_plan = Some(vec!["  ".into()]);
        let err = wf.resume_update(&request, &state(&["A"], 0, &["a"])).unwrap_err();
        assert!(matches!(err, HitlError::InvalidUpdate { .. }));
    }

    #[test]
    fn paused_status_shows_current_chunk() {
        let wf = SectionsWorkflow::new().unwrap();
        let report = wf.status(Some(HUMAN_REVIEW), &state(&["A", "B"], 1, &["a", "b"]));
        assert_eq!(report.status, "user_feedback");
        assert_eq!(report.payload["current_index"], 1);
        assert_eq!(report.payload["current_chunk"], "b");
        assert_eq!(report.payload["plan"], serde_json::json!(["A", "B"]));
    }
}
