//! Data analysis with two review points: the plan is reviewed before any
//! code is written, and the results are reviewed before the report.
//!
//! ```text
//! explore -> plan_analysis -> [interrupt] code_generation -> execute_code
//!   -> visualize -> [interrupt] human_review -> approved? finalize : code_generation
//! ```
//!
//! A revision re-enters `code_generation`, so it pauses for plan review again.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use hitl_engine::{
    review_update, status, GraphBuilder, PassThrough, ResumeRequest, Stage, StageContext,
    StartRequest, StatusReport, Workflow, WorkflowGraph, END,
};
use hitl_types::{
    fields, ApprovalStatus, FieldKind, HitlError, Result, StageOutput, StateSchema, StateUpdate,
    WorkflowState,
};

use crate::code::extract_code;
use crate::common::{self, FINALIZE, HUMAN_REVIEW};
use crate::tool::{AnalysisTool, ExecutionReport};

pub const NAME: &str = "analysis";

pub const FILE_PATH: &str = "file_path";
pub const FILE_NAME: &str = "file_name";
pub const DATA_SUMMARY: &str = "data_summary";
pub const DATA_PREVIEW: &str = "data_preview";
pub const ANALYSIS_PLAN: &str = "analysis_plan";
pub const GENERATED_CODE: &str = "generated_code";
pub const EXECUTION_RESULTS: &str = "execution_results";
pub const VISUALIZATION_CODE: &str = "visualization_code";
pub const VISUALIZATION_PATHS: &str = "visualization_paths";
pub const INTERRUPT_REQUESTED: &str = "interrupt_requested";
pub const CURRENT_STAGE: &str = "current_stage";

const EXPLORE: &str = "explore";
const PLAN_ANALYSIS: &str = "plan_analysis";
const CODE_GENERATION: &str = "code_generation";
const EXECUTE_CODE: &str = "execute_code";
const VISUALIZE: &str = "visualize";

pub const NO_FILE_SUMMARY: &str = "No file provided. Please upload a CSV file.";

const PLAN_PROMPT: &str = "You are a data analyst. Given a dataset summary and the user's \
question, describe step by step how you will analyse the data.";

const CODE_PROMPT: &str = "You write Python analysis code. The data is already loaded as the \
pandas DataFrame `df`. Print every result you want reported. Reply with one ```python block.";

const VIS_PROMPT: &str = "You write Python visualization code with matplotlib. The data is \
loaded as `df`. Save each figure with save_visualization(fig, \"name.png\"). Reply with one \
```python block.";

const REPORT_PROMPT: &str = "You are a data analyst writing the final report. Summarise the \
findings for a non-technical reader, citing the figures produced.";

fn file_of(state: &WorkflowState) -> Option<PathBuf> {
    state.get_nonempty(FILE_PATH).map(PathBuf::from)
}

/// Text recorded for a run, whatever its outcome.
fn describe_run(result: &Result<ExecutionReport>) -> String {
    match result {
        Ok(report) if report.success => report.output.clone(),
        Ok(report) => format!("Execution failed:\n{}", report.output),
        Err(e) => format!("Error executing code: {e}"),
    }
}

struct Explore {
    tool: Arc<dyn AnalysisTool>,
}

#[async_trait]
impl Stage for Explore {
    async fn run(&self, state: &WorkflowState, ctx: &StageContext) -> Result<StateUpdate> {
        let (summary, preview) = match file_of(state) {
            None => (NO_FILE_SUMMARY.to_string(), String::new()),
            Some(file) => match self.tool.describe(&file).await {
                Ok(profile) => (profile.summary, profile.preview),
                Err(e) => {
                    tracing::warn!(file = %file.display(), error = %e, "Data exploration failed");
                    (format!("Error exploring data: {e}"), String::new())
                }
            },
        };
        ctx.emit(StageOutput::text(summary.as_str())).await;
        Ok(StateUpdate::new()
            .text(DATA_SUMMARY, summary)
            .text(DATA_PREVIEW, preview)
            .text(CURRENT_STAGE, EXPLORE))
    }
}

struct PlanAnalysis;

#[async_trait]
impl Stage for PlanAnalysis {
    async fn run(&self, state: &WorkflowState, ctx: &StageContext) -> Result<StateUpdate> {
        let prompt = format!(
            "Question: {}\n\nData summary:\n{}\n\nPreview:\n{}",
            state.get_string(fields::USER_QUERY, ""),
            state.get_string(DATA_SUMMARY, ""),
            state.get_string(DATA_PREVIEW, ""),
        );
        let plan = ctx.generate_text(PLAN_PROMPT, &prompt).await?;
        Ok(StateUpdate::new()
            .text(ANALYSIS_PLAN, plan)
            .text(CURRENT_STAGE, "planning"))
    }
}

struct CodeGeneration;

#[async_trait]
impl Stage for CodeGeneration {
    async fn run(&self, state: &WorkflowState, ctx: &StageContext) -> Result<StateUpdate> {
        let mut prompt = format!(
            "Question: {}\n\nData summary:\n{}\n\nAnalysis plan:\n{}",
            state.get_string(fields::USER_QUERY, ""),
            state.get_string(DATA_SUMMARY, ""),
            state.get_string(ANALYSIS_PLAN, ""),
        );
        let previous = state.get_nonempty(GENERATED_CODE);
        if let Some(code) = previous {
            prompt.push_str(&format!(
                "\n\nPrevious code:\n```python\n{code}\n```\n\nPrevious results:\n{}",
                state.get_string(EXECUTION_RESULTS, "")
            ));
        }
        if let Some(feedback) = common::feedback(state) {
            prompt.push_str(&format!("\n\nReviewer feedback: {feedback}"));
        }

        let reply = ctx.generate_text(CODE_PROMPT, &prompt).await?;
        let mut update = StateUpdate::new()
            .text(GENERATED_CODE, extract_code(&reply))
            .flag(INTERRUPT_REQUESTED, false)
            .text(CURRENT_STAGE, CODE_GENERATION);
        if previous.is_some() {
            update = update.count(fields::REVISION_COUNT, common::next_revision(state));
        }
        Ok(update)
    }
}

struct ExecuteCode {
    tool: Arc<dyn AnalysisTool>,
}

#[async_trait]
impl Stage for ExecuteCode {
    async fn run(&self, state: &WorkflowState, ctx: &StageContext) -> Result<StateUpdate> {
        let code = state.get_string(GENERATED_CODE, "");
        let file = file_of(state);
        let result = self.tool.execute(&code, file.as_deref()).await;
        let text = describe_run(&result);

        let images = match &result {
            Ok(report) => {
                let output = if report.success {
                    StageOutput::text(text.as_str())
                } else {
                    StageOutput::error(text.as_str())
                };
                ctx.emit(output).await;
                report.images.clone()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Analysis code could not run");
                ctx.emit(StageOutput::error(text.as_str())).await;
                Vec::new()
            }
        };

        Ok(StateUpdate::new()
            .text(EXECUTION_RESULTS, text)
            .text_list(VISUALIZATION_PATHS, images)
            .text(CURRENT_STAGE, EXECUTE_CODE))
    }
}

struct Visualize {
    tool: Arc<dyn AnalysisTool>,
}

#[async_trait]
impl Stage for Visualize {
    async fn run(&self, state: &WorkflowState, ctx: &StageContext) -> Result<StateUpdate> {
        let prompt = format!(
            "Question: {}\n\nAnalysis code:\n```python\n{}\n```\n\nResults:\n{}",
            state.get_string(fields::USER_QUERY, ""),
            state.get_string(GENERATED_CODE, ""),
            state.get_string(EXECUTION_RESULTS, ""),
        );
        let reply = ctx.generate_text(VIS_PROMPT, &prompt).await?;
        let code = extract_code(&reply);

        let mut paths = state.get_text_list(VISUALIZATION_PATHS);
        let file = file_of(state);
        let result = self.tool.execute(&code, file.as_deref()).await;
        match &result {
            Ok(report) if report.success => {
                for image in &report.images {
                    if !paths.contains(image) {
                        paths.push(image.clone());
                    }
                }
            }
            _ => {
                ctx.emit(StageOutput::error(describe_run(&result))).await;
            }
        }

        Ok(StateUpdate::new()
            .text(VISUALIZATION_CODE, code)
            .text_list(VISUALIZATION_PATHS, paths)
            .text(CURRENT_STAGE, VISUALIZE))
    }
}

struct Finalize;

#[async_trait]
impl Stage for Finalize {
    async fn run(&self, state: &WorkflowState, ctx: &StageContext) -> Result<StateUpdate> {
        let figures = state.get_text_list(VISUALIZATION_PATHS).join("\n");
        let prompt = format!(
            "Question: {}\n\nAnalysis plan:\n{}\n\nResults:\n{}\n\nFigures:\n{}",
            state.get_string(fields::USER_QUERY, ""),
            state.get_string(ANALYSIS_PLAN, ""),
            state.get_string(EXECUTION_RESULTS, ""),
            if figures.is_empty() { "none" } else { figures.as_str() },
        );
        let report = ctx.generate_text(REPORT_PROMPT, &prompt).await?;
        Ok(StateUpdate::new()
            .text(fields::FINAL_OUTPUT, report)
            .text(CURRENT_STAGE, "complete"))
    }
}

fn route(state: &WorkflowState) -> String {
    common::approval_route(state, FINALIZE, CODE_GENERATION)
}

pub struct AnalysisWorkflow {
    graph: WorkflowGraph,
}

impl AnalysisWorkflow {
    pub fn new(tool: Arc<dyn AnalysisTool>) -> Result<Self> {
        let schema = StateSchema::with_review_fields()
            .field(FILE_PATH, FieldKind::Text)
            .field(FILE_NAME, FieldKind::Text)
            .field(DATA_SUMMARY, FieldKind::Text)
            .field(DATA_PREVIEW, FieldKind::Text)
            .field(ANALYSIS_PLAN, FieldKind::Text)
            .field(GENERATED_CODE, FieldKind::Text)
            .field(EXECUTION_RESULTS, FieldKind::Text)
            .field(VISUALIZATION_CODE, FieldKind::Text)
            .field(VISUALIZATION_PATHS, FieldKind::TextList)
            .field(INTERRUPT_REQUESTED, FieldKind::Boolean)
            .field(CURRENT_STAGE, FieldKind::Text);

        let graph = GraphBuilder::new(NAME)
            .schema(schema)
            .stage(EXPLORE, Explore { tool: tool.clone() })
            .stage(PLAN_ANALYSIS, PlanAnalysis)
            .stage(CODE_GENERATION, CodeGeneration)
            .stage(EXECUTE_CODE, ExecuteCode { tool: tool.clone() })
            .stage(VISUALIZE, Visualize { tool })
            .stage(HUMAN_REVIEW, PassThrough)
            .stage(FINALIZE, Finalize)
            .edge(EXPLORE, PLAN_ANALYSIS)
            .edge(PLAN_ANALYSIS, CODE_GENERATION)
            .edge(CODE_GENERATION, EXECUTE_CODE)
            .edge(EXECUTE_CODE, VISUALIZE)
            .edge(VISUALIZE, HUMAN_REVIEW)
            .branch(HUMAN_REVIEW, route, [FINALIZE, CODE_GENERATION])
            .edge(FINALIZE, END)
            .interrupt_before(CODE_GENERATION)
            .interrupt_before(HUMAN_REVIEW)
            .stream_output([
                EXPLORE,
                PLAN_ANALYSIS,
                CODE_GENERATION,
                EXECUTE_CODE,
                VISUALIZE,
                FINALIZE,
            ])
            .build()?;
        Ok(Self { graph })
    }
}

impl Workflow for AnalysisWorkflow {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Explore a data file, review the plan, run generated code, review the results"
    }

    fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    fn initial_state(&self, request: &StartRequest) -> Result<StateUpdate> {
        let query = common::require_query(&request.query)?;
        let mut update = common::seed_state(query)
            .flag(INTERRUPT_REQUESTED, false)
            .text(CURRENT_STAGE, "start")
            .text_list(VISUALIZATION_PATHS, Vec::<String>::new());

        if let Some(file) = request.file.as_deref().map(str::trim).filter(|f| !f.is_empty()) {
            let path = Path::new(file);
            if !path.is_file() {
                return Err(HitlError::InvalidUpdate {
                    field: FILE_PATH.into(),
                    message: format!("no such file: {file}"),
                });
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.to_string());
            update = update.text(FILE_PATH, file).text(FILE_NAME, name);
        }
        Ok(update)
    }

    /// An interrupt message recorded while paused survives a resume that
    /// carries no comment of its own.
    fn resume_update(&self, request: &ResumeRequest, state: &WorkflowState) -> Result<StateUpdate> {
        if state.get_bool(INTERRUPT_REQUESTED) && request.comment_text().is_none() {
            return Ok(StateUpdate::new().approval(request.decision));
        }
        Ok(review_update(request))
    }

    fn status(&self, paused_at: Option<&str>, state: &WorkflowState) -> StatusReport {
        match paused_at {
            None => StatusReport::finished()
                .with_field(state, fields::FINAL_OUTPUT)
                .with("code", state.get_string(GENERATED_CODE, ""))
                .with_field(state, VISUALIZATION_PATHS),
            Some(CODE_GENERATION) => StatusReport::new(status::CODE_REVIEW)
                .with_field(state, ANALYSIS_PLAN)
                .with_field(state, CURRENT_STAGE),
            Some(_) => StatusReport::new(status::USER_FEEDBACK)
                .with("code", state.get_string(GENERATED_CODE, ""))
                .with_field(state, EXECUTION_RESULTS)
                .with_field(state, VISUALIZATION_PATHS),
        }
    }

    fn supports_interrupt(&self) -> bool {
        true
    }

    fn interrupt_update(&self, message: &str) -> Result<StateUpdate> {
        let message = message.trim();
        let update = StateUpdate::new()
            .flag(INTERRUPT_REQUESTED, true)
            .approval(ApprovalStatus::Feedback);
        Ok(if message.is_empty() {
            update
        } else {
            update.text(fields::HUMAN_FEEDBACK, message)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::StaticAnalysisTool;

    fn workflow() -> AnalysisWorkflow {
        AnalysisWorkflow::new(Arc::new(StaticAnalysisTool::new())).unwrap()
    }

    #[test]
    fn two_interrupt_points() {
        let wf = workflow();
        assert_eq!(wf.graph().interrupt_points(), [CODE_GENERATION, HUMAN_REVIEW]);
        assert!(wf.supports_interrupt());
    }

    #[test]
    fn missing_file_rejected_at_start() {
        let request = StartRequest {
            workflow: NAME.into(),
            query: "Average price?".into(),
            file: Some("/no/such/data.csv".into()),
        };
        let err = workflow().initial_state(&request).unwrap_err();
        assert!(matches!(err, HitlError::InvalidUpdate { ref field, .. } if field == FILE_PATH));
    }

    #[test]
    fn existing_file_recorded_with_name() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("prices.csv");
        std::fs::write(&file, "year,price\n2020,10\n").unwrap();
        let request = StartRequest {
            workflow: NAME.into(),
            query: "Average price?".into(),
            file: Some(file.display().to_string()),
        };
        let state = WorkflowState::from_update(workflow().initial_state(&request).unwrap());
        assert_eq!(state.get_str(FILE_NAME), Some("prices.csv"));
    }

    #[test]
    fn status_per_pause_point() {
        let wf = workflow();
        let state = WorkflowState::from_update(
            StateUpdate::new()
                .text(ANALYSIS_PLAN, "Group by year.")
                .text(GENERATED_CODE, "print(df.mean())")
                .text(CURRENT_STAGE, "planning"),
        );
        let review = wf.status(Some(CODE_GENERATION), &state);
        assert_eq!(review.status, "code_review");
        assert_eq!(review.payload["analysis_plan"], "Group by year.");

        let feedback = wf.status(Some(HUMAN_REVIEW), &state);
        assert_eq!(feedback.status, "user_feedback");
        assert_eq!(feedback.payload["code"], "print(df.mean())");
    }

    #[test]
    fn interrupt_feedback_survives_bare_resume() {
        let wf = workflow();
        let mut state = WorkflowState::new();
        state.apply(wf.interrupt_update("Use median instead").unwrap());
        assert!(state.get_bool(INTERRUPT_REQUESTED));

        let request = ResumeRequest::new("t", ApprovalStatus::Feedback);
        state.apply(wf.resume_update(&request, &state).unwrap());
        assert_eq!(state.get_str(fields::HUMAN_FEEDBACK), Some("Use median instead"));
    }

    #[test]
    fn run_text_per_outcome() {
        assert_eq!(describe_run(&Ok(ExecutionReport::ok("42"))), "42");
        assert!(describe_run(&Ok(ExecutionReport::failed("Traceback"))).starts_with("Execution failed"));
        assert!(describe_run(&Err(HitlError::Other("gone".into()))).contains("gone"));
    }
}
