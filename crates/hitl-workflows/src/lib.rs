//! The workflow variants served by the HITL engine.
//!
//! - `review`: draft, review, revise until approved
//! - `sections`: research, plan, then write and review one section at a time
//! - `analysis`: explore a data file, run generated code, review plan and results
//! - `editor`: sentence-level edits and comments folded into each revision

pub mod analysis;
pub mod code;
pub mod common;
pub mod editor;
pub mod plan;
pub mod review;
pub mod sections;
pub mod sentences;
pub mod tool;

use std::sync::Arc;

use hitl_engine::WorkflowCatalog;
use hitl_types::Result;

pub use analysis::AnalysisWorkflow;
pub use editor::{EditorWorkflow, SentenceEntry, SentenceView};
pub use review::ReviewWorkflow;
pub use sections::SectionsWorkflow;
pub use tool::{
    AnalysisConfig, AnalysisTool, DataProfile, ExecutionReport, ProcessAnalysisTool,
    StaticAnalysisTool,
};

/// All four variants, with `tool` backing the analysis workflow.
pub fn default_catalog(tool: Arc<dyn AnalysisTool>) -> Result<WorkflowCatalog> {
    Ok(WorkflowCatalog::new()
        .with(ReviewWorkflow::new()?)
        .with(SectionsWorkflow::new()?)
        .with(AnalysisWorkflow::new(tool)?)
        .with(EditorWorkflow::new()?))
}
