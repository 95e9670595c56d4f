//! Resumable workflow engine.
//!
//! This crate implements the core HITL runner: graph composition and
//! construction-time validation, stage and router dispatch, interrupt points,
//! per-thread checkpoints, the pending-intent registry, and the event stream
//! adapter that turns a run into handshake/token/status/error events.

pub mod checkpoint;
pub mod engine;
pub mod events;
pub mod graph;
pub mod service;
pub mod session;
pub mod stage;
pub mod validation;
pub mod workflow;

pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use engine::{Disposition, EngineConfig, Executor, RunInput};
pub use events::{status, EventSink, OutputKind, StageEvent, StreamMode, WireEvent};
pub use graph::{Branch, GraphBuilder, StageNode, Transition, WorkflowGraph, END};
pub use service::{Ack, ThreadSnapshot, WorkflowService};
pub use session::{IntentRegistry, MemoryIntentRegistry, PendingIntent, ResumeIntent, StartIntent};
pub use stage::{FnStage, PassThrough, Router, Stage, StageContext};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
pub use workflow::{
    review_update, ResumeRequest, StartRequest, StatusReport, Workflow, WorkflowCatalog,
    WorkflowInfo,
};
