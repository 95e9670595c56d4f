//! Workflow graph validation: lint rules and diagnostics.
//!
//! Every graph is checked when it is built. Call [`validate`] for advisory
//! diagnostics or [`validate_or_raise`] to fail on any `Error`-severity issue.

use std::collections::{HashSet, VecDeque};

use crate::graph::{Transition, WorkflowGraph, END};

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub stage_id: Option<String>,
    pub edge: Option<(String, String)>,
    pub fix: Option<String>,
}

impl Diagnostic {
    pub fn error(rule: &str, message: impl Into<String>, stage_id: Option<String>) -> Self {
        Self {
            rule: rule.into(),
            severity: Severity::Error,
            message: message.into(),
            stage_id,
            edge: None,
            fix: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, graph: &WorkflowGraph) -> Vec<Diagnostic>;
}

fn exists(graph: &WorkflowGraph, id: &str) -> bool {
    id == END || graph.stage(id).is_some()
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct StartStageRule;
impl LintRule for StartStageRule {
    fn name(&self) -> &str { "start_stage" }
    fn apply(&self, graph: &WorkflowGraph) -> Vec<Diagnostic> {
        if graph.stage(graph.start()).is_some() {
            return vec![];
        }
        vec![Diagnostic {
            rule: self.name().into(),
            severity: Severity::Error,
            message: format!("Workflow '{}' has no start stage '{}'", graph.name, graph.start()),
            stage_id: None,
            edge: None,
            fix: Some("Add a stage before declaring transitions, or name an existing start".into()),
        }]
    }
}

struct ReservedNameRule;
impl LintRule for ReservedNameRule {
    fn name(&self) -> &str { "reserved_name" }
    fn apply(&self, graph: &WorkflowGraph) -> Vec<Diagnostic> {
        if graph.stage(END).is_none() {
            return vec![];
        }
        vec![Diagnostic::error(
            self.name(),
            format!("'{END}' is reserved for the end of the workflow"),
            Some(END.into()),
        )]
    }
}

struct TransitionTargetsExistRule;
impl LintRule for TransitionTargetsExistRule {
    fn name(&self) -> &str { "transition_target_exists" }
    fn apply(&self, graph: &WorkflowGraph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for from in graph.stage_ids() {
            if let Some(transition) = graph.transition(from) {
                for to in transition.targets() {
                    if !exists(graph, to) {
                        diags.push(Diagnostic {
                            rule: self.name().into(),
                            severity: Severity::Error,
                            message: format!("Transition {from} -> {to} references non-existent stage '{to}'"),
                            stage_id: None,
                            edge: Some((from.clone(), to.to_string())),
                            fix: Some(format!("Add stage '{to}' or fix the target")),
                        });
                    }
                }
            }
        }
        diags
    }
}

struct InterruptPointsExistRule;
impl LintRule for InterruptPointsExistRule {
    fn name(&self) -> &str { "interrupt_point_exists" }
    fn apply(&self, graph: &WorkflowGraph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for id in graph.interrupt_points() {
            if graph.stage(id).is_none() {
                diags.push(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Error,
                    message: format!("Interrupt point '{id}' is not a declared stage"),
                    stage_id: Some(id.clone()),
                    edge: None,
                    fix: Some(format!("Declare stage '{id}' or remove the interrupt")),
                });
            }
        }
        diags
    }
}

struct OutgoingTransitionRule;
impl LintRule for OutgoingTransitionRule {
    fn name(&self) -> &str { "outgoing_transition" }
    fn apply(&self, graph: &WorkflowGraph) -> Vec<Diagnostic> {
        graph
            .stage_ids()
            .iter()
            .filter(|id| graph.transition(id).is_none())
            .map(|id| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!("Stage '{id}' has no outgoing transition"),
                stage_id: Some(id.clone()),
                edge: None,
                fix: Some(format!("Add an edge from '{id}' (use END to finish)")),
            })
            .collect()
    }
}

struct BranchTargetsRule;
impl LintRule for BranchTargetsRule {
    fn name(&self) -> &str { "branch_targets" }
    fn apply(&self, graph: &WorkflowGraph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for id in graph.stage_ids() {
            let Some(Transition::Branch(branch)) = graph.transition(id) else {
                continue;
            };
            if branch.targets.is_empty() {
                diags.push(Diagnostic::error(
                    self.name(),
                    format!("Branch at '{id}' declares no targets"),
                    Some(id.clone()),
                ));
                continue;
            }
            let unique: HashSet<&String> = branch.targets.iter().collect();
            if unique.len() != branch.targets.len() {
                diags.push(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Warning,
                    message: format!("Branch at '{id}' lists a target more than once"),
                    stage_id: Some(id.clone()),
                    edge: None,
                    fix: None,
                });
            }
            if unique.len() == 1 {
                diags.push(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Info,
                    message: format!("Branch at '{id}' has a single target; a plain edge would do"),
                    stage_id: Some(id.clone()),
                    edge: None,
                    fix: None,
                });
            }
        }
        diags
    }
}

/// BFS from the start stage over every declared transition target.
fn reachable(graph: &WorkflowGraph) -> HashSet<String> {
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    visited.insert(graph.start().to_string());
    queue.push_back(graph.start().to_string());

    while let Some(current) = queue.pop_front() {
        for next in graph.successors(&current) {
            if visited.insert(next.to_string()) {
                queue.push_back(next.to_string());
            }
        }
    }
    visited
}

struct ReachabilityRule;
impl LintRule for ReachabilityRule {
    fn name(&self) -> &str { "reachability" }
    fn apply(&self, graph: &WorkflowGraph) -> Vec<Diagnostic> {
        if graph.stage(graph.start()).is_none() {
            return vec![]; // StartStageRule will catch this
        }
        let visited = reachable(graph);
        graph
            .stage_ids()
            .iter()
            .filter(|id| !visited.contains(*id))
            .map(|id| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!("Stage '{id}' is not reachable from the start stage"),
                stage_id: Some(id.clone()),
                edge: None,
                fix: Some(format!("Add a transition leading to '{id}' or remove it")),
            })
            .collect()
    }
}

struct TerminalReachableRule;
impl LintRule for TerminalReachableRule {
    fn name(&self) -> &str { "terminal_reachable" }
    fn apply(&self, graph: &WorkflowGraph) -> Vec<Diagnostic> {
        if graph.stage(graph.start()).is_none() || reachable(graph).contains(END) {
            return vec![];
        }
        vec![Diagnostic {
            rule: self.name().into(),
            severity: Severity::Error,
            message: format!("Workflow '{}' can never reach END", graph.name),
            stage_id: None,
            edge: None,
            fix: Some("Route at least one stage to END".into()),
        }]
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate(graph: &WorkflowGraph) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(StartStageRule),
        Box::new(ReservedNameRule),
        Box::new(TransitionTargetsExistRule),
        Box::new(InterruptPointsExistRule),
        Box::new(OutgoingTransitionRule),
        Box::new(BranchTargetsRule),
        Box::new(ReachabilityRule),
        Box::new(TerminalReachableRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(graph));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(graph: &WorkflowGraph) -> hitl_types::Result<Vec<Diagnostic>> {
    let diagnostics = validate(graph);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    if !errors.is_empty() {
        let messages: Vec<_> = errors.iter().map(|d| d.message.clone()).collect();
        return Err(hitl_types::HitlError::GraphValidation(messages.join("; ")));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
