//! Static workflow composition: stages, transitions, interrupt points.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;

use hitl_types::{Result, StateSchema};

use crate::stage::{Router, Stage};
use crate::validation::{validate_or_raise, Diagnostic, Severity};

/// Pseudo-stage marking the end of a workflow.
pub const END: &str = "__end__";

pub struct StageNode {
    pub id: String,
    pub stage: Arc<dyn Stage>,
    /// Whether this stage's output is forwarded to stream consumers.
    pub streamed: bool,
}

pub struct Branch {
    pub router: Arc<dyn Router>,
    pub targets: Vec<String>,
}

/// The single way out of a stage.
pub enum Transition {
    Edge(String),
    Branch(Branch),
}

impl Transition {
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Transition::Edge(to) => vec![to.as_str()],
            Transition::Branch(b) => b.targets.iter().map(String::as_str).collect(),
        }
    }
}

pub struct WorkflowGraph {
    pub name: String,
    start: String,
    schema: StateSchema,
    stages: HashMap<String, StageNode>,
    /// Stage ids in declaration order.
    order: Vec<String>,
    transitions: HashMap<String, Transition>,
    interrupts: Vec<String>,
}

impl WorkflowGraph {
    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn schema(&self) -> &StateSchema {
        &self.schema
    }

    pub fn stage(&self, id: &str) -> Option<&StageNode> {
        self.stages.get(id)
    }

    pub fn transition(&self, id: &str) -> Option<&Transition> {
        self.transitions.get(id)
    }

    pub fn is_interrupt(&self, id: &str) -> bool {
        self.interrupts.iter().any(|s| s == id)
    }

    pub fn is_streamed(&self, id: &str) -> bool {
        self.stages.get(id).is_some_and(|s| s.streamed)
    }

    pub fn interrupt_points(&self) -> &[String] {
        &self.interrupts
    }

    /// Stage ids in declaration order.
    pub fn stage_ids(&self) -> &[String] {
        &self.order
    }

    pub fn successors(&self, id: &str) -> Vec<&str> {
        self.transitions
            .get(id)
            .map(Transition::targets)
            .unwrap_or_default()
    }

    /// Graphviz rendering. Interrupt points are drawn as octagons and
    /// branch edges are dashed.
    pub fn to_dot(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph \"{}\" {{", self.name);
        let _ = writeln!(out, "    rankdir=LR;");
        let _ = writeln!(out, "    \"{END}\" [shape=Msquare, label=\"end\"];");
        for id in &self.order {
            let shape = if self.is_interrupt(id) {
                "octagon"
            } else if id == &self.start {
                "Mdiamond"
            } else {
                "box"
            };
            let _ = writeln!(out, "    \"{id}\" [shape={shape}];");
        }
        for id in &self.order {
            match self.transitions.get(id) {
                Some(Transition::Edge(to)) => {
                    let _ = writeln!(out, "    \"{id}\" -> \"{to}\";");
                }
                Some(Transition::Branch(branch)) => {
                    for to in &branch.targets {
                        let _ = writeln!(out, "    \"{id}\" -> \"{to}\" [style=dashed];");
                    }
                }
                None => {}
            }
        }
        out.push_str("}\n");
        out
    }
}

// ---------------------------------------------------------------------------
// GraphBuilder
// ---------------------------------------------------------------------------

/// Builds a [`WorkflowGraph`]. The first stage added is the start stage unless
/// [`GraphBuilder::start`] says otherwise. `build` validates the result.
pub struct GraphBuilder {
    name: String,
    start: Option<String>,
    schema: StateSchema,
    stages: HashMap<String, StageNode>,
    order: Vec<String>,
    transitions: HashMap<String, Transition>,
    interrupts: Vec<String>,
    streamed: HashSet<String>,
    problems: Vec<Diagnostic>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start: None,
            schema: StateSchema::with_review_fields(),
            stages: HashMap::new(),
            order: Vec::new(),
            transitions: HashMap::new(),
            interrupts: Vec::new(),
            streamed: HashSet::new(),
            problems: Vec::new(),
        }
    }

    pub fn schema(mut self, schema: StateSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn stage(mut self, id: impl Into<String>, stage: impl Stage + 'static) -> Self {
        let id = id.into();
        if self.stages.contains_key(&id) {
            self.problems.push(Diagnostic::error(
                "duplicate_stage",
                format!("Stage '{id}' is declared more than once"),
                Some(id.clone()),
            ));
            return self;
        }
        self.order.push(id.clone());
        self.stages.insert(
            id.clone(),
            StageNode {
                id,
                stage: Arc::new(stage),
                streamed: false,
            },
        );
        self
    }

    pub fn start(mut self, id: impl Into<String>) -> Self {
        self.start = Some(id.into());
        self
    }

    pub fn edge(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        let from = from.into();
        self.transition(from, Transition::Edge(to.into()))
    }

    pub fn branch<R, I, S>(self, from: impl Into<String>, router: R, targets: I) -> Self
    where
        R: Router + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let branch = Branch {
            router: Arc::new(router),
            targets: targets.into_iter().map(Into::into).collect(),
        };
        self.transition(from.into(), Transition::Branch(branch))
    }

    /// The engine halts before executing `id` until a caller resumes.
    pub fn interrupt_before(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if !self.interrupts.contains(&id) {
            self.interrupts.push(id);
        }
        self
    }

    /// Forward the output of these stages to stream consumers.
    pub fn stream_output<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.streamed.extend(ids.into_iter().map(Into::into));
        self
    }

    fn transition(mut self, from: String, transition: Transition) -> Self {
        if self.transitions.contains_key(&from) {
            self.problems.push(Diagnostic::error(
                "single_transition",
                format!("Stage '{from}' has more than one outgoing transition"),
                Some(from.clone()),
            ));
            return self;
        }
        self.transitions.insert(from, transition);
        self
    }

    pub fn build(mut self) -> Result<WorkflowGraph> {
        for id in &self.streamed {
            match self.stages.get_mut(id) {
                Some(node) => node.streamed = true,
                None => self.problems.push(Diagnostic::error(
                    "streamed_stage_exists",
                    format!("Streamed stage '{id}' is not declared"),
                    Some(id.clone()),
                )),
            }
        }

        let start = self
            .start
            .clone()
            .or_else(|| self.order.first().cloned())
            .unwrap_or_default();

        let graph = WorkflowGraph {
            name: self.name,
            start,
            schema: self.schema,
            stages: self.stages,
            order: self.order,
            transitions: self.transitions,
            interrupts: self.interrupts,
        };

        let errors: Vec<&Diagnostic> = self
            .problems
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .collect();
        if !errors.is_empty() {
            let messages: Vec<_> = errors.iter().map(|d| d.message.clone()).collect();
            return Err(hitl_types::HitlError::GraphValidation(messages.join("; ")));
        }

        validate_or_raise(&graph)?;
        Ok(graph)
    }
}
