//! Build steps, rules, and the frozen build graph.

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    sync::Arc,
};

use petgraph::{
    dot::{Config, Dot},
    prelude::DiGraphMap,
};
use smol_str::SmolStr;

use crate::{
    error::Trace,
    path::{BuildPath, OutputPath},
};

pub mod diff;
mod hash;
pub use diff::StepDiff;
pub use hash::rule_name;

/// The built-in rule of edges that only group other files.
pub const PHONY: &str = "phony";

/// The implicit pool of steps that run one at a time with live output.
pub const CONSOLE_POOL: &str = "console";

/// A phony target without inputs, which is always out of date.
pub const ALWAYS: &str = "__always__";

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("conflicting build steps for {output}: {diff}\n  first declared by: {first}{trace}")]
    StepConflict {
        output: String,
        diff: StepDiff,
        first: String,
        trace: Trace,
    },

    #[error("build step lists output {output} more than once{trace}")]
    DuplicateOutput { output: String, trace: Trace },

    #[error("{what} {text:?} contains a line break{trace}")]
    LineBreak {
        what: String,
        text: String,
        trace: Trace,
    },

    #[error("rule `{name}` is declared with two different definitions{trace}")]
    RuleConflict { name: SmolStr, trace: Trace },

    #[error("pool name must not be empty{trace}")]
    EmptyPoolName { trace: Trace },

    #[error("pool `{name}` is declared with depth {existing} and with depth {new}{trace}")]
    PoolConflict {
        name: SmolStr,
        existing: u32,
        new: u32,
        trace: Trace,
    },

    #[error("rule `{rule}` uses undeclared pool `{pool}`")]
    UnknownPool { rule: SmolStr, pool: String },

    #[error("build steps form a dependency cycle through {0}")]
    Cycle(String),
}

/// A named, reusable command template.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub name: SmolStr,
    pub variables: BTreeMap<SmolStr, String>,
}

impl Rule {
    pub fn new(name: impl Into<SmolStr>) -> Self {
        Self {
            name: name.into(),
            variables: BTreeMap::new(),
        }
    }

    pub fn phony() -> Self {
        Self::new(PHONY)
    }

    pub fn var(mut self, name: impl Into<SmolStr>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    pub fn is_phony(&self) -> bool {
        self.name == PHONY
    }

    pub fn pool(&self) -> Option<&str> {
        self.get("pool")
    }
}

/// A named concurrency limit, enforced by the build executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pool {
    pub name: SmolStr,
    pub depth: u32,
}

impl Pool {
    pub fn new(name: impl Into<SmolStr>, depth: u32) -> Self {
        Self {
            name: name.into(),
            depth,
        }
    }
}

/// Format of the header dependency file written by a compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepsFormat {
    Gcc,
    Msvc,
}

impl fmt::Display for DepsFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DepsFormat::Gcc => "gcc",
            DepsFormat::Msvc => "msvc",
        })
    }
}

/// A build step bound to a rule.
#[derive(Debug, Clone)]
pub struct BuildStep {
    pub outputs: Vec<OutputPath>,
    pub inputs: Vec<BuildPath>,
    pub implicit_deps: Vec<BuildPath>,
    pub order_only_deps: Vec<BuildPath>,
    pub rule: Arc<Rule>,
    pub variables: BTreeMap<SmolStr, String>,
    /// Re-run the step on every invocation.
    pub always_run: bool,
}

impl BuildStep {
    pub fn new(rule: impl Into<Arc<Rule>>) -> Self {
        Self {
            outputs: Vec::new(),
            inputs: Vec::new(),
            implicit_deps: Vec::new(),
            order_only_deps: Vec::new(),
            rule: rule.into(),
            variables: BTreeMap::new(),
            always_run: false,
        }
    }

    pub fn output(mut self, path: OutputPath) -> Self {
        self.outputs.push(path);
        self
    }

    pub fn input(mut self, path: impl Into<BuildPath>) -> Self {
        self.inputs.push(path.into());
        self
    }

    pub fn implicit(mut self, path: impl Into<BuildPath>) -> Self {
        self.implicit_deps.push(path.into());
        self
    }

    pub fn order_only(mut self, path: impl Into<BuildPath>) -> Self {
        self.order_only_deps.push(path.into());
        self
    }

    pub fn var(mut self, name: impl Into<SmolStr>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn always_run(mut self) -> Self {
        self.always_run = true;
        self
    }

    pub fn is_phony(&self) -> bool {
        self.rule.is_phony()
    }

    /// Every file the step reads, in declaration order.
    pub fn all_inputs(&self) -> impl Iterator<Item = &BuildPath> {
        self.inputs
            .iter()
            .chain(&self.implicit_deps)
            .chain(&self.order_only_deps)
    }
}

/// A build step with an inline command; its rule is derived from the command.
#[derive(Debug, Clone, Default)]
pub struct Step {
    pub outputs: Vec<OutputPath>,
    pub inputs: Vec<BuildPath>,
    pub implicit_deps: Vec<BuildPath>,
    pub order_only_deps: Vec<BuildPath>,
    pub command: String,
    pub description: String,
    pub depfile: Option<OutputPath>,
    pub deps: Option<DepsFormat>,
    pub pool: Option<SmolStr>,
    pub always_run: bool,
    pub phony: bool,
}

impl Step {
    /// Split the step into a rule carrying the command and an edge using it.
    ///
    /// Steps running the same command share one rule.
    pub fn into_build_step(self) -> BuildStep {
        let rule = if self.phony {
            Rule::phony()
        } else {
            let mut variables = BTreeMap::new();
            variables.insert(SmolStr::from("command"), self.command);
            if !self.description.is_empty() {
                variables.insert(SmolStr::from("description"), self.description);
            }
            if let Some(depfile) = &self.depfile {
                variables.insert(SmolStr::from("depfile"), depfile.to_string());
            }
            if let Some(deps) = self.deps {
                variables.insert(SmolStr::from("deps"), deps.to_string());
            }
            if let Some(pool) = self.pool {
                variables.insert(SmolStr::from("pool"), pool.to_string());
            }
            Rule {
                name: rule_name("r", &variables),
                variables,
            }
        };
        BuildStep {
            outputs: self.outputs,
            inputs: self.inputs,
            implicit_deps: self.implicit_deps,
            order_only_deps: self.order_only_deps,
            rule: Arc::new(rule),
            variables: BTreeMap::new(),
            always_run: self.always_run,
        }
    }
}

/// An index that uniquely identifies a build step in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepId(pub(crate) usize);

/// A registered build step, with the traces of everyone who declared it.
#[derive(Debug, Clone)]
pub struct StoredStep {
    pub step: BuildStep,
    pub traces: Vec<String>,
}

/// A synthesized edge addressing a target by name.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetEdge {
    pub name: String,
    pub rule: Arc<Rule>,
    pub inputs: Vec<BuildPath>,
    /// Other target edges this one depends on.
    pub target_deps: Vec<String>,
    pub always_run: bool,
}

impl TargetEdge {
    /// The phony edge standing for the default outputs of a target.
    pub fn alias(name: impl Into<String>, inputs: Vec<BuildPath>) -> Self {
        Self {
            name: name.into(),
            rule: Arc::new(Rule::phony()),
            inputs,
            target_deps: Vec::new(),
            always_run: false,
        }
    }
}

/// The complete, frozen result of realizing all selected targets.
///
/// Produced by [`crate::BuildContext::finish`].
#[derive(Debug, Default)]
pub struct BuildGraph {
    pub(crate) steps: Vec<StoredStep>,
    pub(crate) outputs: BTreeMap<OutputPath, StepId>,
    pub(crate) rules: BTreeMap<SmolStr, Arc<Rule>>,
    pub(crate) pools: BTreeMap<SmolStr, u32>,
    pub(crate) targets: BTreeMap<String, TargetEdge>,
    pub(crate) compdb_rules: BTreeMap<SmolStr, Arc<Rule>>,
    pub(crate) defaults: Vec<String>,
    pub(crate) graph: DiGraphMap<StepId, ()>,
}

impl BuildGraph {
    /// Connect every step to the steps producing its inputs, and reject cycles.
    pub(crate) fn link(&mut self) -> Result<(), GraphError> {
        for i in 0..self.steps.len() {
            self.graph.add_node(StepId(i));
        }
        for (i, stored) in self.steps.iter().enumerate() {
            for input in stored.step.all_inputs() {
                if let Some(out) = input.as_output()
                    && let Some(&producer) = self.outputs.get(out)
                {
                    self.graph.add_edge(StepId(i), producer, ());
                }
            }
        }
        petgraph::algo::toposort(&self.graph, None).map_err(|cycle| {
            let step = &self.steps[cycle.node_id().0].step;
            GraphError::Cycle(
                step.outputs
                    .first()
                    .map(|o| o.relative().to_owned())
                    .unwrap_or_default(),
            )
        })?;
        Ok(())
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Distinct steps, ordered by their lexicographically first output.
    pub fn steps(&self) -> impl Iterator<Item = (StepId, &StoredStep)> {
        let mut seen = HashSet::new();
        self.outputs
            .values()
            .filter(move |id| seen.insert(**id))
            .map(|&id| (id, &self.steps[id.0]))
    }

    pub fn lookup_output(&self, path: &OutputPath) -> Option<&StoredStep> {
        self.outputs.get(path).map(|id| &self.steps[id.0])
    }

    pub fn lookup_step(&self, id: StepId) -> Option<&StoredStep> {
        self.steps.get(id.0)
    }

    /// Steps producing the inputs of the given step.
    pub fn step_dependencies(&self, id: StepId) -> impl Iterator<Item = StepId> + '_ {
        self.graph
            .neighbors_directed(id, petgraph::Direction::Outgoing)
    }

    pub fn rule(&self, name: &str) -> Option<&Arc<Rule>> {
        self.rules.get(name)
    }

    pub fn pools(&self) -> impl Iterator<Item = (&str, u32)> {
        self.pools.iter().map(|(n, d)| (n.as_str(), *d))
    }

    pub fn target_edges(&self) -> impl Iterator<Item = &TargetEdge> {
        self.targets.values()
    }

    pub fn target_edge(&self, name: &str) -> Option<&TargetEdge> {
        self.targets.get(name)
    }

    pub fn compdb_rule_names(&self) -> Vec<String> {
        self.compdb_rules.keys().map(|k| k.to_string()).collect()
    }

    pub fn defaults(&self) -> &[String] {
        &self.defaults
    }

    /// Set the target edges built when the executor is given no targets.
    pub fn set_defaults(&mut self, defaults: Vec<String>) {
        self.defaults = defaults;
    }

    /// Render the step dependency graph in Graphviz DOT format.
    ///
    /// Each node is labeled by the first output of its step, and each edge
    /// points from a step to a step producing one of its inputs.
    pub fn to_dot(&self) -> String {
        let mut dot = petgraph::Graph::<String, &str>::new();
        let mut index = BTreeMap::new();
        for (id, stored) in self.steps() {
            let label = stored
                .step
                .outputs
                .first()
                .map(|o| o.relative().to_owned())
                .unwrap_or_default();
            index.insert(id, dot.add_node(label));
        }
        for (from, to, _) in self.graph.all_edges() {
            if let (Some(&a), Some(&b)) = (index.get(&from), index.get(&to)) {
                dot.add_edge(a, b, "");
            }
        }
        format!("{}", Dot::with_config(&dot, &[Config::EdgeNoLabel]))
    }
}
