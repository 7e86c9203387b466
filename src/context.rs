//! The build context: the stateful graph compiler that targets call into while
//! declaring their build steps.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::Arc,
};

use smol_str::SmolStr;
use tracing::{debug, info, instrument, trace};

use crate::{
    error::{Error, Trace},
    flags::{FlagRegistry, FlagSpec, FlagValue},
    graph::{
        BuildGraph, BuildStep, CONSOLE_POOL, GraphError, Pool, Rule, Step, StepDiff, StepId,
        StoredStep, TargetEdge, rule_name,
    },
    path::{BuildPath, OutputPath, Roots},
    target::{Buildable, Target, is_visible},
};

/// Leaf bookkeeping of one top-level realization.
#[derive(Default)]
struct Frame {
    produced: BTreeSet<OutputPath>,
    consumed: HashSet<BuildPath>,
}

impl Frame {
    /// Outputs produced but not consumed within this realization, sorted.
    fn leaves(self) -> Vec<BuildPath> {
        self.produced
            .into_iter()
            .map(BuildPath::from)
            .filter(|p| !self.consumed.contains(p))
            .collect()
    }
}

/// Collects the build steps, rules and pools declared by targets.
///
/// One context lives for exactly one generator invocation. Call
/// [`BuildContext::realize`] for every selected target, then
/// [`BuildContext::finish`] to freeze the result into a [`BuildGraph`].
pub struct BuildContext {
    roots: Arc<Roots>,
    flags: FlagRegistry,
    run_args: Vec<String>,
    test_args: Vec<String>,

    steps: Vec<StoredStep>,
    outputs: HashMap<OutputPath, StepId>,
    rules: HashMap<SmolStr, Arc<Rule>>,
    pools: BTreeMap<SmolStr, u32>,
    compdb_rules: BTreeMap<SmolStr, Arc<Rule>>,
    targets: BTreeMap<String, TargetEdge>,
    realized: HashSet<String>,

    trace: Vec<String>,
    frames: Vec<Frame>,
    nested: bool,
}

impl BuildContext {
    pub fn new(roots: Arc<Roots>, flags: FlagRegistry) -> Self {
        Self {
            roots,
            flags,
            run_args: Vec::new(),
            test_args: Vec::new(),
            steps: Vec::new(),
            outputs: HashMap::new(),
            rules: HashMap::new(),
            pools: BTreeMap::new(),
            compdb_rules: BTreeMap::new(),
            targets: BTreeMap::new(),
            realized: HashSet::new(),
            trace: Vec::new(),
            frames: Vec::new(),
            nested: false,
        }
    }

    /// Set the argument vectors passed to run and test commands.
    pub fn with_args(mut self, run_args: Vec<String>, test_args: Vec<String>) -> Self {
        self.run_args = run_args;
        self.test_args = test_args;
        self
    }

    pub fn roots(&self) -> &Arc<Roots> {
        &self.roots
    }

    pub fn flags(&self) -> &FlagRegistry {
        &self.flags
    }

    // Flags

    pub fn flag(&mut self, name: &str) -> Result<FlagValue, Error> {
        self.flags.get(name).map_err(|error| self.flag_error(error))
    }

    pub fn flag_string(&mut self, name: &str) -> Result<String, Error> {
        self.flags
            .get_string(name)
            .map_err(|error| self.flag_error(error))
    }

    pub fn flag_bool(&mut self, name: &str) -> Result<bool, Error> {
        self.flags
            .get_bool(name)
            .map_err(|error| self.flag_error(error))
    }

    pub fn flag_int(&mut self, name: &str) -> Result<i64, Error> {
        self.flags
            .get_int(name)
            .map_err(|error| self.flag_error(error))
    }

    pub fn flag_float(&mut self, name: &str) -> Result<f64, Error> {
        self.flags
            .get_float(name)
            .map_err(|error| self.flag_error(error))
    }

    /// Declare a flag from inside build logic and resolve it.
    pub fn register_flag(&mut self, spec: FlagSpec) -> Result<FlagValue, Error> {
        self.flags
            .register(spec)
            .map_err(|error| self.flag_error(error))
    }

    fn flag_error(&self, error: crate::flags::FlagError) -> Error {
        Error::Flag {
            error,
            trace: self.current_trace(),
        }
    }

    // Traces

    /// A copy of the current trace stack.
    pub fn trace(&self) -> Vec<String> {
        self.trace.clone()
    }

    pub fn current_trace(&self) -> Trace {
        Trace(self.trace.clone())
    }

    /// Build an error for a failure in target build logic, tagged with the
    /// current trace.
    pub fn fail(&self, message: impl Into<String>) -> Error {
        Error::Target {
            message: message.into(),
            trace: self.current_trace(),
        }
    }

    /// Run `f` with `id` pushed on the trace stack.
    ///
    /// The stack is restored whether or not `f` succeeds.
    pub fn with_trace<R>(
        &mut self,
        id: impl Into<String>,
        f: impl FnOnce(&mut Self) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let depth = self.trace.len();
        self.trace.push(id.into());
        let result = f(self);
        self.trace.truncate(depth);
        result
    }

    // Realization

    /// Run the build logic of a target and synthesize its alias edges.
    ///
    /// Realizing the same path twice is a no-op.
    #[instrument(level = "debug", skip(self, target))]
    pub fn realize(&mut self, path: &str, target: &dyn Target) -> Result<(), Error> {
        self.check_line("target path", path)?;
        if !self.realized.insert(path.to_owned()) {
            return Ok(());
        }

        let buildable = target.as_buildable();
        if let Some(buildable) = buildable {
            self.frames.push(Frame::default());
            let nested = std::mem::replace(&mut self.nested, false);
            let result = self.with_trace(format!("target:{path}"), |ctx| buildable.build(ctx));
            self.nested = nested;
            let frame = self.frames.pop().unwrap_or_default();
            result?;

            if is_visible(path) {
                let leaves = frame.leaves();
                debug!(leaves = leaves.len(), "realized target");
                self.targets
                    .insert(path.to_owned(), TargetEdge::alias(path, leaves));
            }
        }

        if !is_visible(path) {
            return Ok(());
        }
        let target_deps = if buildable.is_some() {
            vec![path.to_owned()]
        } else {
            Vec::new()
        };
        if let Some(runnable) = target.as_runnable() {
            let command = runnable.run_command(&self.run_args);
            let edge = self.command_edge(
                "run",
                format!("{path}#run"),
                command,
                format!("RUN {path}"),
                runnable.run_deps(),
                target_deps.clone(),
            )?;
            self.targets.insert(edge.name.clone(), edge);
        }
        if let Some(testable) = target.as_testable() {
            let command = testable.test_command(&self.test_args);
            let edge = self.command_edge(
                "test",
                format!("{path}#test"),
                command,
                format!("TEST {path}"),
                testable.test_deps(),
                target_deps,
            )?;
            self.targets.insert(edge.name.clone(), edge);
        }
        Ok(())
    }

    /// An always-run console edge executing a target-supplied command.
    fn command_edge(
        &mut self,
        prefix: &str,
        name: String,
        command: String,
        description: String,
        inputs: Vec<BuildPath>,
        target_deps: Vec<String>,
    ) -> Result<TargetEdge, Error> {
        let mut variables = BTreeMap::new();
        variables.insert(SmolStr::from("command"), command);
        variables.insert(SmolStr::from("description"), description);
        variables.insert(SmolStr::from("pool"), CONSOLE_POOL.to_owned());
        let rule = self.intern_rule(Arc::new(Rule {
            name: rule_name(prefix, &variables),
            variables,
        }))?;
        Ok(TargetEdge {
            name,
            rule,
            inputs,
            target_deps,
            always_run: true,
        })
    }

    /// Run another target's build logic as part of the current one.
    ///
    /// Its steps are registered as usual, but do not count towards the leaf
    /// outputs of the enclosing realization.
    pub fn build_child(&mut self, child: &dyn Buildable) -> Result<(), Error> {
        let nested = std::mem::replace(&mut self.nested, true);
        let result = child.build(self);
        self.nested = nested;
        result
    }

    // Steps

    /// Register a step with an inline command, deriving its rule.
    pub fn add_step(&mut self, step: Step) -> Result<(), Error> {
        self.add_step_with_rule(step.into_build_step())
    }

    /// Register a build step.
    ///
    /// A step without outputs is ignored. A step whose outputs are already
    /// owned must be equivalent to the stored one, in which case only the
    /// current trace is recorded.
    pub fn add_step_with_rule(&mut self, mut step: BuildStep) -> Result<(), Error> {
        if step.outputs.is_empty() {
            return Ok(());
        }
        let mut seen = HashSet::new();
        if let Some(output) = step.outputs.iter().find(|o| !seen.insert(*o)) {
            return Err(GraphError::DuplicateOutput {
                output: output.to_string(),
                trace: self.current_trace(),
            }
            .into());
        }
        for (name, value) in &step.variables {
            self.check_line("step variable name", name)?;
            self.check_line(&format!("value of step variable `{name}`"), value)?;
        }
        step.rule = self.intern_rule(step.rule)?;
        self.track(&step);

        let trace = if self.trace.is_empty() {
            "(top level)".to_owned()
        } else {
            self.trace.join(" > ")
        };
        let owned = step
            .outputs
            .iter()
            .find_map(|o| self.outputs.get(o).map(|&id| (o, id)));

        if let Some((output, id)) = owned {
            let stored = &self.steps[id.0];
            if let Some(diff) = StepDiff::between(&stored.step, &step) {
                return Err(GraphError::StepConflict {
                    output: output.to_string(),
                    diff,
                    first: stored.traces.first().cloned().unwrap_or_default(),
                    trace: self.current_trace(),
                }
                .into());
            }
            trace!(output = %output, "duplicate step");
            self.steps[id.0].traces.push(trace);
            return Ok(());
        }

        let id = StepId(self.steps.len());
        for output in &step.outputs {
            trace!(output = %output, rule = %step.rule.name, "registered step");
            self.outputs.insert(output.clone(), id);
        }
        self.steps.push(StoredStep {
            step,
            traces: vec![trace],
        });
        Ok(())
    }

    /// Record the outputs and inputs of a step in the innermost frame.
    fn track(&mut self, step: &BuildStep) {
        if self.nested {
            return;
        }
        let Some(frame) = self.frames.last_mut() else {
            return;
        };
        frame.produced.extend(step.outputs.iter().cloned());
        frame.consumed.extend(step.all_inputs().cloned());
    }

    fn intern_rule(&mut self, rule: Arc<Rule>) -> Result<Arc<Rule>, Error> {
        self.check_line("rule name", &rule.name)?;
        for (name, value) in &rule.variables {
            self.check_line("rule variable name", name)?;
            let what = format!("value of variable `{name}` in rule `{}`", rule.name);
            self.check_line(&what, value)?;
        }
        if rule.is_phony() {
            if !rule.variables.is_empty() {
                return Err(self.rule_conflict(&rule.name));
            }
            return Ok(rule);
        }
        match self.rules.get(&rule.name) {
            Some(existing) if **existing != *rule => Err(self.rule_conflict(&rule.name)),
            Some(existing) => Ok(Arc::clone(existing)),
            None => {
                self.rules.insert(rule.name.clone(), Arc::clone(&rule));
                Ok(rule)
            }
        }
    }

    /// Ninja statements end at a line break, so no emitted text may hold one.
    fn check_line(&self, what: &str, text: &str) -> Result<(), Error> {
        if !text.contains(['\n', '\r']) {
            return Ok(());
        }
        Err(GraphError::LineBreak {
            what: what.to_owned(),
            text: text.to_owned(),
            trace: self.current_trace(),
        }
        .into())
    }

    fn rule_conflict(&self, name: &SmolStr) -> Error {
        GraphError::RuleConflict {
            name: name.clone(),
            trace: self.current_trace(),
        }
        .into()
    }

    // Pools and compile database rules

    /// Declare a concurrency pool.
    ///
    /// The console pool always exists and is accepted silently.
    pub fn register_pool(&mut self, pool: Pool) -> Result<(), Error> {
        if pool.name.is_empty() {
            return Err(GraphError::EmptyPoolName {
                trace: self.current_trace(),
            }
            .into());
        }
        self.check_line("pool name", &pool.name)?;
        if pool.name == CONSOLE_POOL {
            return Ok(());
        }
        match self.pools.get(&pool.name) {
            Some(&existing) if existing != pool.depth => Err(GraphError::PoolConflict {
                name: pool.name,
                existing,
                new: pool.depth,
                trace: self.current_trace(),
            }
            .into()),
            Some(_) => Ok(()),
            None => {
                self.pools.insert(pool.name, pool.depth);
                Ok(())
            }
        }
    }

    /// Declare a rule that produces compile database entries.
    ///
    /// The rule shares the name space of all other rules, and is returned in
    /// its interned form.
    pub fn register_compdb_rule(&mut self, rule: Rule) -> Result<Arc<Rule>, Error> {
        let rule = self.intern_rule(Arc::new(rule))?;
        self.compdb_rules
            .insert(rule.name.clone(), Arc::clone(&rule));
        Ok(rule)
    }

    pub fn compdb_rule(&self, name: &str) -> Option<Arc<Rule>> {
        self.compdb_rules.get(name).cloned()
    }

    /// Freeze the collected tables into a build graph, handing back the flag
    /// registry.
    pub fn finish(self) -> Result<(BuildGraph, FlagRegistry), Error> {
        let rules: BTreeMap<SmolStr, Arc<Rule>> = self.rules.into_iter().collect();
        let edge_rules = self.targets.values().map(|t| &t.rule);
        for rule in rules.values().chain(edge_rules) {
            if let Some(pool) = rule.pool()
                && pool != CONSOLE_POOL
                && !self.pools.contains_key(pool)
            {
                return Err(GraphError::UnknownPool {
                    rule: rule.name.clone(),
                    pool: pool.to_owned(),
                }
                .into());
            }
        }

        let mut graph = BuildGraph {
            steps: self.steps,
            outputs: self.outputs.into_iter().collect(),
            rules,
            pools: self.pools,
            targets: self.targets,
            compdb_rules: self.compdb_rules,
            defaults: Vec::new(),
            graph: Default::default(),
        };
        graph.link()?;
        info!(
            steps = graph.steps.len(),
            rules = graph.rules.len(),
            pools = graph.pools.len(),
            targets = graph.targets.len(),
            "build graph complete"
        );
        Ok((graph, self.flags))
    }
}
