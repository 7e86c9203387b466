//! Rendering of a [`BuildGraph`] into a Ninja build file.
//!
//! The output only depends on the contents of the graph: steps are written in
//! the order of their first output, target edges in the order of their names,
//! so identical graphs always render to identical text.

use std::{collections::HashSet, fmt};

use smol_str::SmolStr;

use crate::graph::{ALWAYS, BuildGraph, Rule, StoredStep, TargetEdge};

/// Maximum number of trace comments written above a build edge.
const MAX_TRACES: usize = 10;

/// Escape a path or edge name for use in a `build` or `default` line.
///
/// Line breaks cannot be escaped; paths and names holding one are rejected
/// before they reach the graph.
pub fn escape_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        match c {
            '$' | ' ' | ':' => {
                out.push('$');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

/// Render the graph as a complete Ninja file.
pub fn render(graph: &BuildGraph) -> String {
    NinjaWriter::new(graph).to_string()
}

/// A [`fmt::Display`] adapter writing a build graph in Ninja syntax.
pub struct NinjaWriter<'g> {
    graph: &'g BuildGraph,
}

impl<'g> NinjaWriter<'g> {
    pub fn new(graph: &'g BuildGraph) -> Self {
        Self { graph }
    }

    fn write_rule(
        &self,
        f: &mut fmt::Formatter<'_>,
        rule: &Rule,
        written: &mut HashSet<SmolStr>,
    ) -> fmt::Result {
        if rule.is_phony() || !written.insert(rule.name.clone()) {
            return Ok(());
        }
        writeln!(f, "rule {}", rule.name)?;
        for (name, value) in &rule.variables {
            writeln!(f, "  {name} = {value}")?;
        }
        writeln!(f)
    }

    fn write_step(&self, f: &mut fmt::Formatter<'_>, stored: &StoredStep) -> fmt::Result {
        for trace in stored.traces.iter().take(MAX_TRACES) {
            writeln!(f, "# {}", trace.replace(['\n', '\r'], " "))?;
        }
        if stored.traces.len() > MAX_TRACES {
            writeln!(f, "# ... and {} more", stored.traces.len() - MAX_TRACES)?;
        }

        let step = &stored.step;
        write!(f, "build")?;
        for output in &step.outputs {
            write!(f, " {}", escape_path(&output.to_string()))?;
        }
        write!(f, ": {}", step.rule.name)?;
        for input in &step.inputs {
            write!(f, " {}", escape_path(&input.to_string()))?;
        }
        let mut implicit: Vec<String> = step
            .implicit_deps
            .iter()
            .map(|p| escape_path(&p.to_string()))
            .collect();
        if step.always_run {
            implicit.push(ALWAYS.to_owned());
        }
        write_list(f, "|", &implicit)?;
        let order_only: Vec<String> = step
            .order_only_deps
            .iter()
            .map(|p| escape_path(&p.to_string()))
            .collect();
        write_list(f, "||", &order_only)?;
        writeln!(f)?;
        for (name, value) in &step.variables {
            writeln!(f, "  {name} = {value}")?;
        }
        writeln!(f)
    }

    fn write_target(&self, f: &mut fmt::Formatter<'_>, edge: &TargetEdge) -> fmt::Result {
        write!(f, "build {}: {}", escape_path(&edge.name), edge.rule.name)?;
        for input in &edge.inputs {
            write!(f, " {}", escape_path(&input.to_string()))?;
        }
        let mut implicit: Vec<String> = edge.target_deps.iter().map(|d| escape_path(d)).collect();
        if edge.always_run {
            implicit.push(ALWAYS.to_owned());
        }
        write_list(f, "|", &implicit)?;
        writeln!(f)?;
        writeln!(f)
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, separator: &str, items: &[String]) -> fmt::Result {
    if items.is_empty() {
        return Ok(());
    }
    write!(f, " {separator}")?;
    for item in items {
        write!(f, " {item}")?;
    }
    Ok(())
}

impl fmt::Display for NinjaWriter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# Generated by dbt-graph; do not edit.")?;
        writeln!(f, "ninja_required_version = 1.10")?;
        writeln!(f)?;

        for (name, depth) in self.graph.pools() {
            writeln!(f, "pool {name}")?;
            writeln!(f, "  depth = {depth}")?;
            writeln!(f)?;
        }

        writeln!(f, "build {ALWAYS}: phony")?;
        writeln!(f)?;

        let mut written = HashSet::new();
        for (_, stored) in self.graph.steps() {
            self.write_rule(f, &stored.step.rule, &mut written)?;
            self.write_step(f, stored)?;
        }

        for edge in self.graph.target_edges() {
            self.write_rule(f, &edge.rule, &mut written)?;
            self.write_target(f, edge)?;
        }

        let defaults = self.graph.defaults();
        if !defaults.is_empty() {
            write!(f, "default")?;
            for name in defaults {
                write!(f, " {}", escape_path(name))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
