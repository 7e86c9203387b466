//! Equivalence of build steps declared for the same outputs.

use std::{collections::BTreeSet, fmt, sync::Arc};

use smol_str::SmolStr;

use super::{BuildStep, Rule};

/// The first difference found between two steps claiming the same output.
#[derive(Debug, Clone, PartialEq)]
pub enum StepDiff {
    Count {
        list: &'static str,
        existing: usize,
        new: usize,
    },
    Entry {
        list: &'static str,
        position: usize,
        existing: String,
        new: String,
    },
    Rule {
        existing: Arc<Rule>,
        new: Arc<Rule>,
    },
    Variable {
        name: SmolStr,
        existing: Option<String>,
        new: Option<String>,
    },
    AlwaysRun {
        existing: bool,
        new: bool,
    },
}

impl StepDiff {
    /// Compare two steps, returning `None` if they are equivalent.
    ///
    /// Every part of a step that reaches the emitted build file takes part in
    /// the comparison, in order.
    pub fn between(existing: &BuildStep, new: &BuildStep) -> Option<StepDiff> {
        compare_list("outputs", &existing.outputs, &new.outputs)
            .or_else(|| compare_list("inputs", &existing.inputs, &new.inputs))
            .or_else(|| {
                compare_list(
                    "implicit deps",
                    &existing.implicit_deps,
                    &new.implicit_deps,
                )
            })
            .or_else(|| {
                compare_list(
                    "order-only deps",
                    &existing.order_only_deps,
                    &new.order_only_deps,
                )
            })
            .or_else(|| {
                (existing.rule != new.rule).then(|| StepDiff::Rule {
                    existing: Arc::clone(&existing.rule),
                    new: Arc::clone(&new.rule),
                })
            })
            .or_else(|| {
                let names: BTreeSet<&SmolStr> = existing
                    .variables
                    .keys()
                    .chain(new.variables.keys())
                    .collect();
                names.into_iter().find_map(|name| {
                    let a = existing.variables.get(name);
                    let b = new.variables.get(name);
                    (a != b).then(|| StepDiff::Variable {
                        name: name.clone(),
                        existing: a.cloned(),
                        new: b.cloned(),
                    })
                })
            })
            .or_else(|| {
                (existing.always_run != new.always_run).then_some(StepDiff::AlwaysRun {
                    existing: existing.always_run,
                    new: new.always_run,
                })
            })
    }
}

fn compare_list<T: PartialEq + fmt::Display>(
    list: &'static str,
    existing: &[T],
    new: &[T],
) -> Option<StepDiff> {
    if existing.len() != new.len() {
        return Some(StepDiff::Count {
            list,
            existing: existing.len(),
            new: new.len(),
        });
    }
    existing
        .iter()
        .zip(new)
        .position(|(a, b)| a != b)
        .map(|position| StepDiff::Entry {
            list,
            position,
            existing: existing[position].to_string(),
            new: new[position].to_string(),
        })
}

fn describe_rule(rule: &Rule) -> String {
    match rule.get("command") {
        Some(command) => format!("`{}` (command `{command}`)", rule.name),
        None => format!("`{}`", rule.name),
    }
}

impl fmt::Display for StepDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepDiff::Count {
                list,
                existing,
                new,
            } => write!(f, "{list} differ in count: {existing} vs {new}"),
            StepDiff::Entry {
                list,
                position,
                existing,
                new,
            } => write!(f, "{list} differ at position {position}: `{existing}` vs `{new}`"),
            StepDiff::Rule { existing, new } => write!(
                f,
                "rules differ: {} vs {}",
                describe_rule(existing),
                describe_rule(new)
            ),
            StepDiff::Variable {
                name,
                existing,
                new,
            } => {
                let show = |v: &Option<String>| match v {
                    Some(v) => format!("`{v}`"),
                    None => "unset".to_owned(),
                };
                write!(
                    f,
                    "variable `{name}` differs: {} vs {}",
                    show(existing),
                    show(new)
                )
            }
            StepDiff::AlwaysRun { existing, new } => {
                write!(f, "always-run differs: {existing} vs {new}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::Roots;

    fn step(rule: &str, flags: &str) -> BuildStep {
        let roots = Roots::new("/ws/src", "/ws/out");
        BuildStep::new(Rule::new(rule).var("command", "cc $flags -c $in -o $out"))
            .output(roots.out("x.o").unwrap())
            .input(roots.src("x.c").unwrap())
            .var("flags", flags)
    }

    #[test]
    fn equal_steps_have_no_diff() {
        assert_eq!(StepDiff::between(&step("cc", "-O2"), &step("cc", "-O2")), None);
    }

    #[test]
    fn reports_the_first_difference() {
        let diff = StepDiff::between(&step("cc", "-O2"), &step("cc", "-O0")).unwrap();
        assert_eq!(diff.to_string(), "variable `flags` differs: `-O2` vs `-O0`");

        let roots = Roots::new("/ws/src", "/ws/out");
        let extra = step("cc", "-O2").input(roots.src("y.c").unwrap());
        let diff = StepDiff::between(&step("cc", "-O2"), &extra).unwrap();
        assert_eq!(diff.to_string(), "inputs differ in count: 1 vs 2");

        let moved = step("cc", "-O2");
        let mut other = moved.clone();
        other.inputs[0] = roots.src("z.c").unwrap().into();
        let diff = StepDiff::between(&moved, &other).unwrap();
        assert_eq!(
            diff.to_string(),
            "inputs differ at position 0: `/ws/src/x.c` vs `/ws/src/z.c`"
        );

        let diff = StepDiff::between(&step("cc", "-O2"), &step("cxx", "-O2")).unwrap();
        assert!(matches!(diff, StepDiff::Rule { .. }));
    }
}
