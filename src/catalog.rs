//! The catalog of declared targets, and selection of the targets an
//! invocation acts on.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    protocol::TargetInfo,
    target::{Target, is_visible},
};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("target `{0}` is declared more than once")]
    DuplicateTarget(String),

    #[error("target path must not be empty")]
    EmptyPath,

    #[error("target path {0:?} contains a line break")]
    LineBreak(String),

    #[error("invalid target pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },
}

/// What the invoking tool is about to do with the selected targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Build,
    List,
    Run,
    Test,
    Coverage,
    Report,
}

/// Raw target-selection patterns, as regular expressions over target paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Selectors {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

/// Compiled target-selection patterns.
///
/// Every pattern must match the whole target path. Exclusion wins over
/// inclusion, and a path no inclusion pattern matches is not selected.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl Filter {
    pub fn new(selectors: &Selectors) -> Result<Self, CatalogError> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>, CatalogError> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(&format!("^(?:{p})$")).map_err(|source| {
                        CatalogError::InvalidPattern {
                            pattern: p.clone(),
                            source,
                        }
                    })
                })
                .collect()
        };
        Ok(Self {
            include: compile(&selectors.include)?,
            exclude: compile(&selectors.exclude)?,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        !self.exclude.iter().any(|re| re.is_match(path))
            && self.include.iter().any(|re| re.is_match(path))
    }
}

/// Whether a target takes part in an invocation of the given mode.
fn admitted(mode: Mode, target: &dyn Target) -> bool {
    if target.is_report() && mode != Mode::Report {
        return false;
    }
    match mode {
        Mode::Run => target.as_runnable().is_some(),
        Mode::Test | Mode::Coverage => target.as_testable().is_some(),
        Mode::Build | Mode::List | Mode::Report => true,
    }
}

/// All declared targets, keyed by path.
#[derive(Default)]
pub struct Catalog {
    targets: BTreeMap<String, Box<dyn Target>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        path: impl Into<String>,
        target: Box<dyn Target>,
    ) -> Result<(), CatalogError> {
        let path = path.into();
        if path.is_empty() {
            return Err(CatalogError::EmptyPath);
        }
        if path.contains(['\n', '\r']) {
            return Err(CatalogError::LineBreak(path));
        }
        if self.targets.contains_key(&path) {
            return Err(CatalogError::DuplicateTarget(path));
        }
        self.targets.insert(path, target);
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&dyn Target> {
        self.targets.get(path).map(|t| &**t)
    }

    /// Iterate over all targets in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &dyn Target)> {
        self.targets.iter().map(|(p, t)| (p.as_str(), &**t))
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// The sorted paths of the targets selected for this invocation.
    pub fn select(&self, filter: &Filter, mode: Mode) -> Vec<String> {
        self.iter()
            .filter(|(path, target)| {
                is_visible(path) && filter.matches(path) && admitted(mode, *target)
            })
            .map(|(path, _)| path.to_owned())
            .collect()
    }

    /// Metadata of every public target.
    pub fn metadata(&self, selected: &[String]) -> BTreeMap<String, TargetInfo> {
        self.iter()
            .filter(|(path, _)| is_visible(path))
            .map(|(path, target)| {
                let info = TargetInfo {
                    description: target.description().to_owned(),
                    runnable: target.as_runnable().is_some(),
                    testable: target.as_testable().is_some(),
                    report: target.is_report(),
                    selected: selected.binary_search_by(|s| s.as_str().cmp(path)).is_ok(),
                };
                (path.to_owned(), info)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Runnable;

    struct Plain;
    impl Target for Plain {}

    struct Tool;
    impl Target for Tool {
        fn as_runnable(&self) -> Option<&dyn Runnable> {
            Some(self)
        }
    }
    impl Runnable for Tool {
        fn run_command(&self, _args: &[String]) -> String {
            "tool".into()
        }
    }

    struct Coverage;
    impl Target for Coverage {
        fn is_report(&self) -> bool {
            true
        }
    }

    fn selectors(include: &[&str], exclude: &[&str]) -> Selectors {
        Selectors {
            include: include.iter().map(|s| s.to_string()).collect(),
            exclude: exclude.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn catalog() -> Catalog {
        let mut c = Catalog::new();
        c.insert("//lib:A", Box::new(Plain)).unwrap();
        c.insert("//lib:b", Box::new(Plain)).unwrap();
        c.insert("//tools:Gen", Box::new(Tool)).unwrap();
        c.insert("//reports:Cov", Box::new(Coverage)).unwrap();
        c
    }

    #[test]
    fn exclusion_wins_over_inclusion() {
        let f = Filter::new(&selectors(&["//lib:.*", "//tools:.*"], &["//lib:A"])).unwrap();
        assert!(!f.matches("//lib:A"));
        assert!(f.matches("//tools:Gen"));
        assert!(!f.matches("//other:X"));
        assert!(!Filter::new(&Selectors::default()).unwrap().matches("//lib:A"));
    }

    #[test]
    fn patterns_match_whole_paths() {
        let f = Filter::new(&selectors(&["//lib:A"], &[])).unwrap();
        assert!(f.matches("//lib:A"));
        assert!(!f.matches("//lib:AB"));
        assert!(!f.matches("x//lib:A"));
    }

    #[test]
    fn target_paths_are_single_lines() {
        let mut c = Catalog::new();
        assert!(matches!(c.insert("", Box::new(Plain)), Err(CatalogError::EmptyPath)));
        assert!(matches!(
            c.insert("//lib:A\nbuild evil: phony", Box::new(Plain)),
            Err(CatalogError::LineBreak(_))
        ));
        assert!(c.get("//lib:A").is_none());
    }

    #[test]
    fn malformed_pattern_is_rejected() {
        let err = Filter::new(&selectors(&["//lib:("], &[])).unwrap_err();
        assert!(matches!(err, CatalogError::InvalidPattern { .. }));
    }

    #[test]
    fn mode_restricts_selection() {
        let c = catalog();
        let all = Filter::new(&selectors(&[".*"], &[])).unwrap();
        assert_eq!(c.select(&all, Mode::Build), ["//lib:A", "//tools:Gen"]);
        assert_eq!(c.select(&all, Mode::Run), ["//tools:Gen"]);
        assert!(c.select(&all, Mode::Test).is_empty());
        assert_eq!(
            c.select(&all, Mode::Report),
            ["//lib:A", "//reports:Cov", "//tools:Gen"]
        );
    }

    #[test]
    fn private_targets_are_neither_listed_nor_selected() {
        let c = catalog();
        let f = Filter::new(&selectors(&["//lib:b"], &[])).unwrap();
        assert!(c.select(&f, Mode::Build).is_empty());

        let selected = vec!["//tools:Gen".to_string()];
        let meta = c.metadata(&selected);
        assert!(!meta.contains_key("//lib:b"));
        assert!(meta["//tools:Gen"].selected && meta["//tools:Gen"].runnable);
        assert!(!meta["//lib:A"].selected);
        assert!(meta["//reports:Cov"].report);
    }

    #[test]
    fn duplicate_paths_are_rejected() {
        let mut c = catalog();
        assert!(matches!(
            c.insert("//lib:A", Box::new(Plain)),
            Err(CatalogError::DuplicateTarget(_))
        ));
    }
}
