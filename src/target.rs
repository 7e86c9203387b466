//! Declared targets and their capabilities.
//!
//! A target is a plain value registered under a hierarchical path such as
//! `//lib/net:Socket`. What a target can do is discovered through the
//! optional capability accessors of [`Target`], rather than through its
//! concrete type.

use std::sync::Arc;

use tracing::warn;

use crate::{context::BuildContext, error::Error, path::BuildPath};

/// A user-declared target.
pub trait Target {
    fn description(&self) -> &str {
        ""
    }

    fn as_buildable(&self) -> Option<&dyn Buildable> {
        None
    }

    fn as_runnable(&self) -> Option<&dyn Runnable> {
        None
    }

    fn as_testable(&self) -> Option<&dyn Testable> {
        None
    }

    /// Report targets are only selected when reports are requested.
    fn is_report(&self) -> bool {
        false
    }
}

/// Targets shared between the catalog and their dependents.
impl<T: Target + ?Sized> Target for Arc<T> {
    fn description(&self) -> &str {
        (**self).description()
    }

    fn as_buildable(&self) -> Option<&dyn Buildable> {
        (**self).as_buildable()
    }

    fn as_runnable(&self) -> Option<&dyn Runnable> {
        (**self).as_runnable()
    }

    fn as_testable(&self) -> Option<&dyn Testable> {
        (**self).as_testable()
    }

    fn is_report(&self) -> bool {
        (**self).is_report()
    }
}

/// A target that declares build steps.
pub trait Buildable {
    fn build(&self, ctx: &mut BuildContext) -> Result<(), Error>;
}

/// A target with a command that can be run on demand.
pub trait Runnable {
    /// The shell command to run, given the user's run arguments.
    fn run_command(&self, args: &[String]) -> String;

    /// Files that must be up to date before running.
    fn run_deps(&self) -> Vec<BuildPath> {
        Vec::new()
    }
}

/// A target with a test command.
pub trait Testable {
    fn test_command(&self, args: &[String]) -> String;

    fn test_deps(&self) -> Vec<BuildPath> {
        Vec::new()
    }
}

/// The last component of a target path.
pub fn leaf_name(path: &str) -> &str {
    path.rfind([':', '/']).map_or(path, |i| &path[i + 1..])
}

/// Whether a target is public: its leaf name starts with an upper-case letter.
///
/// Private targets may be depended upon, but never listed or selected.
pub fn is_visible(path: &str) -> bool {
    leaf_name(path)
        .chars()
        .next()
        .is_some_and(char::is_uppercase)
}

/// Join run or test arguments into a single shell-quoted string.
///
/// Arguments holding a NUL byte cannot be quoted and are left out with a
/// warning.
pub fn shell_args(args: &[String]) -> String {
    shlex::try_join(args.iter().map(String::as_str)).unwrap_or_else(|error| {
        let (kept, dropped): (Vec<&String>, Vec<&String>) =
            args.iter().partition(|a| !a.contains('\0'));
        warn!(?dropped, "{error}; dropping arguments that cannot be quoted");
        shlex::try_join(kept.into_iter().map(String::as_str)).unwrap_or_default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visibility_follows_the_leaf_name() {
        assert_eq!(leaf_name("//lib/net:Socket"), "Socket");
        assert_eq!(leaf_name("lib/net/Socket"), "Socket");
        assert_eq!(leaf_name("Top"), "Top");

        assert!(is_visible("//lib:A"));
        assert!(!is_visible("//lib:helper"));
        assert!(!is_visible("//lib/Upper:_x"));
        assert!(!is_visible("//lib:"));
    }

    #[test]
    fn shell_args_are_quoted() {
        let args = vec!["--name".to_string(), "two words".to_string()];
        assert_eq!(shlex::split(&shell_args(&args)), Some(args));
        assert_eq!(shell_args(&[]), "");
    }

    #[test_log::test]
    fn unquotable_arguments_are_left_out() {
        let args = vec![
            "--name".to_string(),
            "bad\0arg".to_string(),
            "two words".to_string(),
        ];
        let joined = shell_args(&args);
        assert!(!joined.contains('\0'));
        assert_eq!(
            shlex::split(&joined).unwrap(),
            ["--name", "two words"]
        );
    }
}
