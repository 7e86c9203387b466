//! Compile declared build targets into a Ninja build graph.
//!
//! Targets are registered on a [`Generator`], which selects the ones relevant
//! to the current invocation and realizes them against a [`BuildContext`].
//! The resulting [`BuildGraph`] is rendered into a Ninja file and returned,
//! together with target and flag metadata, as a [`GeneratorOutput`].

pub mod catalog;
pub mod context;
pub mod error;
pub mod flags;
pub mod generator;
pub mod graph;
pub mod ninja;
pub mod path;
pub mod protocol;
pub mod target;

// Re-exports for convenience
pub use catalog::{Catalog, Filter, Mode, Selectors};
pub use context::BuildContext;
pub use error::{Error, Result};
pub use flags::{FlagKind, FlagRegistry, FlagSpec, FlagValue};
pub use generator::Generator;
pub use graph::{BuildGraph, BuildStep, DepsFormat, Pool, Rule, Step};
pub use path::{BuildPath, GlobalPath, OutputPath, Roots, SourcePath};
pub use protocol::{GeneratorInput, GeneratorOutput};
pub use target::{Buildable, Runnable, Target, Testable};
