//! The JSON documents exchanged with the invoking tool.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    catalog::{Mode, Selectors},
    error::Error,
    flags::FlagSnapshot,
};

/// Version of the request and response documents understood by this crate.
pub const FORMAT_VERSION: u32 = 1;

/// The exported view of one flag.
pub type FlagInfo = FlagSnapshot;

/// The request document of one generator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorInput {
    pub version: u32,
    pub source_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub cmdline_flags: BTreeMap<String, String>,
    #[serde(default)]
    pub workspace_flags: BTreeMap<String, String>,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub run_args: Vec<String>,
    #[serde(default)]
    pub test_args: Vec<String>,
    #[serde(default)]
    pub selectors: Selectors,
    /// Only collect target and flag metadata, without realizing anything or
    /// writing state.
    #[serde(default)]
    pub completions_only: bool,
    #[serde(default)]
    pub persist_flags: bool,
    /// Also fill in the response fields of older tool versions.
    #[serde(default)]
    pub legacy: bool,
    #[serde(default)]
    pub export_graph: bool,
}

impl GeneratorInput {
    pub fn new(source_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            version: FORMAT_VERSION,
            source_dir: source_dir.into(),
            working_dir: None,
            output_dir: output_dir.into(),
            cmdline_flags: BTreeMap::new(),
            workspace_flags: BTreeMap::new(),
            mode: Mode::default(),
            run_args: Vec::new(),
            test_args: Vec::new(),
            selectors: Selectors::default(),
            completions_only: false,
            persist_flags: false,
            legacy: false,
            export_graph: false,
        }
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        read_json(path)
    }

    /// The directory the user invoked the tool from.
    pub fn working_dir(&self) -> &Path {
        self.working_dir.as_deref().unwrap_or(&self.source_dir)
    }
}

/// Metadata of one public target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub description: String,
    pub runnable: bool,
    pub testable: bool,
    pub report: bool,
    pub selected: bool,
}

/// The response document of one generator run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneratorOutput {
    pub ninja_file: String,
    pub targets: BTreeMap<String, TargetInfo>,
    pub flags: BTreeMap<String, FlagInfo>,
    pub comp_db_rules: Vec<String>,
    pub selected_targets: Vec<String>,
    /// The step dependency graph in Graphviz DOT format, if requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_graph: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_flags: Option<BTreeMap<String, String>>,
}

impl GeneratorOutput {
    pub fn load(path: &Path) -> Result<Self, Error> {
        read_json(path)
    }

    pub fn write(&self, path: &Path) -> Result<(), Error> {
        let data = serde_json::to_vec_pretty(self).map_err(|source| Error::Json {
            path: path.to_owned(),
            source,
        })?;
        fs::write(path, data).map_err(|source| Error::Io {
            path: path.to_owned(),
            source,
        })
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, Error> {
    let data = fs::read(path).map_err(|source| Error::Io {
        path: path.to_owned(),
        source,
    })?;
    serde_json::from_slice(&data).map_err(|source| Error::Json {
        path: path.to_owned(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_fields_default() {
        let input: GeneratorInput = serde_json::from_str(
            r#"{"version": 1, "source_dir": "/ws/src", "output_dir": "/ws/out"}"#,
        )
        .unwrap();
        assert_eq!(input, GeneratorInput::new("/ws/src", "/ws/out"));
        assert_eq!(input.working_dir(), Path::new("/ws/src"));
        assert_eq!(input.mode, Mode::Build);
    }

    #[test]
    fn request_reads_mode_and_selectors() {
        let input: GeneratorInput = serde_json::from_str(
            r#"{
                "version": 1,
                "source_dir": "/ws/src",
                "working_dir": "/ws/src/lib",
                "output_dir": "/ws/out",
                "mode": "test",
                "selectors": {"include": ["//lib:.*"]},
                "test_args": ["-v"]
            }"#,
        )
        .unwrap();
        assert_eq!(input.mode, Mode::Test);
        assert_eq!(input.selectors.include, ["//lib:.*"]);
        assert!(input.selectors.exclude.is_empty());
        assert_eq!(input.working_dir(), Path::new("/ws/src/lib"));
        assert_eq!(input.test_args, ["-v"]);
    }

    #[test]
    fn optional_response_fields_are_omitted() {
        let json = serde_json::to_value(GeneratorOutput::default()).unwrap();
        let obj = json.as_object().unwrap();
        assert!(obj.contains_key("ninja_file"));
        assert!(!obj.contains_key("dependency_graph"));
        assert!(!obj.contains_key("build_dir"));
        assert!(!obj.contains_key("build_flags"));
    }
}
