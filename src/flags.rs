//! Typed, named configuration flags.
//!
//! A flag is declared once, and its value is resolved on first access from the
//! highest-priority source that provides one:
//!
//! 1. the command line of this invocation,
//! 2. the persisted flag state of the output directory,
//! 3. the workspace defaults,
//! 4. the flag's own default function.
//!
//! Once the target graph has been built the registry is locked. From then on
//! every access fails, and no new flag may be declared.

use std::{
    collections::BTreeMap,
    fmt, fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tracing::{debug, warn};

/// Name of the persisted flag state file inside the output directory.
pub const STATE_FILE_NAME: &str = "FLAGS.json";

#[derive(Debug, thiserror::Error)]
pub enum FlagError {
    #[error(
        "flag `{0}` accessed after registration was closed; flags must only be read while the target graph is being built"
    )]
    Locked(SmolStr),

    #[error("flag `{0}` is declared more than once")]
    Duplicate(SmolStr),

    #[error("unknown flag `{0}`")]
    Unknown(SmolStr),

    #[error("flag `{0}` has no value; pass it on the command line or set a workspace default")]
    Unresolved(SmolStr),

    #[error("flag `{name}`: `{value}` is not a valid {kind} value")]
    InvalidValue {
        name: SmolStr,
        value: String,
        kind: FlagKind,
    },

    #[error("flag `{name}`: `{value}` is not one of the allowed values ({allowed})")]
    NotAllowed {
        name: SmolStr,
        value: String,
        allowed: String,
    },

    #[error("flag `{name}` holds {actual} values, not {expected}")]
    KindMismatch {
        name: SmolStr,
        expected: FlagKind,
        actual: FlagKind,
    },

    #[error("cannot write flag state file {}: {source}", path.display())]
    Persist { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagKind {
    String,
    Bool,
    Int,
    Float,
}

impl fmt::Display for FlagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FlagKind::String => "string",
            FlagKind::Bool => "bool",
            FlagKind::Int => "int",
            FlagKind::Float => "float",
        })
    }
}

/// A resolved flag value.
#[derive(Debug, Clone, PartialEq)]
pub enum FlagValue {
    String(String),
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl FlagValue {
    pub fn kind(&self) -> FlagKind {
        match self {
            FlagValue::String(_) => FlagKind::String,
            FlagValue::Bool(_) => FlagKind::Bool,
            FlagValue::Int(_) => FlagKind::Int,
            FlagValue::Float(_) => FlagKind::Float,
        }
    }

    /// Parse the string encoding of a value of the given kind.
    pub fn parse(kind: FlagKind, s: &str) -> Option<Self> {
        match kind {
            FlagKind::String => Some(FlagValue::String(s.to_owned())),
            FlagKind::Bool => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Some(FlagValue::Bool(true)),
                "false" | "0" | "no" | "off" => Some(FlagValue::Bool(false)),
                _ => None,
            },
            FlagKind::Int => s.trim().parse().ok().map(FlagValue::Int),
            FlagKind::Float => s.trim().parse().ok().map(FlagValue::Float),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FlagValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FlagValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FlagValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            FlagValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

/// The canonical string encoding, used for persistence and snapshots.
impl fmt::Display for FlagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagValue::String(s) => f.write_str(s),
            FlagValue::Bool(b) => write!(f, "{b}"),
            FlagValue::Int(i) => write!(f, "{i}"),
            FlagValue::Float(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for FlagValue {
    fn from(s: &str) -> Self {
        FlagValue::String(s.to_owned())
    }
}

impl From<String> for FlagValue {
    fn from(s: String) -> Self {
        FlagValue::String(s)
    }
}

impl From<bool> for FlagValue {
    fn from(b: bool) -> Self {
        FlagValue::Bool(b)
    }
}

impl From<i64> for FlagValue {
    fn from(i: i64) -> Self {
        FlagValue::Int(i)
    }
}

impl From<f64> for FlagValue {
    fn from(v: f64) -> Self {
        FlagValue::Float(v)
    }
}

/// Computes a flag's fallback value. May decline by returning `None`.
pub type DefaultFn = Box<dyn Fn() -> Option<FlagValue>>;

/// The declaration of a flag.
pub struct FlagSpec {
    name: SmolStr,
    kind: FlagKind,
    description: String,
    allowed: Vec<FlagValue>,
    default: Option<DefaultFn>,
}

impl FlagSpec {
    pub fn new(name: impl Into<SmolStr>, kind: FlagKind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: String::new(),
            allowed: Vec::new(),
            default: None,
        }
    }

    pub fn string(name: impl Into<SmolStr>) -> Self {
        Self::new(name, FlagKind::String)
    }

    pub fn bool(name: impl Into<SmolStr>) -> Self {
        Self::new(name, FlagKind::Bool)
    }

    pub fn int(name: impl Into<SmolStr>) -> Self {
        Self::new(name, FlagKind::Int)
    }

    pub fn float(name: impl Into<SmolStr>) -> Self {
        Self::new(name, FlagKind::Float)
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Restrict the flag to the given set of values.
    pub fn allowed<V: Into<FlagValue>>(mut self, values: impl IntoIterator<Item = V>) -> Self {
        self.allowed = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn default_value(self, value: impl Into<FlagValue>) -> Self {
        let value = value.into();
        self.default_fn(move || Some(value.clone()))
    }

    pub fn default_fn(mut self, f: impl Fn() -> Option<FlagValue> + 'static) -> Self {
        self.default = Some(Box::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FlagKind {
        self.kind
    }
}

impl fmt::Debug for FlagSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlagSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("allowed", &self.allowed)
            .field("default", &self.default.is_some())
            .finish()
    }
}

/// Where a resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagSource {
    CommandLine,
    Persisted,
    Workspace,
    Default,
}

/// The string-encoded values supplied from outside of the flag declarations.
#[derive(Debug, Clone, Default)]
pub struct FlagSources {
    pub command_line: BTreeMap<String, String>,
    pub persisted: BTreeMap<String, String>,
    pub workspace: BTreeMap<String, String>,
}

impl FlagSources {
    /// Load the persisted values from a flag state file.
    ///
    /// A missing file is an empty source. A file that cannot be decoded is
    /// ignored, since it will be rewritten on the next persisting run.
    pub fn load_persisted(&mut self, path: &Path) -> io::Result<()> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        match serde_json::from_slice(&data) {
            Ok(persisted) => self.persisted = persisted,
            Err(e) => warn!(path = %path.display(), "ignoring corrupt flag state file: {e}"),
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Option<(FlagSource, &str)> {
        [
            (FlagSource::CommandLine, &self.command_line),
            (FlagSource::Persisted, &self.persisted),
            (FlagSource::Workspace, &self.workspace),
        ]
        .into_iter()
        .find_map(|(source, map)| map.get(name).map(|v| (source, v.as_str())))
    }
}

/// The exported view of one flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagSnapshot {
    pub description: String,
    pub kind: FlagKind,
    pub allowed: Vec<String>,
    pub value: Option<String>,
    pub source: Option<FlagSource>,
}

#[derive(Debug, Clone)]
struct Resolved {
    value: FlagValue,
    source: FlagSource,
}

struct Entry {
    spec: FlagSpec,
    resolved: Option<Resolved>,
}

/// The registry of all flags of one generator process.
pub struct FlagRegistry {
    sources: FlagSources,
    entries: IndexMap<SmolStr, Entry>,
    state_file: Option<PathBuf>,
    locked: bool,
}

impl FlagRegistry {
    pub fn new(sources: FlagSources) -> Self {
        Self {
            sources,
            entries: IndexMap::new(),
            state_file: None,
            locked: false,
        }
    }

    /// Set the file persisted values are written to by [`Self::lock_and_export`].
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Declare a flag without resolving it.
    pub fn declare(&mut self, spec: FlagSpec) -> Result<(), FlagError> {
        if self.locked {
            return Err(FlagError::Locked(spec.name));
        }
        if self.entries.contains_key(&spec.name) {
            return Err(FlagError::Duplicate(spec.name));
        }
        if let Some(bad) = spec.allowed.iter().find(|v| v.kind() != spec.kind) {
            return Err(FlagError::KindMismatch {
                name: spec.name,
                expected: spec.kind,
                actual: bad.kind(),
            });
        }
        self.entries.insert(
            spec.name.clone(),
            Entry {
                spec,
                resolved: None,
            },
        );
        Ok(())
    }

    /// Declare a flag and immediately resolve its value.
    pub fn register(&mut self, spec: FlagSpec) -> Result<FlagValue, FlagError> {
        let name = spec.name.clone();
        self.declare(spec)?;
        self.get(&name)
    }

    /// Get the value of a declared flag, resolving it on first access.
    pub fn get(&mut self, name: &str) -> Result<FlagValue, FlagError> {
        if self.locked {
            return Err(FlagError::Locked(name.into()));
        }
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| FlagError::Unknown(name.into()))?;
        if let Some(resolved) = &entry.resolved {
            return Ok(resolved.value.clone());
        }
        let resolved = resolve(&entry.spec, &self.sources)?;
        debug!(flag = name, source = ?resolved.source, value = %resolved.value, "resolved flag");
        let value = resolved.value.clone();
        entry.resolved = Some(resolved);
        Ok(value)
    }

    pub fn get_string(&mut self, name: &str) -> Result<String, FlagError> {
        match self.get(name)? {
            FlagValue::String(s) => Ok(s),
            other => Err(mismatch(name, FlagKind::String, &other)),
        }
    }

    pub fn get_bool(&mut self, name: &str) -> Result<bool, FlagError> {
        let value = self.get(name)?;
        value
            .as_bool()
            .ok_or_else(|| mismatch(name, FlagKind::Bool, &value))
    }

    pub fn get_int(&mut self, name: &str) -> Result<i64, FlagError> {
        let value = self.get(name)?;
        value
            .as_int()
            .ok_or_else(|| mismatch(name, FlagKind::Int, &value))
    }

    pub fn get_float(&mut self, name: &str) -> Result<f64, FlagError> {
        let value = self.get(name)?;
        value
            .as_float()
            .ok_or_else(|| mismatch(name, FlagKind::Float, &value))
    }

    /// Close registration and snapshot every declared flag.
    ///
    /// Flags that were declared but never read are resolved on a best-effort
    /// basis for the snapshot; one that cannot be resolved is exported without
    /// a value. When `persist` is set, every flag with a value is written to
    /// the state file, replacing it atomically.
    pub fn lock_and_export(
        &mut self,
        persist: bool,
    ) -> Result<BTreeMap<String, FlagSnapshot>, FlagError> {
        self.locked = true;

        let mut snapshot = BTreeMap::new();
        for (name, entry) in &self.entries {
            let resolved = match &entry.resolved {
                Some(r) => Some(r.clone()),
                None => resolve(&entry.spec, &self.sources).ok(),
            };
            snapshot.insert(
                name.to_string(),
                FlagSnapshot {
                    description: entry.spec.description.clone(),
                    kind: entry.spec.kind,
                    allowed: entry.spec.allowed.iter().map(|v| v.to_string()).collect(),
                    value: resolved.as_ref().map(|r| r.value.to_string()),
                    source: resolved.map(|r| r.source),
                },
            );
        }

        if persist && let Some(path) = &self.state_file {
            let values: BTreeMap<&str, &str> = snapshot
                .iter()
                .filter_map(|(k, s)| s.value.as_deref().map(|v| (k.as_str(), v)))
                .collect();
            write_state_file(path, &values).map_err(|source| FlagError::Persist {
                path: path.clone(),
                source,
            })?;
            debug!(path = %path.display(), count = values.len(), "persisted flags");
        }

        Ok(snapshot)
    }
}

fn mismatch(name: &str, expected: FlagKind, value: &FlagValue) -> FlagError {
    FlagError::KindMismatch {
        name: name.into(),
        expected,
        actual: value.kind(),
    }
}

fn resolve(spec: &FlagSpec, sources: &FlagSources) -> Result<Resolved, FlagError> {
    let resolved = if let Some((source, raw)) = sources.lookup(&spec.name) {
        let value =
            FlagValue::parse(spec.kind, raw).ok_or_else(|| FlagError::InvalidValue {
                name: spec.name.clone(),
                value: raw.to_owned(),
                kind: spec.kind,
            })?;
        Resolved { value, source }
    } else if let Some(value) = spec.default.as_ref().and_then(|f| f()) {
        if value.kind() != spec.kind {
            return Err(mismatch(&spec.name, spec.kind, &value));
        }
        Resolved {
            value,
            source: FlagSource::Default,
        }
    } else {
        return Err(FlagError::Unresolved(spec.name.clone()));
    };

    if !spec.allowed.is_empty() && !spec.allowed.contains(&resolved.value) {
        let allowed = spec
            .allowed
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(FlagError::NotAllowed {
            name: spec.name.clone(),
            value: resolved.value.to_string(),
            allowed,
        });
    }
    Ok(resolved)
}

fn write_state_file(path: &Path, values: &BTreeMap<&str, &str>) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = fs::File::create(&tmp)?;
    serde_json::to_writer_pretty(&mut file, values)?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sources(
        cmdline: &[(&str, &str)],
        persisted: &[(&str, &str)],
        ws: &[(&str, &str)],
    ) -> FlagSources {
        let map = |kv: &[(&str, &str)]| {
            kv.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };
        FlagSources {
            command_line: map(cmdline),
            persisted: map(persisted),
            workspace: map(ws),
        }
    }

    fn opt_spec() -> FlagSpec {
        FlagSpec::string("opt")
            .description("optimization level")
            .default_value("default")
    }

    #[test]
    fn precedence_falls_through_each_source() {
        let cmdline = [("opt", "cmdline")];
        let state = [("opt", "state")];
        let ws = [("opt", "ws")];
        let cases = [
            (sources(&cmdline, &state, &ws), "cmdline", FlagSource::CommandLine),
            (sources(&[], &state, &ws), "state", FlagSource::Persisted),
            (sources(&[], &[], &ws), "ws", FlagSource::Workspace),
            (sources(&[], &[], &[]), "default", FlagSource::Default),
        ];
        for (src, expected, source) in cases {
            let mut reg = FlagRegistry::new(src);
            assert_eq!(reg.register(opt_spec()).unwrap(), FlagValue::from(expected));
            let snap = reg.lock_and_export(false).unwrap();
            assert_eq!(snap["opt"].source, Some(source));
        }

        let mut reg = FlagRegistry::new(FlagSources::default());
        let err = reg.register(FlagSpec::string("opt")).unwrap_err();
        assert!(matches!(err, FlagError::Unresolved(_)));
    }

    #[test]
    fn typed_values_are_parsed_and_validated() {
        let mut reg = FlagRegistry::new(sources(
            &[("jobs", "4"), ("lto", "yes"), ("scale", "1.5"), ("mode", "fast")],
            &[],
            &[],
        ));
        assert_eq!(reg.register(FlagSpec::int("jobs")).unwrap(), FlagValue::Int(4));
        assert_eq!(reg.register(FlagSpec::bool("lto")).unwrap(), FlagValue::Bool(true));
        assert_eq!(reg.get_float("scale").unwrap_err().to_string(), "unknown flag `scale`");
        reg.declare(FlagSpec::float("scale")).unwrap();
        assert_eq!(reg.get_float("scale").unwrap(), 1.5);
        assert!(matches!(
            reg.get_string("jobs"),
            Err(FlagError::KindMismatch { .. })
        ));

        let err = reg
            .register(FlagSpec::string("mode").allowed(["debug", "release"]))
            .unwrap_err();
        assert!(matches!(err, FlagError::NotAllowed { .. }));
    }

    #[test]
    fn invalid_encoding_is_fatal() {
        let mut reg = FlagRegistry::new(sources(&[("jobs", "many")], &[], &[]));
        let err = reg.register(FlagSpec::int("jobs")).unwrap_err();
        assert_eq!(err.to_string(), "flag `jobs`: `many` is not a valid int value");
    }

    #[test]
    fn flags_are_declared_exactly_once() {
        let mut reg = FlagRegistry::new(FlagSources::default());
        reg.declare(opt_spec()).unwrap();
        assert!(matches!(reg.declare(opt_spec()), Err(FlagError::Duplicate(_))));
    }

    #[test]
    fn lock_rejects_every_later_access() {
        let mut reg = FlagRegistry::new(FlagSources::default());
        reg.register(opt_spec()).unwrap();
        reg.declare(FlagSpec::bool("unread").default_value(false)).unwrap();
        let snap = reg.lock_and_export(false).unwrap();
        assert_eq!(snap["unread"].value.as_deref(), Some("false"));

        assert!(matches!(reg.get("opt"), Err(FlagError::Locked(_))));
        assert!(matches!(reg.get("unread"), Err(FlagError::Locked(_))));
        assert!(matches!(reg.declare(FlagSpec::int("late")), Err(FlagError::Locked(_))));
    }

    #[test]
    fn persisted_state_round_trips_through_the_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);

        let mut reg = FlagRegistry::new(sources(&[("opt", "fast")], &[], &[]))
            .with_state_file(&path);
        reg.register(opt_spec()).unwrap();
        reg.declare(FlagSpec::int("missing")).unwrap();
        let snap = reg.lock_and_export(true).unwrap();
        assert_eq!(snap["missing"].value, None);

        let mut next = FlagSources::default();
        next.load_persisted(&path).unwrap();
        assert_eq!(next.persisted.len(), 1);
        assert_eq!(next.persisted["opt"], "fast");
        assert!(!dir.path().join("FLAGS.json.tmp").exists());
    }

    #[test]
    fn corrupt_state_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        fs::write(&path, "{not json").unwrap();

        let mut src = FlagSources::default();
        src.load_persisted(&path).unwrap();
        assert!(src.persisted.is_empty());

        src.load_persisted(&dir.path().join("absent.json")).unwrap();
    }
}
