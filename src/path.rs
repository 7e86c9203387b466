//! Paths rooted in the source tree, the output tree, or the system.
//!
//! Every path handed to the build context is one of three kinds:
//!
//! - [`SourcePath`]: relative to the read-only source root.
//! - [`OutputPath`]: relative to the mutable output root. This is the only kind
//!   that may be produced by a build step.
//! - [`GlobalPath`]: an absolute location resolved outside of the workspace,
//!   e.g. a compiler binary.
//!
//! Identity of every kind is its resolved absolute location, so two relative
//! spellings of the same file compare equal.

use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
    sync::Arc,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path `{0}` must be relative to its root")]
    NotRelative(String),

    #[error("path `{0}` escapes its root")]
    EscapesRoot(String),

    #[error("path `{0}` is empty after normalization")]
    Empty(String),

    #[error("global path `{0}` must be absolute")]
    NotAbsolute(String),

    #[error("path {0:?} contains a line break")]
    LineBreak(String),

    #[error("extension `{0}` must not contain a path separator")]
    InvalidExtension(String),
}

/// The source and output roots of one generator run.
///
/// Roots are fixed for the lifetime of the process. Paths keep a shared
/// handle to them so that derivations always land in the right tree.
#[derive(Debug, PartialEq, Eq)]
pub struct Roots {
    source: PathBuf,
    output: PathBuf,
}

impl Roots {
    pub fn new(source: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            source: source.into(),
            output: output.into(),
        })
    }

    pub fn source_root(&self) -> &Path {
        &self.source
    }

    pub fn output_root(&self) -> &Path {
        &self.output
    }

    /// Create a path relative to the source root.
    pub fn src(self: &Arc<Self>, relative: impl AsRef<str>) -> Result<SourcePath, PathError> {
        Rooted::new(self, Tree::Source, relative.as_ref()).map(SourcePath)
    }

    /// Create a path relative to the output root.
    pub fn out(self: &Arc<Self>, relative: impl AsRef<str>) -> Result<OutputPath, PathError> {
        Rooted::new(self, Tree::Output, relative.as_ref()).map(OutputPath)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tree {
    Source,
    Output,
}

/// Shared representation of source and output paths.
#[derive(Clone)]
struct Rooted {
    roots: Arc<Roots>,
    relative: String,
    absolute: PathBuf,
}

impl Rooted {
    fn new(roots: &Arc<Roots>, tree: Tree, relative: &str) -> Result<Self, PathError> {
        let relative = normalize(relative)?;
        let base = match tree {
            Tree::Source => &roots.source,
            Tree::Output => &roots.output,
        };
        Ok(Self {
            absolute: base.join(&relative),
            roots: Arc::clone(roots),
            relative,
        })
    }

    fn derive(&self, relative: &str) -> Result<OutputPath, PathError> {
        Rooted::new(&self.roots, Tree::Output, relative).map(OutputPath)
    }

    fn with_extension(&self, ext: &str) -> Result<OutputPath, PathError> {
        let ext = ext.strip_prefix('.').unwrap_or(ext);
        if ext.contains('/') {
            return Err(PathError::InvalidExtension(ext.to_owned()));
        }
        let name_start = self.relative.rfind('/').map_or(0, |i| i + 1);
        // A leading dot names a hidden file, not an extension.
        let stem_end = match self.relative[name_start..].rfind('.') {
            Some(0) | None => self.relative.len(),
            Some(i) => name_start + i,
        };
        let mut relative = self.relative[..stem_end].to_owned();
        if !ext.is_empty() {
            relative.push('.');
            relative.push_str(ext);
        }
        self.derive(&relative)
    }
}

/// Lexically normalize a `/`-separated relative path.
fn normalize(relative: &str) -> Result<String, PathError> {
    if relative.contains(['\n', '\r']) {
        return Err(PathError::LineBreak(relative.to_owned()));
    }
    if relative.starts_with('/') || Path::new(relative).is_absolute() {
        return Err(PathError::NotRelative(relative.to_owned()));
    }
    let mut parts: Vec<&str> = Vec::new();
    for part in relative.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(PathError::EscapesRoot(relative.to_owned()));
                }
            }
            part => parts.push(part),
        }
    }
    if parts.is_empty() {
        return Err(PathError::Empty(relative.to_owned()));
    }
    Ok(parts.join("/"))
}

macro_rules! rooted_path {
    ($name:ident) => {
        impl $name {
            /// The normalized path relative to its root.
            pub fn relative(&self) -> &str {
                &self.0.relative
            }

            pub fn absolute(&self) -> &Path {
                &self.0.absolute
            }

            /// The output file derived by replacing the extension.
            pub fn with_extension(&self, ext: &str) -> Result<OutputPath, PathError> {
                self.0.with_extension(ext)
            }

            /// The output file derived by prepending `prefix` to the relative path.
            pub fn with_prefix(&self, prefix: &str) -> Result<OutputPath, PathError> {
                self.0.derive(&format!("{prefix}{}", self.0.relative))
            }

            /// The output file derived by appending `suffix` to the relative path.
            pub fn with_suffix(&self, suffix: &str) -> Result<OutputPath, PathError> {
                self.0.derive(&format!("{}{suffix}", self.0.relative))
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.0.absolute == other.0.absolute
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.0.absolute.hash(state);
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> Ordering {
                self.0
                    .absolute
                    .as_os_str()
                    .cmp(other.0.absolute.as_os_str())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($name))
                    .field(&self.0.relative)
                    .finish()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.absolute.display())
            }
        }
    };
}

/// A file in the read-only source tree.
#[derive(Clone)]
pub struct SourcePath(Rooted);
rooted_path!(SourcePath);

/// A file in the output tree; the only kind of path a build step may produce.
#[derive(Clone)]
pub struct OutputPath(Rooted);
rooted_path!(OutputPath);

/// An absolute path outside of the workspace, such as a system tool.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalPath(PathBuf);

impl GlobalPath {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, PathError> {
        let path = path.into();
        if !path.is_absolute() {
            return Err(PathError::NotAbsolute(path.display().to_string()));
        }
        if path.to_string_lossy().contains(['\n', '\r']) {
            return Err(PathError::LineBreak(path.display().to_string()));
        }
        Ok(Self(path))
    }

    pub fn absolute(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for GlobalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Any path that may appear as a build step input.
#[derive(Clone, Debug)]
pub enum BuildPath {
    Source(SourcePath),
    Output(OutputPath),
    Global(GlobalPath),
}

impl BuildPath {
    pub fn absolute(&self) -> &Path {
        match self {
            BuildPath::Source(p) => p.absolute(),
            BuildPath::Output(p) => p.absolute(),
            BuildPath::Global(p) => p.absolute(),
        }
    }

    pub fn as_output(&self) -> Option<&OutputPath> {
        match self {
            BuildPath::Output(p) => Some(p),
            _ => None,
        }
    }
}

impl PartialEq for BuildPath {
    fn eq(&self, other: &Self) -> bool {
        self.absolute() == other.absolute()
    }
}

impl Eq for BuildPath {}

impl Hash for BuildPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.absolute().hash(state);
    }
}

impl PartialOrd for BuildPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BuildPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.absolute()
            .as_os_str()
            .cmp(other.absolute().as_os_str())
    }
}

impl fmt::Display for BuildPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.absolute().display())
    }
}

impl From<SourcePath> for BuildPath {
    fn from(p: SourcePath) -> Self {
        BuildPath::Source(p)
    }
}

impl From<OutputPath> for BuildPath {
    fn from(p: OutputPath) -> Self {
        BuildPath::Output(p)
    }
}

impl From<GlobalPath> for BuildPath {
    fn from(p: GlobalPath) -> Self {
        BuildPath::Global(p)
    }
}

impl From<&SourcePath> for BuildPath {
    fn from(p: &SourcePath) -> Self {
        BuildPath::Source(p.clone())
    }
}

impl From<&OutputPath> for BuildPath {
    fn from(p: &OutputPath) -> Self {
        BuildPath::Output(p.clone())
    }
}

impl From<&GlobalPath> for BuildPath {
    fn from(p: &GlobalPath) -> Self {
        BuildPath::Global(p.clone())
    }
}
