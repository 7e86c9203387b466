use std::{fmt, io, path::PathBuf};

use crate::{catalog::CatalogError, flags::FlagError, graph::GraphError, path::PathError};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The stack of targets and sub-steps being realized when something happened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trace(pub Vec<String>);

impl Trace {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return Ok(());
        }
        write!(f, "\n  while building: {}", self.0.join(" > "))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error("{error}{trace}")]
    Flag { error: FlagError, trace: Trace },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// A failure reported by a target's own build logic.
    #[error("{message}{trace}")]
    Target { message: String, trace: Trace },

    #[error("unsupported generator protocol version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("cannot access {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("malformed JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl From<FlagError> for Error {
    fn from(error: FlagError) -> Self {
        Error::Flag {
            error,
            trace: Trace::default(),
        }
    }
}
