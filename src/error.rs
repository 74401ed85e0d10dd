//! Error types for container operations and codelet execution.

use std::fmt;

/// Error type covering every failure mode of the crate.
#[derive(Debug)]
pub enum Error {
    /// An invariant of the data model was violated (illegal tag transition,
    /// cyclic dependencies, dummy replacement of a primary input, ...).
    Invariant(String),
    /// An operation tried to touch an item owned by another codelet.
    PermissionDenied(String),
    /// A calclet imported a module outside the allowed set.
    ForbiddenImport(String),
    /// A container path does not exist.
    MissingItem(String),
    /// A codelet script failed; the payload is the rewritten traceback.
    CodeletFailed(String),
    /// A paper reference could not be resolved or opened.
    Reference(String),
    /// The container header, version or a stored value has the wrong shape.
    Format(String),
    /// IO error from the underlying file system.
    Io(std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Invariant(msg) => write!(f, "invariant violation: {}", msg),
            Error::PermissionDenied(msg) => write!(f, "permission denied: {}", msg),
            Error::ForbiddenImport(name) => write!(f, "import of {} not allowed", name),
            Error::MissingItem(path) => write!(f, "no such item: {}", path),
            Error::CodeletFailed(tb) => write!(f, "codelet execution failed:\n{}", tb),
            Error::Reference(msg) => write!(f, "reference resolution failed: {}", msg),
            Error::Format(msg) => write!(f, "format error: {}", msg),
            Error::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Format(e.to_string())
    }
}

impl Error {
    /// Convert into a rhai runtime error so it surfaces inside a codelet.
    pub(crate) fn into_script(self) -> Box<rhai::EvalAltResult> {
        Box::new(rhai::EvalAltResult::ErrorRuntime(
            rhai::Dynamic::from(self.to_string()),
            rhai::Position::NONE,
        ))
    }
}
