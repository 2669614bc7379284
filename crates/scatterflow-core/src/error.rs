//! Error taxonomy for the reduction dataflow engine.
//!
//! One enum covers every fallible surface named in the engine's contract.
//! Recovery is the caller's responsibility except for [`Error::MissingFile`],
//! which the engine itself retries once after a cache-invalidating mtime
//! refresh (see [`crate::engine::Engine::calc_terminal`]).

use crate::template::ModuleIndex;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong evaluating a template.
///
/// Variants are never constructed for a successful-but-unusual outcome:
/// [`Error::Cancelled`] included, a cancelled evaluation is a regular
/// `Err` at the API boundary even though callers should not treat it as
/// a fault. The LM solver's own termination codes are a separate type
/// ([`crate::lm::LmStatus`]) and never appear here.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A template referenced a module id the registry doesn't know, or a
    /// wire pointed at a node/terminal that doesn't exist.
    #[error("invalid template: {reason}")]
    InvalidTemplate {
        /// Human-readable description of what was wrong.
        reason: String,
    },

    /// Structural validation failed: datatype mismatch, duplicate singleton
    /// input, or similar static inconsistency.
    #[error("validation error ({kind}) at {location}")]
    ValidationError {
        /// Short machine-stable category, e.g. `"datatype_mismatch"`.
        kind: String,
        /// Where in the template the problem was found.
        location: String,
    },

    /// The wire graph contains a cycle; `nodes` is the residual set left
    /// over once every node with no remaining unresolved dependent has
    /// been extracted.
    #[error("cyclic dependency among nodes {nodes:?}")]
    CyclicDependency {
        /// Indices of the nodes that form (or are reachable only through) a cycle.
        nodes: Vec<ModuleIndex>,
    },

    /// A `fileinfo` field referenced a path that the file-store can't
    /// currently serve, or whose mtime no longer matches.
    ///
    /// This is the one kind with automatic recovery: the engine refreshes
    /// mtimes and retries once before surfacing it to the caller.
    #[error("missing file: source={source_name:?} path={path}")]
    MissingFile {
        /// The file-store source name the path was resolved against.
        source_name: String,
        /// The path that could not be read.
        path: String,
    },

    /// The file-store transport itself failed (network error, permission
    /// denied, etc.) — distinct from [`Error::MissingFile`], which means
    /// "the store answered, but the file isn't there / is stale".
    #[error("file-store I/O error: {0}")]
    IoError(String),

    /// A module action raised an error while computing its outputs.
    #[error("module {node:?} ({module_id}) failed: {message}")]
    ModuleError {
        /// Index of the failing node within the template.
        node: ModuleIndex,
        /// The module definition id that was being evaluated.
        module_id: String,
        /// Free-form diagnostic text surfaced by the action.
        message: String,
    },

    /// The caller's cancellation token was observed at a suspension point.
    #[error("evaluation cancelled")]
    Cancelled,

    /// The template-reload codec didn't recognize the file's magic bytes.
    #[error("unsupported template-reload format")]
    UnsupportedFormat,

    /// The template-reload codec recognized the format but the embedded
    /// header was not valid JSON/YAML.
    #[error("malformed template-reload header: {0}")]
    MalformedHeader(String),
}

impl Error {
    /// Shorthand for [`Error::InvalidTemplate`].
    pub fn invalid_template(reason: impl Into<String>) -> Self {
        Error::InvalidTemplate {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`Error::ValidationError`].
    pub fn validation(kind: impl Into<String>, location: impl Into<String>) -> Self {
        Error::ValidationError {
            kind: kind.into(),
            location: location.into(),
        }
    }

    /// True for the one kind the engine is allowed to retry automatically.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::MissingFile { .. })
    }
}
