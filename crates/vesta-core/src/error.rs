//! Error types for vesta-core.

use thiserror::Error;

use crate::graph::CellId;

/// Result type for vesta-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in vesta-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to parse cell source.
    #[error("parse error: {0}")]
    Parse(String),

    /// Two cells define the same global name.
    #[error("name '{name}' is defined by both {first} and {second}")]
    DefinitionConflict {
        name: String,
        first: CellId,
        second: CellId,
    },

    /// Cyclic dependency detected in the cell graph.
    #[error("cyclic dependency detected: {0}")]
    CyclicDependency(String),

    /// The setup cell violates its contract.
    #[error("invalid setup cell: {0}")]
    InvalidSetupCell(String),

    /// Cell not found.
    #[error("cell not found: {0}")]
    CellNotFound(String),

    /// No value holder registered under the given object id.
    #[error("value holder not found: {0}")]
    HolderNotFound(String),

    /// A cell failed while being invoked outside the interactive session.
    #[error("execution of {cell} failed: {message}")]
    Execution { cell: String, message: String },

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Invalid operation (e.g., running a notebook whose graph failed to build).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error comes from graph construction.
    ///
    /// Build errors leave the notebook loadable but unexecutable.
    pub fn is_build_error(&self) -> bool {
        matches!(
            self,
            Error::Parse(_)
                | Error::DefinitionConflict { .. }
                | Error::CyclicDependency(_)
                | Error::InvalidSetupCell(_)
        )
    }
}
