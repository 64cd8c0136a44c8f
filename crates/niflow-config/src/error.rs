//! Configuration errors
//!
//! Every variant names the offending location as a dotted key path
//! (`presets.t1-mni_registration.dimension`, `nodes[2].interface`) so a bad
//! document can be fixed without guessing.

use std::path::PathBuf;

use node_engine::GraphError;
use thiserror::Error;

/// Result type alias using ConfigError
pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document is not valid JSON/YAML or does not match the schema
    #[error("Failed to parse {origin}: {message}")]
    Parse { origin: String, message: String },

    /// The document parsed but its structure is wrong at `path`
    #[error("Invalid configuration at '{path}': {reason}")]
    Malformed { path: String, reason: String },

    /// A preset sets a parameter the target interface does not declare
    #[error("Unknown parameter '{path}'")]
    UnknownParameter { path: String },

    /// A preset value has the wrong type for its parameter
    #[error("Invalid value at '{path}': {reason}")]
    InvalidValue { path: String, reason: String },

    /// No preset with this name (or flavored variant) exists
    #[error("Unknown preset '{0}'")]
    UnknownPreset(String),

    /// Building the graph described at `path` failed
    #[error("Invalid workflow at '{path}': {source}")]
    Graph {
        path: String,
        #[source]
        source: GraphError,
    },

    /// A referenced file could not be read
    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub(crate) fn malformed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn graph(path: impl Into<String>, source: GraphError) -> Self {
        Self::Graph {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_key_path() {
        let err = ConfigError::UnknownParameter {
            path: "presets.t1-mni_registration.dimensions".into(),
        };
        assert_eq!(
            err.to_string(),
            "Unknown parameter 'presets.t1-mni_registration.dimensions'"
        );

        let err = ConfigError::graph("edges[0]", GraphError::UnknownNode("bet".into()));
        assert_eq!(err.to_string(), "Invalid workflow at 'edges[0]': Unknown node 'bet'");
    }
}
