//! Report errors
//!
//! Missing artifacts are not errors: they render as placeholders and show up
//! in [`Report::warnings`](crate::Report::warnings).

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReportError>;

#[derive(Debug, Error)]
pub enum ReportError {
    /// The report template document could not be parsed
    #[error("Invalid report template {origin}: {message}")]
    Template { origin: String, message: String },

    /// The report template document could not be read
    #[error("Failed to read report template {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// HTML rendering failed
    #[error("Failed to render report: {0}")]
    Render(#[from] minijinja::Error),
}
