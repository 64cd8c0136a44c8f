//! Report templates
//!
//! A report template lists sections, each naming the artifacts
//! (`node.output` keys) and metrics it shows:
//!
//! ```yaml
//! title: Anatomical preprocessing
//! sections:
//!   - name: registration
//!     title: Spatial normalization
//!     outputs: [reg.warped_image_plot]
//!     metrics: [qc.metrics]
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ReportError, Result};

/// Layout of a report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportTemplate {
    pub title: String,
    #[serde(default)]
    pub sections: Vec<SectionSpec>,
}

/// One report section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SectionSpec {
    /// Anchor name, unique within the report
    pub name: String,
    /// Heading; defaults to `name`
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Artifact keys (`node.output`) shown in order
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Metric keys (`node.output`) shown as a table
    #[serde(default)]
    pub metrics: Vec<String>,
}

impl SectionSpec {
    pub fn heading(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.name)
    }
}

impl ReportTemplate {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| ReportError::Template {
            origin: "(inline)".to_string(),
            message: e.to_string(),
        })
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ReportError::Template {
            origin: "(inline)".to_string(),
            message: e.to_string(),
        })
    }

    /// Load from disk; `.json` files are parsed as JSON, anything else as YAML
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ReportError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let parsed = if is_json {
            Self::from_json_str(&text)
        } else {
            Self::from_yaml_str(&text)
        };
        parsed.map_err(|e| match e {
            ReportError::Template { message, .. } => ReportError::Template {
                origin: path.display().to_string(),
                message,
            },
            other => other,
        })
    }

    /// Every key referenced by any section
    pub fn referenced_keys(&self) -> impl Iterator<Item = &str> {
        self.sections
            .iter()
            .flat_map(|s| s.outputs.iter().chain(s.metrics.iter()))
            .map(|k| k.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_yaml() {
        let template = ReportTemplate::from_yaml_str(
            "title: Anat\nsections:\n  - name: reg\n    outputs: [reg.plot]\n",
        )
        .unwrap();
        assert_eq!(template.sections[0].heading(), "reg");
        assert_eq!(template.referenced_keys().collect::<Vec<_>>(), vec!["reg.plot"]);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = ReportTemplate::from_yaml_str("title: A\nsection: []\n").unwrap_err();
        assert!(matches!(err, ReportError::Template { .. }));
    }

    #[test]
    fn test_from_path_names_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("report.json");
        std::fs::write(&path, "{\"title\": 3}").unwrap();
        let err = ReportTemplate::from_path(&path).unwrap_err();
        assert!(err.to_string().contains("report.json"));
    }
}
