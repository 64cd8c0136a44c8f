//! Report assembly
//!
//! Collects run artifacts and metrics into the sections of a
//! [`ReportTemplate`] and renders one self-contained HTML page. SVG
//! reportlets are embedded inline; other files are linked. Anything a section
//! asks for that the run did not produce renders a placeholder and is listed
//! in [`Report::warnings`], so a partially failed run still yields a report.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use minijinja::{context, Environment};
use node_engine::{ExecutionPlan, PortDataType, RunReport};
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::template::ReportTemplate;

const REPORT_TEMPLATE: &str = include_str!("../templates/report.html");
const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "gif"];

/// Artifacts and metrics available to a report, keyed `node.output`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportInputs {
    pub artifacts: BTreeMap<String, PathBuf>,
    pub metrics: BTreeMap<String, Value>,
}

impl ReportInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_artifact(mut self, key: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.artifacts.insert(key.into(), path.into());
        self
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }

    /// Collect the outputs of a finished run
    ///
    /// File-typed outputs become artifacts, JSON/number/boolean outputs
    /// become metrics. Outputs of failed or skipped nodes are simply absent.
    pub fn from_run_report(report: &RunReport, plan: &ExecutionPlan) -> Self {
        let mut inputs = Self::new();
        for node in plan.nodes() {
            for spec in &node.interface.outputs {
                let Some(value) = report.output(&node.id, &spec.name) else {
                    continue;
                };
                let key = format!("{}.{}", node.id, spec.name);
                match (spec.data_type, value) {
                    (data_type, Value::String(path)) if data_type.is_file_like() => {
                        inputs.artifacts.insert(key, PathBuf::from(path));
                    }
                    (PortDataType::String, _) => {}
                    (PortDataType::Any, Value::String(_)) => {}
                    _ => {
                        inputs.metrics.insert(key, value.clone());
                    }
                }
            }
        }
        inputs
    }
}

/// A rendered report
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub html: String,
    /// One entry per placeholder rendered
    pub warnings: Vec<String>,
}

impl Report {
    pub fn is_complete(&self) -> bool {
        self.warnings.is_empty()
    }

    /// Write the HTML, creating parent directories
    pub fn write(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &self.html)
    }
}

#[derive(Debug, Serialize)]
struct SectionView<'a> {
    name: &'a str,
    heading: &'a str,
    description: Option<&'a str>,
    artifacts: Vec<ArtifactView>,
    metrics: Vec<MetricView>,
}

#[derive(Debug, Serialize)]
struct ArtifactView {
    key: String,
    /// `svg`, `image`, `link` or `missing`
    kind: &'static str,
    href: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct MetricView {
    key: String,
    value: Option<String>,
}

/// Render `template` with whatever `inputs` provides
pub fn assemble(template: &ReportTemplate, inputs: &ReportInputs) -> Result<Report> {
    let mut warnings = Vec::new();
    let mut sections = Vec::with_capacity(template.sections.len());

    for section in &template.sections {
        let mut missing = |what: &str, key: &str, reason: &str| {
            let warning = format!("{} '{}' {}", what, key, reason);
            log::warn!("Report section '{}': {}", section.name, warning);
            warnings.push(warning);
        };

        let mut artifacts = Vec::with_capacity(section.outputs.len());
        for key in &section.outputs {
            let view = match inputs.artifacts.get(key) {
                Some(path) => artifact_view(key, path),
                None => Err("was not produced".to_string()),
            };
            artifacts.push(view.unwrap_or_else(|reason| {
                missing("output", key, &reason);
                ArtifactView {
                    key: key.clone(),
                    kind: "missing",
                    href: None,
                    content: None,
                }
            }));
        }

        let mut metrics = Vec::new();
        for key in &section.metrics {
            match inputs.metrics.get(key) {
                Some(Value::Object(fields)) => {
                    metrics.extend(fields.iter().map(|(field, value)| MetricView {
                        key: format!("{}.{}", key, field),
                        value: Some(format_metric(value)),
                    }));
                }
                Some(value) => metrics.push(MetricView {
                    key: key.clone(),
                    value: Some(format_metric(value)),
                }),
                None => {
                    missing("metric", key, "was not produced");
                    metrics.push(MetricView {
                        key: key.clone(),
                        value: None,
                    });
                }
            }
        }

        sections.push(SectionView {
            name: &section.name,
            heading: section.heading(),
            description: section.description.as_deref(),
            artifacts,
            metrics,
        });
    }

    let mut env = Environment::new();
    env.add_template("report.html", REPORT_TEMPLATE)?;
    let html = env.get_template("report.html")?.render(context! {
        title => &template.title,
        sections => sections,
        warnings => &warnings,
    })?;

    log::info!(
        "Assembled report '{}' with {} sections ({} placeholders)",
        template.title,
        template.sections.len(),
        warnings.len()
    );
    Ok(Report { html, warnings })
}

fn artifact_view(key: &str, path: &Path) -> std::result::Result<ArtifactView, String> {
    if !path.is_file() {
        return Err(format!("is missing on disk ({})", path.display()));
    }
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    let href = path.display().to_string();

    let view = if extension == "svg" {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("could not be read ({})", e))?;
        ArtifactView {
            key: key.to_string(),
            kind: "svg",
            href: Some(href),
            content: Some(strip_xml_prolog(&content).to_string()),
        }
    } else {
        let kind = if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
            "image"
        } else {
            "link"
        };
        ArtifactView {
            key: key.to_string(),
            kind,
            href: Some(href),
            content: None,
        }
    };
    Ok(view)
}

/// Inline SVG must not carry an `<?xml ...?>` declaration
fn strip_xml_prolog(svg: &str) -> &str {
    let trimmed = svg.trim_start();
    if trimmed.starts_with("<?xml") {
        if let Some(end) = trimmed.find("?>") {
            return trimmed[end + 2..].trim_start();
        }
    }
    trimmed
}

fn format_metric(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
