//! Subcommand implementations

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use niflow_config::PipelineConfig;
use niflow_report::{assemble, ReportInputs, ReportTemplate};
use node_engine::{
    freeze, CacheStore, DiskCache, ExecutionPlan, InterfaceRegistry, MemoryCache, RunReport,
    Scheduler, SchedulerConfig,
};
use tokio_util::sync::CancellationToken;

/// Flags of `niflow run`
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub max_concurrency: Option<usize>,
    pub cache_dir: Option<PathBuf>,
    pub no_cache: bool,
    pub report: Option<PathBuf>,
}

/// A pipeline loaded, built and frozen
pub struct Loaded {
    pub config: PipelineConfig,
    pub registry: InterfaceRegistry,
    pub plan: ExecutionPlan,
}

/// Load a pipeline document and freeze it into a plan
pub fn load(path: &Path) -> Result<Loaded> {
    let config = PipelineConfig::from_path(path)
        .with_context(|| format!("failed to load pipeline {}", path.display()))?;
    let registry = config.registry()?;
    let presets = config.load_presets()?;
    let graph = config.build(&registry, &presets)?;
    let plan = freeze(&graph).with_context(|| format!("pipeline '{}' is invalid", config.name))?;
    Ok(Loaded {
        config,
        registry,
        plan,
    })
}

/// `niflow validate`: build and freeze without running anything
pub fn validate(path: &Path) -> Result<ExecutionPlan> {
    let loaded = load(path)?;
    for (i, layer) in loaded.plan.layers().iter().enumerate() {
        log::debug!("Layer {}: {}", i, layer.join(", "));
    }
    Ok(loaded.plan)
}

/// `niflow run`: execute the pipeline and write the report if configured
pub async fn run(path: &Path, options: &RunOptions, cancel: CancellationToken) -> Result<RunReport> {
    let Loaded {
        config,
        registry,
        plan,
    } = load(path)?;

    let cache: Arc<dyn CacheStore> = if options.no_cache {
        Arc::new(MemoryCache::new())
    } else {
        let dir = options
            .cache_dir
            .clone()
            .unwrap_or_else(|| config.cache_path());
        log::info!("Using cache at {}", dir.display());
        Arc::new(DiskCache::new(dir))
    };

    let mut scheduler_config = SchedulerConfig::default();
    if let Some(max) = options.max_concurrency.or(config.max_concurrency) {
        scheduler_config.max_concurrency = max.max(1);
    }

    let report = Scheduler::new(Arc::new(registry), cache)
        .with_work_dir(config.work_path())
        .run_with_config(&plan, &scheduler_config, cancel)
        .await;

    if let Err(err) = write_report(&config, &plan, &report, options.report.as_deref()) {
        log::warn!("Run finished but the report could not be written: {:#}", err);
    }
    Ok(report)
}

fn write_report(
    config: &PipelineConfig,
    plan: &ExecutionPlan,
    run: &RunReport,
    output_override: Option<&Path>,
) -> Result<()> {
    let Some(decl) = &config.report else {
        if output_override.is_some() {
            log::warn!(
                "Pipeline '{}' has no report section; --report ignored",
                config.name
            );
        }
        return Ok(());
    };

    let template_path = config.resolve_path(&decl.template);
    let template = ReportTemplate::from_path(&template_path)?;
    let report = assemble(&template, &ReportInputs::from_run_report(run, plan))?;

    let output = output_override
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.resolve_path(&decl.output));
    report
        .write(&output)
        .with_context(|| format!("failed to write report {}", output.display()))?;
    log::info!("Wrote report to {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use node_engine::{NodeState, RunStatus};

    const PIPELINE: &str = r#"
name: qc
max_concurrency: 2
nodes:
  - {id: anat, interface: identity, inputs: {value: {cjv: 0.4}}}
  - {id: merge, interface: merge-metrics}
edges:
  - {from: anat.value, to: merge.in1}
report:
  template: report.yaml
  output: out/report.html
"#;

    fn write_pipeline(dir: &Path, text: &str) -> PathBuf {
        std::fs::write(
            dir.join("report.yaml"),
            "title: QC\nsections:\n  - name: metrics\n    metrics: [merge.metrics]\n",
        )
        .unwrap();
        let path = dir.join("pipeline.yaml");
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_validate() {
        let temp = tempfile::tempdir().unwrap();
        let path = write_pipeline(temp.path(), PIPELINE);
        let plan = validate(&path).unwrap();
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn test_validate_reports_context() {
        let temp = tempfile::tempdir().unwrap();
        let path = write_pipeline(temp.path(), "name: qc\nnodes: [{id: a, interface: nope}]\n");
        let err = validate(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("nodes[0].interface"));
    }

    #[tokio::test]
    async fn test_run_writes_report_and_caches() {
        let temp = tempfile::tempdir().unwrap();
        let path = write_pipeline(temp.path(), PIPELINE);

        let first = run(&path, &RunOptions::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.status, RunStatus::Succeeded);
        assert_eq!(first.state("merge"), Some(NodeState::Succeeded));
        let html = std::fs::read_to_string(temp.path().join("out/report.html")).unwrap();
        assert!(html.contains("merge.metrics.cjv"));

        let second = run(&path, &RunOptions::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.cache_hits(), 2);
        assert_eq!(second.invocations(), 0);
        assert!(temp.path().join(".niflow/cache").is_dir());
    }

    #[tokio::test]
    async fn test_no_cache_and_report_override() {
        let temp = tempfile::tempdir().unwrap();
        let path = write_pipeline(temp.path(), PIPELINE);
        let options = RunOptions {
            no_cache: true,
            report: Some(temp.path().join("elsewhere.html")),
            ..RunOptions::default()
        };

        let report = run(&path, &options, CancellationToken::new()).await.unwrap();
        assert!(report.succeeded());
        assert!(temp.path().join("elsewhere.html").is_file());
        assert!(!temp.path().join(".niflow/cache").exists());
    }

    #[tokio::test]
    async fn test_missing_report_template_keeps_run_result() {
        let temp = tempfile::tempdir().unwrap();
        let path = write_pipeline(
            temp.path(),
            &PIPELINE.replace("template: report.yaml", "template: missing.yaml"),
        );
        let options = RunOptions {
            no_cache: true,
            ..RunOptions::default()
        };

        let report = run(&path, &options, CancellationToken::new()).await.unwrap();
        assert!(report.succeeded());
        assert_eq!(report.state("merge"), Some(NodeState::Succeeded));
        assert!(!temp.path().join("out/report.html").exists());
    }
}
