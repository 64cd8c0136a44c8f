//! External command binding
//!
//! Runs an external tool (FSL, ANTs, AFNI, ...) as a black-box step.
//! Argument and output templates reference resolved inputs by name with
//! `{name}` placeholders. Uses `tokio::process::Command` for async execution
//! with timeout support; the child is killed if the step is dropped or the
//! run is cancelled.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use node_engine::{PortDataType, PortValues, StepContext, StepError, StepExecutor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;

/// Number of stderr lines kept in failure messages
const STDERR_TAIL_LINES: usize = 20;

/// File the rendered command line is written to inside the node work dir
const COMMAND_LOG: &str = "command.txt";

/// Declarative description of an external command
///
/// # Placeholders
/// - `{<input>}` - value of a resolved input
/// - `{work_dir}` - the node's scratch directory (`.` when there is none)
/// - `{node_id}` - the node id
/// - `{stdout}` - captured stdout (output templates only)
/// - `{{` / `}}` - literal braces
///
/// An argument referencing an optional input that has no value is dropped.
/// An argument that is exactly `{<input>}` where the input is an array
/// expands to one argument per element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandSpec {
    /// Program to run, looked up on `PATH`
    pub program: String,
    /// Argument templates
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Kill the process after this many seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Output port name -> value template
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            timeout_secs: None,
            outputs: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn output(mut self, port: impl Into<String>, template: impl Into<String>) -> Self {
        self.outputs.insert(port.into(), template.into());
        self
    }
}

/// Step binding that runs a [`CommandSpec`]
#[derive(Debug, Clone)]
pub struct CommandStep {
    spec: CommandSpec,
}

impl CommandStep {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Render the argument list for a set of inputs
    pub fn render_args(
        &self,
        ctx: &StepContext,
        inputs: &PortValues,
    ) -> Result<Vec<String>, StepError> {
        let scope = Scope {
            ctx,
            inputs,
            stdout: None,
        };
        let mut args = Vec::with_capacity(self.spec.args.len());
        for template in &self.spec.args {
            if let Some(Value::Array(items)) = sole_placeholder(template).and_then(|n| inputs.get(n)) {
                args.extend(items.iter().map(value_to_arg));
                continue;
            }
            if let Some(arg) = expand(template, &scope)? {
                args.push(arg);
            }
        }
        Ok(args)
    }

    fn collect_outputs(
        &self,
        ctx: &StepContext,
        inputs: &PortValues,
        stdout: &str,
        work_dir: &Path,
    ) -> Result<PortValues, StepError> {
        let scope = Scope {
            ctx,
            inputs,
            stdout: Some(stdout),
        };
        let mut outputs = PortValues::new();
        for (port, template) in &self.spec.outputs {
            let Some(rendered) = expand(template, &scope)? else {
                continue;
            };
            let data_type = ctx
                .interface
                .output(port)
                .map(|p| p.data_type)
                .unwrap_or(PortDataType::Any);
            let value = convert_output(port, data_type, rendered, work_dir)?;
            outputs.insert(port.clone(), value);
        }
        Ok(outputs)
    }

    async fn run_process(
        &self,
        ctx: &StepContext,
        args: &[String],
        work_dir: &Path,
    ) -> Result<String, StepError> {
        let mut cmd = Command::new(&self.spec.program);
        cmd.args(args)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in &self.spec.env {
            cmd.env(k, v);
        }

        let child = cmd.spawn().map_err(|e| {
            StepError::failed(format!("failed to spawn '{}': {}", self.spec.program, e))
        })?;
        let wait = child.wait_with_output();

        let output = match self.spec.timeout_secs {
            Some(secs) => tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(StepError::Cancelled),
                result = tokio::time::timeout(Duration::from_secs(secs), wait) => match result {
                    Ok(result) => result,
                    Err(_) => {
                        return Err(StepError::failed(format!(
                            "'{}' timed out after {}s",
                            self.spec.program, secs
                        )))
                    }
                },
            },
            None => tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(StepError::Cancelled),
                result = wait => result,
            },
        }
        .map_err(|e| {
            StepError::failed(format!("failed to wait for '{}': {}", self.spec.program, e))
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        log::debug!(
            "Command '{}' for '{}' exited with {:?}, stdout={} bytes, stderr={} bytes",
            self.spec.program,
            ctx.node_id,
            output.status.code(),
            stdout.len(),
            stderr.len()
        );

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(StepError::failed(format!(
                "'{}' exited with code {}: {}",
                self.spec.program,
                code,
                stderr_tail(&stderr)
            )));
        }
        Ok(stdout)
    }
}

#[async_trait]
impl StepExecutor for CommandStep {
    async fn execute(&self, ctx: &StepContext, inputs: PortValues) -> Result<PortValues, StepError> {
        let work_dir = match &ctx.work_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await.map_err(|e| {
                    StepError::failed(format!("cannot create work dir {:?}: {}", dir, e))
                })?;
                dir.clone()
            }
            None => PathBuf::from("."),
        };

        let args = self.render_args(ctx, &inputs)?;
        log::debug!(
            "Running '{}' for '{}' with {} args in {:?}",
            self.spec.program,
            ctx.node_id,
            args.len(),
            work_dir
        );
        if ctx.work_dir.is_some() {
            let line = std::iter::once(self.spec.program.as_str())
                .chain(args.iter().map(|a| a.as_str()))
                .collect::<Vec<_>>()
                .join(" ");
            if let Err(e) = tokio::fs::write(work_dir.join(COMMAND_LOG), line + "\n").await {
                log::warn!("Could not record command line for '{}': {}", ctx.node_id, e);
            }
        }

        let stdout = self.run_process(ctx, &args, &work_dir).await?;
        self.collect_outputs(ctx, &inputs, &stdout, &work_dir)
    }
}

/// Values visible to placeholders
struct Scope<'a> {
    ctx: &'a StepContext,
    inputs: &'a PortValues,
    stdout: Option<&'a str>,
}

enum Lookup {
    Found(String),
    Absent,
}

impl Scope<'_> {
    fn lookup(&self, name: &str) -> Result<Lookup, StepError> {
        if let Some(value) = self.inputs.get(name) {
            return Ok(Lookup::Found(value_to_arg(value)));
        }
        match name {
            "work_dir" => Ok(Lookup::Found(
                self.ctx
                    .work_dir
                    .as_ref()
                    .map(|d| d.display().to_string())
                    .unwrap_or_else(|| ".".to_string()),
            )),
            "node_id" => Ok(Lookup::Found(self.ctx.node_id.clone())),
            "stdout" if self.stdout.is_some() => Ok(Lookup::Found(
                self.stdout.unwrap_or_default().trim_end().to_string(),
            )),
            _ if self.ctx.interface.input(name).is_some() => Ok(Lookup::Absent),
            _ => Err(StepError::failed(format!(
                "unknown placeholder '{{{}}}'",
                name
            ))),
        }
    }
}

/// Expand a template; `None` when it references an absent optional input
fn expand(template: &str, scope: &Scope<'_>) -> Result<Option<String>, StepError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => {
                            return Err(StepError::failed(format!(
                                "unterminated placeholder in '{}'",
                                template
                            )))
                        }
                    }
                }
                match scope.lookup(name.trim())? {
                    Lookup::Found(value) => out.push_str(&value),
                    Lookup::Absent => return Ok(None),
                }
            }
            c => out.push(c),
        }
    }
    Ok(Some(out))
}

/// Input name if the template is exactly one placeholder
fn sole_placeholder(template: &str) -> Option<&str> {
    let inner = template.strip_prefix('{')?.strip_suffix('}')?;
    if inner.is_empty() || inner.contains(['{', '}']) {
        return None;
    }
    Some(inner.trim())
}

fn value_to_arg(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(value_to_arg).collect::<Vec<_>>().join(" "),
        other => other.to_string(),
    }
}

fn convert_output(
    port: &str,
    data_type: PortDataType,
    rendered: String,
    work_dir: &Path,
) -> Result<Value, StepError> {
    if data_type.is_file_like() {
        let path = PathBuf::from(&rendered);
        let path = if path.is_relative() {
            work_dir.join(path)
        } else {
            path
        };
        if !path.exists() {
            return Err(StepError::failed(format!(
                "output '{}' was not written: {} does not exist",
                port,
                path.display()
            )));
        }
        return Ok(Value::String(path.display().to_string()));
    }
    match data_type {
        PortDataType::String => Ok(Value::String(rendered)),
        PortDataType::Any => Ok(serde_json::from_str(&rendered).unwrap_or(Value::String(rendered))),
        _ => serde_json::from_str(rendered.trim()).map_err(|e| {
            StepError::failed(format!(
                "output '{}' is not valid {}: {}",
                port, data_type, e
            ))
        }),
    }
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use node_engine::{Interface, PortSpec};
    use serde_json::json;
    use std::sync::Arc;

    fn ctx(interface: Interface, work_dir: Option<PathBuf>) -> StepContext {
        let mut ctx = StepContext::detached("node-1", Arc::new(interface));
        ctx.work_dir = work_dir;
        ctx
    }

    fn echo_interface() -> Interface {
        Interface::new("echo")
            .with_input(PortSpec::required("message", PortDataType::String))
            .with_input(PortSpec::optional("extra", PortDataType::Json))
            .with_input(PortSpec::optional("flag", PortDataType::Number))
            .with_output(PortSpec::required("text", PortDataType::String))
    }

    #[test]
    fn test_render_args() {
        let step = CommandStep::new(
            CommandSpec::new("echo")
                .arg("{message}")
                .arg("{extra}")
                .arg("-f={flag}")
                .arg("{{literal}}"),
        );
        let inputs = PortValues::from([
            ("message".to_string(), json!("hello")),
            ("extra".to_string(), json!(["a", "b"])),
        ]);
        let args = step.render_args(&ctx(echo_interface(), None), &inputs).unwrap();
        assert_eq!(args, vec!["hello", "a", "b", "{literal}"]);
    }

    #[test]
    fn test_unknown_placeholder_is_error() {
        let step = CommandStep::new(CommandSpec::new("echo").arg("{nope}"));
        let err = step
            .render_args(&ctx(echo_interface(), None), &PortValues::new())
            .unwrap_err();
        assert!(err.to_string().contains("unknown placeholder '{nope}'"));
    }

    #[test]
    fn test_stderr_tail() {
        let stderr: String = (0..30).map(|i| format!("line {}\n", i)).collect();
        let tail = stderr_tail(&stderr);
        assert!(tail.starts_with("line 10"));
        assert!(tail.ends_with("line 29"));
    }

    #[tokio::test]
    async fn test_echo_stdout_output() {
        let step = CommandStep::new(
            CommandSpec::new("echo")
                .arg("{message}")
                .arg("world")
                .output("text", "{stdout}"),
        );
        let inputs = PortValues::from([("message".to_string(), json!("hello"))]);
        let outputs = step.execute(&ctx(echo_interface(), None), inputs).await.unwrap();
        assert_eq!(outputs.get("text").unwrap(), "hello world");
    }

    #[tokio::test]
    async fn test_json_output_parsed() {
        let iface = Interface::new("metrics").with_output(PortSpec::required("qc", PortDataType::Json));
        let step = CommandStep::new(
            CommandSpec::new("echo")
                .arg(r#"{{"snr": 12.5}}"#)
                .output("qc", "{stdout}"),
        );
        let outputs = step.execute(&ctx(iface, None), PortValues::new()).await.unwrap();
        assert_eq!(outputs.get("qc").unwrap(), &json!({"snr": 12.5}));
    }

    #[tokio::test]
    async fn test_file_output_in_work_dir() {
        let temp = tempfile::tempdir().unwrap();
        let work_dir = temp.path().join("anat").join("bet");
        let iface = Interface::new("touch").with_output(PortSpec::required("out_file", PortDataType::Image));
        let step = CommandStep::new(
            CommandSpec::new("touch")
                .arg("brain.nii.gz")
                .output("out_file", "{work_dir}/brain.nii.gz"),
        );

        let outputs = step
            .execute(&ctx(iface, Some(work_dir.clone())), PortValues::new())
            .await
            .unwrap();
        let path = outputs.get("out_file").unwrap().as_str().unwrap();
        assert!(Path::new(path).exists());
        assert!(work_dir.join(COMMAND_LOG).exists());
    }

    #[tokio::test]
    async fn test_missing_file_output_fails() {
        let temp = tempfile::tempdir().unwrap();
        let iface = Interface::new("noop").with_output(PortSpec::required("out_file", PortDataType::Image));
        let step = CommandStep::new(CommandSpec::new("true").output("out_file", "brain.nii.gz"));

        let err = step
            .execute(&ctx(iface, Some(temp.path().to_path_buf())), PortValues::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("was not written"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_code_and_stderr() {
        let iface = Interface::new("sh");
        let step = CommandStep::new(
            CommandSpec::new("sh")
                .arg("-c")
                .arg("echo 'antsRegistration: bad metric' >&2; exit 3"),
        );
        let err = step.execute(&ctx(iface, None), PortValues::new()).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exited with code 3"));
        assert!(msg.contains("bad metric"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let step = CommandStep::new(CommandSpec::new("sleep").arg("5").timeout_secs(1));
        let err = step
            .execute(&ctx(Interface::new("sleep"), None), PortValues::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out after 1s"));
    }

    #[tokio::test]
    async fn test_cancel_kills_process() {
        let step = CommandStep::new(CommandSpec::new("sleep").arg("30"));
        let ctx = ctx(Interface::new("sleep"), None);
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let err = step.execute(&ctx, PortValues::new()).await.unwrap_err();
        assert_eq!(err, StepError::Cancelled);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let step = CommandStep::new(CommandSpec::new("definitely-not-a-real-tool-xyz"));
        let err = step
            .execute(&ctx(Interface::new("missing"), None), PortValues::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[test]
    fn test_spec_deserializes() {
        let spec: CommandSpec = serde_json::from_value(json!({
            "program": "bet",
            "args": ["{in_file}", "{work_dir}/brain.nii.gz", "-f", "{frac}"],
            "timeout_secs": 600,
            "outputs": {"out_file": "{work_dir}/brain.nii.gz"}
        }))
        .unwrap();
        assert_eq!(spec.args.len(), 4);
        assert_eq!(spec.timeout_secs, Some(600));
    }
}
