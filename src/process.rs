//! Shell command execution shared by stage executors and health probes.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde_json::Value;
use tracing::debug;

use crate::definition::StageParameters;
use crate::error::StageError;
use crate::gate::MetricSet;
use crate::secrets::SecretStore;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const METRIC_PREFIX: &str = "::metric ";
const SECRET_PREFIX: &str = "secret:";

/// EX_TEMPFAIL from sysexits.h.
pub const DEFAULT_TRANSIENT_EXIT_CODE: i32 = 75;

#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub run: String,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<PathBuf>,
    pub transient_exit_codes: Vec<i32>,
}

impl CommandSpec {
    pub fn new(run: impl Into<String>) -> Self {
        Self {
            run: run.into(),
            env: BTreeMap::new(),
            workdir: None,
            transient_exit_codes: vec![DEFAULT_TRANSIENT_EXIT_CODE],
        }
    }

    /// Read `run`, `env`, `workdir` and `transient_exit_codes` from stage
    /// params. `Ok(None)` when no `run` is given.
    pub fn from_params(params: &StageParameters) -> Result<Option<Self>> {
        let Some(run) = params.get("run") else {
            return Ok(None);
        };
        let run = run
            .as_str()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| anyhow!("'run' must be a non-empty string"))?;
        let mut spec = Self::new(run);

        if let Some(env) = params.get("env") {
            let env = env
                .as_object()
                .ok_or_else(|| anyhow!("'env' must be a map of strings"))?;
            for (key, value) in env {
                let value = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => return Err(anyhow!("env value for '{key}' must be a scalar")),
                };
                spec.env.insert(key.clone(), value);
            }
        }
        if let Some(dir) = params.get("workdir").and_then(Value::as_str) {
            spec.workdir = Some(PathBuf::from(dir));
        }
        if let Some(codes) = params.get("transient_exit_codes") {
            spec.transient_exit_codes = codes
                .as_array()
                .ok_or_else(|| anyhow!("'transient_exit_codes' must be a list"))?
                .iter()
                .map(|code| {
                    code.as_i64()
                        .map(|c| c as i32)
                        .ok_or_else(|| anyhow!("exit codes must be integers"))
                })
                .collect::<Result<_>>()?;
        }
        Ok(Some(spec))
    }

    /// Resolve a relative `workdir` against `base`.
    pub fn rooted_at(&self, base: &Path) -> Self {
        let mut spec = self.clone();
        spec.workdir = Some(match &self.workdir {
            Some(dir) => base.join(dir),
            None => base.to_path_buf(),
        });
        spec
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub metrics: MetricSet,
    pub duration: Duration,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Classify a non-zero exit as transient or deterministic.
    pub fn check(self, spec: &CommandSpec) -> std::result::Result<Self, StageError> {
        if self.success() {
            return Ok(self);
        }
        let tail = tail_lines(&self.stderr, 5);
        let message = match self.exit_code {
            Some(code) => format!("command `{}` exited with code {code}", spec.run),
            None => format!("command `{}` was terminated by a signal", spec.run),
        };
        let message = if tail.is_empty() {
            message
        } else {
            format!("{message}: {tail}")
        };
        match self.exit_code {
            Some(code) if spec.transient_exit_codes.contains(&code) => {
                Err(StageError::Transient(message))
            }
            _ => Err(StageError::Deterministic(message)),
        }
    }
}

/// Run `spec` through `sh -c`, collecting output and `::metric` lines.
///
/// A command that outlives `timeout` is killed and reported as a
/// deterministic failure.
pub fn run_command(
    spec: &CommandSpec,
    secrets: Option<&dyn SecretStore>,
    timeout: Option<Duration>,
) -> std::result::Result<CommandOutcome, StageError> {
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(&spec.run)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &spec.workdir {
        command.current_dir(dir);
    }
    for (key, value) in &spec.env {
        command.env(key, resolve_env_value(key, value, secrets)?);
    }

    let started = Instant::now();
    let mut child = command.spawn().map_err(|err| {
        StageError::Transient(format!("failed to spawn `{}`: {err}", spec.run))
    })?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_reader = thread::spawn(move || read_pipe(stdout));
    let stderr_reader = thread::spawn(move || read_pipe(stderr));

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(err) => {
                return Err(StageError::Transient(format!(
                    "failed to wait on `{}`: {err}",
                    spec.run
                )));
            }
        }
        if let Some(limit) = timeout
            && started.elapsed() >= limit
        {
            let _ = child.kill();
            let _ = child.wait();
            return Err(StageError::Deterministic(format!(
                "command `{}` timed out after {}s",
                spec.run,
                limit.as_secs_f64()
            )));
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();
    let metrics = parse_metrics(&stdout);
    debug!(
        command = spec.run.as_str(),
        code = ?status.code(),
        metrics = metrics.len(),
        "Command finished"
    );
    Ok(CommandOutcome {
        exit_code: status.code(),
        stdout,
        stderr,
        metrics,
        duration: started.elapsed(),
    })
}

fn resolve_env_value(
    key: &str,
    value: &str,
    secrets: Option<&dyn SecretStore>,
) -> std::result::Result<String, StageError> {
    let Some(secret) = value.strip_prefix(SECRET_PREFIX) else {
        return Ok(value.to_string());
    };
    secrets
        .and_then(|store| store.get(secret))
        .ok_or_else(|| {
            StageError::Deterministic(format!("secret '{secret}' for env '{key}' is not available"))
        })
}

fn read_pipe<R: Read>(pipe: Option<R>) -> String {
    let mut buffer = String::new();
    if let Some(mut pipe) = pipe {
        let mut bytes = Vec::new();
        if pipe.read_to_end(&mut bytes).is_ok() {
            buffer = String::from_utf8_lossy(&bytes).into_owned();
        }
    }
    buffer
}

/// Extract `::metric name=value` lines. Later lines win.
pub fn parse_metrics(output: &str) -> MetricSet {
    let mut metrics = MetricSet::new();
    for line in output.lines() {
        let Some(rest) = line.trim().strip_prefix(METRIC_PREFIX) else {
            continue;
        };
        for pair in rest.split_whitespace() {
            if let Some((name, value)) = pair.split_once('=')
                && let Ok(value) = value.parse::<f64>()
                && !name.is_empty()
            {
                metrics.insert(name.to_string(), value);
            }
        }
    }
    metrics
}

fn tail_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join(" | ")
}
