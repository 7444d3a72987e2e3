//! Command Runner (spec §4.7)
//!
//! Dispatches a resolved check command by type and produces a
//! [`CheckResult`]. Plugin/Dummy/Sleep/Null run locally under a bounded
//! worker pool; Remote hands off to the Cluster Messenger; IFW API talks
//! HTTP/JSON directly to an agent.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command as TokioCommand;
use tokio::sync::Semaphore;
use tracing::{instrument, warn};

use crate::checkable::CheckResult;
use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::macros::{ArgSpec, ResolverList, resolve_arguments};
use crate::registry::ObjectId;

/// Soft cap on argv byte length; plugin argv exceeding this is truncated
/// (spec §4.7: "shorten the longest `$x$` expansion to ~90% of a
/// page-sized limit").
const ARGV_PAGE_LIMIT: usize = 4096;

#[derive(Debug, Clone)]
pub enum CommandSpec {
    Plugin { command: Vec<String>, arg_spec: Vec<ArgSpec>, timeout: Duration },
    Dummy,
    Sleep,
    Null { node_name: String },
    Remote { endpoint: String },
    IfwApi { base_url: String, command_name: String, arg_spec: Vec<ArgSpec> },
}

/// Dispatch target for non-local command types; implemented by the
/// Cluster Messenger (Remote) and an HTTP client (IFW API). Kept as a
/// trait so the Command Runner doesn't depend on those modules directly,
/// mirroring the teacher's `StorageBackend`-style pluggable-backend seam.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, checkable: ObjectId, spec: &CommandSpec, resolvers: &ResolverList, clock: &Clock) -> CoreResult<CheckResult>;
}

pub struct LocalExecutor {
    http: reqwest::Client,
    semaphore: Semaphore,
}

impl LocalExecutor {
    pub fn new(max_concurrent_local_commands: usize) -> Self {
        Self {
            http: reqwest::Client::builder().build().expect("failed to build http client"),
            semaphore: Semaphore::new(max_concurrent_local_commands),
        }
    }

    fn base_result(clock: &Clock, schedule_start: f64, command: Vec<String>) -> CheckResult {
        let now = clock.now();
        CheckResult {
            state: 0,
            exit_status: 0,
            output: String::new(),
            performance_data: Vec::new(),
            schedule_start,
            schedule_end: now,
            execution_start: now,
            execution_end: now,
            command,
            check_source: "local".to_string(),
            active: true,
            vars_before: None,
            vars_after: None,
        }
    }

    #[instrument(skip(self, command, arg_spec, resolvers, clock))]
    async fn run_plugin(
        &self,
        command: &[String],
        arg_spec: &[ArgSpec],
        resolvers: &ResolverList,
        timeout: Duration,
        clock: &Clock,
    ) -> CoreResult<CheckResult> {
        let schedule_start = clock.now();
        let _permit = self.semaphore.acquire().await.map_err(|_| CoreError::CommandExecFailure {
            command: command.join(" "),
            cause: "worker pool closed".to_string(),
        })?;

        let mut argv = resolve_arguments(command, arg_spec, resolvers, None)?;
        truncate_argv(&mut argv);

        let Some((program, args)) = argv.split_first() else {
            return Err(CoreError::CommandExecFailure { command: String::new(), cause: "empty argv".to_string() });
        };

        let execution_start = clock.now();
        let child = TokioCommand::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        let output = tokio::time::timeout(timeout, child).await.map_err(|_| CoreError::CommandTimeout {
            command: argv.join(" "),
        })?;
        let output = output.map_err(|e| CoreError::CommandExecFailure { command: argv.join(" "), cause: e.to_string() })?;
        let execution_end = clock.now();

        let exit_status = output.status.code().unwrap_or(3);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let (text, perfdata) = split_output(&stdout);

        let state = match exit_status {
            0..=3 => exit_status as u8,
            other => {
                warn!(exit_status = other, "plugin exit code out of range, mapping to Unknown");
                3
            }
        };

        Ok(CheckResult {
            state,
            exit_status,
            output: text,
            performance_data: perfdata,
            schedule_start,
            schedule_end: execution_start,
            execution_start,
            execution_end,
            command: argv,
            check_source: "local".to_string(),
            active: true,
            vars_before: None,
            vars_after: None,
        })
    }

    async fn run_dummy(&self, resolvers: &ResolverList, clock: &Clock) -> CoreResult<CheckResult> {
        let state_text = crate::macros::resolve_macros("$dummy_state$", resolvers, None, None)?;
        let text = crate::macros::resolve_macros("$dummy_text$", resolvers, None, None)?;
        let state: u8 = state_text.parse().unwrap_or(0).min(3);
        let mut result = Self::base_result(clock, clock.now(), vec!["dummy".to_string()]);
        result.state = state;
        result.exit_status = state as i32;
        result.output = text;
        Ok(result)
    }

    async fn run_sleep(&self, resolvers: &ResolverList, clock: &Clock) -> CoreResult<CheckResult> {
        let sleep_text = crate::macros::resolve_macros("$sleep_time$", resolvers, None, None)?;
        let secs: f64 = sleep_text.parse().unwrap_or(0.0);
        let schedule_start = clock.now();
        clock.sleep(Duration::from_secs_f64(secs.max(0.0))).await;
        let mut result = Self::base_result(clock, schedule_start, vec!["sleep".to_string()]);
        result.output = format!("Slept for {secs}s");
        Ok(result)
    }

    async fn run_null(&self, node_name: &str, clock: &Clock) -> CoreResult<CheckResult> {
        let mut result = Self::base_result(clock, clock.now(), vec!["null".to_string()]);
        result.output = format!("Hello from {node_name}");
        Ok(result)
    }

    #[instrument(skip(self, arg_spec, resolvers, clock))]
    async fn run_ifw_api(
        &self,
        base_url: &str,
        command_name: &str,
        arg_spec: &[ArgSpec],
        resolvers: &ResolverList,
        clock: &Clock,
    ) -> CoreResult<CheckResult> {
        let schedule_start = clock.now();
        let url = format!("{base_url}/v1/checker?command={command_name}");

        let body = resolve_json_body(arg_spec, resolvers)?;

        let response = self.http.post(&url).json(&body).send().await.map_err(|e| CoreError::CommandExecFailure {
            command: url.clone(),
            cause: format!("connect/tls failure: {e}"),
        })?;

        if !response.status().is_success() {
            return Err(CoreError::CommandExecFailure { command: url, cause: format!("http status {}", response.status()) });
        }

        let execution_end = clock.now();
        let parsed: serde_json::Value = response.json().await.map_err(|e| CoreError::CommandExecFailure {
            command: url.clone(),
            cause: format!("bad json: {e}"),
        })?;

        let entry = parsed.get(command_name).ok_or_else(|| CoreError::CommandExecFailure {
            command: url.clone(),
            cause: format!("missing field '{command_name}' in response"),
        })?;

        let ifw_result: IfwCheckerResult = serde_json::from_value(entry.clone())
            .map_err(|e| CoreError::CommandExecFailure { command: url.clone(), cause: format!("bad field shape: {e}") })?;

        let state = match ifw_result.exitcode {
            0..=3 => ifw_result.exitcode as u8,
            other => {
                warn!(exit_status = other, "ifw api exit code out of range, mapping to Unknown");
                3
            }
        };

        Ok(CheckResult {
            state,
            exit_status: ifw_result.exitcode,
            output: ifw_result.checkresult,
            performance_data: ifw_result.perfdata,
            schedule_start,
            schedule_end: schedule_start,
            execution_start: schedule_start,
            execution_end,
            command: vec![command_name.to_string()],
            check_source: "ifw-api".to_string(),
            active: true,
            vars_before: None,
            vars_after: None,
        })
    }
}

/// Builds the JSON body posted to the IFW API checker endpoint, resolving
/// each argument's macro template the same way [`resolve_arguments`] does
/// for plugin argv (order, `set_if` gating, `repeat_key` fan-out), just
/// landing in an object field instead of an argv slot.
fn resolve_json_body(arg_spec: &[ArgSpec], resolvers: &ResolverList) -> CoreResult<serde_json::Value> {
    let mut specs: Vec<&ArgSpec> = arg_spec.iter().collect();
    specs.sort_by_key(|s| s.order);

    let mut body = serde_json::Map::new();
    for spec in specs {
        if let Some(gate) = &spec.set_if {
            let resolved = crate::macros::resolve_macros(gate, resolvers, None, None)?;
            if resolved.is_empty() || resolved == "0" || resolved == "false" {
                continue;
            }
        }

        let value = match &spec.value {
            None => serde_json::Value::Bool(true),
            Some(template) => {
                let resolved = crate::macros::resolve_macros(template, resolvers, None, None)?;
                if spec.repeat_key {
                    serde_json::Value::Array(
                        resolved.split(';').filter(|p| !p.is_empty()).map(|p| serde_json::Value::String(p.to_string())).collect(),
                    )
                } else {
                    serde_json::Value::String(resolved)
                }
            }
        };
        body.insert(spec.key.clone(), value);
    }
    Ok(serde_json::Value::Object(body))
}

#[derive(Deserialize)]
struct IfwCheckerResult {
    exitcode: i32,
    checkresult: String,
    #[serde(default)]
    perfdata: Vec<String>,
}

/// Splits plugin stdout into "text | perfdata" (spec §6).
fn split_output(raw: &str) -> (String, Vec<String>) {
    let raw = raw.trim_end_matches('\n');
    match raw.split_once('|') {
        Some((text, perf)) => (text.trim().to_string(), perf.split_whitespace().map(str::to_string).collect()),
        None => (raw.to_string(), Vec::new()),
    }
}

/// Truncates the argv in place if it exceeds the page limit, dropping
/// characters from the longest single element first.
fn truncate_argv(argv: &mut [String]) {
    let total: usize = argv.iter().map(|s| s.len()).sum();
    if total <= ARGV_PAGE_LIMIT {
        return;
    }
    warn!(total, limit = ARGV_PAGE_LIMIT, "argv exceeds page limit, truncating longest element");
    if let Some((idx, _)) = argv.iter().enumerate().max_by_key(|(_, s)| s.len()) {
        let target = (ARGV_PAGE_LIMIT as f64 * 0.9) as usize;
        let shrink_to = target.min(argv[idx].len());
        argv[idx].truncate(shrink_to);
    }
}

#[async_trait]
impl CommandExecutor for LocalExecutor {
    async fn run(&self, _checkable: ObjectId, spec: &CommandSpec, resolvers: &ResolverList, clock: &Clock) -> CoreResult<CheckResult> {
        match spec {
            CommandSpec::Plugin { command, arg_spec, timeout } => self.run_plugin(command, arg_spec, resolvers, *timeout, clock).await,
            CommandSpec::Dummy => self.run_dummy(resolvers, clock).await,
            CommandSpec::Sleep => self.run_sleep(resolvers, clock).await,
            CommandSpec::Null { node_name } => self.run_null(node_name, clock).await,
            CommandSpec::IfwApi { base_url, command_name, arg_spec } => self.run_ifw_api(base_url, command_name, arg_spec, resolvers, clock).await,
            CommandSpec::Remote { endpoint } => Err(CoreError::RemoteUnreachable { endpoint: endpoint.clone() }),
        }
    }
}
