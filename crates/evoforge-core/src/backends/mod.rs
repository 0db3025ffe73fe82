//! Domain backends: how one artifact family is prompted for, built, and measured.

use crate::errors::ConfigError;
use crate::model::{BuildOutcome, EvalOutcome};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::str::FromStr;

pub mod emulation;
pub mod fake;
pub mod process;
pub mod prompts;
pub mod tcp_bpf;
pub mod tcp_kmod;
pub mod webcache;

/// Capability set the controller drives for every candidate.
///
/// `build` and `run_experiment` report ordinary failures (compile errors, timeouts,
/// a crashed simulator) through their outcome values. An `Err` means the backend's
/// own environment is broken and stops the run.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;
    fn initial_prompt(&self) -> String;
    fn mutate_prompt(&self, parent_codes: &[String]) -> String;
    fn debug_prompt(&self, stdout: &str, stderr: &str) -> String {
        prompts::debug_prompt(stdout, stderr)
    }
    async fn build(&self, code: &str) -> anyhow::Result<BuildOutcome>;
    async fn run_experiment(&self) -> anyhow::Result<EvalOutcome>;
    /// Metadata stored once with the run.
    fn run_info(&self) -> serde_json::Value;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    WebCache,
    TcpKmod,
    TcpBpf,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [TaskKind::WebCache, TaskKind::TcpKmod, TaskKind::TcpBpf];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::WebCache => "webcache",
            TaskKind::TcpKmod => "tcp",
            TaskKind::TcpBpf => "tcpbpf",
        }
    }
}

impl FromStr for TaskKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<_> = TaskKind::ALL.iter().map(|k| k.as_str()).collect();
                ConfigError(format!("unknown task '{}' (known: {})", s, known.join(", ")))
            })
    }
}

pub(crate) fn parse_task_args<T: DeserializeOwned>(
    task: TaskKind,
    args: &serde_json::Value,
) -> Result<T, ConfigError> {
    let args = if args.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        args.clone()
    };
    serde_json::from_value(args)
        .map_err(|e| ConfigError(format!("invalid task_args for {}: {}", task.as_str(), e)))
}

/// Instantiates the backend for `task`, validating its arguments and on-disk layout.
pub fn build_backend(
    task: &str,
    task_args: &serde_json::Value,
    workdir: &Path,
) -> anyhow::Result<Box<dyn Backend>> {
    let kind: TaskKind = task.parse()?;
    let backend: Box<dyn Backend> = match kind {
        TaskKind::WebCache => Box::new(webcache::WebCacheBackend::new(
            parse_task_args(kind, task_args)?,
            workdir,
        )?),
        TaskKind::TcpKmod => Box::new(tcp_kmod::TcpKmodBackend::new(
            parse_task_args(kind, task_args)?,
            workdir,
        )?),
        TaskKind::TcpBpf => Box::new(tcp_bpf::TcpBpfBackend::new(
            parse_task_args(kind, task_args)?,
            workdir,
        )?),
    };
    Ok(backend)
}
