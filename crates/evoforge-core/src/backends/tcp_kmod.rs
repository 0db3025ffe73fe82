//! Congestion-control logic spliced into a loadable kernel module.

use super::emulation::{EmulationHarness, LinkArgs};
use super::process::{run_bounded, shell, ProcessOutput};
use super::{prompts, Backend};
use crate::errors::ConfigError;
use crate::model::{BuildOutcome, EvalOutcome};
use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MODULE_DIR: &str = "tcp_cc/kern_mod";
const TEMPLATE: &str = "tcp_heuristic.template";
const MODULE_NAME: &str = "tcp_heuristic";
const MAKE_TIMEOUT: Duration = Duration::from_secs(300);
const MODULE_TIMEOUT: Duration = Duration::from_secs(30);

/// A loaded kernel module, unloaded when the slot goes out of scope.
struct ModuleSlot {
    dir: PathBuf,
    unload: String,
    loaded: bool,
}

impl ModuleSlot {
    async fn acquire(dir: &Path) -> anyhow::Result<Result<Self, ProcessOutput>> {
        let unload = format!("sudo rmmod {MODULE_NAME}");
        // A module left by an aborted run would make insmod fail.
        let _ = run_bounded(shell(&unload, dir), Some(MODULE_TIMEOUT)).await?;
        let out = run_bounded(
            shell(&format!("sudo insmod {MODULE_NAME}.ko"), dir),
            Some(MODULE_TIMEOUT),
        )
        .await?;
        if !out.success() {
            return Ok(Err(out));
        }
        Ok(Ok(Self {
            dir: dir.to_path_buf(),
            unload,
            loaded: true,
        }))
    }

    async fn release(mut self) -> anyhow::Result<()> {
        self.loaded = false;
        let out = run_bounded(shell(&self.unload, &self.dir), Some(MODULE_TIMEOUT)).await?;
        report_unload(&out);
        Ok(())
    }
}

fn report_unload(out: &ProcessOutput) {
    if !out.success() {
        tracing::warn!(
            event = "kmod.unload_failed",
            timed_out = out.timed_out,
            stderr = %out.stderr
        );
    }
}

impl Drop for ModuleSlot {
    /// Hands the unload to the runtime, bounded like every other module command.
    fn drop(&mut self) {
        if !self.loaded {
            return;
        }
        tracing::warn!(event = "kmod.unload_on_drop", dir = %self.dir.display());
        let cmd = shell(&self.unload, &self.dir);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    match run_bounded(cmd, Some(MODULE_TIMEOUT)).await {
                        Ok(out) => report_unload(&out),
                        Err(e) => tracing::warn!(event = "kmod.unload_failed", error = %e),
                    }
                });
            }
            Err(_) => tracing::warn!(
                event = "kmod.unload_failed",
                "no runtime left to unload the module"
            ),
        }
    }
}

pub struct TcpKmodBackend {
    link: LinkArgs,
    make_dir: PathBuf,
    harness: EmulationHarness,
}

impl TcpKmodBackend {
    pub fn new(link: LinkArgs, workdir: &Path) -> anyhow::Result<Self> {
        let make_dir = workdir.join(MODULE_DIR);
        if !make_dir.join(TEMPLATE).exists() {
            return Err(ConfigError(format!(
                "{} not found",
                make_dir.join(TEMPLATE).display()
            ))
            .into());
        }
        let harness = EmulationHarness::new(link.clone(), workdir);
        harness.check_layout()?;
        Ok(Self {
            link,
            make_dir,
            harness,
        })
    }
}

/// The template followed by the candidate, separated by a blank line.
fn splice(template: &str, code: &str) -> String {
    format!("{}\n\n{}\n", template, code)
}

#[async_trait]
impl Backend for TcpKmodBackend {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn initial_prompt(&self) -> String {
        prompts::initial_prompt(prompts::TCP_CONTEXT, "c", prompts::REPLY_PLAN)
    }

    fn mutate_prompt(&self, parent_codes: &[String]) -> String {
        prompts::mutate_prompt(prompts::TCP_CONTEXT, "c", parent_codes, prompts::TCP_PLACEHOLDER)
    }

    async fn build(&self, code: &str) -> anyhow::Result<BuildOutcome> {
        let template = tokio::fs::read_to_string(self.make_dir.join(TEMPLATE))
            .await
            .context("failed to read module template")?;
        tokio::fs::write(
            self.make_dir.join(format!("{MODULE_NAME}.c")),
            splice(&template, code),
        )
        .await
        .context("failed to write module source")?;

        let make = run_bounded(shell("make", &self.make_dir), Some(MAKE_TIMEOUT)).await?;
        if make.timed_out {
            return Ok(BuildOutcome::failed(
                make.stdout,
                format!("{}\nbuild timed out", make.stderr),
            ));
        }
        Ok(BuildOutcome {
            success: make.success(),
            stdout: make.stdout,
            stderr: make.stderr,
        })
    }

    async fn run_experiment(&self) -> anyhow::Result<EvalOutcome> {
        let slot = match ModuleSlot::acquire(&self.make_dir).await? {
            Ok(slot) => slot,
            Err(load) => {
                return Ok(EvalOutcome {
                    exec_status: false,
                    eval_results: json!({}),
                    eval_logs: json!({ "insmod_logs": load.to_json() }),
                })
            }
        };
        let report = self.harness.run_flow().await;
        slot.release().await?;
        Ok(report?.into_outcome(json!({})))
    }

    fn run_info(&self) -> serde_json::Value {
        json!({ "task_args": self.link.to_json() })
    }
}
