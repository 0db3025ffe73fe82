//! Congestion-control logic compiled into an eBPF scaffold and attached through
//! a probe loader.

use super::emulation::{EmulationHarness, LinkArgs};
use super::process::{run_bounded, shell, ProcessGuard, ProcessOutput};
use super::{prompts, Backend};
use crate::errors::ConfigError;
use crate::model::{BuildOutcome, EvalOutcome};
use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SCAFFOLD_DIR: &str = "tcp_cc/bpf_scaffolding";
const MAKE_TRIES: u32 = 3;
const MAKE_TIMEOUT: Duration = Duration::from_secs(120);
const ATTACH_TEST_TIMEOUT: Duration = Duration::from_secs(60);
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

const KILL_PROBE: &str =
    "ps aux | grep logi[c].py | tr -s ' ' | cut -d ' ' -f2 | xargs -r sudo kill -9";

const BPF_CONTEXT: &str = "\
You are a networking engineer designing a TCP congestion control algorithm that runs as \
eBPF inside the Linux kernel. Implement:

```c
static inline u32 bpf_core_logic(u8 ca_state, struct heuristic_state* st, const struct rate_sample* rs, u32 prev_cwnd);
```

It returns the new congestion window. `ca_state`, `rs` and `st` are as in the kernel \
congestion-control API, with `st` adding flow-wide statistics and a per-RTT window history \
via `history_get(st, i)`. The eBPF verifier must accept the code: bounded loops only, no \
floating point, no globals, no calls outside the provided helpers.";

async fn sh(dir: &Path, script: &str, limit: Duration) -> anyhow::Result<ProcessOutput> {
    run_bounded(shell(script, dir), Some(limit)).await
}

/// Shell steps turning `LLMCode.h` into an attachable program.
#[derive(Debug, Clone)]
struct BuildSteps {
    make: String,
    /// Runs between failed makes; a module left loaded by a crashed run blocks the build.
    unload: String,
    attach_test: String,
    tries: u32,
    retry_pause: Duration,
    make_timeout: Duration,
    attach_timeout: Duration,
}

impl Default for BuildSteps {
    fn default() -> Self {
        Self {
            make: "make".into(),
            unload: "sudo rmmod tcp_heuristic".into(),
            attach_test: "sudo python3 logic.py test".into(),
            tries: MAKE_TRIES,
            retry_pause: Duration::from_secs(3),
            make_timeout: MAKE_TIMEOUT,
            attach_timeout: ATTACH_TEST_TIMEOUT,
        }
    }
}

impl BuildSteps {
    /// `Err` carries the output of the last failed make.
    async fn make(&self, dir: &Path) -> anyhow::Result<Result<(), ProcessOutput>> {
        let mut last = ProcessOutput::default();
        for attempt in 1..=self.tries {
            let out = sh(dir, &self.make, self.make_timeout).await?;
            if out.success() {
                return Ok(Ok(()));
            }
            tracing::warn!(event = "bpf.make_retry", attempt, "make failed; unloading stale module");
            sh(dir, &self.unload, CLEANUP_TIMEOUT).await?;
            tokio::time::sleep(self.retry_pause).await;
            last = out;
        }
        Ok(Err(last))
    }

    async fn attach_test(&self, dir: &Path) -> anyhow::Result<BuildOutcome> {
        let test = sh(dir, &self.attach_test, self.attach_timeout).await?;
        if test.timed_out {
            return Ok(BuildOutcome::failed(
                test.stdout,
                format!("{}\nprobe test timed out", test.stderr),
            ));
        }
        Ok(BuildOutcome {
            success: test.success(),
            stdout: test.stdout,
            stderr: test.stderr,
        })
    }
}

pub struct TcpBpfBackend {
    link: LinkArgs,
    build_dir: PathBuf,
    harness: EmulationHarness,
    steps: BuildSteps,
}

impl TcpBpfBackend {
    pub fn new(link: LinkArgs, workdir: &Path) -> anyhow::Result<Self> {
        let build_dir = workdir.join(SCAFFOLD_DIR);
        if !build_dir.exists() {
            return Err(ConfigError(format!("{} not found", build_dir.display())).into());
        }
        let harness = EmulationHarness::new(link.clone(), workdir);
        harness.check_layout()?;
        Ok(Self {
            link,
            build_dir,
            harness,
            steps: BuildSteps::default(),
        })
    }

    async fn sh(&self, script: &str, limit: Duration) -> anyhow::Result<ProcessOutput> {
        sh(&self.build_dir, script, limit).await
    }

    /// Tears down leftovers from a previous candidate: loaders, emulators, objects.
    async fn cleanup(&self) -> anyhow::Result<()> {
        for script in [
            KILL_PROBE,
            "make clean",
            "sudo pkill iperf3",
            "sudo pkill mm-link",
            "sudo pkill mm-delay",
        ] {
            let out = self.sh(script, CLEANUP_TIMEOUT).await?;
            tracing::debug!(event = "bpf.cleanup", script, returncode = ?out.returncode);
        }
        let _ = tokio::fs::remove_file(self.build_dir.join("LLMCode.h")).await;
        Ok(())
    }
}

#[async_trait]
impl Backend for TcpBpfBackend {
    fn name(&self) -> &'static str {
        "tcpbpf"
    }

    fn initial_prompt(&self) -> String {
        prompts::initial_prompt(BPF_CONTEXT, "c", prompts::REPLY_PLAN)
    }

    fn mutate_prompt(&self, parent_codes: &[String]) -> String {
        prompts::mutate_prompt(BPF_CONTEXT, "c", parent_codes, "// bpf_core_logic")
    }

    async fn build(&self, code: &str) -> anyhow::Result<BuildOutcome> {
        self.cleanup().await?;
        tokio::fs::write(self.build_dir.join("LLMCode.h"), code)
            .await
            .context("failed to write candidate into the bpf scaffold")?;

        if let Err(out) = self.steps.make(&self.build_dir).await? {
            return Ok(BuildOutcome::failed(out.stdout, out.stderr));
        }
        self.steps.attach_test(&self.build_dir).await
    }

    async fn run_experiment(&self) -> anyhow::Result<EvalOutcome> {
        let probe = ProcessGuard::spawn(
            "bpf-probe",
            shell("sudo python3 logic.py", &self.build_dir),
        )?;

        let report = self.harness.run_flow().await;
        let bpftool = self.sh("sudo bpftool prog show", Duration::from_secs(10)).await;

        // The loader runs as root; its process group is out of our reach.
        self.sh(KILL_PROBE, CLEANUP_TIMEOUT).await?;
        let probe_out = probe.stop(Duration::from_secs(5)).await;

        let report = report?;
        let bpftool = bpftool?;
        Ok(report.into_outcome(json!({
            "bpf_logs": probe_out.to_json(),
            "bpftool_logs": bpftool.stdout,
        })))
    }

    fn run_info(&self) -> serde_json::Value {
        json!({ "task_args": self.link.to_json() })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn steps(make: &str, attach_test: &str) -> BuildSteps {
        BuildSteps {
            make: make.into(),
            unload: "echo unload >> unloads".into(),
            attach_test: attach_test.into(),
            retry_pause: Duration::ZERO,
            attach_timeout: Duration::from_millis(300),
            ..BuildSteps::default()
        }
    }

    fn lines(path: &Path) -> usize {
        std::fs::read_to_string(path)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn make_succeeds_on_third_try() {
        let dir = tempfile::tempdir().unwrap();
        let s = steps("echo try >> tries; [ $(wc -l < tries) -ge 3 ]", "true");
        assert!(s.make(dir.path()).await.unwrap().is_ok());
        assert_eq!(lines(&dir.path().join("tries")), 3);
        assert_eq!(lines(&dir.path().join("unloads")), 2);
    }

    #[tokio::test]
    async fn make_gives_up_after_three_tries() {
        let dir = tempfile::tempdir().unwrap();
        let s = steps("echo try >> tries; echo 'LLMCode.h:3: error' 1>&2; exit 2", "true");
        let out = s.make(dir.path()).await.unwrap().unwrap_err();
        assert_eq!(out.returncode, Some(2));
        assert_eq!(out.stderr, "LLMCode.h:3: error");
        assert_eq!(lines(&dir.path().join("tries")), 3);
        assert_eq!(lines(&dir.path().join("unloads")), 3);
    }

    #[tokio::test]
    async fn hung_attach_test_is_a_failed_build() {
        let dir = tempfile::tempdir().unwrap();
        let s = steps("true", "echo loading; sleep 30");
        let started = std::time::Instant::now();
        let out = s.attach_test(dir.path()).await.unwrap();
        assert!(!out.success);
        assert_eq!(out.stdout, "loading");
        assert!(out.stderr.ends_with("probe test timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn attach_test_result_is_the_build_result() {
        let dir = tempfile::tempdir().unwrap();
        let ok = steps("true", "echo attached").attach_test(dir.path()).await.unwrap();
        assert!(ok.success);
        assert_eq!(ok.stdout, "attached");

        let rejected = steps("true", "echo 'invalid mem access' 1>&2; exit 1")
            .attach_test(dir.path())
            .await
            .unwrap();
        assert!(!rejected.success);
        assert_eq!(rejected.stderr, "invalid mem access");
    }

    #[test]
    fn missing_scaffold_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = TcpBpfBackend::new(LinkArgs::default(), dir.path()).err().unwrap();
        assert!(crate::errors::is_config_error(&err));
    }
}
