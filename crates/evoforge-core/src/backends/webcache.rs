//! Cache-eviction priority functions, built into the simulator tree and scored
//! by replaying a trace.

use super::process::{run_bounded, shell, ProcessOutput};
use super::{prompts, Backend};
use crate::errors::ConfigError;
use crate::model::{BuildOutcome, EvalOutcome};
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;

const LLM_CODE_PATH: &str = "libCacheSim/libCacheSim/cache/eviction/PQEvolve/LLMCode.h";
const TRACE_DIR: &str = "libCacheSim/data";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WebCacheArgs {
    pub trace: String,
    pub cache_sizes: Vec<f64>,
    pub eval_cache_size: f64,
    /// Sizes are percentages of the trace footprint instead of MiB.
    pub percent: bool,
    /// Score on byte miss ratio rather than request miss ratio.
    pub byte: bool,
    pub build_timeout_seconds: u64,
    pub eval_timeout_seconds: u64,
}

impl Default for WebCacheArgs {
    fn default() -> Self {
        Self {
            trace: "CloudPhysics/w106.oracleGeneral.bin.zst".into(),
            cache_sizes: vec![128.0],
            eval_cache_size: 128.0,
            percent: false,
            byte: true,
            build_timeout_seconds: 180,
            eval_timeout_seconds: 3600,
        }
    }
}

impl WebCacheArgs {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.cache_sizes.iter().any(|s| same_size(*s, self.eval_cache_size)) {
            return Err(ConfigError(format!(
                "eval_cache_size {} must be one of cache_sizes {:?}",
                self.eval_cache_size, self.cache_sizes
            )));
        }
        for (i, a) in self.cache_sizes.iter().enumerate() {
            if self.cache_sizes[i + 1..].iter().any(|b| same_size(*a, *b)) {
                return Err(ConfigError(format!(
                    "cache_sizes contains {} more than once",
                    a
                )));
            }
        }
        if !(self.percent || self.byte) {
            return Err(ConfigError(
                "webcache needs percent or byte to be enabled".into(),
            ));
        }
        Ok(())
    }
}

fn same_size(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

pub struct WebCacheBackend {
    args: WebCacheArgs,
    code_dir: PathBuf,
    build_dir: PathBuf,
}

impl WebCacheBackend {
    pub fn new(args: WebCacheArgs, workdir: &Path) -> anyhow::Result<Self> {
        args.validate()?;
        let code_dir = workdir.join("webcache");
        let trace = code_dir.join(TRACE_DIR).join(&args.trace);
        if !trace.exists() {
            return Err(ConfigError(format!("trace {} not found", trace.display())).into());
        }
        Ok(Self {
            build_dir: code_dir.join("build"),
            code_dir,
            args,
        })
    }

    fn trace_arg(&self) -> String {
        format!("../{}/{}", TRACE_DIR, self.args.trace)
    }
}

#[async_trait]
impl Backend for WebCacheBackend {
    fn name(&self) -> &'static str {
        "webcache"
    }

    fn initial_prompt(&self) -> String {
        prompts::initial_prompt(prompts::WEBCACHE_CONTEXT, "cpp", prompts::REPLY_PLAN)
    }

    fn mutate_prompt(&self, parent_codes: &[String]) -> String {
        prompts::mutate_prompt(
            prompts::WEBCACHE_CONTEXT,
            "cpp",
            parent_codes,
            "// priority function",
        )
    }

    async fn build(&self, code: &str) -> anyhow::Result<BuildOutcome> {
        tokio::fs::write(self.code_dir.join(LLM_CODE_PATH), code)
            .await
            .context("failed to write candidate into the simulator tree")?;

        if self.build_dir.exists() {
            tokio::fs::remove_dir_all(&self.build_dir)
                .await
                .context("failed to clear build directory")?;
        }
        tokio::fs::create_dir_all(&self.build_dir)
            .await
            .context("failed to create build directory")?;

        let limit = Some(Duration::from_secs(self.args.build_timeout_seconds));
        let cmake = run_bounded(shell("cmake ../", &self.build_dir), limit).await?;
        if !cmake.success() {
            anyhow::bail!("cmake configuration failed: {}", cmake.stderr);
        }

        let make = run_bounded(shell("make -j", &self.build_dir), limit).await?;
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
        let unit = if self.args.percent { "percent" } else { "mb" };
        let sizes: Vec<String> = self.args.cache_sizes.iter().map(|s| s.to_string()).collect();
        let cmd = format!(
            "./run_multiple_sizes.o {} {} {}",
            self.trace_arg(),
            unit,
            sizes.join(" ")
        );
        let out = run_bounded(
            shell(&cmd, &self.build_dir),
            Some(Duration::from_secs(self.args.eval_timeout_seconds)),
        )
        .await?;
        Ok(score_run(&self.args, out))
    }

    fn run_info(&self) -> serde_json::Value {
        json!({ "task_args": self.args })
    }
}

/// Picks the row for `eval_cache_size` out of the simulator's JSON lines.
fn score_run(args: &WebCacheArgs, out: ProcessOutput) -> EvalOutcome {
    let logs = out.to_json();
    if !out.success() {
        return EvalOutcome {
            exec_status: false,
            eval_results: json!({}),
            eval_logs: logs,
        };
    }

    let mut rows: Vec<serde_json::Value> = out
        .stdout
        .lines()
        .filter(|l| l.trim_start().starts_with('{'))
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect();
    let row_size = |r: &serde_json::Value| r.get("cache_size_mb").and_then(|v| v.as_f64());

    let selected = if args.percent {
        // Percent sizes are resolved against the footprint by the simulator; match by rank.
        let mut sorted = args.cache_sizes.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let rank = sorted.iter().position(|s| same_size(*s, args.eval_cache_size));
        rows.sort_by(|a, b| {
            row_size(a)
                .unwrap_or(f64::MAX)
                .total_cmp(&row_size(b).unwrap_or(f64::MAX))
        });
        if rows.len() == sorted.len() {
            rank.and_then(|i| rows.get(i).cloned())
        } else {
            None
        }
    } else {
        let mut hits = rows
            .iter()
            .filter(|r| row_size(r).is_some_and(|s| same_size(s, args.eval_cache_size)));
        match (hits.next(), hits.next()) {
            (Some(r), None) => Some(r.clone()),
            _ => None,
        }
    };

    let column = if args.byte { "byte_miss_ratio" } else { "miss_ratio" };
    match selected.as_ref().and_then(|r| r.get(column)).and_then(|v| v.as_f64()) {
        Some(miss) => EvalOutcome {
            exec_status: true,
            eval_results: json!({ "score": 1.0 - miss, "results": rows }),
            eval_logs: logs,
        },
        None => EvalOutcome {
            exec_status: false,
            eval_results: json!({ "results": rows }),
            eval_logs: json!({
                "returncode": out.returncode,
                "stdout": out.stdout,
                "stderr": out.stderr,
                "error": format!("no unique {} result for cache size {}", column, args.eval_cache_size),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_output(stdout: &str) -> ProcessOutput {
        ProcessOutput {
            returncode: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
            timed_out: false,
        }
    }

    #[test]
    fn defaults_validate() {
        WebCacheArgs::default().validate().unwrap();
    }

    #[test]
    fn validation_rejects_bad_sizes() {
        let mut a = WebCacheArgs {
            eval_cache_size: 64.0,
            ..Default::default()
        };
        assert!(a.validate().is_err());

        a.cache_sizes = vec![64.0, 64.0];
        assert!(a.validate().unwrap_err().0.contains("more than once"));

        a.cache_sizes = vec![64.0];
        a.byte = false;
        assert!(a.validate().is_err());
    }

    #[test]
    fn scores_byte_miss_ratio_at_eval_size() {
        let args = WebCacheArgs {
            cache_sizes: vec![64.0, 128.0],
            ..Default::default()
        };
        let out = ok_output(
            "loading trace\n\
             {\"cache_size_mb\": 64.0, \"miss_ratio\": 0.5, \"byte_miss_ratio\": 0.6}\n\
             {\"cache_size_mb\": 128.0, \"miss_ratio\": 0.3, \"byte_miss_ratio\": 0.25}\n",
        );
        let r = score_run(&args, out);
        assert!(r.exec_status);
        assert_eq!(r.eval_results["score"].as_f64(), Some(0.75));
        assert_eq!(r.eval_results["results"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn percent_mode_matches_by_rank() {
        let args = WebCacheArgs {
            cache_sizes: vec![10.0, 1.0],
            eval_cache_size: 10.0,
            percent: true,
            byte: false,
            ..Default::default()
        };
        let out = ok_output(
            "{\"cache_size_mb\": 900.0, \"miss_ratio\": 0.2, \"byte_miss_ratio\": 0.1}\n\
             {\"cache_size_mb\": 90.0, \"miss_ratio\": 0.4, \"byte_miss_ratio\": 0.3}\n",
        );
        let r = score_run(&args, out);
        assert!(r.exec_status);
        let score = r.eval_results["score"].as_f64().unwrap();
        assert!((score - 0.8).abs() < 1e-12);
    }

    #[test]
    fn crash_or_missing_row_is_exec_failure() {
        let args = WebCacheArgs::default();
        let crashed = ProcessOutput {
            returncode: Some(139),
            ..Default::default()
        };
        assert!(!score_run(&args, crashed).exec_status);

        let r = score_run(&args, ok_output("{\"cache_size_mb\": 64.0, \"byte_miss_ratio\": 0.1}"));
        assert!(!r.exec_status);
        assert!(r.eval_results.get("score").is_none());
    }

    #[test]
    fn missing_trace_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = WebCacheBackend::new(WebCacheArgs::default(), dir.path())
            .err()
            .unwrap();
        assert!(crate::errors::is_config_error(&err));
    }
}
