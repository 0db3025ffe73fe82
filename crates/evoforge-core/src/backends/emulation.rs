//! Network emulation harness shared by the congestion-control backends: an iperf3
//! flow through a mahimahi delay + trace-driven link, summarized by
//! `mm-throughput-graph`.

use super::process::{run_bounded, shell, ProcessGuard, ProcessOutput};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;

const TRACE_DIR: &str = "tcp_cc/evaluate/sage_traces/traces";
const LOG_DIR: &str = "tcp_cc/evaluate/logs";
const UTILS_DIR: &str = "tcp_cc/utils";
const REVERSE_TRACE: &str = "wired192";
const HELPER_GRACE: Duration = Duration::from_secs(5);

/// Link shape for one experiment. Bandwidth in Mbit/s, one-way delay in ms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LinkArgs {
    pub bw: u32,
    pub delay: u32,
    pub bdp_multiplier: u32,
    /// iperf3 flow length in seconds.
    pub timeout: u64,
}

impl Default for LinkArgs {
    fn default() -> Self {
        Self {
            bw: 12,
            delay: 20,
            bdp_multiplier: 2,
            timeout: 20,
        }
    }
}

impl LinkArgs {
    /// Bandwidth-delay product in 1500-byte packets.
    pub fn bdp(&self) -> f64 {
        (2.0 * self.bw as f64 * self.delay as f64) / 12.0
    }

    pub fn queue_packets(&self) -> u64 {
        (self.bdp() * self.bdp_multiplier as f64).round_ties_even() as u64
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "bw": self.bw,
            "delay": self.delay,
            "bdp_multiplier": self.bdp_multiplier,
            "timeout": self.timeout,
            "bdp": self.bdp(),
            "qs": self.queue_packets(),
        })
    }
}

/// Fields read from `mm-throughput-graph`'s summary on stderr.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LinkSummary {
    pub utilization: f64,
    pub throughput: f64,
    pub queuing_delay_95p: f64,
    pub signal_delay_95p: f64,
}

impl LinkSummary {
    /// `None` when the summary has no throughput line (flow never ran).
    pub fn parse(text: &str) -> Option<Self> {
        let mut s = LinkSummary::default();
        let mut saw_throughput = false;
        for line in text.lines() {
            let words: Vec<&str> = line.split_whitespace().collect();
            let second_last = || {
                words
                    .len()
                    .checked_sub(2)
                    .and_then(|i| words.get(i))
                    .copied()
                    .unwrap_or("")
            };
            if line.contains("utilization") {
                let pct = second_last().trim_start_matches('(').trim_end_matches('%');
                s.utilization = pct.parse().unwrap_or(0.0);
                if let Some(t) = words.get(2).and_then(|w| w.parse().ok()) {
                    s.throughput = t;
                    saw_throughput = true;
                }
            }
            if line.contains("95th percentile per-packet queueing delay") {
                s.queuing_delay_95p = second_last().parse().unwrap_or(0.0);
            }
            if line.contains("95th percentile signal delay") {
                s.signal_delay_95p = second_last().parse().unwrap_or(0.0);
            }
        }
        saw_throughput.then_some(s)
    }

    pub fn score(&self) -> f64 {
        self.throughput / (1e-5 + self.queuing_delay_95p)
    }
}

/// What one emulated flow produced.
pub struct FlowReport {
    pub summary: Option<LinkSummary>,
    pub logs: serde_json::Value,
}

impl FlowReport {
    /// Folds extra helper logs in and turns the summary into an outcome.
    pub fn into_outcome(self, extra_logs: serde_json::Value) -> crate::model::EvalOutcome {
        let mut logs = self.logs;
        if let (Some(dst), serde_json::Value::Object(src)) = (logs.as_object_mut(), extra_logs) {
            dst.extend(src);
        }
        match self.summary {
            Some(s) => crate::model::EvalOutcome {
                exec_status: true,
                eval_results: json!({ "score": s.score(), "results": s }),
                eval_logs: logs,
            },
            None => crate::model::EvalOutcome {
                exec_status: false,
                eval_results: json!({}),
                eval_logs: logs,
            },
        }
    }
}

pub struct EmulationHarness {
    pub link: LinkArgs,
    trace_dir: PathBuf,
    log_dir: PathBuf,
    utils_dir: PathBuf,
}

impl EmulationHarness {
    pub fn new(link: LinkArgs, workdir: &Path) -> Self {
        Self {
            link,
            trace_dir: workdir.join(TRACE_DIR),
            log_dir: workdir.join(LOG_DIR),
            utils_dir: workdir.join(UTILS_DIR),
        }
    }

    pub fn trace_path(&self) -> PathBuf {
        self.trace_dir.join(format!("wired{}", self.link.bw))
    }

    pub fn check_layout(&self) -> Result<(), crate::errors::ConfigError> {
        for p in [self.trace_path(), self.trace_dir.join(REVERSE_TRACE), self.utils_dir.clone()] {
            if !p.exists() {
                return Err(crate::errors::ConfigError(format!(
                    "{} not found",
                    p.display()
                )));
            }
        }
        Ok(())
    }

    fn flow_command(&self, uplink_log: &Path) -> String {
        let qs = self.link.queue_packets();
        format!(
            "mm-delay {delay} mm-link {trace} {reverse} \
             --uplink-queue-args=\"packets={qs}\" --downlink-queue-args=\"packets={qs}\" \
             --uplink-queue=droptail --downlink-queue=droptail --uplink-log={log} \
             -- bash -c 'cd {utils} && sudo LD_PRELOAD=./heuristic.so iperf3 -c $MAHIMAHI_BASE -t {t}'",
            delay = self.link.delay,
            trace = self.trace_path().display(),
            reverse = self.trace_dir.join(REVERSE_TRACE).display(),
            log = uplink_log.display(),
            utils = self.utils_dir.display(),
            t = self.link.timeout,
        )
    }

    /// Runs one bounded flow. The traffic server lives only for this call.
    pub async fn run_flow(&self) -> anyhow::Result<FlowReport> {
        tokio::fs::create_dir_all(&self.log_dir).await?;
        let down = self.log_dir.join("down");
        let _ = tokio::fs::remove_file(&down).await;

        let _ = run_bounded(shell("pkill iperf3", &self.log_dir), Some(HELPER_GRACE)).await;
        let server = ProcessGuard::spawn("iperf3-server", shell("iperf3 -s", &self.log_dir))?;

        let flow = run_bounded(
            shell(&self.flow_command(&down), &self.log_dir),
            Some(Duration::from_secs(self.link.timeout + 5)),
        )
        .await?;
        let server_out = server.stop(HELPER_GRACE).await;

        let mut logs = json!({
            "iperf_logs": flow_logs(&flow),
            "iperf_server_logs": server_out.to_json(),
        });
        if !down.exists() {
            tracing::warn!(event = "emulation.no_log", path = %down.display());
            return Ok(FlowReport { summary: None, logs });
        }

        let graph = run_bounded(
            shell("mm-throughput-graph 500 down > /dev/null", &self.log_dir),
            Some(Duration::from_secs(30)),
        )
        .await?;
        logs["throughput_summary"] = json!(graph.stderr);
        Ok(FlowReport {
            summary: LinkSummary::parse(&graph.stderr),
            logs,
        })
    }
}

fn flow_logs(flow: &ProcessOutput) -> serde_json::Value {
    let mut v = flow.to_json();
    // The flow is cut at `timeout + 5`; hitting that bound is the normal exit.
    v["cut_at_bound"] = json!(flow.timed_out);
    v
}
