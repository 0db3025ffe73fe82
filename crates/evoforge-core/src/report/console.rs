use crate::engine::EvolveSummary;
use crate::fingerprint::code_digest;
use crate::model::{RunInfo, StoredCandidate};
use crate::storage::{IterationCounts, RunListing};
use std::fmt::Write as _;

fn fmt_score(s: Option<f64>) -> String {
    s.map(|v| format!("{:.4}", v)).unwrap_or_else(|| "-".into())
}

pub fn render_evolve_summary(s: &EvolveSummary) -> String {
    format!(
        "\nRun {}: {} recorded ({} built, {} evaluated), {} skipped, best score {}",
        s.run_id,
        s.recorded,
        s.built,
        s.evaluated,
        s.skipped,
        fmt_score(s.best_score)
    )
}

pub fn print_evolve_summary(s: &EvolveSummary) {
    eprintln!("{}", render_evolve_summary(s));
}

pub fn render_run_summary(
    info: &RunInfo,
    counts: &[IterationCounts],
    top: &[StoredCandidate],
) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Run {} (task {}, model {}, created {})",
        info.run_id, info.task, info.model, info.created_at
    );
    if counts.is_empty() {
        let _ = writeln!(out, "  no candidates recorded");
        return out;
    }

    let _ = writeln!(out, "\n  {:>4}  {:>8}  {:>6}  {:>9}  {:>10}", "iter", "recorded", "built", "evaluated", "best");
    for c in counts {
        let _ = writeln!(
            out,
            "  {:>4}  {:>8}  {:>6}  {:>9}  {:>10}",
            c.iter,
            c.recorded,
            c.built,
            c.evaluated,
            fmt_score(c.best_score)
        );
    }

    if !top.is_empty() {
        let _ = writeln!(out, "\n  Top candidates:");
        for (rank, c) in top.iter().enumerate() {
            let digest = c
                .record
                .final_code
                .as_deref()
                .map(code_digest)
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "  {:>2}. iter={:<3} sample={:<3} score={}  code={}",
                rank + 1,
                c.record.iter,
                c.record.sample,
                fmt_score(c.record.score()),
                digest
            );
        }
    }
    out
}

pub fn print_run_summary(info: &RunInfo, counts: &[IterationCounts], top: &[StoredCandidate]) {
    eprint!("{}", render_run_summary(info, counts, top));
}

pub fn print_runs(runs: &[RunListing]) {
    if runs.is_empty() {
        eprintln!("No runs in ledger.");
        return;
    }
    for r in runs {
        println!(
            "{:<16} {:<9} {:<14} {:>5} candidates  best {}  {}",
            r.run_id,
            r.task,
            r.model,
            r.candidates,
            fmt_score(r.best_score),
            r.created_at
        );
    }
}
