use super::exit_codes;
use crate::cli::args::{LedgerArgs, ShowArgs, SummaryArgs};
use anyhow::Context;
use evoforge_core::errors::EvolveError;
use evoforge_core::model::RunInfo;
use evoforge_core::report::console;
use evoforge_core::storage::Store;

/// Opens an existing ledger. Read-only commands never create one.
fn open_ledger(args: &LedgerArgs) -> anyhow::Result<Option<Store>> {
    if !args.db.exists() {
        return Ok(None);
    }
    let store = Store::open(&args.db)
        .with_context(|| format!("failed to open ledger {}", args.db.display()))?;
    store.init_schema()?;
    Ok(Some(store))
}

/// Opens the ledger holding `run_id`; a missing ledger or run is `UnknownRun`.
fn open_run_ledger(args: &LedgerArgs, run_id: &str) -> anyhow::Result<(Store, RunInfo)> {
    let unknown = || EvolveError::UnknownRun(run_id.to_string());
    let store = open_ledger(args)?.ok_or_else(unknown)?;
    let info = store.run_info(run_id)?.ok_or_else(unknown)?;
    Ok((store, info))
}

pub fn cmd_runs(args: LedgerArgs) -> anyhow::Result<i32> {
    let runs = match open_ledger(&args)? {
        Some(store) => store.list_runs()?,
        None => Vec::new(),
    };
    if runs.is_empty() {
        eprintln!("no runs in {}", args.db.display());
    } else {
        console::print_runs(&runs);
    }
    Ok(exit_codes::OK)
}

pub fn cmd_summary(args: SummaryArgs) -> anyhow::Result<i32> {
    let (store, info) = open_run_ledger(&args.ledger, &args.run_id)?;

    let counts = store.iteration_counts(&args.run_id)?;
    let top = store.top_candidates(&args.run_id, args.top)?;

    if args.json {
        let doc = serde_json::json!({
            "run": info,
            "iterations": counts,
            "top": top,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        console::print_run_summary(&info, &counts, &top);
    }
    Ok(exit_codes::OK)
}

pub fn cmd_show(args: ShowArgs) -> anyhow::Result<i32> {
    let (store, _) = open_run_ledger(&args.ledger, &args.run_id)?;

    let stored = store
        .get_candidate(&args.run_id, args.iter, args.sample)?
        .with_context(|| {
            format!(
                "no record for iteration {} sample {} in run '{}'",
                args.iter, args.sample, args.run_id
            )
        })?;

    if args.code {
        match stored.record.final_code.as_deref() {
            Some(code) => println!("{code}"),
            None => anyhow::bail!(
                "record {}/{} of run '{}' has no code",
                args.iter,
                args.sample,
                args.run_id
            ),
        }
    } else {
        println!("{}", serde_json::to_string_pretty(&stored)?);
    }
    Ok(exit_codes::OK)
}
