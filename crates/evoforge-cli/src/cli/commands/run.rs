use super::exit_codes;
use crate::cli::args::RunArgs;
use anyhow::Context;
use evoforge_core::backends::{build_backend, Backend};
use evoforge_core::config::{self, EvolveConfig, RunOverrides, RunSettings};
use evoforge_core::engine::{open_run, ControllerSettings, EvolutionController};
use evoforge_core::fingerprint::capture_git_info;
use evoforge_core::providers::llm::build_provider;
use evoforge_core::storage::Store;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DEFAULT_CONFIG: &str = "evoforge.yaml";

fn load_layered_config(args: &RunArgs) -> anyhow::Result<EvolveConfig> {
    let mut cfg = match &args.config {
        Some(path) => config::load_config(path, args.strict_config)?,
        None if Path::new(DEFAULT_CONFIG).exists() => {
            config::load_config(Path::new(DEFAULT_CONFIG), args.strict_config)?
        }
        None => EvolveConfig::default(),
    };
    cfg.apply_env()?;
    Ok(cfg)
}

fn resolve_settings(args: RunArgs) -> anyhow::Result<RunSettings> {
    let cfg = load_layered_config(&args)?;
    let task_args = args
        .task_args
        .iter()
        .map(|raw| config::parse_task_arg(raw))
        .collect::<Result<Vec<_>, _>>()?;

    let overrides = RunOverrides {
        task: args.task,
        model: args.model,
        workdir: args.workdir,
        db: args.db,
        n_samples: args.n_samples,
        build_retries: args.build_retries,
        num_snippets: args.num_snippets,
        generation_retries: args.generation_retries,
        request_timeout_seconds: args.request_timeout_seconds,
        task_args,
    };
    Ok(RunSettings::resolve(
        &cfg,
        overrides,
        args.start_iter,
        args.end_iter,
        args.run_id,
    )?)
}

pub async fn cmd_run(args: RunArgs) -> anyhow::Result<i32> {
    let settings = resolve_settings(args)?;
    tracing::debug!(event = "config.resolved", settings = ?settings);

    let provider = build_provider(&settings.model)?;
    let backend: Arc<dyn Backend> =
        Arc::from(build_backend(&settings.task, &settings.task_args, &settings.workdir)?);

    let store = Store::open(&settings.db)
        .with_context(|| format!("failed to open ledger {}", settings.db.display()))?;
    store.init_schema()?;

    let source_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let run_id = open_run(
        &store,
        &settings.task,
        &settings.model,
        settings.run_id.as_deref(),
        backend.as_ref(),
        &source_dir,
    )?;
    eprintln!("run: {} (ledger {})", run_id, settings.db.display());

    let controller = EvolutionController::new(
        store,
        provider,
        backend,
        ControllerSettings::from_run(&settings),
        run_id,
    );
    let summary = controller
        .evolve(settings.start_iter, settings.end_iter, capture_git_info(&source_dir))
        .await?;

    evoforge_core::report::console::print_evolve_summary(&summary);
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn run_args(argv: &[&str]) -> RunArgs {
        #[derive(Parser)]
        struct Wrapper {
            #[command(flatten)]
            run: RunArgs,
        }
        let mut full = vec!["evoforge"];
        full.extend_from_slice(argv);
        Wrapper::parse_from(full).run
    }

    #[test]
    fn flags_and_task_args_reach_settings() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join("evoforge.yaml");
        std::fs::write(
            &cfg,
            "configVersion: 1\ntask: webcache\nmodel: gemini-2.0\nsettings:\n  n_samples: 9\ntask_args:\n  byte: true\n",
        )
        .unwrap();

        let args = run_args(&[
            "--config",
            cfg.to_str().unwrap(),
            "--end-iter",
            "3",
            "--n-samples",
            "4",
            "--task-arg=--cache-sizes=[64, 128]",
            "--task-arg",
            "eval_cache_size=64",
        ]);
        let s = resolve_settings(args).unwrap();
        assert_eq!(s.task, "webcache");
        assert_eq!(s.n_samples, 4);
        assert_eq!(s.end_iter, 3);
        assert_eq!(s.task_args["byte"], true);
        assert_eq!(s.task_args["cache_sizes"], serde_json::json!([64, 128]));
        assert_eq!(s.task_args["eval_cache_size"], 64);
    }

    #[test]
    fn continuing_past_zero_needs_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join("c.yaml");
        std::fs::write(&cfg, "task: tcp\nmodel: gpt-4o-mini\n").unwrap();
        let args = run_args(&[
            "--config",
            cfg.to_str().unwrap(),
            "--start-iter",
            "2",
            "--end-iter",
            "4",
        ]);
        let err = resolve_settings(args).unwrap_err();
        assert!(evoforge_core::errors::is_config_error(&err));
    }
}
