use super::args::*;
use std::path::Path;

pub mod ledger;
pub mod run;

pub mod exit_codes {
    pub const OK: i32 = 0;
    pub const RUN_FAILED: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
}

const GITIGNORE: &str = "/.evoforge/\n*.db-shm\n*.db-wal\n";

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.cmd {
        Command::Run(args) => run::cmd_run(args).await,
        Command::Init(args) => cmd_init(args),
        Command::Runs(args) => ledger::cmd_runs(args),
        Command::Summary(args) => ledger::cmd_summary(args),
        Command::Show(args) => ledger::cmd_show(args),
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_init(args: InitArgs) -> anyhow::Result<i32> {
    if args.config.exists() {
        eprintln!("note: {} already exists", args.config.display());
    } else {
        ensure_parent_dir(&args.config)?;
        evoforge_core::config::write_sample_config(&args.config)?;
        eprintln!("created {}", args.config.display());
    }

    if args.gitignore {
        write_file_if_missing(Path::new(".gitignore"), GITIGNORE)?;
    }
    Ok(exit_codes::OK)
}

fn write_file_if_missing(path: &Path, content: &str) -> anyhow::Result<()> {
    ensure_parent_dir(path)?;
    if path.exists() {
        eprintln!("note: {} already exists (skipped)", path.display());
    } else {
        std::fs::write(path, content)?;
        eprintln!("created {}", path.display());
    }
    Ok(())
}

pub(crate) fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}
