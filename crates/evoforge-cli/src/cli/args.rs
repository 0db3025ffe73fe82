use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "evoforge",
    version,
    about = "Evolve buildable heuristics with a language model: generate, build, evaluate, select"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,

    /// log output format on stderr (level via EVOFORGE_LOG)
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// run or continue an evolution over iterations [start-iter, end-iter)
    Run(RunArgs),
    /// write a sample evoforge.yaml
    Init(InitArgs),
    /// list runs in the ledger
    Runs(LedgerArgs),
    /// per-iteration counts and best candidates of a run
    Summary(SummaryArgs),
    /// print one candidate record as JSON
    Show(ShowArgs),
    Version,
}

#[derive(Parser, Clone)]
pub struct RunArgs {
    /// config file (defaults to ./evoforge.yaml when present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// fail on unknown config keys instead of warning
    #[arg(long)]
    pub strict_config: bool,

    /// webcache | tcp | tcpbpf
    #[arg(long)]
    pub task: Option<String>,

    /// model alias (gemini-2.0 | gemini-2.5 | gpt-4o-mini)
    #[arg(long)]
    pub model: Option<String>,

    #[arg(long)]
    pub n_samples: Option<u32>,

    #[arg(long, default_value_t = 0)]
    pub start_iter: u32,

    #[arg(long)]
    pub end_iter: u32,

    /// continue this run instead of allocating a new one
    #[arg(long)]
    pub run_id: Option<String>,

    #[arg(long)]
    pub db: Option<PathBuf>,

    /// directory holding the domain source trees
    #[arg(long)]
    pub workdir: Option<PathBuf>,

    /// backend argument as key=value (repeatable), e.g. --task-arg cache_sizes=[64,128]
    #[arg(long = "task-arg", value_name = "KEY=VALUE")]
    pub task_args: Vec<String>,

    /// build attempts per candidate
    #[arg(long)]
    pub build_retries: Option<u32>,

    /// parents fed into each mutation prompt
    #[arg(long)]
    pub num_snippets: Option<usize>,

    /// retries for a failed chat request (0 aborts the run on the first failure)
    #[arg(long)]
    pub generation_retries: Option<u32>,

    #[arg(long)]
    pub request_timeout_seconds: Option<u64>,
}

#[derive(Parser, Clone)]
pub struct InitArgs {
    #[arg(long, default_value = "evoforge.yaml")]
    pub config: PathBuf,

    /// also write a .gitignore for the ledger directory
    #[arg(long)]
    pub gitignore: bool,
}

#[derive(Parser, Clone)]
pub struct LedgerArgs {
    #[arg(long, env = "EVOFORGE_DB", default_value = ".evoforge/ledger.db")]
    pub db: PathBuf,
}

#[derive(Parser, Clone)]
pub struct SummaryArgs {
    #[command(flatten)]
    pub ledger: LedgerArgs,

    #[arg(long)]
    pub run_id: String,

    /// number of best candidates to list
    #[arg(long, default_value_t = 5)]
    pub top: u32,

    /// print the summary as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Clone)]
pub struct ShowArgs {
    #[command(flatten)]
    pub ledger: LedgerArgs,

    #[arg(long)]
    pub run_id: String,

    #[arg(long)]
    pub iter: u32,

    #[arg(long)]
    pub sample: u32,

    /// print only the final code
    #[arg(long)]
    pub code: bool,
}
