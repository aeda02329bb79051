//! The command-line front-end: global flags parsed once, then dispatched to
//! a subcommand that only builds a config struct and calls into the engine.

mod cache;
mod plan;
mod run;
mod validate;

use std::path::PathBuf;

use clap::Parser;
use eyre::{Result, WrapErr};

#[derive(clap::Parser)]
#[clap(name = "kiln", version = env!("CARGO_PKG_VERSION"), about = env!("CARGO_PKG_DESCRIPTION"))]
struct Cli {
    /// Number of jobs to run in parallel (default: CPU count - 1)
    #[clap(short, long, global = true)]
    jobs: Option<usize>,
    /// Path to the workflow file (default: search upward for kiln.toml/.yaml/.yml/.json)
    #[clap(long, global = true, value_name = "PATH")]
    file: Option<PathBuf>,
    /// Enables verbose (debug) output
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Suppresses non-error output
    #[clap(short, long, global = true)]
    quiet: bool,
    /// Emit logs as JSON lines instead of compact text
    #[clap(long, global = true)]
    json: bool,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Select and execute jobs
    Run(Box<run::Run>),
    /// Inspect or prune the cache store
    Cache(Box<cache::Cache>),
    /// Print the run plan without executing anything
    Plan(Box<plan::Plan>),
    /// Validate the workflow's DAG without executing anything
    Validate(Box<validate::Validate>),
}

/// Parses argv, initializes logging, and dispatches to a subcommand.
/// Returns the process exit code; a fatal engine error is reported via
/// `color-eyre` and mapped through [`crate::Error::exit_code`].
pub async fn run() -> Result<i32> {
    let args = Cli::parse();

    let level = if args.quiet {
        "warn"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    if std::env::var_os("KILN_LOG").is_none() {
        // SAFETY: single-threaded startup path, before any other thread reads env.
        unsafe { std::env::set_var("KILN_LOG", level) };
    }
    crate::tracing_setup::init(args.json);

    let cwd = std::env::current_dir().wrap_err("could not determine current directory")?;
    let workflow_path = args
        .file
        .or_else(|| crate::config::find(&cwd))
        .ok_or_else(|| eyre::eyre!("no kiln.toml/.yaml/.yml/.json found searching upward from {}", cwd.display()))?;

    match args.command {
        Commands::Run(cmd) => cmd.run(&workflow_path, &cwd, args.jobs).await,
        Commands::Cache(cmd) => cmd.run(&workflow_path),
        Commands::Plan(cmd) => cmd.run(&workflow_path, &cwd),
        Commands::Validate(cmd) => cmd.run(&workflow_path),
    }
}
