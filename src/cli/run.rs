//! `kiln run`: the primary engine entry point — load workflow, select jobs,
//! build the DAG, drive the scheduler.

use std::path::Path;
use std::sync::Arc;

use eyre::Result;
use tokio_util::sync::CancellationToken;

use crate::dag::Dag;
use crate::scheduler::{CacheOutcome, JobOutcome, Scheduler};
use crate::selector::{self, Mode};
use crate::tool_version::ShellToolVersionResolver;
use crate::{config, repo_facts::GitRepoFacts, JobResult, Settings};

#[derive(Debug, clap::Args)]
pub struct Run {
    /// Select every job, ignoring change-aware filtering (default when
    /// `--diff` is not given)
    #[clap(long, conflicts_with = "diff")]
    all: bool,
    /// Change-aware selection: only run jobs whose `paths` match files
    /// changed relative to this ref
    #[clap(long, value_name = "REF")]
    diff: Option<String>,
    /// Let independent jobs keep running after a failure, tainting only
    /// the failed job's dependents
    #[clap(long)]
    no_fail_fast: bool,
    /// Print the resolved run plan before executing
    #[clap(long)]
    plan: bool,
}

impl Run {
    pub async fn run(&self, workflow_path: &Path, workspace: &Path, jobs: Option<usize>) -> Result<i32> {
        let workflow = match config::load(workflow_path) {
            Ok(w) => w,
            Err(e) => {
                tracing::error!("{e}");
                return Ok(e.exit_code());
            }
        };

        let dag = match Dag::build(&workflow) {
            Ok(d) => d,
            Err(e) => {
                tracing::error!("{e}");
                return Ok(e.exit_code());
            }
        };

        if self.all {
            tracing::debug!("--all given explicitly; this is the default when --diff is absent");
        }
        let mode = if self.diff.is_some() { Mode::Diff } else { Mode::All };
        let facts = if mode == Mode::Diff {
            match GitRepoFacts::discover(workspace) {
                Ok(f) => Some(f),
                Err(e) => {
                    tracing::error!("{e}");
                    return Ok(e.exit_code());
                }
            }
        } else {
            None
        };
        let plan = match selector::select(
            &workflow,
            mode,
            facts.as_ref().map(|f| f as &dyn crate::repo_facts::RepoFacts),
            self.diff.as_deref(),
        ) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("{e}");
                return Ok(e.exit_code());
            }
        };

        if self.plan {
            println!("{}", plan.clone().with_levels(&dag.levels));
        }

        let fail_fast = !self.no_fail_fast;
        let settings = Settings::resolve(jobs, fail_fast, workspace.to_path_buf(), false);

        let cancellation = CancellationToken::new();
        let ctrl_c_token = cancellation.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("received interrupt, stopping new jobs and signalling running children");
                ctrl_c_token.cancel();
                #[cfg(unix)]
                crate::cmd::kill_all(nix::sys::signal::Signal::SIGTERM);
            }
        });

        let tool_versions = Arc::new(ShellToolVersionResolver::new());
        let scheduler = Scheduler::new(workflow, dag, tool_versions, settings.scheduler_config());
        let results = scheduler.run(&plan, cancellation).await?;

        print_results(&results);

        let any_failed = results.iter().any(|r| r.outcome == JobOutcome::Failed);
        Ok(if any_failed { 1 } else { 0 })
    }
}

fn print_results(results: &[JobResult]) {
    for r in results {
        let outcome = match r.outcome {
            JobOutcome::Ok => "ok",
            JobOutcome::Failed => "failed",
            JobOutcome::Skipped => "skipped",
            JobOutcome::Cancelled => "cancelled",
        };
        let cache = match r.cache_outcome {
            CacheOutcome::Hit => " (cache hit)",
            CacheOutcome::Miss => " (cache miss)",
            CacheOutcome::NotApplicable => "",
        };
        match &r.failing_step {
            Some((step, Some(code))) => {
                println!("{:<20} {outcome}{cache} — step {step:?} exited {code}", r.name)
            }
            Some((step, None)) => println!("{:<20} {outcome}{cache} — step {step:?} could not run", r.name),
            None => println!("{:<20} {outcome}{cache} ({:.2}s)", r.name, r.duration.as_secs_f64()),
        }
    }
}
