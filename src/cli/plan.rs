//! `kiln plan`: print the [`crate::plan::RunPlan`] for an invocation without
//! executing anything. Shares selection logic with `kiln run --plan`; this
//! subcommand exists for callers that only want the plan (e.g. a CI step
//! that posts it as a PR comment).

use std::path::Path;

use eyre::Result;

use crate::dag::Dag;
use crate::selector::{self, Mode};
use crate::{config, repo_facts::GitRepoFacts};

#[derive(Debug, clap::Args)]
pub struct Plan {
    /// Change-aware selection: only plan jobs whose `paths` match files
    /// changed relative to this ref
    #[clap(long, value_name = "REF")]
    diff: Option<String>,
}

impl Plan {
    pub fn run(&self, workflow_path: &Path, workspace: &Path) -> Result<i32> {
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

        println!("{}", plan.with_levels(&dag.levels));
        Ok(0)
    }
}
