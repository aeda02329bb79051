//! `kiln validate`: DAG-only check, no repo facts and no execution. Used in
//! CI to fail fast on a malformed workflow before anything is scheduled.

use std::path::Path;

use eyre::Result;

use crate::config;
use crate::dag::Dag;

#[derive(Debug, clap::Args)]
pub struct Validate {}

impl Validate {
    pub fn run(&self, workflow_path: &Path) -> Result<i32> {
        let workflow = match config::load(workflow_path) {
            Ok(w) => w,
            Err(e) => {
                tracing::error!("{e}");
                return Ok(e.exit_code());
            }
        };
        match Dag::build(&workflow) {
            Ok(dag) => {
                println!("ok: {} jobs, {} topological levels", workflow.jobs.len(), dag.levels.len());
                Ok(0)
            }
            Err(e) => {
                tracing::error!("{e}");
                Ok(e.exit_code())
            }
        }
    }
}
