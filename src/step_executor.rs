//! Runs a single [`Step`] and reports its outcome. The `shell` kind is built
//! into the engine; other kinds dispatch through a tag-keyed registry rather
//! than subtype inheritance over the step type itself.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use crate::cmd::CmdLineRunner;
use crate::workflow::Step;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl StepOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Everything a step needs to run that isn't in the step's own declaration:
/// the job it belongs to (for logging/error context), the workspace root,
/// and the job's resolved environment.
pub struct StepContext<'a> {
    pub job_name: &'a str,
    pub workspace: &'a Path,
    pub env: &'a indexmap::IndexMap<String, String>,
    pub log_dir: &'a Path,
}

pub trait StepKindExecutor: Send + Sync {
    fn execute(&self, step: &Step, ctx: &StepContext) -> Result<StepOutcome>;
}

struct ShellExecutor;

impl StepKindExecutor for ShellExecutor {
    fn execute(&self, step: &Step, ctx: &StepContext) -> Result<StepOutcome> {
        let command = step.command.as_deref().unwrap_or_default();
        let dir = ctx.workspace.join(step.working_dir());
        let result = CmdLineRunner::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&dir)
            .envs(ctx.env.iter())
            .execute()?;
        Ok(StepOutcome { stdout: result.stdout.clone(), stderr: result.stderr.clone(), exit_code: result.exit_code() })
    }
}

/// Tag -> executor registry. `shell` is always present; extension kinds are
/// registered by callers that link in additional step-kind crates (none
/// ship with the engine itself).
pub struct StepRegistry {
    executors: HashMap<String, Box<dyn StepKindExecutor>>,
}

impl Default for StepRegistry {
    fn default() -> Self {
        let mut executors: HashMap<String, Box<dyn StepKindExecutor>> = HashMap::new();
        executors.insert("shell".to_string(), Box::new(ShellExecutor));
        Self { executors }
    }
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, executor: Box<dyn StepKindExecutor>) {
        self.executors.insert(kind.into(), executor);
    }

    /// Runs `step`, then appends its captured output to a per-step log file
    /// under `ctx.log_dir` in one write once the step completes — output is
    /// not streamed live.
    pub fn run(&self, step: &Step, ctx: &StepContext) -> Result<StepOutcome> {
        let executor = self.executors.get(&step.kind).ok_or_else(|| Error::UnknownStepKind {
            job: ctx.job_name.to_string(),
            step: step.name.clone(),
            kind: step.kind.clone(),
        })?;
        let outcome = executor.execute(step, ctx)?;
        self.append_log(ctx, step, &outcome)?;
        Ok(outcome)
    }

    fn append_log(&self, ctx: &StepContext, step: &Step, outcome: &StepOutcome) -> Result<()> {
        std::fs::create_dir_all(ctx.log_dir)?;
        let log_path = self.log_path(ctx.log_dir, ctx.job_name, &step.name);
        let mut file = OpenOptions::new().create(true).append(true).open(log_path)?;
        writeln!(file, "=== step {:?} (exit {}) ===", step.name, outcome.exit_code)?;
        if !outcome.stdout.is_empty() {
            writeln!(file, "--- stdout ---\n{}", outcome.stdout)?;
        }
        if !outcome.stderr.is_empty() {
            writeln!(file, "--- stderr ---\n{}", outcome.stderr)?;
        }
        Ok(())
    }

    fn log_path(&self, log_dir: &Path, job_name: &str, step_name: &str) -> PathBuf {
        log_dir.join(format!("{job_name}.{step_name}.log"))
    }
}
