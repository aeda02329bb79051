use thiserror::Error;

use crate::cmd::CmdResult;

/// All fatal and per-job error conditions the engine can produce.
///
/// DAG errors and workflow-load errors are fatal before any job runs;
/// repo-facts errors are fatal only in diff-selection mode; cache errors are
/// never fatal (the engine degrades to a miss and logs); step/kind errors
/// fail only the job that produced them.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    JoinPaths(#[from] std::env::JoinPathsError),

    #[cfg(unix)]
    #[error(transparent)]
    Nix(#[from] nix::errno::Errno),

    #[error("{} {} exited with non-zero status: {}\n{}", .0, .1.join(" "), render_exit_status(.3), .2)]
    ScriptFailed(String, Vec<String>, String, CmdResult),

    #[error("workflow load error in {file}: {message}")]
    WorkflowLoad { file: String, message: String },

    #[error("job {job:?} lists cache_dirs outside the workspace: {path}")]
    CacheDirEscapesWorkspace { job: String, path: String },

    #[error("job {job:?} `needs` references unknown job {missing:?}")]
    UnknownNeed { job: String, missing: String },

    #[error("duplicate job name {0:?}")]
    DuplicateJob(String),

    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("not a git repository (searched upward from {0})")]
    NotARepository(String),

    #[error("could not resolve ref {0:?}")]
    UnknownRef(String),

    #[error("cache entry for job {job:?} key {key} is corrupt: {message}")]
    CorruptEntry { job: String, key: String, message: String },

    #[error("job {job:?} step {step:?} failed with exit code {exit_code:?}")]
    StepFailed { job: String, step: String, exit_code: Option<i32> },

    #[error("job {job:?} step {step:?} uses unknown step kind {kind:?}")]
    UnknownStepKind { job: String, step: String, kind: String },

    #[error(transparent)]
    Glob(#[from] globset::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Git(#[from] git2::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Maps a fatal top-level error onto a process exit code. Per-job errors
    /// (`StepFailed`, `UnknownStepKind`, `CorruptEntry`) never reach this:
    /// the scheduler folds them into a `JobResult` instead of propagating an
    /// `Err` out of a run.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::WorkflowLoad { .. }
            | Error::CacheDirEscapesWorkspace { .. }
            | Error::Toml(_)
            | Error::Yaml(_)
            | Error::Json(_) => 2,
            Error::UnknownNeed { .. } | Error::DuplicateJob(_) | Error::Cycle(_) => 3,
            Error::NotARepository(_) | Error::UnknownRef(_) => 4,
            _ => 1,
        }
    }
}

fn render_exit_status(result: &CmdResult) -> String {
    match result.status.code() {
        Some(exit_status) => format!("exit code {exit_status}"),
        None => "no exit status".into(),
    }
}
