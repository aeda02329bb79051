//! Resolved run settings: the result of layering CLI flags over environment
//! variables over built-in defaults. A plain struct — kiln's surface is
//! small enough that codegen from a schema buys nothing a few `Option`
//! fields don't already give us.

use std::path::PathBuf;

use crate::env;
use crate::scheduler::SchedulerConfig;

#[derive(Debug, Clone)]
pub struct Settings {
    pub workers: usize,
    pub fail_fast: bool,
    pub workspace: PathBuf,
    pub cache_root: PathBuf,
    pub log_dir: PathBuf,
    pub json_logs: bool,
}

impl Settings {
    /// Builds settings from explicit CLI overrides, falling back to
    /// `KILN_JOBS` / `KILN_CACHE_DIR`, then to the engine's defaults.
    pub fn resolve(workers: Option<usize>, fail_fast: bool, workspace: PathBuf, json_logs: bool) -> Self {
        let workers = workers.or(*env::KILN_JOBS).unwrap_or_else(SchedulerConfig::default_workers);
        let cache_root = env::KILN_CACHE_DIR.clone();
        let log_dir = workspace.join(".kiln").join("logs");
        Self { workers, fail_fast, workspace, cache_root, log_dir, json_logs }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            workers: self.workers,
            fail_fast: self.fail_fast,
            workspace: self.workspace.clone(),
            cache_root: self.cache_root.clone(),
            log_dir: self.log_dir.clone(),
        }
    }
}
