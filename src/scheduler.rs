//! Runs a [`RunPlan`] against a [`Dag`], bounded by a worker pool, honoring
//! cache hits and fail-fast/cancellation semantics.
//!
//! A `tokio`-based worker pool gated by a semaphore runs one task per job,
//! checking the cache store before running its steps. All engine-owned
//! mutable state (the ready set, remaining in-degrees, and results) lives
//! behind one `std::sync::Mutex`, and every blocking unit of work (hashing,
//! tar I/O, child-process wait) runs inside `tokio::task::spawn_blocking` so
//! it is bound to an OS thread rather than cooperatively scheduled.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use indexmap::IndexSet;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::cache::CacheStore;
use crate::dag::Dag;
use crate::input_hash;
use crate::key;
use crate::plan::{RunPlan, SkipReason};
use crate::step_executor::{StepContext, StepRegistry};
use crate::tool_version::ToolVersionResolver;
use crate::workflow::{Job, Workflow};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Ok,
    Failed,
    Skipped,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Miss,
    NotApplicable,
}

#[derive(Debug, Clone)]
pub struct JobResult {
    pub name: String,
    pub outcome: JobOutcome,
    pub cache_outcome: CacheOutcome,
    pub failing_step: Option<(String, Option<i32>)>,
    pub duration: Duration,
}

pub struct SchedulerConfig {
    pub workers: usize,
    pub fail_fast: bool,
    pub workspace: PathBuf,
    pub cache_root: PathBuf,
    pub log_dir: PathBuf,
}

impl SchedulerConfig {
    /// Default worker count: `CPU - 1`, minimum 1.
    pub fn default_workers() -> usize {
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1).saturating_sub(1).max(1)
    }
}

struct SchedulerState {
    in_degree: HashMap<String, usize>,
    results: HashMap<String, JobResult>,
    tainted: std::collections::HashSet<String>,
    stopped: bool,
}

pub struct Scheduler {
    workflow: Arc<Workflow>,
    dag: Arc<Dag>,
    cache: Arc<CacheStore>,
    registry: Arc<StepRegistry>,
    tool_versions: Arc<dyn ToolVersionResolver>,
    cfg: Arc<SchedulerConfig>,
}

impl Scheduler {
    pub fn new(
        workflow: Workflow,
        dag: Dag,
        tool_versions: Arc<dyn ToolVersionResolver>,
        cfg: SchedulerConfig,
    ) -> Self {
        let cache = CacheStore::new(cfg.cache_root.clone());
        Self {
            workflow: Arc::new(workflow),
            dag: Arc::new(dag),
            cache: Arc::new(cache),
            registry: Arc::new(StepRegistry::new()),
            tool_versions,
            cfg: Arc::new(cfg),
        }
    }

    pub async fn run(&self, plan: &RunPlan, cancellation: CancellationToken) -> Result<Vec<JobResult>> {
        let selected: IndexSet<String> = plan.selected_jobs.iter().cloned().collect();

        let mut state = SchedulerState {
            in_degree: self
                .dag
                .jobs()
                .map(|name| (name.to_string(), self.dag.predecessors_of(name).count()))
                .collect(),
            results: HashMap::new(),
            tainted: Default::default(),
            stopped: false,
        };

        // Skipped jobs complete instantly as vacuous successes; `needs` never
        // blocks on them, so their dependents' in-degree drops right away as
        // part of setting up the initial ready set.
        let mut initial_ready = Vec::new();
        for (name, reason) in &plan.skipped_jobs {
            state.results.insert(
                name.clone(),
                JobResult {
                    name: name.clone(),
                    outcome: JobOutcome::Skipped,
                    cache_outcome: CacheOutcome::NotApplicable,
                    failing_step: None,
                    duration: Duration::ZERO,
                },
            );
            let _ = reason; // only NoMatchingPaths reaches us via the selector; recorded verbatim
            for dependent in self.dag.dependents_of(name) {
                if let Some(deg) = state.in_degree.get_mut(dependent) {
                    *deg -= 1;
                }
            }
        }
        for name in &selected {
            if state.in_degree.get(name).copied() == Some(0) {
                initial_ready.push(name.clone());
            }
        }

        let total_jobs = selected.len();
        let remaining = Arc::new(AtomicUsize::new(total_jobs));
        let done = Arc::new(Notify::new());
        let state = Arc::new(Mutex::new(state));
        let semaphore = Arc::new(Semaphore::new(self.cfg.workers.max(1)));

        if total_jobs == 0 {
            let state = Mutex::into_inner(Arc::try_unwrap(state).unwrap_or_else(|_| unreachable!())).unwrap();
            return Ok(self.ordered_results(state));
        }

        for name in initial_ready {
            self.spawn_job(
                name,
                selected.clone(),
                state.clone(),
                semaphore.clone(),
                remaining.clone(),
                done.clone(),
                cancellation.clone(),
            );
        }

        loop {
            // `notified()` must be created *before* the condition check: it
            // snapshots the notify_waiters() generation at creation time, so
            // a completion racing in between is still observed. Checking
            // first and calling `notified()` after would let a notification
            // that fires in that window go unseen forever.
            let notified = done.notified();
            if remaining.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }

        let state = Arc::try_unwrap(state).unwrap_or_else(|_| unreachable!()).into_inner().unwrap();
        Ok(self.ordered_results(state))
    }

    fn ordered_results(&self, state: SchedulerState) -> Vec<JobResult> {
        self.dag
            .jobs()
            .filter_map(|name| state.results.get(name).cloned())
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_job(
        &self,
        name: String,
        selected: IndexSet<String>,
        state: Arc<Mutex<SchedulerState>>,
        semaphore: Arc<Semaphore>,
        remaining: Arc<AtomicUsize>,
        done: Arc<Notify>,
        cancellation: CancellationToken,
    ) {
        spawn_job_static(
            name,
            selected,
            self.workflow.clone(),
            self.dag.clone(),
            self.cache.clone(),
            self.registry.clone(),
            self.tool_versions.clone(),
            self.cfg.clone(),
            state,
            semaphore,
            remaining,
            done,
            cancellation,
        );
    }
}

/// Free-function twin of [`Scheduler::spawn_job`] used for dependents spawned
/// from inside an already-running job's completion handler, where `&self`
/// is no longer available.
#[allow(clippy::too_many_arguments)]
fn spawn_job_static(
    name: String,
    selected: IndexSet<String>,
    workflow: Arc<Workflow>,
    dag: Arc<Dag>,
    cache: Arc<CacheStore>,
    registry: Arc<StepRegistry>,
    tool_versions: Arc<dyn ToolVersionResolver>,
    cfg: Arc<SchedulerConfig>,
    state: Arc<Mutex<SchedulerState>>,
    semaphore: Arc<Semaphore>,
    remaining: Arc<AtomicUsize>,
    done: Arc<Notify>,
    cancellation: CancellationToken,
) {
    let fail_fast = cfg.fail_fast;
    tokio::spawn(async move {
        let already_stopped = {
            let state = state.lock().unwrap();
            state.stopped || state.tainted.contains(&name)
        };
        let result = if already_stopped || cancellation.is_cancelled() {
            JobResult {
                name: name.clone(),
                outcome: JobOutcome::Cancelled,
                cache_outcome: CacheOutcome::NotApplicable,
                failing_step: None,
                duration: Duration::ZERO,
            }
        } else {
            let _permit = semaphore.acquire().await.expect("semaphore never closed");
            // Re-check: a job may have been failed by a sibling while this one
            // sat on the semaphore, and fail-fast must not let it reach `running`.
            let stopped_while_waiting = {
                let state = state.lock().unwrap();
                state.stopped || state.tainted.contains(&name)
            };
            if stopped_while_waiting || cancellation.is_cancelled() {
                JobResult {
                    name: name.clone(),
                    outcome: JobOutcome::Cancelled,
                    cache_outcome: CacheOutcome::NotApplicable,
                    failing_step: None,
                    duration: Duration::ZERO,
                }
            } else {
                let job = workflow.job(&name).expect("dag and workflow agree on job names").clone();
                let cache = cache.clone();
                let registry = registry.clone();
                let tool_versions = tool_versions.clone();
                let workspace = cfg.workspace.clone();
                let log_dir = cfg.log_dir.clone();
                let cancellation = cancellation.clone();
                tokio::task::spawn_blocking(move || {
                    run_job(&job, &workspace, &log_dir, &cache, &registry, tool_versions.as_ref(), &cancellation)
                })
                .await
                .expect("job-running task did not panic")
            }
        };

        let mut newly_ready = Vec::new();
        {
            let mut state = state.lock().unwrap();
            state.results.insert(name.clone(), result.clone());

            if fail_fast && result.outcome == JobOutcome::Failed {
                state.stopped = true;
            }

            let taint_dependents = !fail_fast && matches!(result.outcome, JobOutcome::Failed | JobOutcome::Cancelled);

            for dependent in dag.dependents_of(&name) {
                if let Some(deg) = state.in_degree.get_mut(dependent) {
                    *deg -= 1;
                    if taint_dependents {
                        state.tainted.insert(dependent.to_string());
                    }
                    if *deg == 0 && selected.contains(dependent) && !state.results.contains_key(dependent) {
                        newly_ready.push(dependent.to_string());
                    }
                }
            }
        }

        for dependent in newly_ready {
            spawn_job_static(
                dependent,
                selected.clone(),
                workflow.clone(),
                dag.clone(),
                cache.clone(),
                registry.clone(),
                tool_versions.clone(),
                cfg.clone(),
                state.clone(),
                semaphore.clone(),
                remaining.clone(),
                done.clone(),
                cancellation.clone(),
            );
        }

        remaining.fetch_sub(1, Ordering::SeqCst);
        done.notify_waiters();
    });
}

/// Runs one job to completion: cache check, restore-on-hit, or run-steps-
/// then-store-and-prune on a full miss. Always invoked from inside
/// `spawn_blocking`.
fn run_job(
    job: &Job,
    workspace: &std::path::Path,
    log_dir: &std::path::Path,
    cache: &CacheStore,
    registry: &StepRegistry,
    tool_versions: &dyn ToolVersionResolver,
    cancellation: &CancellationToken,
) -> JobResult {
    let start = Instant::now();

    if cancellation.is_cancelled() {
        return JobResult {
            name: job.name.clone(),
            outcome: JobOutcome::Cancelled,
            cache_outcome: CacheOutcome::NotApplicable,
            failing_step: None,
            duration: start.elapsed(),
        };
    }

    if job.caching_enabled() {
        // A hashing failure must not fall back to a fixed digest: that key is
        // deterministic across runs and would serve a stale cache hit on every
        // subsequent invocation instead of just skipping the cache once.
        match input_hash::hash(workspace, &job.inputs, &[]) {
            Ok(digest) => {
                let key = key::derive(job, tool_versions, &digest);

                if cache.lookup(&job.name, &key) == crate::cache::Lookup::Present {
                    if cache.restore(&job.name, &key, workspace).is_ok() {
                        return JobResult {
                            name: job.name.clone(),
                            outcome: JobOutcome::Ok,
                            cache_outcome: CacheOutcome::Hit,
                            failing_step: None,
                            duration: start.elapsed(),
                        };
                    }
                    // restore failure: miss-with-warning, fall through to running steps
                }

                let (outcome, failing_step) = run_steps(job, workspace, log_dir, registry, cancellation);
                if outcome == JobOutcome::Ok {
                    let _ = cache.store(&job.name, &key, workspace, &job.cache_dirs);
                    let _ = cache.prune(&job.name, job.cache_keep);
                }
                JobResult {
                    name: job.name.clone(),
                    outcome,
                    cache_outcome: CacheOutcome::Miss,
                    failing_step,
                    duration: start.elapsed(),
                }
            }
            Err(_) => {
                let (outcome, failing_step) = run_steps(job, workspace, log_dir, registry, cancellation);
                JobResult {
                    name: job.name.clone(),
                    outcome,
                    cache_outcome: CacheOutcome::NotApplicable,
                    failing_step,
                    duration: start.elapsed(),
                }
            }
        }
    } else {
        let (outcome, failing_step) = run_steps(job, workspace, log_dir, registry, cancellation);
        JobResult {
            name: job.name.clone(),
            outcome,
            cache_outcome: CacheOutcome::NotApplicable,
            failing_step,
            duration: start.elapsed(),
        }
    }
}

fn run_steps(
    job: &Job,
    workspace: &std::path::Path,
    log_dir: &std::path::Path,
    registry: &StepRegistry,
    cancellation: &CancellationToken,
) -> (JobOutcome, Option<(String, Option<i32>)>) {
    for step in &job.steps {
        if cancellation.is_cancelled() {
            return (JobOutcome::Cancelled, None);
        }
        let ctx = StepContext { job_name: &job.name, workspace, env: &job.env, log_dir };
        match registry.run(step, &ctx) {
            Ok(outcome) if outcome.success() => continue,
            Ok(outcome) => {
                if cancellation.is_cancelled() {
                    return (JobOutcome::Cancelled, None);
                }
                return (JobOutcome::Failed, Some((step.name.clone(), Some(outcome.exit_code))));
            }
            Err(_) => {
                if cancellation.is_cancelled() {
                    return (JobOutcome::Cancelled, None);
                }
                return (JobOutcome::Failed, Some((step.name.clone(), None)));
            }
        }
    }
    (JobOutcome::Ok, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::Dag;
    use crate::tool_version::ToolVersionResolver;
    use crate::workflow::{Job, Step, Workflow};
    use indexmap::{IndexMap, IndexSet};
    use tempfile::tempdir;

    struct NoTools;
    impl ToolVersionResolver for NoTools {
        fn version(&self, _tool: &str) -> Option<String> {
            None
        }
    }

    fn shell_job(name: &str, needs: &[&str], command: &str) -> Job {
        Job {
            name: name.into(),
            steps: vec![Step {
                name: "run".into(),
                kind: "shell".into(),
                command: Some(command.into()),
                dir: None,
                with: IndexMap::new(),
            }],
            needs: needs.iter().map(|s| s.to_string()).collect(),
            paths: vec![],
            diff_enabled: true,
            inputs: vec![],
            env: IndexMap::new(),
            cache_dirs: vec![],
            requires: IndexSet::new(),
            cache_keep: 5,
        }
    }

    async fn run_plan(workflow: Workflow, fail_fast: bool) -> Vec<JobResult> {
        let workspace = tempdir().unwrap();
        let cache_root = tempdir().unwrap();
        let log_dir = tempdir().unwrap();
        let dag = Dag::build(&workflow).unwrap();
        let plan = RunPlan::new(workflow.jobs.iter().map(|j| j.name.clone()).collect(), vec![]);
        let cfg = SchedulerConfig {
            workers: 2,
            fail_fast,
            workspace: workspace.path().to_path_buf(),
            cache_root: cache_root.path().to_path_buf(),
            log_dir: log_dir.path().to_path_buf(),
        };
        let scheduler = Scheduler::new(workflow, dag, Arc::new(NoTools), cfg);
        scheduler.run(&plan, CancellationToken::new()).await.unwrap()
    }

    #[tokio::test]
    async fn linear_chain_all_succeed() {
        let workflow = Workflow::new(vec![shell_job("a", &[], "true"), shell_job("b", &["a"], "true")]);
        let results = run_plan(workflow, false).await;
        assert!(results.iter().all(|r| r.outcome == JobOutcome::Ok));
    }

    #[tokio::test]
    async fn fail_fast_cancels_dependents_after_failure() {
        let workflow = Workflow::new(vec![
            shell_job("a", &[], "exit 1"),
            shell_job("b", &["a"], "true"),
        ]);
        let results = run_plan(workflow, true).await;
        let a = results.iter().find(|r| r.name == "a").unwrap();
        let b = results.iter().find(|r| r.name == "b").unwrap();
        assert_eq!(a.outcome, JobOutcome::Failed);
        assert_eq!(b.outcome, JobOutcome::Cancelled);
    }

    #[tokio::test]
    async fn non_fail_fast_still_taints_direct_dependents_of_a_failure() {
        let workflow = Workflow::new(vec![
            shell_job("a", &[], "exit 1"),
            shell_job("b", &["a"], "true"),
            shell_job("c", &[], "true"),
        ]);
        let results = run_plan(workflow, false).await;
        let b = results.iter().find(|r| r.name == "b").unwrap();
        let c = results.iter().find(|r| r.name == "c").unwrap();
        assert_eq!(b.outcome, JobOutcome::Cancelled);
        assert_eq!(c.outcome, JobOutcome::Ok);
    }

    #[test]
    fn run_steps_reports_cancelled_not_failed_for_a_step_killed_mid_run() {
        // A step that is still executing when cancellation fires, and then
        // exits non-zero (the shape a SIGTERM-killed child leaves behind),
        // must be classified `Cancelled`, not `Failed` — cancellation isn't
        // observed until after the blocking step call returns.
        let job = shell_job("a", &[], "sleep 0.2; exit 1");
        let workspace = tempdir().unwrap();
        let log_dir = tempdir().unwrap();
        let registry = StepRegistry::new();
        let cancellation = CancellationToken::new();

        let watcher = cancellation.clone();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            watcher.cancel();
        });

        let (outcome, failing_step) =
            run_steps(&job, workspace.path(), log_dir.path(), &registry, &cancellation);
        assert_eq!(outcome, JobOutcome::Cancelled);
        assert!(failing_step.is_none());
    }

    #[tokio::test]
    async fn fail_fast_blocks_a_job_parked_on_the_semaphore() {
        // Two independent jobs (no `needs` edge) under a single worker: `a`
        // fails first and must stop `b` from ever reaching `running`, even
        // though `b` was already spawned and waiting on the semaphore permit
        // before `a`'s failure set `stopped`.
        let workspace = tempdir().unwrap();
        let cache_root = tempdir().unwrap();
        let log_dir = tempdir().unwrap();
        let marker = workspace.path().join("b-ran");
        let workflow = Workflow::new(vec![
            shell_job("a", &[], "exit 1"),
            shell_job("b", &[], &format!("touch {}", marker.display())),
        ]);
        let dag = Dag::build(&workflow).unwrap();
        let plan = RunPlan::new(workflow.jobs.iter().map(|j| j.name.clone()).collect(), vec![]);
        let cfg = SchedulerConfig {
            workers: 1,
            fail_fast: true,
            workspace: workspace.path().to_path_buf(),
            cache_root: cache_root.path().to_path_buf(),
            log_dir: log_dir.path().to_path_buf(),
        };
        let scheduler = Scheduler::new(workflow, dag, Arc::new(NoTools), cfg);
        let results = scheduler.run(&plan, CancellationToken::new()).await.unwrap();

        let b = results.iter().find(|r| r.name == "b").unwrap();
        assert_eq!(b.outcome, JobOutcome::Cancelled);
        assert!(!marker.exists(), "b's subprocess must never have been spawned");
    }

    #[tokio::test]
    async fn fan_out_with_two_workers_all_complete() {
        let workflow = Workflow::new(vec![
            shell_job("root", &[], "true"),
            shell_job("a", &["root"], "true"),
            shell_job("b", &["root"], "true"),
            shell_job("c", &["root"], "true"),
        ]);
        let results = run_plan(workflow, false).await;
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.outcome == JobOutcome::Ok));
    }
}
