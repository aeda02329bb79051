//! Validates `needs` edges, detects cycles, and computes in-degrees, reverse
//! adjacency, and topological levels via Kahn's algorithm.
//!
//! `IndexMap`/`IndexSet` are used throughout so iteration order follows
//! declaration order wherever it's user-observable.

use indexmap::{IndexMap, IndexSet};

use crate::workflow::Workflow;
use crate::{Error, Result};

/// A validated dependency graph over a [`Workflow`]'s jobs.
#[derive(Debug, Clone)]
pub struct Dag {
    /// needs -> needed-by (forward adjacency: a job's dependents)
    pub(crate) dependents: IndexMap<String, IndexSet<String>>,
    /// job -> remaining predecessors at the start of a run
    pub(crate) in_degree: IndexMap<String, usize>,
    /// job -> direct predecessors (as declared by `needs`)
    pub(crate) predecessors: IndexMap<String, IndexSet<String>>,
    /// Topological levels: layers of job names whose predecessors are all in
    /// lower-numbered levels. For display only; the scheduler does not rely
    /// on discrete levels, it reacts to in-degree reaching zero.
    pub levels: Vec<Vec<String>>,
    /// Declaration order, preserved for "jobs begin in workflow-declaration
    /// order" tie-breaking within a topological level.
    pub declaration_order: Vec<String>,
}

impl Dag {
    pub fn build(workflow: &Workflow) -> Result<Self> {
        workflow.validate()?;

        let mut predecessors: IndexMap<String, IndexSet<String>> = IndexMap::new();
        let mut dependents: IndexMap<String, IndexSet<String>> = IndexMap::new();
        let mut in_degree: IndexMap<String, usize> = IndexMap::new();
        let declaration_order: Vec<String> = workflow.jobs.iter().map(|j| j.name.clone()).collect();

        for job in &workflow.jobs {
            predecessors.entry(job.name.clone()).or_default();
            dependents.entry(job.name.clone()).or_default();
            in_degree.entry(job.name.clone()).or_insert(0);
        }
        for job in &workflow.jobs {
            for need in &job.needs {
                predecessors.get_mut(&job.name).unwrap().insert(need.clone());
                dependents.get_mut(need).unwrap().insert(job.name.clone());
                *in_degree.get_mut(&job.name).unwrap() += 1;
            }
        }

        let levels = Self::topological_levels(&declaration_order, &dependents, in_degree.clone())?;

        Ok(Self { dependents, in_degree, predecessors, levels, declaration_order })
    }

    /// Kahn's algorithm: peel off zero-in-degree nodes level by level, in
    /// declaration order within a level. If nodes remain after the queue is
    /// exhausted, they form (or are reachable only through) a cycle.
    fn topological_levels(
        declaration_order: &[String],
        dependents: &IndexMap<String, IndexSet<String>>,
        mut in_degree: IndexMap<String, usize>,
    ) -> Result<Vec<Vec<String>>> {
        let mut levels = Vec::new();
        let mut remaining: usize = in_degree.len();

        loop {
            let level: Vec<String> = declaration_order
                .iter()
                .filter(|name| in_degree.get(*name).copied() == Some(0))
                .cloned()
                .collect();
            if level.is_empty() {
                break;
            }
            // Remove this level from consideration so the next iteration's
            // filter only sees not-yet-peeled nodes.
            for name in &level {
                in_degree.remove(name);
                remaining -= 1;
            }
            for name in &level {
                if let Some(deps) = dependents.get(name) {
                    for dependent in deps {
                        if let Some(count) = in_degree.get_mut(dependent) {
                            *count -= 1;
                        }
                    }
                }
            }
            levels.push(level);
        }

        if remaining > 0 {
            let cycle_path: Vec<String> = in_degree.keys().cloned().collect();
            return Err(Error::Cycle(cycle_path));
        }

        Ok(levels)
    }

    pub fn predecessors_of(&self, job: &str) -> impl Iterator<Item = &str> {
        self.predecessors.get(job).into_iter().flatten().map(|s| s.as_str())
    }

    pub fn dependents_of(&self, job: &str) -> impl Iterator<Item = &str> {
        self.dependents.get(job).into_iter().flatten().map(|s| s.as_str())
    }

    pub fn initial_in_degree(&self, job: &str) -> usize {
        self.in_degree.get(job).copied().unwrap_or(0)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &str> {
        self.declaration_order.iter().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Job, Step};
    use pretty_assertions::assert_eq;

    fn step() -> Step {
        Step { name: "s".into(), kind: "shell".into(), command: Some("true".into()), dir: None, with: Default::default() }
    }

    fn job(name: &str, needs: &[&str]) -> Job {
        Job {
            name: name.into(),
            steps: vec![step()],
            needs: needs.iter().map(|s| s.to_string()).collect(),
            paths: vec![],
            diff_enabled: true,
            inputs: vec![],
            env: Default::default(),
            cache_dirs: vec![],
            requires: Default::default(),
            cache_keep: 5,
        }
    }

    #[test]
    fn linear_chain_has_three_levels() {
        let wf = Workflow::new(vec![job("a", &[]), job("b", &["a"]), job("c", &["b"])]);
        let dag = Dag::build(&wf).unwrap();
        assert_eq!(dag.levels, vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn fan_out_shares_a_level() {
        let wf = Workflow::new(vec![job("a", &[]), job("b", &["a"]), job("c", &["a"])]);
        let dag = Dag::build(&wf).unwrap();
        assert_eq!(dag.levels, vec![vec!["a"], vec!["b", "c"]]);
    }

    #[test]
    fn level_preserves_declaration_order_not_alphabetical() {
        let wf = Workflow::new(vec![job("z", &[]), job("a", &[]), job("m", &["z", "a"])]);
        let dag = Dag::build(&wf).unwrap();
        assert_eq!(dag.levels, vec![vec!["z", "a"], vec!["m"]]);
    }

    #[test]
    fn detects_simple_cycle() {
        let wf = Workflow::new(vec![job("a", &["b"]), job("b", &["a"])]);
        let err = Dag::build(&wf).unwrap_err();
        assert!(matches!(err, Error::Cycle(_)));
    }

    #[test]
    fn detects_longer_cycle_mixed_with_acyclic_nodes() {
        let wf = Workflow::new(vec![
            job("a", &[]),
            job("b", &["a", "d"]),
            job("c", &["b"]),
            job("d", &["c"]),
        ]);
        let err = Dag::build(&wf).unwrap_err();
        assert!(matches!(err, Error::Cycle(_)));
    }

    #[test]
    fn in_degree_and_adjacency_are_correct() {
        let wf = Workflow::new(vec![job("a", &[]), job("b", &["a"]), job("c", &["a"])]);
        let dag = Dag::build(&wf).unwrap();
        assert_eq!(dag.initial_in_degree("a"), 0);
        assert_eq!(dag.initial_in_degree("b"), 1);
        let mut dependents: Vec<_> = dag.dependents_of("a").collect();
        dependents.sort();
        assert_eq!(dependents, vec!["b", "c"]);
    }
}
