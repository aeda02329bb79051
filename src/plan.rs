//! The resolved selection of jobs for one invocation, produced by
//! [`crate::selector`] before [`crate::dag`] sees the (pruned) graph.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    NoMatchingPaths,
    UpstreamSkipped,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SkipReason::NoMatchingPaths => "no-matching-paths",
            SkipReason::UpstreamSkipped => "upstream-skipped",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPlan {
    pub selected_jobs: Vec<String>,
    pub skipped_jobs: Vec<(String, SkipReason)>,
    #[serde(rename = "generatedAt")]
    pub generated_at: String,
}

impl RunPlan {
    pub fn new(selected_jobs: Vec<String>, skipped_jobs: Vec<(String, SkipReason)>) -> Self {
        Self { selected_jobs, skipped_jobs, generated_at: chrono::Utc::now().to_rfc3339() }
    }

    /// Fill in `topological_levels`, restricted to selected jobs, for display.
    pub fn with_levels(self, levels: &[Vec<String>]) -> RunPlanWithLevels {
        let selected: std::collections::HashSet<_> = self.selected_jobs.iter().cloned().collect();
        let topological_levels = levels
            .iter()
            .map(|level| level.iter().filter(|n| selected.contains(*n)).cloned().collect::<Vec<_>>())
            .filter(|level: &Vec<String>| !level.is_empty())
            .collect();
        RunPlanWithLevels { plan: self, topological_levels }
    }

    pub fn is_selected(&self, job: &str) -> bool {
        self.selected_jobs.iter().any(|j| j == job)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPlanWithLevels {
    #[serde(flatten)]
    pub plan: RunPlan,
    pub topological_levels: Vec<Vec<String>>,
}

impl std::fmt::Display for RunPlanWithLevels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Run plan ({} selected, {} skipped):", self.plan.selected_jobs.len(), self.plan.skipped_jobs.len())?;
        for (i, level) in self.topological_levels.iter().enumerate() {
            writeln!(f, "  level {i}: {}", level.join(", "))?;
        }
        for (name, reason) in &self.plan.skipped_jobs {
            writeln!(f, "  skip {name}: {reason}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_exclude_skipped_jobs() {
        let plan = RunPlan::new(vec!["a".into()], vec![("b".into(), SkipReason::NoMatchingPaths)]);
        let with_levels = plan.with_levels(&[vec!["a".into(), "b".into()]]);
        assert_eq!(with_levels.topological_levels, vec![vec!["a".to_string()]]);
    }
}
