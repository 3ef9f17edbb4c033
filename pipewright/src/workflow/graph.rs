//! Job dependency graph and execution levels.
//!
//! `level(j) = 0` when `j` needs nothing, otherwise one more than the deepest
//! job it needs. Depths are memoized; a job seen again while its own depth
//! is still being computed closes a cycle.

use std::collections::{BTreeMap, BTreeSet};

use super::spec::JobSpec;
use crate::errors::GraphError;

/// A validated, acyclic `needs` graph partitioned into levels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobGraph {
    needs: BTreeMap<String, BTreeSet<String>>,
    depth: BTreeMap<String, usize>,
    levels: Vec<Vec<String>>,
}

impl JobGraph {
    /// Builds the graph from a `job -> needs` map.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnknownDependency`] if any job needs a job that
    /// is not in the map, checked before cycles, and
    /// [`GraphError::CycleDetected`] otherwise if the relation has a cycle.
    pub fn new(needs: BTreeMap<String, BTreeSet<String>>) -> Result<Self, GraphError> {
        for (job, deps) in &needs {
            if let Some(dep) = deps.iter().find(|d| !needs.contains_key(*d)) {
                return Err(GraphError::UnknownDependency {
                    job: job.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        let mut depth = BTreeMap::new();
        let mut in_progress = Vec::new();
        for job in needs.keys() {
            visit(job, &needs, &mut depth, &mut in_progress)?;
        }

        let level_count = depth.values().max().map_or(0, |d| d + 1);
        let mut levels = vec![Vec::new(); level_count];
        for (job, d) in &depth {
            levels[*d].push(job.clone());
        }

        Ok(Self {
            needs,
            depth,
            levels,
        })
    }

    /// Builds the graph from workflow jobs.
    pub fn from_jobs(jobs: &BTreeMap<String, JobSpec>) -> Result<Self, GraphError> {
        Self::new(
            jobs.iter()
                .map(|(name, job)| (name.clone(), job.needs.clone()))
                .collect(),
        )
    }

    /// Returns the levels in execution order. Jobs within a level are sorted.
    #[must_use]
    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    /// Returns the level of `job`.
    #[must_use]
    pub fn level_of(&self, job: &str) -> Option<usize> {
        self.depth.get(job).copied()
    }

    /// Returns the direct dependencies of `job`.
    #[must_use]
    pub fn dependencies(&self, job: &str) -> Option<&BTreeSet<String>> {
        self.needs.get(job)
    }

    /// Returns every job `job` transitively needs.
    #[must_use]
    pub fn ancestors(&self, job: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = vec![job];
        while let Some(current) = stack.pop() {
            if let Some(deps) = self.needs.get(current) {
                for dep in deps {
                    if seen.insert(dep.clone()) {
                        stack.push(dep);
                    }
                }
            }
        }
        seen
    }

    /// Returns the number of jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.needs.len()
    }

    /// Returns true if the graph has no jobs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.needs.is_empty()
    }
}

fn visit(
    job: &str,
    needs: &BTreeMap<String, BTreeSet<String>>,
    depth: &mut BTreeMap<String, usize>,
    in_progress: &mut Vec<String>,
) -> Result<usize, GraphError> {
    if let Some(d) = depth.get(job) {
        return Ok(*d);
    }
    if let Some(pos) = in_progress.iter().position(|j| j == job) {
        let mut path = in_progress[pos..].to_vec();
        path.push(job.to_string());
        return Err(GraphError::CycleDetected {
            job: job.to_string(),
            path,
        });
    }

    in_progress.push(job.to_string());
    let mut d = 0;
    if let Some(deps) = needs.get(job) {
        for dep in deps {
            d = d.max(visit(dep, needs, depth, in_progress)? + 1);
        }
    }
    in_progress.pop();

    depth.insert(job.to_string(), d);
    Ok(d)
}
