//! Execution plan compilation.
//!
//! A plan is an ordered list of batches. Each batch holds the stages whose
//! dependencies were all satisfied by earlier batches, coalesced into
//! parallel groups along `parallel_with` edges. Iteration follows
//! declaration order throughout, so a given definition always compiles to
//! the same plan.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::definition::PipelineDefinition;
use crate::errors::{CycleDetectedError, Result};

/// One barrier-delimited step of the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Parallel groups, ordered by their first member's declaration index.
    pub groups: Vec<Vec<String>>,
}

impl Batch {
    /// All stage IDs in this batch, group by group.
    pub fn stage_ids(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().flatten().map(String::as_str)
    }

    /// Number of stages in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }

    /// Whether the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ordered batches for one resolved definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Pipeline name.
    pub pipeline: String,
    /// Batches in execution order.
    pub batches: Vec<Batch>,
}

impl ExecutionPlan {
    /// Total number of stages across all batches.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.batches.iter().map(Batch::len).sum()
    }

    /// Index of the batch containing `stage`.
    #[must_use]
    pub fn batch_of(&self, stage: &str) -> Option<usize> {
        self.batches
            .iter()
            .position(|b| b.stage_ids().any(|id| id == stage))
    }

    /// The plan as nested ID lists (batches → groups → stage IDs).
    #[must_use]
    pub fn shape(&self) -> Vec<Vec<Vec<String>>> {
        self.batches.iter().map(|b| b.groups.clone()).collect()
    }
}

/// Compiles a validated definition into an execution plan.
///
/// Dependencies must already reference existing stages. Fails with
/// [`CycleDetectedError`] if the `depends_on` graph has a cycle; no partial
/// plan is produced.
pub fn compile_plan(def: &PipelineDefinition) -> Result<ExecutionPlan> {
    let order: Vec<&str> = def.stage_ids().collect();
    let index: HashMap<&str, usize> = order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    let deps: Vec<Vec<usize>> = def
        .stages
        .iter()
        .map(|s| {
            s.dependencies()
                .iter()
                .filter_map(|d| index.get(d.as_str()).copied())
                .collect()
        })
        .collect();
    let peers: Vec<Vec<usize>> = def
        .stages
        .iter()
        .map(|s| {
            def.stages
                .iter()
                .enumerate()
                .filter(|(_, other)| other.id != s.id && s.is_parallel_with(other))
                .map(|(j, _)| j)
                .collect()
        })
        .collect();

    let mut scheduled = vec![false; order.len()];
    let mut remaining = order.len();
    let mut batches = Vec::new();

    while remaining > 0 {
        let ready: Vec<usize> = (0..order.len())
            .filter(|&i| !scheduled[i] && deps[i].iter().all(|&d| scheduled[d]))
            .collect();

        if ready.is_empty() {
            let unscheduled: HashSet<usize> = (0..order.len()).filter(|&i| !scheduled[i]).collect();
            let path = find_cycle(&unscheduled, &deps)
                .into_iter()
                .map(|i| order[i].to_string())
                .collect();
            return Err(CycleDetectedError::new(format!("pipeline '{}'", def.name), path).into());
        }

        let groups = group_ready(&ready, &peers)
            .into_iter()
            .map(|g| g.into_iter().map(|i| order[i].to_string()).collect())
            .collect();
        for &i in &ready {
            scheduled[i] = true;
        }
        remaining -= ready.len();
        batches.push(Batch { groups });
    }

    Ok(ExecutionPlan {
        pipeline: def.name.clone(),
        batches,
    })
}

/// Splits the ready set into connected components of the `parallel_with`
/// relation restricted to the ready set.
fn group_ready(ready: &[usize], peers: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let in_ready: HashSet<usize> = ready.iter().copied().collect();
    let mut assigned = HashSet::new();
    let mut groups = Vec::new();

    for &start in ready {
        if !assigned.insert(start) {
            continue;
        }
        let mut group = vec![start];
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for &peer in &peers[node] {
                if in_ready.contains(&peer) && assigned.insert(peer) {
                    group.push(peer);
                    stack.push(peer);
                }
            }
        }
        group.sort_unstable();
        groups.push(group);
    }

    groups
}

/// Finds one cycle among `nodes`, returned with its first node repeated.
fn find_cycle(nodes: &HashSet<usize>, deps: &[Vec<usize>]) -> Vec<usize> {
    let mut sorted: Vec<usize> = nodes.iter().copied().collect();
    sorted.sort_unstable();

    let mut visited = HashSet::new();
    let mut on_stack = HashSet::new();
    let mut path = Vec::new();

    for start in sorted {
        if !visited.contains(&start) {
            if let Some(cycle) = dfs_cycle(start, nodes, deps, &mut visited, &mut on_stack, &mut path) {
                return cycle;
            }
        }
    }
    // Every unscheduled node waits on another unscheduled node, so a cycle
    // always exists; an empty path only results from inconsistent input.
    Vec::new()
}

fn dfs_cycle(
    node: usize,
    nodes: &HashSet<usize>,
    deps: &[Vec<usize>],
    visited: &mut HashSet<usize>,
    on_stack: &mut HashSet<usize>,
    path: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    visited.insert(node);
    on_stack.insert(node);
    path.push(node);

    for &dep in &deps[node] {
        if !nodes.contains(&dep) {
            continue;
        }
        if !visited.contains(&dep) {
            if let Some(cycle) = dfs_cycle(dep, nodes, deps, visited, on_stack, path) {
                return Some(cycle);
            }
        } else if on_stack.contains(&dep) {
            let start = path.iter().position(|&n| n == dep).unwrap_or(0);
            let mut cycle = path[start..].to_vec();
            cycle.push(dep);
            return Some(cycle);
        }
    }

    path.pop();
    on_stack.remove(&node);
    None
}
