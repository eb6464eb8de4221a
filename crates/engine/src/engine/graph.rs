//! Dependency graph resolution.
//!
//! Builds a directed graph over job ids from `needs` edges, rejects
//! cycles, and produces a topological order. Pure function of the
//! definition; nothing here touches run state.

use std::collections::{BTreeMap, HashMap};

use crate::definition::WorkflowDefinition;
use crate::error::{EngineError, EngineResult};

/// Resolved dependency graph for one workflow definition.
#[derive(Debug, Clone)]
pub struct JobGraph {
    /// Job ids in a valid topological order (every job after its needs).
    pub order: Vec<String>,

    /// Reverse edges: job id -> jobs that depend on it.
    pub dependents: BTreeMap<String, Vec<String>>,
}

impl JobGraph {
    /// Jobs with no dependencies; immediately ready when a run starts.
    pub fn roots<'a>(&'a self, definition: &'a WorkflowDefinition) -> Vec<&'a str> {
        self.order
            .iter()
            .filter(|id| {
                definition
                    .job(id)
                    .map(|j| j.needs_ids().is_empty())
                    .unwrap_or(false)
            })
            .map(|id| id.as_str())
            .collect()
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Resolve the `needs` DAG of a definition.
///
/// Returns `EngineError::Cycle` naming the offending path if the graph
/// is not acyclic. Edge targets are assumed validated by the parser.
pub fn resolve(definition: &WorkflowDefinition) -> EngineResult<JobGraph> {
    let mut colors: HashMap<&str, Color> = definition
        .job_ids()
        .into_iter()
        .map(|id| (id, Color::White))
        .collect();

    let mut order = Vec::with_capacity(definition.jobs.len());
    let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for job in definition.jobs.values() {
        for needed in job.needs_ids() {
            dependents
                .entry(needed.to_string())
                .or_default()
                .push(job.id.clone());
        }
    }

    // Iterate in sorted id order so the topological order is deterministic.
    for id in definition.job_ids() {
        if colors[id] == Color::White {
            visit(definition, id, &mut colors, &mut order, &mut Vec::new())?;
        }
    }

    Ok(JobGraph { order, dependents })
}

fn visit<'a>(
    definition: &'a WorkflowDefinition,
    id: &'a str,
    colors: &mut HashMap<&'a str, Color>,
    order: &mut Vec<String>,
    path: &mut Vec<&'a str>,
) -> EngineResult<()> {
    colors.insert(id, Color::Gray);
    path.push(id);

    if let Some(job) = definition.job(id) {
        for needed in job.needs_ids() {
            match colors.get(needed).copied().unwrap_or(Color::White) {
                Color::Gray => {
                    // Back edge: report the cycle path from the revisited node.
                    let start = path.iter().position(|p| *p == needed).unwrap_or(0);
                    let mut cycle: Vec<&str> = path[start..].to_vec();
                    cycle.push(needed);
                    return Err(EngineError::Cycle(cycle.join(" -> ")));
                }
                Color::White => visit(definition, needed, colors, order, path)?,
                Color::Black => {}
            }
        }
    }

    path.pop();
    colors.insert(id, Color::Black);
    order.push(id.to_string());
    Ok(())
}
