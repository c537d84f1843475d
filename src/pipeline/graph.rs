//! Dependency graph over phases.

use std::collections::{BTreeSet, HashMap, HashSet};

use super::definition::PhaseDef;
use crate::errors::PipelineError;

/// Index into the phase list, in file order.
pub type PhaseIndex = usize;

#[derive(Debug)]
pub struct PhaseGraph {
    phases: Vec<PhaseDef>,
    /// index -> phases that depend on it
    forward_edges: Vec<Vec<PhaseIndex>>,
    /// index -> phases it depends on
    reverse_edges: Vec<Vec<PhaseIndex>>,
}

impl PhaseGraph {
    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn phase(&self, index: PhaseIndex) -> Option<&PhaseDef> {
        self.phases.get(index)
    }

    pub fn dependents(&self, index: PhaseIndex) -> &[PhaseIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    pub fn dependencies(&self, index: PhaseIndex) -> &[PhaseIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    pub fn dependencies_satisfied(
        &self,
        index: PhaseIndex,
        completed: &HashSet<PhaseIndex>,
    ) -> bool {
        self.dependencies(index)
            .iter()
            .all(|dep| completed.contains(dep))
    }

    /// Topological order. Among phases that are ready at the same time the
    /// one listed first in the file goes first.
    pub fn execution_order(&self) -> Vec<PhaseIndex> {
        let mut in_degree: Vec<usize> = self.reverse_edges.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<PhaseIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(node) = ready.pop_first() {
            order.push(node);
            for &dependent in self.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }
        order
    }

    /// Groups of phases that become ready together.
    pub fn waves(&self) -> Vec<Vec<String>> {
        let mut waves = Vec::new();
        let mut completed: HashSet<PhaseIndex> = HashSet::new();

        loop {
            let ready: Vec<PhaseIndex> = (0..self.len())
                .filter(|i| !completed.contains(i) && self.dependencies_satisfied(*i, &completed))
                .collect();
            if ready.is_empty() {
                break;
            }
            waves.push(ready.iter().map(|&i| self.phases[i].label.clone()).collect());
            completed.extend(ready);
        }
        waves
    }
}

pub struct DagBuilder {
    phases: Vec<PhaseDef>,
}

impl DagBuilder {
    pub fn new(phases: Vec<PhaseDef>) -> Self {
        Self { phases }
    }

    /// Build the graph, rejecting duplicate labels, unknown dependencies
    /// and cycles.
    pub fn build(self) -> Result<PhaseGraph, PipelineError> {
        let mut index_map = HashMap::new();
        for (i, phase) in self.phases.iter().enumerate() {
            if index_map.insert(phase.label.clone(), i).is_some() {
                return Err(PipelineError::DuplicatePhase(phase.label.clone()));
            }
        }

        let mut forward_edges: Vec<Vec<PhaseIndex>> = vec![Vec::new(); self.phases.len()];
        let mut reverse_edges: Vec<Vec<PhaseIndex>> = vec![Vec::new(); self.phases.len()];

        for (to_idx, phase) in self.phases.iter().enumerate() {
            for dep in &phase.depends_on {
                let from_idx =
                    *index_map
                        .get(dep)
                        .ok_or_else(|| PipelineError::UnknownDependency {
                            phase: phase.label.clone(),
                            dependency: dep.clone(),
                        })?;
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = PhaseGraph {
            phases: self.phases,
            forward_edges,
            reverse_edges,
        };

        let order = graph.execution_order();
        if order.len() != graph.len() {
            let placed: HashSet<PhaseIndex> = order.into_iter().collect();
            let involved: Vec<&str> = (0..graph.len())
                .filter(|i| !placed.contains(i))
                .map(|i| graph.phases[i].label.as_str())
                .collect();
            return Err(PipelineError::Cycle(involved.join(", ")));
        }

        Ok(graph)
    }
}
