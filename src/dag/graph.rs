//! Index-based dependency graph over a phase registry.
//!
//! The graph mirrors the registry's declaration order: index `i` is the `i`-th phase
//! of `PhaseRegistry::phases()`.

use std::collections::HashSet;

use crate::errors::CycleError;
use crate::phase::PhaseRegistry;

/// Index into the registry's phase list.
pub type PhaseIndex = usize;

/// Forward and reverse dependency edges for a registry.
#[derive(Debug)]
pub struct PhaseGraph {
    ids: Vec<String>,
    /// index -> phases that depend on it
    forward_edges: Vec<Vec<PhaseIndex>>,
    /// index -> phases it depends on
    reverse_edges: Vec<Vec<PhaseIndex>>,
}

impl PhaseGraph {
    /// Build the graph. The registry has already rejected unknown dependencies.
    pub fn from_registry(registry: &PhaseRegistry) -> Self {
        let len = registry.len();
        let mut forward_edges: Vec<Vec<PhaseIndex>> = vec![Vec::new(); len];
        let mut reverse_edges: Vec<Vec<PhaseIndex>> = vec![Vec::new(); len];

        for (to_idx, phase) in registry.phases().iter().enumerate() {
            for dep in &phase.dependencies {
                if let Some(from_idx) = registry.position(dep) {
                    forward_edges[from_idx].push(to_idx);
                    reverse_edges[to_idx].push(from_idx);
                }
            }
        }

        Self {
            ids: registry.phases().iter().map(|p| p.id.clone()).collect(),
            forward_edges,
            reverse_edges,
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn id(&self, index: PhaseIndex) -> &str {
        &self.ids[index]
    }

    pub fn index_of(&self, id: &str) -> Option<PhaseIndex> {
        self.ids.iter().position(|p| p == id)
    }

    /// Phases that depend on the given phase.
    pub fn dependents(&self, index: PhaseIndex) -> &[PhaseIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Phases the given phase depends on.
    pub fn dependencies(&self, index: PhaseIndex) -> &[PhaseIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    pub fn dependencies_satisfied(
        &self,
        index: PhaseIndex,
        scheduled: &HashSet<PhaseIndex>,
    ) -> bool {
        self.dependencies(index)
            .iter()
            .all(|dep| scheduled.contains(dep))
    }

    /// Every phase reachable through forward edges, in declaration order.
    pub fn transitive_dependents(&self, index: PhaseIndex) -> Vec<PhaseIndex> {
        let mut seen = HashSet::new();
        let mut stack: Vec<PhaseIndex> = self.dependents(index).to_vec();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                stack.extend_from_slice(self.dependents(next));
            }
        }
        let mut out: Vec<PhaseIndex> = seen.into_iter().collect();
        out.sort_unstable();
        out
    }

    /// Extract one concrete cycle among phases that could not be scheduled.
    ///
    /// Every unscheduled phase has at least one unscheduled dependency, so walking
    /// dependencies from the lowest unscheduled index must revisit a phase.
    pub fn find_cycle(&self, unscheduled: &HashSet<PhaseIndex>) -> CycleError {
        let Some(&start) = unscheduled.iter().min() else {
            return CycleError::new(Vec::new());
        };

        let mut path: Vec<PhaseIndex> = Vec::new();
        let mut current = start;
        loop {
            if let Some(pos) = path.iter().position(|&p| p == current) {
                let mut cycle: Vec<String> =
                    path[pos..].iter().map(|&i| self.ids[i].clone()).collect();
                cycle.push(self.ids[current].clone());
                // Report in dependency order (a depends on b -> b runs first)
                cycle.reverse();
                return CycleError::new(cycle);
            }
            path.push(current);
            match self
                .dependencies(current)
                .iter()
                .copied()
                .filter(|d| unscheduled.contains(d))
                .min()
            {
                Some(next) => current = next,
                None => {
                    return CycleError::new(path.iter().map(|&i| self.ids[i].clone()).collect());
                }
            }
        }
    }
}
