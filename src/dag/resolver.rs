//! Dependency resolver: partitions a registry into execution waves.
//!
//! Uses Kahn-style layering: each wave is the set of not-yet-scheduled phases whose
//! dependencies are all scheduled in earlier waves. If a round schedules nothing while
//! phases remain, the remainder contains a cycle.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::dag::graph::{PhaseGraph, PhaseIndex};
use crate::errors::CycleError;
use crate::phase::PhaseRegistry;

/// A set of phases with no dependency on each other. Members are listed in
/// declaration order, but may run in any interleaving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wave {
    pub index: usize,
    pub phases: Vec<String>,
}

impl Wave {
    pub fn contains(&self, id: &str) -> bool {
        self.phases.iter().any(|p| p == id)
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}

/// The ordered wave sequence for a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub waves: Vec<Wave>,
}

impl ExecutionPlan {
    pub fn len(&self) -> usize {
        self.waves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waves.is_empty()
    }

    pub fn phase_count(&self) -> usize {
        self.waves.iter().map(Wave::len).sum()
    }

    /// Index of the wave a phase was placed in.
    pub fn wave_of(&self, id: &str) -> Option<usize> {
        self.waves.iter().position(|w| w.contains(id))
    }

    /// Check the plan against the registry: every phase placed exactly once and
    /// every dependency in a strictly earlier wave.
    pub fn is_valid_for(&self, registry: &PhaseRegistry) -> bool {
        let mut seen = HashSet::new();
        for wave in &self.waves {
            for id in &wave.phases {
                if !seen.insert(id.as_str()) {
                    return false;
                }
            }
        }
        if seen.len() != registry.len() {
            return false;
        }

        registry.phases().iter().all(|phase| {
            let Some(own) = self.wave_of(&phase.id) else {
                return false;
            };
            phase
                .dependencies
                .iter()
                .all(|dep| self.wave_of(dep).is_some_and(|w| w < own))
        })
    }
}

/// Partition a registry into waves, or report a cycle.
pub fn resolve(registry: &PhaseRegistry) -> Result<ExecutionPlan, CycleError> {
    let graph = PhaseGraph::from_registry(registry);
    let mut scheduled: HashSet<PhaseIndex> = HashSet::with_capacity(graph.len());
    let mut waves = Vec::new();

    while scheduled.len() < graph.len() {
        let ready: Vec<PhaseIndex> = (0..graph.len())
            .filter(|i| !scheduled.contains(i))
            .filter(|&i| graph.dependencies_satisfied(i, &scheduled))
            .collect();

        if ready.is_empty() {
            let unscheduled: HashSet<PhaseIndex> =
                (0..graph.len()).filter(|i| !scheduled.contains(i)).collect();
            return Err(graph.find_cycle(&unscheduled));
        }

        scheduled.extend(ready.iter().copied());
        waves.push(Wave {
            index: waves.len(),
            phases: ready.iter().map(|&i| graph.id(i).to_string()).collect(),
        });
    }

    Ok(ExecutionPlan { waves })
}
