//! Graph validation and wave listing.

use anyhow::{Context, Result};
use std::path::Path;

use phaseflow::config::OrchestratorConfig;
use phaseflow::dag::resolve;
use phaseflow::phase::PhaseRegistry;

pub fn cmd_plan(config: &OrchestratorConfig, graph: &Path) -> Result<i32> {
    let registry = PhaseRegistry::load(graph, &config.phase_defaults())?;
    let plan = resolve(&registry).context("Invalid phase graph")?;
    phaseflow::ui::print_plan(&plan, &registry);
    Ok(0)
}
