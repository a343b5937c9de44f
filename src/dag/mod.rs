//! Dependency resolution and wave execution.
//!
//! The workflow is a directed acyclic graph of phases. It is partitioned into
//! waves and each wave runs in parallel once every earlier wave has been evaluated.
//!
//! ## Architecture
//!
//! 1. **Graph** - Indexes a registry into forward and reverse dependency edges
//! 2. **Resolver** - Layers the graph into waves, or reports a cycle
//! 3. **Executor** - Runs one wave as concurrent child processes
//!
//! ## Example
//!
//! ```no_run
//! use phaseflow::dag::resolve;
//! use phaseflow::phase::{Phase, PhaseCommand, PhaseRegistry};
//!
//! # fn example() -> anyhow::Result<()> {
//! let registry = PhaseRegistry::new(vec![
//!     Phase::new("setup", PhaseCommand::shell("make setup")),
//!     Phase::new("core", PhaseCommand::shell("make core")).with_dependencies(["setup"]),
//!     Phase::new("tests", PhaseCommand::shell("make test")).with_dependencies(["setup"]),
//!     Phase::new("docs", PhaseCommand::shell("make docs")).with_dependencies(["core", "tests"]),
//! ])?;
//!
//! let plan = resolve(&registry)?;
//! // Wave 0: [setup]
//! // Wave 1: [core, tests]
//! // Wave 2: [docs]
//! assert_eq!(plan.len(), 3);
//! # Ok(())
//! # }
//! ```

pub mod executor;
mod graph;
mod resolver;
mod state;

pub use executor::{
    ExecutorConfig, Invocation, InvocationKind, PhaseEvent, PhaseExecutor, output_paths,
};
pub use graph::{PhaseGraph, PhaseIndex};
pub use resolver::{ExecutionPlan, Wave, resolve};
pub use state::{
    ExecutionTimer, FailureClass, OutputRef, PhaseRun, PhaseStatus, TIMEOUT_EXIT_CODE, WaveReport,
};
