//! Workflow orchestration: the driver loop, failure policy and run results.

pub mod failure;
pub mod runner;
pub mod state;

pub use failure::{ExhaustedAction, FailureAction, FailureHandler, RetryPolicy};
pub use runner::{DriverSettings, WorkflowDriver};
pub use state::{PhaseSummary, WorkflowOutcome, WorkflowResult, WorkflowState};
