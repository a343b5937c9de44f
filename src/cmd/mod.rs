//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `run`    | `Run`            |
//! | `plan`   | `Plan`           |
//! | `status` | `Status`         |
//! | `score`  | `Score`          |

use anyhow::Result;

use phaseflow::config::OrchestratorConfig;

pub mod plan;
pub mod run;
pub mod score;
pub mod status;

pub use plan::cmd_plan;
pub use run::{RunOptions, cmd_run};
pub use score::cmd_score;
pub use status::cmd_status;

/// Validate the final layered config, logging its warnings.
pub fn check_config(config: &OrchestratorConfig) -> Result<()> {
    for warning in config.validate()? {
        tracing::warn!("{}", warning);
    }
    Ok(())
}
