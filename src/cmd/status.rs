//! Manifest replay for a past or running workflow.

use anyhow::Result;
use std::path::Path;

use phaseflow::config::OrchestratorConfig;
use phaseflow::manifest;

pub fn cmd_status(config: &OrchestratorConfig, base_dir: &Path, run_id: &str) -> Result<i32> {
    let path = config
        .run_dir(base_dir, run_id)
        .join(super::run::MANIFEST_FILE);
    if !path.exists() {
        anyhow::bail!("No manifest for run '{}' at {}", run_id, path.display());
    }
    let replay = manifest::replay(&path)?;
    phaseflow::ui::print_status(run_id, &replay);
    Ok(0)
}
