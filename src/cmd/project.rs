//! Project initialization — `sysrev init`.

use anyhow::Result;
use std::path::Path;

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    use sysrev::init::{init_project, is_initialized};

    let was_initialized = is_initialized(project_dir);
    let result = init_project(project_dir)?;

    if result.created {
        println!(
            "Initialized sysrev project at {}",
            result.sysrev_dir.display()
        );
        println!();
        println!("Created directory structure:");
        println!("  .sysrev/");
        println!("  ├── sysrev.toml   # Orchestrator and stage command configuration");
        println!("  ├── artifacts/    # Stage outputs too large to keep inline");
        println!("  ├── progress/     # Progress snapshots");
        println!("  └── logs/         # Log files (when [logging] file = true)");
        println!();
        println!("Next steps:");
        println!("  1. Add a [stages.<name>] command per stage to .sysrev/sysrev.toml");
        println!("  2. Run `sysrev submit <run.toml>` to register a review");
        println!("  3. Run `sysrev run <run-id>` to drive it");
    } else if was_initialized {
        println!(
            "sysrev project already initialized at {}",
            result.sysrev_dir.display()
        );
        println!("Directory structure verified.");
    }

    Ok(())
}
