//! `sysrev init`: create the `.sysrev/` directory structure in a project.
//!
//! ```text
//! .sysrev/
//! ├── sysrev.toml      # Orchestrator configuration
//! ├── sysrev.db        # Checkpoint store (created on first use)
//! ├── artifacts/       # Spilled and referenced stage outputs, per run
//! ├── progress/        # Mirrored progress snapshots, per run
//! └── logs/            # Rolling log files when [logging] file = true
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::{CONFIG_FILE, SYSREV_DIR};

const SUBDIRS: [&str; 3] = ["artifacts", "progress", "logs"];

/// Written to `sysrev.toml` on first init.
pub const DEFAULT_CONFIG: &str = r#"# sysrev orchestrator configuration

[retry]
base_delay_ms = 2000
multiplier = 2.0
max_retries = 3
max_delay_ms = 60000

[store]
backend = "sqlite"

[orchestrator]
lease_ttl_secs = 900
max_concurrent_runs = 4
max_inline_artifact_bytes = 65536
rate_limit_per_sec = 5.0
rate_limit_burst = 5
max_in_flight = 4

[logging]
level = "info"
format = "pretty"
file = false

# One table per stage. Each command reads the stage input as JSON on stdin
# and prints {"outcome": {...}} as its last stdout line.
#
# [stages.search]
# command = "python"
# args = ["-m", "review.search"]
# timeout_secs = 1800
"#;

#[derive(Debug)]
pub struct InitResult {
    pub sysrev_dir: PathBuf,
    /// False when `.sysrev/` already existed.
    pub created: bool,
}

/// Create (or complete) `.sysrev/` under `project_dir`. Never overwrites an existing config.
pub fn init_project(project_dir: &Path) -> Result<InitResult> {
    let sysrev_dir = get_sysrev_dir(project_dir);
    let created = !sysrev_dir.exists();

    std::fs::create_dir_all(&sysrev_dir)
        .with_context(|| format!("Failed to create directory: {}", sysrev_dir.display()))?;
    for name in SUBDIRS {
        let dir = sysrev_dir.join(name);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }

    let config_path = sysrev_dir.join(CONFIG_FILE);
    if !config_path.exists() {
        std::fs::write(&config_path, DEFAULT_CONFIG)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
    }

    Ok(InitResult {
        sysrev_dir,
        created,
    })
}

pub fn is_initialized(project_dir: &Path) -> bool {
    get_sysrev_dir(project_dir).exists()
}

pub fn get_sysrev_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(SYSREV_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SysrevToml;
    use tempfile::tempdir;

    #[test]
    fn test_init_creates_structure() {
        let dir = tempdir().unwrap();
        assert!(!is_initialized(dir.path()));

        let result = init_project(dir.path()).unwrap();
        assert!(result.created);
        assert!(is_initialized(dir.path()));
        for name in SUBDIRS {
            assert!(result.sysrev_dir.join(name).is_dir(), "missing {}", name);
        }
        assert!(result.sysrev_dir.join(CONFIG_FILE).is_file());
    }

    #[test]
    fn test_init_is_idempotent_and_keeps_config() {
        let dir = tempdir().unwrap();
        init_project(dir.path()).unwrap();
        let config_path = get_sysrev_dir(dir.path()).join(CONFIG_FILE);
        std::fs::write(&config_path, "[retry]\nmax_retries = 7\n").unwrap();

        let result = init_project(dir.path()).unwrap();
        assert!(!result.created);
        assert_eq!(
            std::fs::read_to_string(&config_path).unwrap(),
            "[retry]\nmax_retries = 7\n"
        );
    }

    #[test]
    fn test_default_config_parses_to_defaults() {
        let parsed = SysrevToml::parse(DEFAULT_CONFIG).unwrap();
        assert_eq!(parsed, SysrevToml::default());
        assert!(parsed.validate().is_empty());
    }
}
