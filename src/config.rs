//! Orchestrator configuration read from `.sysrev/sysrev.toml`.
//!
//! Layered: file → environment → CLI.
//!
//! ```toml
//! [retry]
//! base_delay_ms = 2000
//! multiplier = 2.0
//! max_retries = 3
//! max_delay_ms = 60000
//!
//! [store]
//! backend = "sqlite"        # or "file"
//!
//! [orchestrator]
//! lease_ttl_secs = 900
//! max_concurrent_runs = 4
//! max_inline_artifact_bytes = 65536
//! rate_limit_per_sec = 5.0
//! rate_limit_burst = 5
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! file = false
//!
//! [stages.search]
//! command = "python"
//! args = ["-m", "review.search"]
//! timeout_secs = 1800
//!
//! [stages.search.env]
//! PUBMED_API_KEY = "..."
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::stage::StageName;

/// Name of the per-project state directory.
pub const SYSREV_DIR: &str = ".sysrev";

/// Name of the configuration file inside `SYSREV_DIR`.
pub const CONFIG_FILE: &str = "sysrev.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    2000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_retries: default_max_retries(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Checkpoint persistence backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    File,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::Sqlite => write!(f, "sqlite"),
            StoreBackend::File => write!(f, "file"),
        }
    }
}

impl std::str::FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(StoreBackend::Sqlite),
            "file" => Ok(StoreBackend::File),
            _ => anyhow::bail!("Invalid store backend '{}'. Valid values: sqlite, file", s),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Database file (sqlite) or runs directory (file). Relative paths are
    /// resolved against `.sysrev/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// How long a run lease lasts without renewal.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    /// Runs driven at once by `run-all`.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    /// Inline outputs larger than this are moved to the artifact store.
    #[serde(default = "default_max_inline_artifact_bytes")]
    pub max_inline_artifact_bytes: usize,
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: f64,
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
    /// External calls a single run may have in flight.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_lease_ttl_secs() -> u64 {
    900
}

fn default_max_concurrent_runs() -> usize {
    4
}

fn default_max_inline_artifact_bytes() -> usize {
    64 * 1024
}

fn default_rate_limit_per_sec() -> f64 {
    5.0
}

fn default_rate_limit_burst() -> u32 {
    5
}

fn default_max_in_flight() -> usize {
    4
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: default_lease_ttl_secs(),
            max_concurrent_runs: default_max_concurrent_runs(),
            max_inline_artifact_bytes: default_max_inline_artifact_bytes(),
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Also write daily-rolled logs under `.sysrev/logs`.
    #[serde(default)]
    pub file: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            file: false,
        }
    }
}

/// An external program that implements one stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageCommandConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

/// The complete sysrev.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SysrevToml {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Command-backed stages keyed by stage name.
    #[serde(default)]
    pub stages: BTreeMap<String, StageCommandConfig>,
}

impl SysrevToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse sysrev.toml")
    }

    /// Load `.sysrev/sysrev.toml`, or defaults when it does not exist.
    pub fn load_or_default(sysrev_dir: &Path) -> Result<Self> {
        let config_path = sysrev_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize sysrev.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Stage command definitions with parsed stage names. Unknown names are dropped;
    /// `validate` reports them.
    pub fn stage_commands(&self) -> Vec<(StageName, &StageCommandConfig)> {
        self.stages
            .iter()
            .filter_map(|(name, cfg)| name.parse::<StageName>().ok().map(|stage| (stage, cfg)))
            .collect()
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.retry.multiplier < 1.0 {
            warnings.push(format!(
                "retry.multiplier {} is below 1.0; delays will shrink between attempts",
                self.retry.multiplier
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            warnings.push(format!(
                "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            ));
        }
        if self.orchestrator.max_concurrent_runs == 0 {
            warnings.push("orchestrator.max_concurrent_runs must be at least 1".to_string());
        }
        if self.orchestrator.max_in_flight == 0 {
            warnings.push("orchestrator.max_in_flight must be at least 1".to_string());
        }
        let rate = self.orchestrator.rate_limit_per_sec;
        if !(rate.is_finite() && rate > 0.0) {
            warnings.push(
                "orchestrator.rate_limit_per_sec is not positive; stage calls will not be rate limited"
                    .to_string(),
            );
        }
        if self.orchestrator.lease_ttl_secs < 10 {
            warnings.push(format!(
                "orchestrator.lease_ttl_secs {} is very short; leases may expire mid-stage",
                self.orchestrator.lease_ttl_secs
            ));
        }
        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            warnings.push(format!("Invalid logging.level '{}'", self.logging.level));
        }

        for (name, stage) in &self.stages {
            if name.parse::<StageName>().is_err() {
                warnings.push(format!("Unknown stage '{}' in [stages]", name));
            }
            if stage.command.trim().is_empty() {
                warnings.push(format!("stages.{}.command is empty", name));
            }
            if stage.timeout_secs == Some(0) {
                warnings.push(format!("stages.{}.timeout_secs must be positive", name));
            }
        }

        warnings
    }
}

/// Runtime configuration: sysrev.toml merged with environment and CLI.
#[derive(Debug, Clone)]
pub struct SysrevConfig {
    pub project_dir: PathBuf,
    pub sysrev_dir: PathBuf,
    pub toml: SysrevToml,
    /// `SYSREV_STORE`
    pub env_store_backend: Option<StoreBackend>,
    /// `SYSREV_DB_PATH`
    pub env_store_path: Option<PathBuf>,
    /// CLI override for log output format.
    pub cli_log_format: Option<LogFormat>,
}

impl SysrevConfig {
    /// Load configuration for a project directory, reading the process environment.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        Self::with_env(project_dir, |key| std::env::var(key).ok())
    }

    /// Load configuration with an explicit environment lookup.
    pub fn with_env(project_dir: PathBuf, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let sysrev_dir = project_dir.join(SYSREV_DIR);
        let toml = SysrevToml::load_or_default(&sysrev_dir)?;

        let env_store_backend = env("SYSREV_STORE")
            .map(|v| v.parse::<StoreBackend>())
            .transpose()
            .context("Invalid SYSREV_STORE")?;
        let env_store_path = env("SYSREV_DB_PATH")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            project_dir,
            sysrev_dir,
            toml,
            env_store_backend,
            env_store_path,
            cli_log_format: None,
        })
    }

    pub fn with_log_format(mut self, format: Option<LogFormat>) -> Self {
        self.cli_log_format = format;
        self
    }

    /// Store backend (env → file → default).
    pub fn store_backend(&self) -> StoreBackend {
        self.env_store_backend.unwrap_or(self.toml.store.backend)
    }

    /// Store location (env → file → default for the backend).
    pub fn store_path(&self) -> PathBuf {
        if let Some(path) = &self.env_store_path {
            return path.clone();
        }
        match &self.toml.store.path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.sysrev_dir.join(path),
            None => match self.store_backend() {
                StoreBackend::Sqlite => self.sysrev_dir.join("sysrev.db"),
                StoreBackend::File => self.sysrev_dir.join("runs"),
            },
        }
    }

    /// Log format (CLI → file → default).
    pub fn log_format(&self) -> LogFormat {
        self.cli_log_format.unwrap_or(self.toml.logging.format)
    }

    pub fn config_file(&self) -> PathBuf {
        self.sysrev_dir.join(CONFIG_FILE)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.sysrev_dir.join("artifacts")
    }

    pub fn progress_dir(&self) -> PathBuf {
        self.sysrev_dir.join("progress")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.sysrev_dir.join("logs")
    }

    pub fn is_initialized(&self) -> bool {
        self.sysrev_dir.exists()
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = SysrevToml::parse("").unwrap();
        assert_eq!(config.retry.base_delay_ms, 2000);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.orchestrator.max_inline_artifact_bytes, 65536);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_full() {
        let content = r#"
[retry]
base_delay_ms = 500
max_retries = 5

[store]
backend = "file"
path = "state"

[orchestrator]
max_concurrent_runs = 2

[logging]
format = "json"
file = true

[stages.search]
command = "python"
args = ["-m", "review.search"]
timeout_secs = 60

[stages.search.env]
PUBMED_API_KEY = "k"
"#;
        let config = SysrevToml::parse(content).unwrap();
        assert_eq!(config.retry.base_delay_ms, 500);
        assert_eq!(config.retry.multiplier, 2.0);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.store.backend, StoreBackend::File);
        assert_eq!(config.orchestrator.max_concurrent_runs, 2);
        assert_eq!(config.orchestrator.lease_ttl_secs, 900);
        assert_eq!(config.logging.format, LogFormat::Json);

        let commands = config.stage_commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].0, StageName::Search);
        assert_eq!(commands[0].1.env["PUBMED_API_KEY"], "k");
    }

    #[test]
    fn test_validate_reports_problems() {
        let content = r#"
[retry]
multiplier = 0.5

[orchestrator]
max_concurrent_runs = 0
rate_limit_per_sec = 0.0

[stages.meta_analysis]
command = ""
"#;
        let warnings = SysrevToml::parse(content).unwrap().validate();
        assert!(warnings.iter().any(|w| w.contains("multiplier")));
        assert!(warnings.iter().any(|w| w.contains("max_concurrent_runs")));
        assert!(warnings.iter().any(|w| w.contains("will not be rate limited")));
        assert!(warnings.iter().any(|w| w.contains("Unknown stage 'meta_analysis'")));
        assert!(warnings.iter().any(|w| w.contains("command is empty")));
    }

    #[test]
    fn test_store_backend_from_str() {
        assert_eq!("SQLite".parse::<StoreBackend>().unwrap(), StoreBackend::Sqlite);
        assert_eq!("file".parse::<StoreBackend>().unwrap(), StoreBackend::File);
        assert!("postgres".parse::<StoreBackend>().is_err());
    }

    #[test]
    fn test_load_and_save() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut config = SysrevToml::default();
        config.retry.max_retries = 7;
        config.save(&path).unwrap();

        let loaded = SysrevToml::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = SysrevToml::load_or_default(dir.path()).unwrap();
        assert_eq!(config, SysrevToml::default());
    }

    #[test]
    fn test_store_path_layers() {
        let dir = tempdir().unwrap();
        let no_env = |_: &str| None;

        let config = SysrevConfig::with_env(dir.path().to_path_buf(), no_env).unwrap();
        assert_eq!(config.store_backend(), StoreBackend::Sqlite);
        assert_eq!(config.store_path(), config.sysrev_dir.join("sysrev.db"));

        std::fs::create_dir_all(dir.path().join(SYSREV_DIR)).unwrap();
        std::fs::write(
            dir.path().join(SYSREV_DIR).join(CONFIG_FILE),
            "[store]\nbackend = \"file\"\n",
        )
        .unwrap();
        let config = SysrevConfig::with_env(dir.path().to_path_buf(), no_env).unwrap();
        assert_eq!(config.store_path(), config.sysrev_dir.join("runs"));

        let env = |key: &str| match key {
            "SYSREV_STORE" => Some("sqlite".to_string()),
            "SYSREV_DB_PATH" => Some("/tmp/elsewhere.db".to_string()),
            _ => None,
        };
        let config = SysrevConfig::with_env(dir.path().to_path_buf(), env).unwrap();
        assert_eq!(config.store_backend(), StoreBackend::Sqlite);
        assert_eq!(config.store_path(), PathBuf::from("/tmp/elsewhere.db"));
    }

    #[test]
    fn test_invalid_env_backend_is_an_error() {
        let dir = tempdir().unwrap();
        let env = |key: &str| (key == "SYSREV_STORE").then(|| "mongo".to_string());
        assert!(SysrevConfig::with_env(dir.path().to_path_buf(), env).is_err());
    }

    #[test]
    fn test_cli_log_format_wins() {
        let dir = tempdir().unwrap();
        let config = SysrevConfig::with_env(dir.path().to_path_buf(), |_| None)
            .unwrap()
            .with_log_format(Some(LogFormat::Json));
        assert_eq!(config.log_format(), LogFormat::Json);
    }
}
