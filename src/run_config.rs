//! Immutable per-run configuration snapshot.
//!
//! A `RunConfig` is read once at submission, hashed, and stored with the run.
//! Nothing mutates it afterwards; resumed runs see exactly what was submitted.
//!
//! ```toml
//! research_question = "Does exercise reduce depressive symptoms in adults?"
//! inclusion_criteria = ["randomized controlled trial", "adults >= 18"]
//! exclusion_criteria = ["case reports"]
//! databases = ["pubmed", "scopus"]
//! mode = "standard"
//! skip_stages = ["figures"]
//!
//! [settings]
//! max_papers = 500
//! ```

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::artifact::sha256_hex;
use crate::stage::StageName;

/// Depth of the review; stages read it to size their work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewMode {
    Quick,
    #[default]
    Standard,
    Comprehensive,
}

impl std::fmt::Display for ReviewMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReviewMode::Quick => write!(f, "quick"),
            ReviewMode::Standard => write!(f, "standard"),
            ReviewMode::Comprehensive => write!(f, "comprehensive"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub research_question: String,
    #[serde(default)]
    pub inclusion_criteria: Vec<String>,
    #[serde(default)]
    pub exclusion_criteria: Vec<String>,
    #[serde(default)]
    pub databases: Vec<String>,
    #[serde(default)]
    pub mode: ReviewMode,
    /// Stages recorded as SKIPPED without being executed.
    #[serde(default)]
    pub skip_stages: Vec<StageName>,
    /// Free-form settings passed through to stages.
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl RunConfig {
    pub fn new(research_question: impl Into<String>) -> Self {
        Self {
            research_question: research_question.into(),
            inclusion_criteria: Vec::new(),
            exclusion_criteria: Vec::new(),
            databases: Vec::new(),
            mode: ReviewMode::default(),
            skip_stages: Vec::new(),
            settings: serde_json::Map::new(),
        }
    }

    /// Load from a `.toml` or `.json` file, chosen by extension.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read run config: {}", path.display()))?;

        let config: RunConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse run config JSON: {}", path.display()))?,
            _ => toml::from_str(&content)
                .with_context(|| format!("Failed to parse run config TOML: {}", path.display()))?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.research_question.trim().is_empty() {
            bail!("research_question must not be empty");
        }
        if self.skip_stages.contains(&StageName::Search) {
            bail!("the search stage cannot be skipped");
        }
        Ok(())
    }

    pub fn skips(&self, stage: StageName) -> bool {
        self.skip_stages.contains(&stage)
    }

    /// Canonical JSON used for storage and hashing.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize run config")
    }

    pub fn hash(&self) -> Result<String> {
        Ok(sha256_hex(self.to_json()?.as_bytes()))
    }
}
