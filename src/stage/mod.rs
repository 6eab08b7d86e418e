//! Stage definitions for the review pipeline.
//!
//! This module provides:
//! - `StageName`, the closed and totally ordered set of pipeline stages
//! - `StageContract`, the capability every stage implementation provides
//! - `StageOutcome` / `StageInput` / `StageContext`, the values crossing that seam
//!
//! Stages are pure with respect to orchestration: they never touch the
//! checkpoint store. Everything they need arrives in `StageInput`.

pub mod command;
pub mod limiter;
pub mod registry;

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::artifact::{Artifact, ArtifactStore};
use crate::progress::StageProgress;
use crate::run_config::RunConfig;

pub use command::CommandStage;
pub use limiter::RateLimiter;
pub use registry::StageRegistry;

/// One named unit of work in the fixed pipeline.
///
/// Variant order is the canonical execution order; `Ord` follows it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Search,
    Screen,
    Fetch,
    Extract,
    RiskOfBias,
    Analysis,
    Tables,
    Figures,
    Introduction,
    Methods,
    Results,
    Discussion,
    Abstract,
    Render,
}

impl StageName {
    /// Every stage, in canonical order.
    pub const ALL: [StageName; 14] = [
        Self::Search,
        Self::Screen,
        Self::Fetch,
        Self::Extract,
        Self::RiskOfBias,
        Self::Analysis,
        Self::Tables,
        Self::Figures,
        Self::Introduction,
        Self::Methods,
        Self::Results,
        Self::Discussion,
        Self::Abstract,
        Self::Render,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Screen => "screen",
            Self::Fetch => "fetch",
            Self::Extract => "extract",
            Self::RiskOfBias => "risk_of_bias",
            Self::Analysis => "analysis",
            Self::Tables => "tables",
            Self::Figures => "figures",
            Self::Introduction => "introduction",
            Self::Methods => "methods",
            Self::Results => "results",
            Self::Discussion => "discussion",
            Self::Abstract => "abstract",
            Self::Render => "render",
        }
    }

    /// Zero-based position in the canonical order.
    pub fn position(&self) -> usize {
        *self as usize
    }

    /// Static prerequisite table. Always a subset of the stages before `self`,
    /// not necessarily contiguous.
    pub fn required_stages(&self) -> &'static [StageName] {
        use StageName::*;
        match self {
            Search => &[],
            Screen => &[Search],
            Fetch => &[Screen],
            Extract => &[Fetch],
            RiskOfBias => &[Extract],
            Analysis => &[Extract],
            Tables => &[Extract, RiskOfBias, Analysis],
            Figures => &[Screen, Analysis],
            Introduction => &[Search],
            Methods => &[Search, Screen, RiskOfBias],
            Results => &[Extract, Analysis, Tables],
            Discussion => &[Results],
            Abstract => &[Introduction, Methods, Results, Discussion],
            Render => &[
                Tables,
                Figures,
                Introduction,
                Methods,
                Results,
                Discussion,
                Abstract,
            ],
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == normalized)
            .ok_or_else(|| format!("Invalid stage name: {}", s))
    }
}

/// What a stage reports back after one invocation of `execute`.
///
/// A stage that raises (returns `Err`) is treated the same as
/// `StageOutcome::failed` with zero cost; the orchestrator classifies the
/// error text either way.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Artifact>,
    /// Cost incurred by this attempt alone.
    #[serde(default)]
    pub cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub needs_user_action: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_hint: Option<String>,
    /// The stage decided it does not apply to this run.
    #[serde(default)]
    pub skipped: bool,
}

impl StageOutcome {
    pub fn completed(output: Artifact, cost: f64) -> Self {
        Self {
            success: true,
            output: Some(output),
            cost,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>, cost: f64) -> Self {
        Self {
            success: false,
            cost,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// A failure that must not be retried; the hint is shown to the operator.
    pub fn needs_action(error: impl Into<String>, hint: impl Into<String>, cost: f64) -> Self {
        Self {
            success: false,
            cost,
            error: Some(error.into()),
            needs_user_action: true,
            action_hint: Some(hint.into()),
            ..Default::default()
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            success: true,
            skipped: true,
            action_hint: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// Explicit handles a stage may use while executing.
#[derive(Clone)]
pub struct StageContext {
    pub limiter: RateLimiter,
    pub progress: StageProgress,
    pub artifacts: Arc<dyn ArtifactStore>,
}

/// Orchestrator-assembled input for one stage invocation.
#[derive(Clone)]
pub struct StageInput {
    pub run_id: String,
    pub stage: StageName,
    /// 1-based attempt number within the current retry budget.
    pub attempt: u32,
    pub config: Arc<RunConfig>,
    /// Outputs of COMPLETED prerequisites. SKIPPED prerequisites are absent.
    pub artifacts: BTreeMap<StageName, Artifact>,
    pub context: StageContext,
}

impl StageInput {
    pub fn artifact(&self, stage: StageName) -> Option<&Artifact> {
        self.artifacts.get(&stage)
    }

    /// JSON document handed to out-of-process stages.
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::json!({
            "run_id": self.run_id,
            "stage": self.stage,
            "attempt": self.attempt,
            "config": &*self.config,
            "artifacts": self.artifacts,
        })
    }
}

/// The capability interface every pipeline stage implements.
#[async_trait]
pub trait StageContract: Send + Sync {
    fn name(&self) -> StageName;

    /// Declared prerequisites; used for validation only.
    fn required_stages(&self) -> &'static [StageName] {
        self.name().required_stages()
    }

    /// Side effects must be idempotent across repeated invocations for the
    /// same run and stage.
    async fn execute(&self, input: StageInput) -> Result<StageOutcome>;
}
