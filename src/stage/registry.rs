use std::collections::BTreeMap;
use std::sync::Arc;

use super::{CommandStage, StageContract, StageName};
use crate::config::SysrevConfig;
use crate::errors::OrchestratorError;

/// Executors keyed by the stage they implement.
#[derive(Clone, Default)]
pub struct StageRegistry {
    stages: BTreeMap<StageName, Arc<dyn StageContract>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every `[stages.<name>]` command from configuration.
    pub fn from_config(config: &SysrevConfig) -> Self {
        let mut registry = Self::new();
        for (stage, command) in config.toml.stage_commands() {
            registry.register(Arc::new(CommandStage::from_config(
                stage,
                command,
                &config.project_dir,
            )));
        }
        registry
    }

    /// Register under the executor's own name, replacing any previous entry.
    pub fn register(&mut self, stage: Arc<dyn StageContract>) -> &mut Self {
        self.insert(stage.name(), stage)
    }

    /// Register under an explicit key. `validate` rejects keys that disagree
    /// with the executor's `name()`.
    pub fn insert(&mut self, key: StageName, stage: Arc<dyn StageContract>) -> &mut Self {
        self.stages.insert(key, stage);
        self
    }

    pub fn get(&self, stage: StageName) -> Option<Arc<dyn StageContract>> {
        self.stages.get(&stage).cloned()
    }

    pub fn contains(&self, stage: StageName) -> bool {
        self.stages.contains_key(&stage)
    }

    pub fn stages(&self) -> impl Iterator<Item = StageName> + '_ {
        self.stages.keys().copied()
    }

    /// Check every executor's declared prerequisites against the canonical order.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        for (key, stage) in &self.stages {
            if stage.name() != *key {
                return Err(OrchestratorError::InvalidRegistry(format!(
                    "executor for {} is registered under {}",
                    stage.name(),
                    key
                )));
            }
            for prerequisite in stage.required_stages() {
                if prerequisite >= key {
                    return Err(OrchestratorError::InvalidRegistry(format!(
                        "stage {} requires {}, which does not come before it",
                        key, prerequisite
                    )));
                }
            }
        }
        Ok(())
    }
}
