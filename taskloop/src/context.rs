//! Explicit engine context threaded through every orchestration call.

use std::path::Path;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::classifier::Classifier;
use crate::io::checkpoint::CheckpointStore;
use crate::io::config::{TaskloopConfig, load_classifier, load_config};
use crate::io::init::TaskloopPaths;
use crate::io::prompt::PromptEngine;
use crate::io::registry::SessionRegistry;

/// Per-invocation overrides layered over `config.toml`.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub model: Option<String>,
    pub max_iterations: Option<u32>,
    pub verbose: bool,
    pub delegate: bool,
    /// Ask the operator on exhausted failures and allow spec creation.
    pub interactive: bool,
}

/// Everything a unit of work needs, resolved once per invocation.
pub struct EngineContext {
    pub paths: TaskloopPaths,
    pub config: TaskloopConfig,
    pub registry: SessionRegistry,
    pub classifier: Classifier,
    pub prompts: PromptEngine,
    pub model: String,
    /// Loop passes per run; 0 means unlimited.
    pub max_iterations: u32,
    pub verbose: bool,
    pub delegate: bool,
    pub interactive: bool,
    pub cancel: CancellationToken,
}

impl EngineContext {
    /// Load config and rule tables for the project at `root`.
    pub fn load(root: &Path, overrides: &RunOverrides, cancel: CancellationToken) -> Result<Self> {
        let paths = TaskloopPaths::new(root);
        let config = load_config(&paths.config_path)
            .with_context(|| format!("load {}", paths.config_path.display()))?;
        let classifier = load_classifier(&paths.root, &config.classifier)?;
        Ok(Self::from_parts(paths, config, classifier, overrides, cancel))
    }

    pub fn from_parts(
        paths: TaskloopPaths,
        config: TaskloopConfig,
        classifier: Classifier,
        overrides: &RunOverrides,
        cancel: CancellationToken,
    ) -> Self {
        let model = overrides
            .model
            .clone()
            .unwrap_or_else(|| config.model.clone());
        let max_iterations = overrides.max_iterations.unwrap_or(config.max_iterations);
        debug!(root = %paths.root.display(), %model, max_iterations, "engine context ready");
        Self {
            registry: SessionRegistry::new(paths.clone()),
            paths,
            config,
            classifier,
            prompts: PromptEngine::new(),
            model,
            max_iterations,
            verbose: overrides.verbose,
            delegate: overrides.delegate,
            interactive: overrides.interactive,
            cancel,
        }
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        self.registry.checkpoints()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::write_config;

    #[test]
    fn overrides_win_over_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = TaskloopPaths::new(temp.path());
        write_config(
            &paths.config_path,
            &TaskloopConfig {
                model: "opus".to_string(),
                max_iterations: 7,
                ..TaskloopConfig::default()
            },
        )
        .expect("write config");

        let ctx = EngineContext::load(temp.path(), &RunOverrides::default(), CancellationToken::new())
            .expect("load");
        assert_eq!(ctx.model, "opus");
        assert_eq!(ctx.max_iterations, 7);

        let overrides = RunOverrides {
            model: Some("haiku".to_string()),
            max_iterations: Some(0),
            ..RunOverrides::default()
        };
        let ctx = EngineContext::load(temp.path(), &overrides, CancellationToken::new()).expect("load");
        assert_eq!(ctx.model, "haiku");
        assert_eq!(ctx.max_iterations, 0);
    }
}
