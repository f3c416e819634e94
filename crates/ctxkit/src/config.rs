//! Aggregate configuration, loaded from `.ctxkit/config.json`.
//!
//! Every component owns its own config struct with documented defaults and a
//! `validate()` method. [`CtxConfig`] groups them; any key missing from the
//! file keeps its default.
//!
//! ```json
//! {
//!   "max_tokens": 64000,
//!   "monitor": { "threshold": 0.8 },
//!   "compaction": { "strategy": "rolling_window", "preserve_recent_count": 6 },
//!   "static_index": { "extensions": ["rs", "py"] },
//!   "temporal": { "frustration": { "min_signals": 3 } }
//! }
//! ```

use crate::Result;
use crate::backend::OpenRouterClient;
use crate::collectors::dynamic::DynamicConfig;
use crate::collectors::static_index::StaticIndexConfig;
use crate::collectors::temporal::TemporalConfig;
use crate::compaction::CompactionConfig;
use crate::context::MonitorConfig;
use crate::hooks::HookConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::{Error, session::DEFAULT_SESSION_PATH};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default config file location, relative to the project root.
pub const DEFAULT_CONFIG_PATH: &str = ".ctxkit/config.json";

/// Model backend settings. The API key always comes from `OPENROUTER_KEY`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: Option<String>,
    pub summary_model: Option<String>,
    pub embedding_model: Option<String>,
}

impl BackendConfig {
    /// A configured client, or `None` when no API key is set.
    pub fn client(&self) -> Option<OpenRouterClient> {
        let mut client = OpenRouterClient::from_env()?;
        if let Some(url) = &self.base_url {
            client = client.with_base_url(url);
        }
        if let Some(model) = &self.summary_model {
            client = client.with_summary_model(model);
        }
        if let Some(model) = &self.embedding_model {
            client = client.with_embedding_model(model);
        }
        Some(client)
    }
}

/// Configuration for every component.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CtxConfig {
    /// Token budget of the working context. Default: `128000`.
    pub max_tokens: usize,
    /// Session document location. Default: `.ctxkit/session.json`.
    pub session_path: PathBuf,
    pub monitor: MonitorConfig,
    pub compaction: CompactionConfig,
    pub hooks: HookConfig,
    pub static_index: StaticIndexConfig,
    pub dynamic: DynamicConfig,
    pub temporal: TemporalConfig,
    pub orchestrator: OrchestratorConfig,
    pub backend: BackendConfig,
}

impl Default for CtxConfig {
    fn default() -> Self {
        Self {
            max_tokens: 128_000,
            session_path: PathBuf::from(DEFAULT_SESSION_PATH),
            monitor: MonitorConfig::default(),
            compaction: CompactionConfig::default(),
            hooks: HookConfig::default(),
            static_index: StaticIndexConfig::default(),
            dynamic: DynamicConfig::default(),
            temporal: TemporalConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

impl CtxConfig {
    /// Parse a config from JSON text and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or defaults if the file does not exist. A file that
    /// exists but is malformed or invalid is an error.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(json) => {
                debug!("Loading config from {}", path.display());
                Self::from_json(&json)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Re-root every path-bearing component at `root`.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        if self.session_path.is_relative() {
            self.session_path = root.join(&self.session_path);
        }
        self.static_index.root = root.clone();
        self.dynamic.workdir = root;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(Error::InvalidConfig("max_tokens must be positive".into()));
        }
        self.monitor.validate()?;
        self.compaction.validate()?;
        self.static_index.validate()?;
        self.dynamic.validate()?;
        self.temporal.validate()?;
        self.orchestrator.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::StrategyKind;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CtxConfig::load_or_default(dir.path().join("config.json")).unwrap();
        assert_eq!(config, CtxConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = CtxConfig::from_json(
            r#"{
                "max_tokens": 64000,
                "monitor": { "threshold": 0.8 },
                "compaction": { "strategy": "rolling_window" },
                "temporal": { "frustration": { "min_signals": 3 } }
            }"#,
        )
        .unwrap();
        assert_eq!(config.max_tokens, 64_000);
        assert_eq!(config.monitor.threshold, 0.8);
        assert_eq!(config.compaction.strategy, StrategyKind::RollingWindow);
        assert_eq!(config.compaction.preserve_recent_count, 10);
        assert_eq!(config.temporal.frustration.min_signals, 3);
        assert_eq!(config.temporal.frustration.repeat_window, 5);
        assert_eq!(config.orchestrator.retrieval_count, 5);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            CtxConfig::from_json(r#"{ "monitor": { "threshold": 1.5 } }"#),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            CtxConfig::from_json(r#"{ "compaction": { "strategy": "shred" } }"#),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn with_root_rebases_paths() {
        let config = CtxConfig::default().with_root("/work/project");
        assert_eq!(config.session_path, Path::new("/work/project/.ctxkit/session.json"));
        assert_eq!(config.static_index.root, Path::new("/work/project"));
        assert_eq!(config.dynamic.workdir, Path::new("/work/project"));
    }
}
