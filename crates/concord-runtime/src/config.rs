//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use concord_core::{ConcordError, ConcordResult};
use concord_state::{ConflictPolicy, PriorityTable};

/// What to do with an operation whose dependencies never arrive
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DependencyTimeout {
    /// Discard it and report `MissingDependency`
    #[default]
    Drop,
    /// Apply it anyway; correctness is no longer guaranteed for it
    ApplySpeculatively,
}

/// Serializable subset of [`ConflictPolicy`]
///
/// Custom strategies cannot be described in configuration; install them
/// with `SyncEngine::with_policy`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PolicyConfig {
    #[default]
    LastWriterWins,
    Merge,
    Priority(PriorityTable),
    Manual,
}

impl From<PolicyConfig> for ConflictPolicy {
    fn from(config: PolicyConfig) -> Self {
        match config {
            PolicyConfig::LastWriterWins => ConflictPolicy::LastWriterWins,
            PolicyConfig::Merge => ConflictPolicy::Merge,
            PolicyConfig::Priority(table) => ConflictPolicy::Priority(table),
            PolicyConfig::Manual => ConflictPolicy::Manual,
        }
    }
}

/// Sync engine configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Conflict resolution policy
    pub policy: PolicyConfig,
    /// Drain passes a deferred operation may wait for its dependencies
    pub max_dependency_retries: u32,
    /// Fate of an operation that exhausted its retries
    pub dependency_timeout: DependencyTimeout,
    /// Capture pre-images on applied entries (needed to undo updates)
    pub retain_pre_images: bool,
    /// Window `SyncEngine::prune_expired` keeps in the log
    pub retention_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            policy: PolicyConfig::LastWriterWins,
            max_dependency_retries: 5,
            dependency_timeout: DependencyTimeout::Drop,
            retain_pre_images: true,
            retention_ms: None,
        }
    }
}

impl EngineConfig {
    /// Every conflict goes to a human; dependencies get a long grace period
    pub fn strict() -> Self {
        EngineConfig {
            policy: PolicyConfig::Manual,
            max_dependency_retries: 20,
            dependency_timeout: DependencyTimeout::Drop,
            retain_pre_images: true,
            retention_ms: None,
        }
    }

    /// Low memory: no pre-images, short log retention, never blocks on
    /// missing dependencies for long
    pub fn lightweight() -> Self {
        EngineConfig {
            policy: PolicyConfig::LastWriterWins,
            max_dependency_retries: 2,
            dependency_timeout: DependencyTimeout::ApplySpeculatively,
            retain_pre_images: false,
            retention_ms: Some(10 * 60 * 1000),
        }
    }

    pub fn with_policy(mut self, policy: PolicyConfig) -> Self {
        self.policy = policy;
        self
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> ConcordResult<()> {
        if self.retention_ms == Some(0) {
            return Err(ConcordError::Config(
                "retentionMs must be positive when set".into(),
            ));
        }
        if let PolicyConfig::Priority(table) = &self.policy {
            if table.weights.is_empty() {
                return Err(ConcordError::Config(
                    "priority policy needs at least one role weight".into(),
                ));
            }
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration; missing keys take defaults
    pub fn from_json(json: &str) -> ConcordResult<Self> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| ConcordError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
