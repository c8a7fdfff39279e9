use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine tuning knobs, usually read from the `[engine]` table of a TOML file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of tasks running at once (0 = unlimited)
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,

    /// Timeout applied to tasks whose spec declares none
    #[serde(default)]
    pub task_timeout_secs: Option<u64>,

    /// Maximum nesting of dynamic expansions (and inlined workflows)
    #[serde(default = "default_max_expansion_depth")]
    pub max_expansion_depth: usize,
}

fn default_max_parallelism() -> usize {
    8
}

fn default_max_expansion_depth() -> usize {
    32
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallelism: default_max_parallelism(),
            task_timeout_secs: None,
            max_expansion_depth: default_max_expansion_depth(),
        }
    }
}

impl EngineConfig {
    /// Parse a standalone engine config from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse engine configuration")
    }

    /// Load from a file, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("Engine configuration not found, using defaults");
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).context("Failed to read engine configuration")?;
        Self::from_toml(&content)
    }

    pub fn default_task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }

    /// Task slots, with 0 meaning unbounded
    pub(crate) fn parallelism(&self) -> usize {
        if self.max_parallelism == 0 {
            usize::MAX
        } else {
            self.max_parallelism
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_for_empty_config() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config.max_parallelism, 8);
        assert_eq!(config.max_expansion_depth, 32);
        assert!(config.default_task_timeout().is_none());
    }

    #[test]
    fn test_partial_config() {
        let config = EngineConfig::from_toml("max_parallelism = 0\ntask_timeout_secs = 30\n").unwrap();
        assert_eq!(config.parallelism(), usize::MAX);
        assert_eq!(config.default_task_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.max_expansion_depth, 32);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = EngineConfig::load(&temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.max_parallelism, 8);
    }

    #[test]
    fn test_load_rejects_bad_types() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("engine.toml");
        std::fs::write(&path, "max_parallelism = \"many\"\n").unwrap();
        assert!(EngineConfig::load(&path).is_err());
    }
}
