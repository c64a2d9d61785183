//! Configuration management for aggscope
//!
//! A single TOML file holds translator settings, logging options and the
//! per-entity index metadata.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::query::translator::AggregationSettings;
use crate::registry::{IndexMetadata, StaticMetadata};

/// Main configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub aggregation: AggregationSettings,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Entity type name to index metadata
    #[serde(default)]
    pub entities: HashMap<String, IndexMetadata>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,

    /// "pretty" or "json"
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        Self::from_toml_str(&content).with_context(|| format!("Invalid config {:?}", path))
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = ?path, "No config file, using defaults");
            Ok(Config::default())
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.aggregation.terms_size == 0 {
            return Err(anyhow!("aggregation.terms_size must be positive"));
        }
        if self.aggregation.default_percents.is_empty() {
            return Err(anyhow!("aggregation.default_percents must not be empty"));
        }
        if let Some(p) = self
            .aggregation
            .default_percents
            .iter()
            .find(|p| !(0.0..=100.0).contains(*p))
        {
            return Err(anyhow!("aggregation.default_percents: {} is outside [0, 100]", p));
        }
        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => return Err(anyhow!("logging.format must be pretty or json, got '{}'", other)),
        }
        for (entity, meta) in &self.entities {
            meta.validate()
                .with_context(|| format!("entities.{}", entity))?;
        }
        Ok(())
    }

    /// Metadata source over the configured entities.
    pub fn metadata_source(&self) -> StaticMetadata {
        StaticMetadata::from(self.entities.clone())
    }

    pub fn settings(&self) -> AggregationSettings {
        self.aggregation.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MetadataSource;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
[aggregation]
terms_size = 500

[logging]
level = "debug"
format = "json"

[entities.policy]
index_name = "policy"
search_index_names = ["policy", "policy_archive"]
print_log = true

[entities.claim]
index_name = "claim"
number_of_shards = 3
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.aggregation.terms_size, 500);
        assert_eq!(config.aggregation.default_percents.len(), 7);
        assert_eq!(config.logging.format, "json");

        let source = config.metadata_source();
        assert_eq!(source.entities(), vec!["claim", "policy"]);
        let policy = source.lookup("policy").unwrap();
        assert!(policy.print_log);
        assert_eq!(policy.search_index_names, vec!["policy", "policy_archive"]);
        assert_eq!(source.lookup("claim").unwrap().number_of_shards, 3);
    }

    #[test]
    fn test_defaults_when_empty() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.aggregation.terms_size, 10_000);
        assert_eq!(config.logging.level, "info");
        assert!(config.entities.is_empty());
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(Config::from_toml_str("[aggregation]\nterms_size = 0").is_err());
        assert!(Config::from_toml_str("[aggregation]\ndefault_percents = [120.0]").is_err());
        assert!(Config::from_toml_str("[aggregation]\ndefault_percents = []").is_err());
        assert!(Config::from_toml_str("[logging]\nformat = \"xml\"").is_err());
        assert!(Config::from_toml_str("[entities.x]\nindex_name = \"\"").is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("aggscope.toml");

        let config = Config::from_toml_str(SAMPLE).unwrap();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.aggregation, config.aggregation);
        assert_eq!(loaded.entities, config.entities);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_or_default(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.logging.format, "pretty");
    }
}
