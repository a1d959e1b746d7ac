//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::dialect::BackendKind;
use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Compute a SHA256 hash of the configuration.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Prefix for cache table names.
    ///
    /// Derived from the configuration hash so that a restarted run with the
    /// same configuration addresses the same tables.
    pub fn cache_table_prefix(&self) -> String {
        format!("tmp_{}", &self.hash()[..8])
    }
}

impl DatabaseConfig {
    /// Backend kind; validated configurations always parse.
    pub fn kind(&self) -> Result<BackendKind> {
        BackendKind::parse(&self.r#type).ok_or_else(|| {
            crate::error::BulkError::Config(format!("Unknown database type: '{}'", self.r#type))
        })
    }

    /// Connection target for log lines; never includes the password.
    pub fn describe(&self, default_port: u16) -> String {
        if self.host.is_empty() {
            return self.database.clone();
        }
        format!(
            "{}@{}:{}/{}",
            self.user,
            self.host,
            self.port.unwrap_or(default_port),
            self.database
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
database:
  type: postgis
  host: db.example.org
  database: citydb
  user: citydb_user
  password: secret
resources:
  threads: 4
  id_cache:
    cache_size: 1000
    partitions: 2
import:
  resolver_batch_size: 500
"#;

    #[test]
    fn test_from_yaml() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.database.schema, "public");
        assert_eq!(config.database.srid, 4326);
        assert_eq!(config.resources.get_threads(), 4);
        assert_eq!(config.resources.id_cache.page_factor, 0.85);
        assert_eq!(config.import.resolver_batch_size, 500);
        assert!(matches!(config.cache, CacheConfig::Database));
    }

    #[test]
    fn test_cache_table_prefix_is_stable() {
        let a = Config::from_yaml(YAML).unwrap();
        let b = Config::from_yaml(YAML).unwrap();
        assert_eq!(a.cache_table_prefix(), b.cache_table_prefix());
        assert_eq!(a.cache_table_prefix().len(), "tmp_".len() + 8);
    }

    #[test]
    fn test_describe_uses_default_port() {
        let config = Config::from_yaml(YAML).unwrap();
        let target = config.database.describe(5432);
        assert!(target.contains(":5432/citydb"));
        assert!(!target.contains(&config.database.password));
    }
}
