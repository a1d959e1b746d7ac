//! Configuration validation.

use super::Config;
use crate::dialect::BackendKind;
use crate::error::{BulkError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    let kind = BackendKind::parse(&config.database.r#type).ok_or_else(|| {
        BulkError::Config(format!(
            "database.type must be one of 'postgis', 'oracle', 'sqlite', got '{}'",
            config.database.r#type
        ))
    })?;

    if config.database.database.is_empty() {
        return Err(BulkError::Config("database.database is required".into()));
    }
    if kind != BackendKind::Sqlite {
        if config.database.host.is_empty() {
            return Err(BulkError::Config("database.host is required".into()));
        }
        if config.database.user.is_empty() {
            return Err(BulkError::Config("database.user is required".into()));
        }
    }

    let resources = &config.resources;
    if let Some(0) = resources.threads {
        return Err(BulkError::Config("resources.threads must be at least 1".into()));
    }
    if let Some(0) = resources.queue_size {
        return Err(BulkError::Config(
            "resources.queue_size must be at least 1".into(),
        ));
    }
    if let Some(0) = resources.id_cache.partitions {
        return Err(BulkError::Config(
            "resources.id_cache.partitions must be at least 1".into(),
        ));
    }
    if resources.id_cache.cache_size == 0 {
        return Err(BulkError::Config(
            "resources.id_cache.cache_size must be at least 1".into(),
        ));
    }
    let factor = resources.id_cache.page_factor;
    if !(factor > 0.0 && factor <= 1.0) {
        return Err(BulkError::Config(format!(
            "resources.id_cache.page_factor must be in (0, 1], got {}",
            factor
        )));
    }
    for (name, value) in [
        ("writer_connections", resources.writer_connections),
        ("reader_connections", resources.reader_connections),
        ("cache_connections", resources.cache_connections),
    ] {
        if let Some(0) = value {
            return Err(BulkError::Config(format!(
                "resources.{} must be at least 1",
                name
            )));
        }
    }

    if config.import.resolver_batch_size == 0 {
        return Err(BulkError::Config(
            "import.resolver_batch_size must be at least 1".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, DatabaseConfig, ImportConfig, ResourcesConfig};

    fn valid_config() -> Config {
        Config {
            database: DatabaseConfig {
                r#type: "postgis".to_string(),
                host: "localhost".to_string(),
                port: None,
                database: "citydb".to_string(),
                schema: "public".to_string(),
                user: "postgres".to_string(),
                password: "password".to_string(),
                srid: 25832,
            },
            cache: CacheConfig::Database,
            resources: ResourcesConfig::default(),
            import: ImportConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_unknown_backend_type() {
        let mut config = valid_config();
        config.database.r#type = "mssql".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_sqlite_needs_no_host() {
        let mut config = valid_config();
        config.database.r#type = "sqlite".to_string();
        config.database.host = String::new();
        config.database.user = String::new();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_missing_host() {
        let mut config = valid_config();
        config.database.host = String::new();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_page_factor_bounds() {
        let mut config = valid_config();
        config.resources.id_cache.page_factor = 1.5;
        assert!(validate(&config).is_err());
        config.resources.id_cache.page_factor = 0.0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_threads_rejected() {
        let mut config = valid_config();
        config.resources.threads = Some(0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_database_config_debug_redacts_password() {
        let mut config = valid_config();
        config.database.password = "super_secret_password_123".to_string();
        let debug_output = format!("{:?}", config.database);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super_secret_password_123"));
    }
}
