use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.storage_root.as_os_str().is_empty() {
        return Err(ConfigError::Validation {
            message: "storage_root must not be empty".to_string(),
        });
    }

    if config.worker_count == 0 {
        return Err(ConfigError::Validation {
            message: "worker_count must be at least 1".to_string(),
        });
    }

    if config.retention_days < 1 {
        return Err(ConfigError::Validation {
            message: format!("retention_days must be positive, got {}", config.retention_days),
        });
    }

    if !(config.preview.scale > 0.0 && config.preview.scale <= 1.0) {
        return Err(ConfigError::Validation {
            message: format!(
                "preview.scale must be in (0, 1], got {}",
                config.preview.scale
            ),
        });
    }

    if config.preview.point_limit == 0 || config.preview.chunk_points == 0 {
        return Err(ConfigError::Validation {
            message: "preview.point_limit and preview.chunk_points must be positive".to_string(),
        });
    }

    Ok(())
}
