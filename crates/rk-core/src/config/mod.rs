//! Configuration management for kernel provisioning

mod provisioner;
mod serde_utils;

pub use provisioner::{parse_port_range, ProvisionerConfig, MIN_PORT_RANGE_SIZE};
pub use serde_utils::{duration_millis, duration_secs};

use crate::error::ConfigError;
use std::path::Path;

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("provisioner.toml");

        let config = ProvisionerConfig::default();
        save_config(&path, &config).unwrap();

        let loaded: ProvisionerConfig = load_config(&path).unwrap();
        assert_eq!(loaded.port_range, config.port_range);
        assert_eq!(loaded.launch_timeout, config.launch_timeout);
    }

    #[test]
    fn test_load_missing_file() {
        let result: Result<ProvisionerConfig, _> =
            load_config(Path::new("/nonexistent/provisioner.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }
}
