//! Configuration management for the flood detection service.
//!
//! Layers, lowest priority first: built-in defaults, an optional TOML file
//! (`CONFIG_FILE`, default `config/default.toml`), then `FLOOD__*`
//! environment variables such as `FLOOD__DETECTION__SYN_THRESHOLD=8`.

use std::env;

use config::{Config as ConfigBuilder, ConfigError, Environment, File};

use crate::models::Config;

pub const DEFAULT_CONFIG_FILE: &str = "config/default.toml";

/// Load configuration from the default file location and the environment
pub fn load_config() -> Result<Config, ConfigError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
    load_config_from(&config_file)
}

/// Load configuration using `config_file` as the file layer. A missing file is not an error.
pub fn load_config_from(config_file: &str) -> Result<Config, ConfigError> {
    let config = ConfigBuilder::builder()
        .add_source(ConfigBuilder::try_from(&Config::default())?)
        .add_source(File::with_name(config_file).required(false))
        .add_source(
            Environment::with_prefix("FLOOD")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::UdpFloodMode;
    use crate::models::StorageBackend;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_without_file() {
        let config = load_config_from("/nonexistent/flood.toml").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.detection.syn_threshold, 5);
        assert_eq!(config.blocking.block_duration_secs, 600);
        assert_eq!(config.etl.batch_size, 100);
        assert_eq!(config.storage.backend, StorageBackend::File);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flood.toml");
        fs::write(
            &path,
            r#"
[detection]
syn_threshold = 8
udp_mode = "sliding_window"

[storage]
backend = "memory"

[capture]
interface = "eth1"
"#,
        )
        .unwrap();

        let config = load_config_from(path.to_str().unwrap()).unwrap();
        assert_eq!(config.detection.syn_threshold, 8);
        assert_eq!(config.detection.udp_mode, UdpFloodMode::SlidingWindow);
        assert_eq!(config.detection.udp_threshold, 10);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.capture.interface.as_deref(), Some("eth1"));
        assert_eq!(config.analyzer.tracked_sources_cap, 50);
    }
}
