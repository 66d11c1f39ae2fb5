use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::DetectionConfig;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
    /// Prefix for every key written by the service
    pub key_prefix: String,
}

/// Where attack logs and ETL batches are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Local JSON files
    File,
    /// Redis lists
    Redis,
    /// Process memory only
    Memory,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage backend
    pub backend: StorageBackend,
    /// Attack log file (file backend)
    pub log_file: PathBuf,
    /// Directory for batch snapshots; also the ETL fallback location for every backend
    pub data_dir: PathBuf,
}

/// Blocking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockingConfig {
    /// How long a source stays blocked
    pub block_duration_secs: u64,
}

/// Traffic analyzer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Connection records kept per source before the least recently seen is evicted
    pub per_source_connection_cap: usize,
    /// Sources held in the connection table; the least recently seen is evicted past it
    pub tracked_sources_cap: usize,
    /// Whether UDP flood detections also block the source
    pub block_udp_floods: bool,
}

/// Batch aggregator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtlConfig {
    /// Records per sink batch
    pub batch_size: usize,
    /// SYN packets per source (lifetime of the run) above which a SYN flood is reported
    pub syn_threshold: u64,
    /// UDP packets per source (lifetime of the run) above which a UDP flood is reported
    pub udp_threshold: u64,
}

/// Classifier service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Whether to call the external classifier at all
    pub enabled: bool,
    /// Classification endpoint URL
    pub endpoint: Option<String>,
    /// Bearer token for the endpoint
    pub api_key: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

/// Live capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Directory where stopped captures are saved
    pub output_dir: PathBuf,
    /// Frames buffered between the capture worker and the analyzer
    pub channel_capacity: usize,
    /// How long `stop` waits for the capture worker
    pub stop_timeout_secs: u64,
    /// Default interface when a start request names none
    pub interface: Option<String>,
    /// Default BPF filter when a start request names none
    pub filter: Option<String>,
    /// Frames kept in memory for saving on stop; 0 disables saving
    pub max_saved_frames: usize,
}

/// Metrics exporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether to expose Prometheus metrics
    pub enabled: bool,
    /// Listen address of the metrics endpoint
    pub listen: String,
}

/// Application configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Redis configuration
    pub redis: RedisConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Flood detection configuration
    pub detection: DetectionConfig,
    /// Blocking configuration
    pub blocking: BlockingConfig,
    /// Traffic analyzer configuration
    pub analyzer: AnalyzerConfig,
    /// Batch aggregator configuration
    pub etl: EtlConfig,
    /// Classifier configuration
    pub classifier: ClassifierConfig,
    /// Live capture configuration
    pub capture: CaptureConfig,
    /// Metrics configuration
    pub metrics: MetricsConfig,
}

impl Default for BlockingConfig {
    fn default() -> Self {
        Self {
            block_duration_secs: 600,
        }
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            per_source_connection_cap: 10,
            tracked_sources_cap: 50,
            block_udp_floods: false,
        }
    }
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            syn_threshold: 5,
            udp_threshold: 100,
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            api_key: None,
            timeout_secs: 10,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("captures"),
            channel_capacity: 1024,
            stop_timeout_secs: 5,
            interface: None,
            filter: None,
            max_saved_frames: 100_000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".to_string(),
                key_prefix: "flood".to_string(),
            },
            storage: StorageConfig {
                backend: StorageBackend::File,
                log_file: PathBuf::from("logs/attack_logs.json"),
                data_dir: PathBuf::from("data"),
            },
            detection: DetectionConfig::default(),
            blocking: BlockingConfig::default(),
            analyzer: AnalyzerConfig::default(),
            etl: EtlConfig::default(),
            classifier: ClassifierConfig::default(),
            capture: CaptureConfig::default(),
            metrics: MetricsConfig {
                enabled: false,
                listen: "127.0.0.1:9000".to_string(),
            },
        }
    }
}
