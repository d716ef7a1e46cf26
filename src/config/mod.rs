//! Configuration module for nodeacq-rs
//!
//! This module handles engine configuration including:
//! - Acquisition tuning (bus timeout, interval floor, event buffering)
//! - Hardware backend selection and simulated bench parameters
//! - Node store location
//! - An inline node list applied at startup
//!
//! # File Formats
//!
//! Configuration files are TOML (`.toml`) or JSON (`.json`), selected by
//! extension.
//!
//! # App Data Location
//!
//! Without an explicit store path, nodes are persisted in the
//! platform-appropriate data directory:
//! - **Linux**: `~/.local/share/dev.hxyulin.nodeacq-rs/nodes.json`
//! - **macOS**: `~/Library/Application Support/dev.hxyulin.nodeacq-rs/nodes.json`
//! - **Windows**: `%APPDATA%\dev.hxyulin.nodeacq-rs\nodes.json`
//!
//! # Example
//!
//! ```ignore
//! use nodeacq_rs::config::EngineConfig;
//!
//! let config = EngineConfig::load("bench.toml")?;
//! println!("{} nodes, bus timeout {} ms", config.nodes.len(), config.acquisition.bus_timeout_ms);
//!
//! EngineConfig::sample().save("sample.json")?;
//! ```

use crate::error::{EngineError, Result};
use crate::types::{AccessLevel, DataType, NodeSpec, Scaling, SourceType};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ==================== Constants ====================

/// Application identifier (used for the data directory)
pub const APP_ID: &str = "dev.hxyulin.nodeacq-rs";

/// Default node store filename
pub const NODE_STORE_FILE: &str = "nodes.json";

/// Default maximum wait for a bus lock in milliseconds
pub const DEFAULT_BUS_TIMEOUT_MS: u64 = 250;

/// Default lower bound for `update_interval_ms`
pub const DEFAULT_MIN_INTERVAL_MS: u64 = 10;

/// Default capacity of the engine event queue
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 1024;

/// Default wait for in-flight cycles at shutdown in milliseconds
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2000;

/// Default voltage presented on simulated converter inputs
pub const DEFAULT_BENCH_VOLTAGE: f64 = 1.65;

// ==================== App Data Directory ====================

/// Get the application data directory path
pub fn app_data_dir() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID))
}

/// Ensure the app data directory exists
pub fn ensure_app_data_dir() -> Result<PathBuf> {
    let dir = app_data_dir().ok_or_else(|| {
        EngineError::Config("Could not determine app data directory".to_string())
    })?;

    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            EngineError::Config(format!("Failed to create app data directory: {}", e))
        })?;
    }

    Ok(dir)
}

// ==================== Engine Config ====================

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub acquisition: AcquisitionConfig,
    pub hardware: HardwareConfig,
    pub store: StoreConfig,
    /// Nodes applied at startup (empty = keep whatever the store holds)
    pub nodes: Vec<NodeSpec>,
}

impl EngineConfig {
    /// Load a configuration file, choosing the format by extension
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        match ConfigFormat::from_path(path) {
            ConfigFormat::Toml => toml::from_str(&content).map_err(|e| {
                EngineError::Config(format!("Failed to parse config file {:?}: {}", path, e))
            }),
            ConfigFormat::Json => serde_json::from_str(&content).map_err(|e| {
                EngineError::Config(format!("Failed to parse config file {:?}: {}", path, e))
            }),
        }
    }

    /// Save the configuration, choosing the format by extension
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    EngineError::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = self.render(ConfigFormat::from_path(path))?;
        std::fs::write(path, content).map_err(|e| {
            EngineError::Config(format!("Failed to write config file {:?}: {}", path, e))
        })
    }

    /// Serialize to text
    pub fn render(&self, format: ConfigFormat) -> Result<String> {
        match format {
            ConfigFormat::Toml => toml::to_string_pretty(self)
                .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e))),
            ConfigFormat::Json => serde_json::to_string_pretty(self)
                .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e))),
        }
    }

    /// Create a sample configuration with a reference bench
    ///
    /// A sine simulation, a push button on GPIO17, an LED on GPIO27 and a
    /// tank level sensor on ADS1115 channel 0 scaled to percent.
    pub fn sample() -> Self {
        let mut config = Self::default();

        config.nodes.push(
            NodeSpec::new("Simulated_Sine", "ns=2;s=Simulated_Sine", SourceType::Simulation)
                .with_config("sim_type", "sine")
                .with_config("min", 0)
                .with_config("max", 100)
                .with_description("Test signal for trend displays"),
        );

        config.nodes.push(
            NodeSpec::new("GPIO_17_Input", "ns=2;s=GPIO_17", SourceType::DigitalIo)
                .with_data_type(DataType::Boolean)
                .with_config("pin", 17)
                .with_config("mode", "input")
                .with_interval(200),
        );

        config.nodes.push(
            NodeSpec::new("GPIO_27_Output", "ns=2;s=GPIO_27", SourceType::DigitalIo)
                .with_data_type(DataType::Boolean)
                .with_access(AccessLevel::ReadWrite)
                .with_config("pin", 27)
                .with_config("mode", "output"),
        );

        config.nodes.push(
            NodeSpec::new("Tank_Level", "ns=2;s=Tank_Level", SourceType::AnalogChannel)
                .with_config("device", "ads1115")
                .with_config("channel", 0)
                .with_config("gain", 1)
                .with_config("i2c_address", 0x48)
                .with_interval(500)
                .with_scaling(Scaling::new(0.0, 100.0, "%")),
        );

        config
    }

    /// Timeout for bus locks
    pub fn bus_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.acquisition.bus_timeout_ms)
    }

    /// Resolved node store location (None = in-memory store)
    pub fn store_path(&self) -> Result<Option<PathBuf>> {
        match self.store.backend {
            StoreBackend::Memory => Ok(None),
            StoreBackend::File => match &self.store.path {
                Some(path) => Ok(Some(path.clone())),
                None => Ok(Some(ensure_app_data_dir()?.join(NODE_STORE_FILE))),
            },
        }
    }
}

/// Text format of a configuration file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    /// JSON for `.json`, TOML for everything else
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ConfigFormat::Json,
            _ => ConfigFormat::Toml,
        }
    }
}

impl std::str::FromStr for ConfigFormat {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "toml" => Ok(ConfigFormat::Toml),
            "json" => Ok(ConfigFormat::Json),
            other => Err(EngineError::Config(format!("unknown config format '{}'", other))),
        }
    }
}

// ==================== Acquisition Config ====================

/// Acquisition tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Maximum wait for a bus lock in milliseconds
    pub bus_timeout_ms: u64,
    /// Smallest accepted `update_interval_ms`
    pub min_interval_ms: u64,
    /// Capacity of the event queue
    pub event_buffer_size: usize,
    /// Seed for simulation sources without their own `seed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulation_seed: Option<u64>,
    /// Wait for in-flight cycles at shutdown in milliseconds
    pub shutdown_grace_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            bus_timeout_ms: DEFAULT_BUS_TIMEOUT_MS,
            min_interval_ms: DEFAULT_MIN_INTERVAL_MS,
            event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
            simulation_seed: None,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

// ==================== Hardware Config ====================

/// Hardware backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareMode {
    /// Simulated bench
    #[default]
    Mock,
}

/// Hardware backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub mode: HardwareMode,
    /// Lowest valid pin number
    pub pin_min: u8,
    /// Highest valid pin number
    pub pin_max: u8,
    /// Simulated time per bus transaction in microseconds
    pub latency_us: u64,
    /// Voltage presented on every simulated converter input
    pub bench_voltage: f64,
    /// Peak noise added to simulated conversions in volts
    pub noise_volts: f64,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            mode: HardwareMode::Mock,
            pin_min: *crate::hardware::DEFAULT_PIN_RANGE.start(),
            pin_max: *crate::hardware::DEFAULT_PIN_RANGE.end(),
            latency_us: 500,
            bench_voltage: DEFAULT_BENCH_VOLTAGE,
            noise_volts: 0.01,
        }
    }
}

// ==================== Store Config ====================

/// Where node definitions are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Not persisted
    #[default]
    Memory,
    /// JSON file
    File,
}

/// Node store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// File location (None = app data directory)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.acquisition.bus_timeout_ms, DEFAULT_BUS_TIMEOUT_MS);
        assert_eq!(config.acquisition.min_interval_ms, DEFAULT_MIN_INTERVAL_MS);
        assert_eq!(config.hardware.mode, HardwareMode::Mock);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(config.nodes.is_empty());
        assert_eq!(config.store_path().unwrap(), None);
    }

    #[test]
    fn test_sample_nodes() {
        let config = EngineConfig::sample();
        assert_eq!(config.nodes.len(), 4);
        let tank = &config.nodes[3];
        assert_eq!(tank.source_type, SourceType::AnalogChannel);
        assert_eq!(tank.scaling.as_ref().map(|s| s.unit.as_str()), Some("%"));
    }

    #[test]
    fn test_round_trip_both_formats() {
        let temp_dir = TempDir::new().unwrap();
        let config = EngineConfig::sample();

        for name in ["engine.toml", "engine.json"] {
            let path = temp_dir.path().join(name);
            config.save(&path).unwrap();
            let loaded = EngineConfig::load(&path).unwrap();
            assert_eq!(loaded.nodes, config.nodes, "{}", name);
            assert_eq!(loaded.acquisition.bus_timeout_ms, config.acquisition.bus_timeout_ms);
        }
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let text = r#"
            [acquisition]
            bus_timeout_ms = 100

            [[nodes]]
            display_name = "Pump"
            node_id = "ns=2;s=Pump"
            source_type = "digital_io"
            source_config = { pin = 22 }
        "#;
        let config: EngineConfig = toml::from_str(text).unwrap();
        assert_eq!(config.acquisition.bus_timeout_ms, 100);
        assert_eq!(config.acquisition.event_buffer_size, DEFAULT_EVENT_BUFFER_SIZE);
        assert_eq!(config.nodes.len(), 1);
        assert_eq!(config.nodes[0].source_config["pin"], serde_json::json!(22));
    }

    #[test]
    fn test_load_missing_file() {
        let err = EngineConfig::load("/nonexistent/engine.toml").unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(ConfigFormat::from_path(Path::new("a.json")), ConfigFormat::Json);
        assert_eq!(ConfigFormat::from_path(Path::new("a.toml")), ConfigFormat::Toml);
        assert_eq!(ConfigFormat::from_path(Path::new("a")), ConfigFormat::Toml);
        assert_eq!("JSON".parse::<ConfigFormat>().unwrap(), ConfigFormat::Json);
    }
}
