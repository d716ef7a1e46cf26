//! Core data types for the acquisition engine
//!
//! This module contains the fundamental data structures used throughout the
//! crate for describing signal nodes and the readings taken from them.
//!
//! # Main Types
//!
//! - [`Node`] - A registered signal definition with its store-assigned id
//! - [`NodeSpec`] - A desired node definition, as written by a caller
//! - [`Scaling`] - Linear voltage to engineering-unit mapping
//! - [`Reading`] - The result of one acquisition cycle
//! - [`NodeValue`] - An engineering value coerced to the node's data type
//! - [`DeviceKey`] - Identity of a physically shared bus resource
//! - [`NodeState`] - Scheduler state of a node

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default acquisition cadence in milliseconds
pub const DEFAULT_UPDATE_INTERVAL_MS: u64 = 1000;

/// Source-specific configuration keys and values
pub type SourceConfig = BTreeMap<String, serde_json::Value>;

/// Value type exposed for a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DataType {
    /// Logic level
    Boolean,
    /// 32-bit signed integer
    Int32,
    /// Floating point
    #[default]
    #[serde(alias = "Double")]
    Float,
    /// Decimal text
    String,
}

impl DataType {
    /// Coerce an engineering value to this data type
    pub fn coerce(&self, value: f64) -> NodeValue {
        match self {
            DataType::Boolean => NodeValue::Boolean(value != 0.0),
            // `as` saturates at the i32 bounds and maps NaN to 0
            DataType::Int32 => NodeValue::Int32(value.round() as i32),
            DataType::Float => NodeValue::Float(value),
            DataType::String => NodeValue::String(value.to_string()),
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::Boolean => write!(f, "Boolean"),
            DataType::Int32 => write!(f, "Int32"),
            DataType::Float => write!(f, "Float"),
            DataType::String => write!(f, "String"),
        }
    }
}

/// Access rights of external clients on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AccessLevel {
    /// Read only
    #[default]
    #[serde(alias = "CurrentRead")]
    Read,
    /// Write only
    #[serde(alias = "CurrentWrite")]
    Write,
    /// Read and write
    #[serde(alias = "CurrentReadWrite")]
    ReadWrite,
}

impl AccessLevel {
    /// Whether clients may write this node
    pub fn is_writable(&self) -> bool {
        matches!(self, AccessLevel::Write | AccessLevel::ReadWrite)
    }
}

/// Kind of source a node acquires from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// Value set explicitly by a caller
    #[default]
    Manual,
    /// Software signal generator
    Simulation,
    /// GPIO pin logic level
    #[serde(alias = "gpio")]
    DigitalIo,
    /// Channel on a bus-attached ADC
    #[serde(alias = "analog")]
    AnalogChannel,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceType::Manual => write!(f, "manual"),
            SourceType::Simulation => write!(f, "simulation"),
            SourceType::DigitalIo => write!(f, "digital_io"),
            SourceType::AnalogChannel => write!(f, "analog_channel"),
        }
    }
}

/// Linear mapping from a raw voltage range to an engineering range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scaling {
    /// Raw reading that maps to `scale_min`
    #[serde(default)]
    pub voltage_min: f64,
    /// Raw reading that maps to `scale_max`
    #[serde(default = "default_voltage_max")]
    pub voltage_max: f64,
    /// Engineering value at `voltage_min`
    pub scale_min: f64,
    /// Engineering value at `voltage_max`
    pub scale_max: f64,
    /// Unit label for display (e.g., "bar", "°C", "%")
    #[serde(default)]
    pub unit: String,
}

fn default_voltage_max() -> f64 {
    3.3
}

impl Scaling {
    /// Create a scaling over the default 0–3.3 V input range
    pub fn new(scale_min: f64, scale_max: f64, unit: impl Into<String>) -> Self {
        Self {
            voltage_min: 0.0,
            voltage_max: default_voltage_max(),
            scale_min,
            scale_max,
            unit: unit.into(),
        }
    }

    /// Set the raw input range
    pub fn with_voltage_range(mut self, voltage_min: f64, voltage_max: f64) -> Self {
        self.voltage_min = voltage_min;
        self.voltage_max = voltage_max;
        self
    }
}

/// Identity of a physically shared bus resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceKey {
    /// Device on an I2C bus
    I2c { bus: u8, address: u8 },
    /// Device selected by a chip-select line on an SPI bus
    Spi { bus: u8, chip_select: u8 },
}

impl std::fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKey::I2c { bus, address } => write!(f, "i2c-{}@0x{:02X}", bus, address),
            DeviceKey::Spi { bus, chip_select } => write!(f, "spi-{}/cs{}", bus, chip_select),
        }
    }
}

/// Desired definition of a node, as supplied by a caller
///
/// `id` is only used to match a `NodeSpec` against an existing registry entry;
/// new nodes get their id from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Registry id of the node this spec replaces (None = match by `node_id`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    /// Human-readable name
    pub display_name: String,
    /// External protocol identifier (e.g., "ns=2;s=Tank_Level")
    pub node_id: String,
    /// Value type exposed to clients
    #[serde(default)]
    pub data_type: DataType,
    /// Client access rights
    #[serde(default)]
    pub access_level: AccessLevel,
    /// Kind of source
    pub source_type: SourceType,
    /// Source-specific configuration
    #[serde(default)]
    pub source_config: SourceConfig,
    /// Acquisition cadence in milliseconds
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,
    /// Whether the node is scheduled
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Linear scaling (None = raw value is the engineering value)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling: Option<Scaling>,
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Starting value for manual nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_value: Option<f64>,
}

fn default_update_interval_ms() -> u64 {
    DEFAULT_UPDATE_INTERVAL_MS
}

fn default_true() -> bool {
    true
}

impl NodeSpec {
    /// Create a spec with default type, access and cadence
    pub fn new(
        display_name: impl Into<String>,
        node_id: impl Into<String>,
        source_type: SourceType,
    ) -> Self {
        Self {
            id: None,
            display_name: display_name.into(),
            node_id: node_id.into(),
            data_type: DataType::default(),
            access_level: AccessLevel::default(),
            source_type,
            source_config: SourceConfig::new(),
            update_interval_ms: DEFAULT_UPDATE_INTERVAL_MS,
            enabled: true,
            scaling: None,
            description: None,
            initial_value: None,
        }
    }

    /// Target an existing registry entry
    pub fn with_id(mut self, id: u32) -> Self {
        self.id = Some(id);
        self
    }

    /// Set one source_config key
    pub fn with_config(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.source_config.insert(key.to_string(), value.into());
        self
    }

    /// Set the acquisition cadence
    pub fn with_interval(mut self, interval_ms: u64) -> Self {
        self.update_interval_ms = interval_ms;
        self
    }

    /// Set the exposed data type
    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    /// Set the access level
    pub fn with_access(mut self, access_level: AccessLevel) -> Self {
        self.access_level = access_level;
        self
    }

    /// Activate scaling
    pub fn with_scaling(mut self, scaling: Scaling) -> Self {
        self.scaling = Some(scaling);
        self
    }

    /// Set whether the node is scheduled
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the starting value of a manual node
    pub fn with_initial_value(mut self, value: f64) -> Self {
        self.initial_value = Some(value);
        self
    }

    /// Label used in log lines and configuration issues
    pub fn label(&self) -> &str {
        if self.display_name.is_empty() {
            &self.node_id
        } else {
            &self.display_name
        }
    }

    /// Materialize as a registered node with the given id
    pub fn into_node(self, id: u32) -> Node {
        Node {
            id,
            display_name: self.display_name,
            node_id: self.node_id,
            data_type: self.data_type,
            access_level: self.access_level,
            source_type: self.source_type,
            source_config: self.source_config,
            update_interval_ms: self.update_interval_ms,
            enabled: self.enabled,
            scaling: self.scaling,
            description: self.description,
            initial_value: self.initial_value,
        }
    }
}

/// A registered signal definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Store-assigned identifier, immutable
    pub id: u32,
    /// Human-readable name
    pub display_name: String,
    /// External protocol identifier
    pub node_id: String,
    /// Value type exposed to clients
    pub data_type: DataType,
    /// Client access rights
    pub access_level: AccessLevel,
    /// Kind of source
    pub source_type: SourceType,
    /// Source-specific configuration
    #[serde(default)]
    pub source_config: SourceConfig,
    /// Acquisition cadence in milliseconds
    pub update_interval_ms: u64,
    /// Whether the node is scheduled
    pub enabled: bool,
    /// Linear scaling (None = identity)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling: Option<Scaling>,
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Starting value for manual nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_value: Option<f64>,
}

impl Node {
    /// Unit label of the engineering value (empty when unscaled)
    pub fn unit(&self) -> &str {
        self.scaling.as_ref().map(|s| s.unit.as_str()).unwrap_or("")
    }

    /// Spec equivalent of this node, carrying its id
    pub fn to_spec(&self) -> NodeSpec {
        NodeSpec {
            id: Some(self.id),
            display_name: self.display_name.clone(),
            node_id: self.node_id.clone(),
            data_type: self.data_type,
            access_level: self.access_level,
            source_type: self.source_type,
            source_config: self.source_config.clone(),
            update_interval_ms: self.update_interval_ms,
            enabled: self.enabled,
            scaling: self.scaling.clone(),
            description: self.description.clone(),
            initial_value: self.initial_value,
        }
    }
}

/// Result of one acquisition cycle
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Value returned by the source driver
    pub raw_value: Option<f64>,
    /// Engineering value after scaling
    pub value: Option<f64>,
    /// Failure message (None = success)
    pub error: Option<String>,
    /// When the cycle completed
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    /// A successful reading
    pub fn success(raw_value: f64, value: f64) -> Self {
        Self {
            raw_value: Some(raw_value),
            value: Some(value),
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// A failed reading
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            raw_value: None,
            value: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }

    /// Whether the cycle succeeded
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Engineering value coerced to a node's data type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeValue {
    Boolean(bool),
    Int32(i32),
    Float(f64),
    String(String),
}

impl std::fmt::Display for NodeValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeValue::Boolean(b) => write!(f, "{}", b),
            NodeValue::Int32(i) => write!(f, "{}", i),
            NodeValue::Float(v) => write!(f, "{:.4}", v),
            NodeValue::String(s) => write!(f, "{}", s),
        }
    }
}

/// Scheduler state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum NodeState {
    /// Not scheduled
    #[default]
    Disabled,
    /// Waiting for the next timer fire
    Idle,
    /// Cycle in flight
    Acquiring,
    /// Last cycle succeeded
    Ok,
    /// Last cycle failed
    Errored,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Disabled => write!(f, "Disabled"),
            NodeState::Idle => write!(f, "Idle"),
            NodeState::Acquiring => write!(f, "Acquiring"),
            NodeState::Ok => write!(f, "Ok"),
            NodeState::Errored => write!(f, "Errored"),
        }
    }
}
