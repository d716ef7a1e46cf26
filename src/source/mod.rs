//! Source drivers
//!
//! A node's `source_type` and `source_config` are parsed once, at validation
//! time, into a typed [`SourceSpec`]. The scheduler then builds a
//! [`SourceDriver`] from it and calls [`SourceDriver::read`] on every
//! cycle.
//!
//! Drivers for bus-attached converters route their transactions through the
//! [`BusArbiter`](crate::engine::BusArbiter); pin and bus I/O runs on the
//! blocking thread pool.

pub mod analog;
pub mod digital;
pub mod manual;
pub mod simulation;

pub use analog::{AdcDevice, AnalogDriver, AnalogSpec, Gain};
pub use digital::DigitalDriver;
pub use manual::{ManualDriver, ManualValue};
pub use simulation::{SimKind, SimulationDriver, SimulationSpec};

use crate::engine::BusArbiter;
use crate::error::{EngineError, Result};
use crate::hardware::{HardwareAccess, PinMode};
use crate::types::{DeviceKey, SourceConfig, SourceType};
use std::sync::Arc;
use std::time::Duration;

/// Validated, typed form of a node's source configuration
#[derive(Debug, Clone, PartialEq)]
pub enum SourceSpec {
    Manual { initial_value: f64 },
    Simulation(SimulationSpec),
    DigitalIo { pin: u8, mode: PinMode },
    Analog(AnalogSpec),
}

impl SourceSpec {
    /// Parse and validate a source configuration
    ///
    /// `initial_value` is the node-level seed for manual sources; a
    /// `source_config.initial_value` key takes precedence over it.
    pub fn parse(
        source_type: SourceType,
        config: &SourceConfig,
        initial_value: Option<f64>,
    ) -> Result<Self> {
        match source_type {
            SourceType::Manual => {
                let initial_value = opt_f64(config, "initial_value")?
                    .or(initial_value)
                    .unwrap_or(0.0);
                Ok(SourceSpec::Manual { initial_value })
            }
            SourceType::Simulation => Ok(SourceSpec::Simulation(SimulationSpec::parse(config)?)),
            SourceType::DigitalIo => {
                let pin = require_u8(config, "pin")?;
                let mode = match opt_str(config, "mode")? {
                    None => PinMode::Input,
                    Some(m) if m.eq_ignore_ascii_case("input") => PinMode::Input,
                    Some(m) if m.eq_ignore_ascii_case("output") => PinMode::Output,
                    Some(other) => {
                        return Err(EngineError::Config(format!(
                            "mode must be 'input' or 'output', got '{}'",
                            other
                        )))
                    }
                };
                Ok(SourceSpec::DigitalIo { pin, mode })
            }
            SourceType::AnalogChannel => Ok(SourceSpec::Analog(AnalogSpec::parse(config)?)),
        }
    }

    /// Shared bus resource this source contends for, if any
    pub fn device_key(&self) -> Option<DeviceKey> {
        match self {
            SourceSpec::Analog(spec) => Some(spec.device.key()),
            _ => None,
        }
    }
}

/// Collaborators a driver needs to perform a read
#[derive(Clone)]
pub struct DriverContext {
    pub hardware: Arc<dyn HardwareAccess>,
    pub arbiter: Arc<BusArbiter>,
    /// Maximum wait for a bus lock
    pub bus_timeout: Duration,
    /// Seed for simulation sources without their own `seed` key
    pub simulation_seed: Option<u64>,
}

/// Per-node reading strategy, one variant per source type
pub enum SourceDriver {
    Manual(ManualDriver),
    Simulation(SimulationDriver),
    DigitalIo(DigitalDriver),
    Analog(AnalogDriver),
}

impl SourceDriver {
    /// Build a fresh driver for a node
    ///
    /// `manual` is the value cell shared with the engine's
    /// `set_manual_value` path; only manual sources use it.
    pub fn build(node_id: u32, spec: &SourceSpec, manual: Arc<ManualValue>, ctx: &DriverContext) -> Self {
        match spec {
            SourceSpec::Manual { .. } => SourceDriver::Manual(ManualDriver::new(manual)),
            SourceSpec::Simulation(sim) => {
                let seed = sim
                    .seed
                    .or_else(|| ctx.simulation_seed.map(|s| s.wrapping_add(u64::from(node_id))));
                SourceDriver::Simulation(SimulationDriver::new(sim.clone(), seed))
            }
            SourceSpec::DigitalIo { pin, mode } => {
                SourceDriver::DigitalIo(DigitalDriver::new(*pin, *mode))
            }
            SourceSpec::Analog(analog) => SourceDriver::Analog(AnalogDriver::new(analog.clone())),
        }
    }

    /// Obtain one raw reading
    ///
    /// `interval` is the node's current cadence; simulation sources use it
    /// to advance their notion of elapsed time.
    pub async fn read(&mut self, ctx: &DriverContext, interval: Duration) -> Result<f64> {
        match self {
            SourceDriver::Manual(driver) => Ok(driver.read()),
            SourceDriver::Simulation(driver) => Ok(driver.next(interval)),
            SourceDriver::DigitalIo(driver) => driver.read(ctx).await,
            SourceDriver::Analog(driver) => driver.read(ctx).await,
        }
    }

    /// Shared bus resource this driver contends for, if any
    pub fn device_key(&self) -> Option<DeviceKey> {
        match self {
            SourceDriver::Analog(driver) => Some(driver.device_key()),
            _ => None,
        }
    }
}

/// Run a blocking hardware call on the blocking thread pool
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::HardwareRead(format!("hardware call aborted: {}", e)))?
}

// ============================================================================
// source_config accessors
// ============================================================================

fn missing(key: &str) -> EngineError {
    EngineError::Config(format!("missing required source_config key '{}'", key))
}

/// Optional numeric key; numeric strings are accepted
pub(crate) fn opt_f64(config: &SourceConfig, key: &str) -> Result<Option<f64>> {
    match config.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| EngineError::Config(format!("'{}' is not a finite number", key))),
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| EngineError::Config(format!("'{}' must be numeric, got '{}'", key, s))),
        Some(other) => Err(EngineError::Config(format!(
            "'{}' must be numeric, got {}",
            key, other
        ))),
    }
}

/// Optional unsigned integer key; accepts `0x`-prefixed hex strings
pub(crate) fn opt_u64(config: &SourceConfig, key: &str) -> Result<Option<u64>> {
    match config.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| {
            EngineError::Config(format!("'{}' must be a non-negative integer, got {}", key, n))
        }),
        Some(serde_json::Value::String(s)) => {
            let s = s.trim();
            let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(hex, 16),
                None => s.parse::<u64>(),
            };
            parsed.map(Some).map_err(|_| {
                EngineError::Config(format!("'{}' must be a non-negative integer, got '{}'", key, s))
            })
        }
        Some(other) => Err(EngineError::Config(format!(
            "'{}' must be a non-negative integer, got {}",
            key, other
        ))),
    }
}

pub(crate) fn opt_u8(config: &SourceConfig, key: &str) -> Result<Option<u8>> {
    match opt_u64(config, key)? {
        None => Ok(None),
        Some(v) => u8::try_from(v)
            .map(Some)
            .map_err(|_| EngineError::Config(format!("'{}' out of range: {}", key, v))),
    }
}

pub(crate) fn require_u8(config: &SourceConfig, key: &str) -> Result<u8> {
    opt_u8(config, key)?.ok_or_else(|| missing(key))
}

pub(crate) fn opt_str<'a>(config: &'a SourceConfig, key: &str) -> Result<Option<&'a str>> {
    match config.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(EngineError::Config(format!(
            "'{}' must be a string, got {}",
            key, other
        ))),
    }
}

pub(crate) fn require_str<'a>(config: &'a SourceConfig, key: &str) -> Result<&'a str> {
    opt_str(config, key)?.ok_or_else(|| missing(key))
}
