//! Hardware access collaborator
//!
//! Source drivers never touch hardware directly. They go through the
//! [`HardwareAccess`] trait, which exposes raw pin-level I/O and raw bus
//! transactions. Protocol knowledge (ADC register layouts, SPI framing)
//! lives in the drivers; an implementation of this trait only moves bytes
//! and levels.
//!
//! # Implementations
//!
//! - [`MockHardware`] - Simulated bench with GPIO pins and ADS1115 /
//!   MCP3008 / MCP3208 converters, fault and latency injection, and
//!   per-device concurrency instrumentation.
//!
//! Implementations are shared between acquisition tasks behind an `Arc` and
//! are called from the blocking thread pool, so every method takes `&self`
//! and may block.

pub mod mock;

pub use mock::{AdcKind, MockHardware, TransactionProbe};

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

/// Valid BCM pin numbers on a 40-pin Raspberry Pi header
pub const DEFAULT_PIN_RANGE: RangeInclusive<u8> = 0..=27;

/// Direction of a GPIO pin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PinMode {
    /// Input with pull-down, so an unconnected pin reads low
    #[default]
    Input,
    /// Push-pull output
    Output,
}

impl std::fmt::Display for PinMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PinMode::Input => write!(f, "input"),
            PinMode::Output => write!(f, "output"),
        }
    }
}

/// Raw hardware primitives consumed by the source drivers
///
/// # Example
///
/// ```ignore
/// fn read_button(hw: &dyn HardwareAccess) -> Result<bool> {
///     hw.setup_pin(17, PinMode::Input)?;
///     hw.read_pin(17)
/// }
/// ```
pub trait HardwareAccess: Send + Sync {
    /// Short name for log lines
    fn name(&self) -> &str;

    /// Pin numbers valid on this platform
    fn pin_range(&self) -> RangeInclusive<u8> {
        DEFAULT_PIN_RANGE
    }

    /// Configure a pin's direction
    fn setup_pin(&self, pin: u8, mode: PinMode) -> Result<()>;

    /// Read a pin's logic level
    fn read_pin(&self, pin: u8) -> Result<bool>;

    /// Drive an output pin
    fn write_pin(&self, pin: u8, high: bool) -> Result<()>;

    /// Combined I2C transaction: write `write`, then read `read.len()` bytes
    ///
    /// Either half may be empty.
    fn i2c_write_read(&self, bus: u8, address: u8, write: &[u8], read: &mut [u8]) -> Result<()>;

    /// Full-duplex SPI transfer with `chip_select` asserted
    ///
    /// `tx` and `rx` have the same length.
    fn spi_transfer(&self, bus: u8, chip_select: u8, tx: &[u8], rx: &mut [u8]) -> Result<()>;
}
