//! Simulated hardware bench for testing
//!
//! This module provides a [`HardwareAccess`] implementation that can be used
//! to run the engine without a Raspberry Pi. It emulates:
//!
//! - **GPIO pins**: levels can be set from the test side; outputs keep the
//!   last written level
//! - **ADS1115** (I2C): config register (mux, PGA) and conversion register
//! - **MCP3008 / MCP3208** (SPI): single-ended conversion frames
//!
//! # Instrumentation
//!
//! Every bus transaction is counted per [`DeviceKey`], and the mock tracks
//! how many transactions are inside a device at the same time. A correctly
//! arbitrated engine never lets [`MockHardware::max_concurrent`] exceed 1.
//!
//! # Example
//!
//! ```ignore
//! use nodeacq_rs::hardware::MockHardware;
//! use nodeacq_rs::types::DeviceKey;
//!
//! let hw = MockHardware::new().with_latency(Duration::from_millis(2));
//! let key = DeviceKey::I2c { bus: 1, address: 0x48 };
//! hw.attach_ads1115(1, 0x48);
//! hw.set_channel_voltage(key, 0, 1.65);
//! hw.set_pin_level(17, true);
//! ```

use super::{HardwareAccess, PinMode, DEFAULT_PIN_RANGE};
use crate::error::{EngineError, Result};
use crate::types::DeviceKey;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// ADS1115 conversion register pointer
const ADS_REG_CONVERSION: u8 = 0x00;
/// ADS1115 config register pointer
const ADS_REG_CONFIG: u8 = 0x01;

/// Converter models the bench can host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdcKind {
    /// 16-bit, 4 channels, I2C
    Ads1115,
    /// 10-bit, 8 channels, SPI
    Mcp3008,
    /// 12-bit, 8 channels, SPI
    Mcp3208,
}

/// Per-device transaction counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionProbe {
    /// Transactions currently inside the device
    pub active: usize,
    /// Highest `active` value observed
    pub max_concurrent: usize,
    /// Total transactions started
    pub transactions: u64,
}

#[derive(Debug, Clone, Copy)]
struct MockPin {
    mode: Option<PinMode>,
    level: bool,
}

#[derive(Debug, Clone)]
struct MockAdc {
    kind: AdcKind,
    /// Reference voltage for the SPI parts
    vref: f64,
    /// Input voltage per channel
    channels: [f64; 8],
    /// ADS1115 config register
    config: u16,
    /// ADS1115 register pointer
    pointer: u8,
}

impl MockAdc {
    fn new(kind: AdcKind, vref: f64) -> Self {
        Self {
            kind,
            vref,
            channels: [0.0; 8],
            // Power-on default: AIN0/AIN1 differential, ±2.048 V
            config: 0x8583,
            pointer: ADS_REG_CONVERSION,
        }
    }

    /// Full-scale range selected by the ADS1115 PGA bits
    fn ads_full_scale(&self) -> f64 {
        match (self.config >> 9) & 0x07 {
            0 => 6.144,
            1 => 4.096,
            2 => 2.048,
            3 => 1.024,
            4 => 0.512,
            _ => 0.256,
        }
    }

    /// Single-ended channel selected by the ADS1115 mux bits
    fn ads_channel(&self) -> Option<usize> {
        match (self.config >> 12) & 0x07 {
            mux @ 4..=7 => Some((mux - 4) as usize),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct BenchState {
    pins: HashMap<u8, MockPin>,
    adcs: HashMap<DeviceKey, MockAdc>,
    failing_devices: HashSet<DeviceKey>,
    failing_pins: HashSet<u8>,
    probes: HashMap<DeviceKey, TransactionProbe>,
}

/// Simulated GPIO header and bus-attached converters
pub struct MockHardware {
    state: Mutex<BenchState>,
    /// Valid pin numbers
    pin_range: RangeInclusive<u8>,
    /// If false every pin operation fails as if the GPIO driver were missing
    gpio_available: bool,
    /// Time spent inside each bus transaction
    latency: Duration,
    /// Peak noise added to each analog conversion (volts)
    noise_amplitude: f64,
    rng: Mutex<ChaCha8Rng>,
}

impl MockHardware {
    /// Create an empty bench
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BenchState::default()),
            pin_range: DEFAULT_PIN_RANGE,
            gpio_available: true,
            latency: Duration::ZERO,
            noise_amplitude: 0.0,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(12345)),
        }
    }

    /// Set the valid pin range
    pub fn with_pin_range(mut self, range: RangeInclusive<u8>) -> Self {
        self.pin_range = range;
        self
    }

    /// Simulate a host without a GPIO driver
    pub fn without_gpio(mut self) -> Self {
        self.gpio_available = false;
        self
    }

    /// Set the time each bus transaction takes
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Add uniform noise of ±`amplitude` volts to analog conversions
    pub fn with_noise(mut self, amplitude: f64, seed: u64) -> Self {
        self.noise_amplitude = amplitude.abs();
        self.rng = Mutex::new(ChaCha8Rng::seed_from_u64(seed));
        self
    }

    fn state(&self) -> MutexGuard<'_, BenchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach an ADS1115 at `address` on I2C `bus`
    pub fn attach_ads1115(&self, bus: u8, address: u8) {
        self.state().adcs.insert(
            DeviceKey::I2c { bus, address },
            MockAdc::new(AdcKind::Ads1115, 0.0),
        );
    }

    /// Attach an MCP3008 or MCP3208 on SPI `bus`, chip-select `chip_select`
    pub fn attach_spi_adc(&self, kind: AdcKind, bus: u8, chip_select: u8, vref: f64) {
        self.state().adcs.insert(
            DeviceKey::Spi { bus, chip_select },
            MockAdc::new(kind, vref),
        );
    }

    /// Set the input voltage of one converter channel
    pub fn set_channel_voltage(&self, key: DeviceKey, channel: usize, volts: f64) {
        if let Some(adc) = self.state().adcs.get_mut(&key) {
            if let Some(slot) = adc.channels.get_mut(channel) {
                *slot = volts;
            }
        }
    }

    /// Set the level an input pin reads
    pub fn set_pin_level(&self, pin: u8, high: bool) {
        let mut state = self.state();
        let entry = state.pins.entry(pin).or_insert(MockPin {
            mode: None,
            level: false,
        });
        entry.level = high;
    }

    /// Current level of a pin (false if never touched)
    pub fn pin_level(&self, pin: u8) -> bool {
        self.state().pins.get(&pin).map(|p| p.level).unwrap_or(false)
    }

    /// Direction a pin was last configured with
    pub fn pin_mode(&self, pin: u8) -> Option<PinMode> {
        self.state().pins.get(&pin).and_then(|p| p.mode)
    }

    /// Make every transaction against `key` fail (or recover)
    pub fn fail_device(&self, key: DeviceKey, failing: bool) {
        let mut state = self.state();
        if failing {
            state.failing_devices.insert(key);
        } else {
            state.failing_devices.remove(&key);
        }
    }

    /// Make every operation on `pin` fail (or recover)
    pub fn fail_pin(&self, pin: u8, failing: bool) {
        let mut state = self.state();
        if failing {
            state.failing_pins.insert(pin);
        } else {
            state.failing_pins.remove(&pin);
        }
    }

    /// Transaction counters for a device
    pub fn probe(&self, key: DeviceKey) -> TransactionProbe {
        self.state().probes.get(&key).copied().unwrap_or_default()
    }

    /// Highest number of simultaneous transactions seen on a device
    pub fn max_concurrent(&self, key: DeviceKey) -> usize {
        self.probe(key).max_concurrent
    }

    /// Total transactions started against a device
    pub fn transaction_count(&self, key: DeviceKey) -> u64 {
        self.probe(key).transactions
    }

    fn noise(&self) -> f64 {
        if self.noise_amplitude == 0.0 {
            return 0.0;
        }
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        rng.gen_range(-self.noise_amplitude..=self.noise_amplitude)
    }

    fn check_pin(&self, pin: u8) -> Result<()> {
        if !self.gpio_available {
            return Err(EngineError::HardwareRead(
                "GPIO interface not available".to_string(),
            ));
        }
        if !self.pin_range.contains(&pin) {
            return Err(EngineError::HardwareRead(format!(
                "pin {} outside valid range {}..={}",
                pin,
                self.pin_range.start(),
                self.pin_range.end()
            )));
        }
        if self.state().failing_pins.contains(&pin) {
            return Err(EngineError::HardwareRead(format!("pin {} I/O failure", pin)));
        }
        Ok(())
    }

    /// Run a transaction body with concurrency instrumentation around it
    ///
    /// The bench lock is not held during the simulated latency, so
    /// overlapping callers are visible in the probe counters.
    fn transaction<T>(
        &self,
        key: DeviceKey,
        body: impl FnOnce(&mut MockAdc, f64) -> Result<T>,
    ) -> Result<T> {
        {
            let mut state = self.state();
            let probe = state.probes.entry(key).or_default();
            probe.active += 1;
            probe.transactions += 1;
            probe.max_concurrent = probe.max_concurrent.max(probe.active);
        }

        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }

        let noise = self.noise();
        let mut state = self.state();
        let result = if state.failing_devices.contains(&key) {
            Err(EngineError::HardwareRead(format!("{}: transaction failed", key)))
        } else {
            match state.adcs.get_mut(&key) {
                Some(adc) => body(adc, noise),
                None => Err(EngineError::HardwareRead(format!("{}: no device (NACK)", key))),
            }
        };
        if let Some(probe) = state.probes.get_mut(&key) {
            probe.active = probe.active.saturating_sub(1);
        }
        result
    }
}

impl Default for MockHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareAccess for MockHardware {
    fn name(&self) -> &str {
        "mock"
    }

    fn pin_range(&self) -> RangeInclusive<u8> {
        self.pin_range.clone()
    }

    fn setup_pin(&self, pin: u8, mode: PinMode) -> Result<()> {
        self.check_pin(pin)?;
        let mut state = self.state();
        let entry = state.pins.entry(pin).or_insert(MockPin {
            mode: None,
            level: false,
        });
        entry.mode = Some(mode);
        Ok(())
    }

    fn read_pin(&self, pin: u8) -> Result<bool> {
        self.check_pin(pin)?;
        Ok(self.pin_level(pin))
    }

    fn write_pin(&self, pin: u8, high: bool) -> Result<()> {
        self.check_pin(pin)?;
        let mut state = self.state();
        match state.pins.get_mut(&pin) {
            Some(p) if p.mode == Some(PinMode::Output) => {
                p.level = high;
                Ok(())
            }
            _ => Err(EngineError::HardwareRead(format!(
                "pin {} is not configured as output",
                pin
            ))),
        }
    }

    fn i2c_write_read(&self, bus: u8, address: u8, write: &[u8], read: &mut [u8]) -> Result<()> {
        let key = DeviceKey::I2c { bus, address };
        self.transaction(key, |adc, noise| {
            if adc.kind != AdcKind::Ads1115 {
                return Err(EngineError::HardwareRead(format!("{}: not an I2C device", key)));
            }
            if let Some((&pointer, payload)) = write.split_first() {
                adc.pointer = pointer;
                if pointer == ADS_REG_CONFIG && payload.len() >= 2 {
                    adc.config = u16::from_be_bytes([payload[0], payload[1]]);
                }
            }
            if read.is_empty() {
                return Ok(());
            }
            let word = match adc.pointer {
                ADS_REG_CONVERSION => {
                    let channel = adc.ads_channel().ok_or_else(|| {
                        EngineError::HardwareRead(format!("{}: differential mux not emulated", key))
                    })?;
                    let fsr = adc.ads_full_scale();
                    let code = ((adc.channels[channel] + noise) / fsr * 32768.0)
                        .round()
                        .clamp(-32768.0, 32767.0) as i16;
                    code as u16
                }
                // OS bit set: conversion complete
                ADS_REG_CONFIG => adc.config | 0x8000,
                other => {
                    return Err(EngineError::HardwareRead(format!(
                        "{}: register 0x{:02X} not emulated",
                        key, other
                    )))
                }
            };
            let bytes = word.to_be_bytes();
            for (dst, src) in read.iter_mut().zip(bytes.iter()) {
                *dst = *src;
            }
            Ok(())
        })
    }

    fn spi_transfer(&self, bus: u8, chip_select: u8, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        let key = DeviceKey::Spi { bus, chip_select };
        self.transaction(key, |adc, noise| {
            if tx.len() < 3 || rx.len() < 3 {
                return Err(EngineError::HardwareRead(format!("{}: short SPI frame", key)));
            }
            let (channel, max_code) = match adc.kind {
                AdcKind::Mcp3008 => {
                    if tx[0] & 0x01 == 0 || tx[1] & 0x80 == 0 {
                        return Err(EngineError::HardwareRead(format!(
                            "{}: expected single-ended start frame",
                            key
                        )));
                    }
                    (((tx[1] >> 4) & 0x07) as usize, 1023.0)
                }
                AdcKind::Mcp3208 => {
                    if tx[0] & 0x06 != 0x06 {
                        return Err(EngineError::HardwareRead(format!(
                            "{}: expected single-ended start frame",
                            key
                        )));
                    }
                    ((((tx[0] & 0x01) << 2) | (tx[1] >> 6)) as usize, 4095.0)
                }
                AdcKind::Ads1115 => {
                    return Err(EngineError::HardwareRead(format!("{}: not an SPI device", key)))
                }
            };
            let volts = adc.channels[channel] + noise;
            let code = (volts / adc.vref * max_code).round().clamp(0.0, max_code) as u16;
            rx[0] = 0;
            rx[1] = (code >> 8) as u8;
            rx[2] = (code & 0xFF) as u8;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_levels() {
        let hw = MockHardware::new();
        hw.setup_pin(17, PinMode::Input).unwrap();
        assert!(!hw.read_pin(17).unwrap());

        hw.set_pin_level(17, true);
        assert!(hw.read_pin(17).unwrap());
        assert_eq!(hw.pin_mode(17), Some(PinMode::Input));
    }

    #[test]
    fn test_pin_out_of_range() {
        let hw = MockHardware::new();
        let err = hw.read_pin(40).unwrap_err();
        assert!(err.to_string().contains("outside valid range"));
    }

    #[test]
    fn test_gpio_unavailable() {
        let hw = MockHardware::new().without_gpio();
        assert!(hw.setup_pin(4, PinMode::Input).is_err());
        assert!(hw.read_pin(4).is_err());
    }

    #[test]
    fn test_write_requires_output_mode() {
        let hw = MockHardware::new();
        hw.setup_pin(27, PinMode::Input).unwrap();
        assert!(hw.write_pin(27, true).is_err());

        hw.setup_pin(27, PinMode::Output).unwrap();
        hw.write_pin(27, true).unwrap();
        assert!(hw.pin_level(27));
    }

    #[test]
    fn test_ads1115_register_protocol() {
        let hw = MockHardware::new();
        hw.attach_ads1115(1, 0x48);
        let key = DeviceKey::I2c { bus: 1, address: 0x48 };
        hw.set_channel_voltage(key, 2, 1.024);

        // AIN2 single-ended (mux 110), PGA ±4.096 V (001)
        let config: u16 = 0x8000 | (0b110 << 12) | (0b001 << 9) | 0x0100 | 0x0083;
        let [hi, lo] = config.to_be_bytes();
        hw.i2c_write_read(1, 0x48, &[ADS_REG_CONFIG, hi, lo], &mut [])
            .unwrap();

        let mut buf = [0u8; 2];
        hw.i2c_write_read(1, 0x48, &[ADS_REG_CONVERSION], &mut buf)
            .unwrap();
        let code = i16::from_be_bytes(buf);
        assert_eq!(code, 8192); // 1.024 / 4.096 * 32768
        assert_eq!(hw.transaction_count(key), 2);
    }

    #[test]
    fn test_mcp3008_frame() {
        let hw = MockHardware::new();
        hw.attach_spi_adc(AdcKind::Mcp3008, 0, 8, 3.3);
        let key = DeviceKey::Spi {
            bus: 0,
            chip_select: 8,
        };
        hw.set_channel_voltage(key, 5, 3.3);

        let tx = [0x01, 0x80 | (5 << 4), 0x00];
        let mut rx = [0u8; 3];
        hw.spi_transfer(0, 8, &tx, &mut rx).unwrap();
        let code = (((rx[1] & 0x03) as u16) << 8) | rx[2] as u16;
        assert_eq!(code, 1023);
    }

    #[test]
    fn test_missing_device_nacks() {
        let hw = MockHardware::new();
        let err = hw
            .i2c_write_read(1, 0x49, &[ADS_REG_CONVERSION], &mut [0u8; 2])
            .unwrap_err();
        assert!(err.to_string().contains("NACK"));
    }

    #[test]
    fn test_fault_injection() {
        let hw = MockHardware::new();
        hw.attach_spi_adc(AdcKind::Mcp3208, 0, 7, 3.3);
        let key = DeviceKey::Spi {
            bus: 0,
            chip_select: 7,
        };
        let tx = [0x06, 0x00, 0x00];

        hw.fail_device(key, true);
        assert!(hw.spi_transfer(0, 7, &tx, &mut [0u8; 3]).is_err());

        hw.fail_device(key, false);
        assert!(hw.spi_transfer(0, 7, &tx, &mut [0u8; 3]).is_ok());
    }
}
