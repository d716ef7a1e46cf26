//! Channels on bus-attached analog-to-digital converters
//!
//! Supported converters:
//!
//! | device  | bus | channels | resolution | voltage                       |
//! |---------|-----|----------|------------|-------------------------------|
//! | ADS1115 | I2C | 4        | 16 bit     | `code * FSR / 32768`          |
//! | MCP3008 | SPI | 8        | 10 bit     | `code * vref / 1023`          |
//! | MCP3208 | SPI | 8        | 12 bit     | `code / 4095 * vref`          |
//!
//! Every conversion holds the arbiter lock for the converter's
//! [`DeviceKey`] for its whole register sequence, so two channels of one
//! chip never interleave their transactions.

use super::{opt_f64, opt_u8, require_str, require_u8, DriverContext};
use crate::error::{EngineError, Result};
use crate::hardware::HardwareAccess;
use crate::types::{DeviceKey, SourceConfig};
use std::time::Duration;

pub const DEFAULT_ADS1115_ADDRESS: u8 = 0x48;
pub const DEFAULT_I2C_BUS: u8 = 1;
pub const DEFAULT_SPI_BUS: u8 = 0;
/// CE0 on the Raspberry Pi header
pub const DEFAULT_CS_PIN: u8 = 8;
pub const DEFAULT_VREF: f64 = 3.3;

const ADS_REG_CONVERSION: u8 = 0x00;
const ADS_REG_CONFIG: u8 = 0x01;
/// Start a single conversion
const ADS_OS_START: u16 = 0x8000;
/// Single-shot mode
const ADS_MODE_SINGLE: u16 = 0x0100;
/// 128 samples per second
const ADS_DR_128SPS: u16 = 0x0080;
/// Comparator disabled
const ADS_COMP_DISABLE: u16 = 0x0003;
/// Polls of the OS bit before giving up (one conversion at 128 SPS is ~8 ms)
const ADS_READY_POLLS: usize = 20;
const ADS_POLL_DELAY: Duration = Duration::from_millis(1);

/// ADS1115 programmable gain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gain {
    TwoThirds,
    One,
    Two,
    Four,
    Eight,
    Sixteen,
}

impl Gain {
    /// Full-scale range in volts
    pub fn full_scale(&self) -> f64 {
        match self {
            Gain::TwoThirds => 6.144,
            Gain::One => 4.096,
            Gain::Two => 2.048,
            Gain::Four => 1.024,
            Gain::Eight => 0.512,
            Gain::Sixteen => 0.256,
        }
    }

    /// PGA field of the config register
    fn pga_bits(&self) -> u16 {
        match self {
            Gain::TwoThirds => 0,
            Gain::One => 1,
            Gain::Two => 2,
            Gain::Four => 3,
            Gain::Eight => 4,
            Gain::Sixteen => 5,
        }
    }

    fn parse(config: &SourceConfig) -> Result<Self> {
        if let Some(serde_json::Value::String(s)) = config.get("gain") {
            if s.trim() == "2/3" {
                return Ok(Gain::TwoThirds);
            }
        }
        let Some(gain) = opt_f64(config, "gain")? else {
            return Ok(Gain::One);
        };
        if (gain - 2.0 / 3.0).abs() < 1e-3 {
            return Ok(Gain::TwoThirds);
        }
        match gain {
            g if g == 1.0 => Ok(Gain::One),
            g if g == 2.0 => Ok(Gain::Two),
            g if g == 4.0 => Ok(Gain::Four),
            g if g == 8.0 => Ok(Gain::Eight),
            g if g == 16.0 => Ok(Gain::Sixteen),
            other => Err(EngineError::Config(format!(
                "gain must be one of 2/3, 1, 2, 4, 8, 16; got {}",
                other
            ))),
        }
    }
}

/// Converter model and its bus wiring
#[derive(Debug, Clone, PartialEq)]
pub enum AdcDevice {
    Ads1115 { bus: u8, address: u8, gain: Gain },
    Mcp3008 { bus: u8, chip_select: u8, vref: f64 },
    Mcp3208 { bus: u8, chip_select: u8, vref: f64 },
}

impl AdcDevice {
    /// Shared resource the converter sits behind
    pub fn key(&self) -> DeviceKey {
        match *self {
            AdcDevice::Ads1115 { bus, address, .. } => DeviceKey::I2c { bus, address },
            AdcDevice::Mcp3008 {
                bus, chip_select, ..
            }
            | AdcDevice::Mcp3208 {
                bus, chip_select, ..
            } => DeviceKey::Spi { bus, chip_select },
        }
    }

    pub fn channel_count(&self) -> u8 {
        match self {
            AdcDevice::Ads1115 { .. } => 4,
            AdcDevice::Mcp3008 { .. } | AdcDevice::Mcp3208 { .. } => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AdcDevice::Ads1115 { .. } => "ads1115",
            AdcDevice::Mcp3008 { .. } => "mcp3008",
            AdcDevice::Mcp3208 { .. } => "mcp3208",
        }
    }
}

/// Parsed analog channel configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AnalogSpec {
    pub device: AdcDevice,
    pub channel: u8,
}

impl AnalogSpec {
    pub fn parse(config: &SourceConfig) -> Result<Self> {
        let device_name = require_str(config, "device")?;
        let channel = require_u8(config, "channel")?;

        let device = match device_name.to_ascii_lowercase().as_str() {
            "ads1115" => AdcDevice::Ads1115 {
                bus: opt_u8(config, "i2c_bus")?.unwrap_or(DEFAULT_I2C_BUS),
                address: opt_u8(config, "i2c_address")?.unwrap_or(DEFAULT_ADS1115_ADDRESS),
                gain: Gain::parse(config)?,
            },
            kind @ ("mcp3008" | "mcp3208") => {
                let bus = opt_u8(config, "spi_bus")?.unwrap_or(DEFAULT_SPI_BUS);
                let chip_select = opt_u8(config, "cs_pin")?.unwrap_or(DEFAULT_CS_PIN);
                let vref = opt_f64(config, "vref")?.unwrap_or(DEFAULT_VREF);
                if !(vref.is_finite() && vref > 0.0) {
                    return Err(EngineError::Config(format!(
                        "vref must be positive, got {}",
                        vref
                    )));
                }
                if kind == "mcp3008" {
                    AdcDevice::Mcp3008 {
                        bus,
                        chip_select,
                        vref,
                    }
                } else {
                    AdcDevice::Mcp3208 {
                        bus,
                        chip_select,
                        vref,
                    }
                }
            }
            other => {
                return Err(EngineError::Config(format!(
                    "unsupported device '{}' (expected ads1115, mcp3008 or mcp3208)",
                    other
                )))
            }
        };

        check_channel(&device, channel)?;
        Ok(Self { device, channel })
    }
}

fn check_channel(device: &AdcDevice, channel: u8) -> Result<()> {
    if channel >= device.channel_count() {
        return Err(EngineError::Config(format!(
            "channel {} out of range for {} ({} channels)",
            channel,
            device.name(),
            device.channel_count()
        )));
    }
    Ok(())
}

/// Perform one conversion and return the channel voltage
///
/// Blocking; callers hold the arbiter lock for the device key.
pub fn convert(hw: &dyn HardwareAccess, spec: &AnalogSpec) -> Result<f64> {
    check_channel(&spec.device, spec.channel)?;
    let ch = spec.channel;

    match spec.device {
        AdcDevice::Ads1115 { bus, address, gain } => {
            let mux = (0b100 | u16::from(ch)) << 12;
            let config = ADS_OS_START
                | mux
                | (gain.pga_bits() << 9)
                | ADS_MODE_SINGLE
                | ADS_DR_128SPS
                | ADS_COMP_DISABLE;
            let [hi, lo] = config.to_be_bytes();
            hw.i2c_write_read(bus, address, &[ADS_REG_CONFIG, hi, lo], &mut [])?;

            let mut ready = false;
            for _ in 0..ADS_READY_POLLS {
                let mut status = [0u8; 2];
                hw.i2c_write_read(bus, address, &[ADS_REG_CONFIG], &mut status)?;
                if u16::from_be_bytes(status) & ADS_OS_START != 0 {
                    ready = true;
                    break;
                }
                std::thread::sleep(ADS_POLL_DELAY);
            }
            if !ready {
                return Err(EngineError::HardwareRead(format!(
                    "{}: conversion did not complete",
                    spec.device.key()
                )));
            }

            let mut buf = [0u8; 2];
            hw.i2c_write_read(bus, address, &[ADS_REG_CONVERSION], &mut buf)?;
            let code = i16::from_be_bytes(buf);
            Ok(f64::from(code) * gain.full_scale() / 32768.0)
        }
        AdcDevice::Mcp3008 {
            bus,
            chip_select,
            vref,
        } => {
            let tx = [0x01, (0x08 | ch) << 4, 0x00];
            let mut rx = [0u8; 3];
            hw.spi_transfer(bus, chip_select, &tx, &mut rx)?;
            let code = (u16::from(rx[1] & 0x03) << 8) | u16::from(rx[2]);
            Ok(f64::from(code) * vref / 1023.0)
        }
        AdcDevice::Mcp3208 {
            bus,
            chip_select,
            vref,
        } => {
            let tx = [0x06 | (ch >> 2), (ch & 0x03) << 6, 0x00];
            let mut rx = [0u8; 3];
            hw.spi_transfer(bus, chip_select, &tx, &mut rx)?;
            let code = (u16::from(rx[1] & 0x0F) << 8) | u16::from(rx[2]);
            Ok(f64::from(code) / 4095.0 * vref)
        }
    }
}

/// Reads one converter channel through the bus arbiter
pub struct AnalogDriver {
    spec: AnalogSpec,
}

impl AnalogDriver {
    pub fn new(spec: AnalogSpec) -> Self {
        Self { spec }
    }

    pub fn device_key(&self) -> DeviceKey {
        self.spec.device.key()
    }

    pub async fn read(&mut self, ctx: &DriverContext) -> Result<f64> {
        let hw = ctx.hardware.clone();
        let spec = self.spec.clone();
        ctx.arbiter
            .with_lock(self.device_key(), ctx.bus_timeout, move || {
                convert(hw.as_ref(), &spec)
            })
            .await
    }
}
