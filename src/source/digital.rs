//! GPIO pin levels

use super::{run_blocking, DriverContext};
use crate::error::{EngineError, Result};
use crate::hardware::PinMode;

/// Reads the logic level of one pin as 0.0 / 1.0
pub struct DigitalDriver {
    pin: u8,
    mode: PinMode,
    /// Pin direction has been applied since the driver was built
    configured: bool,
}

impl DigitalDriver {
    pub fn new(pin: u8, mode: PinMode) -> Self {
        Self {
            pin,
            mode,
            configured: false,
        }
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    pub async fn read(&mut self, ctx: &DriverContext) -> Result<f64> {
        let range = ctx.hardware.pin_range();
        if !range.contains(&self.pin) {
            return Err(EngineError::HardwareRead(format!(
                "pin {} outside platform range {}..={}",
                self.pin,
                range.start(),
                range.end()
            )));
        }

        let hw = ctx.hardware.clone();
        let (pin, mode, setup) = (self.pin, self.mode, !self.configured);
        let level = run_blocking(move || {
            if setup {
                hw.setup_pin(pin, mode)?;
            }
            hw.read_pin(pin)
        })
        .await?;

        self.configured = true;
        Ok(if level { 1.0 } else { 0.0 })
    }
}
