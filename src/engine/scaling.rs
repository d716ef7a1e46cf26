//! Linear scaling from raw readings to engineering values
//!
//! A node with active scaling maps `[voltage_min, voltage_max]` onto
//! `[scale_min, scale_max]`. Readings outside the input range extrapolate
//! along the same line; nothing is clamped. A node without scaling passes
//! its raw reading through unchanged.

use crate::error::{EngineError, Result};
use crate::types::{DataType, NodeValue, Scaling};

/// Check a scaling definition before it enters the registry
pub fn validate_scaling(scaling: &Scaling) -> Result<()> {
    let bounds = [
        ("voltage_min", scaling.voltage_min),
        ("voltage_max", scaling.voltage_max),
        ("scale_min", scaling.scale_min),
        ("scale_max", scaling.scale_max),
    ];
    for (name, bound) in bounds {
        if !bound.is_finite() {
            return Err(EngineError::Config(format!(
                "scaling {} must be finite, got {}",
                name, bound
            )));
        }
    }

    if scaling.voltage_max == scaling.voltage_min {
        return Err(EngineError::ScalingDomain {
            voltage_min: scaling.voltage_min,
            voltage_max: scaling.voltage_max,
        });
    }
    Ok(())
}

/// Convert a raw reading to an engineering value
///
/// Expects a scaling that passed [`validate_scaling`].
pub fn apply_scaling(scaling: Option<&Scaling>, raw: f64) -> f64 {
    let Some(s) = scaling else {
        return raw;
    };

    let t = (raw - s.voltage_min) / (s.voltage_max - s.voltage_min);
    // Weighted form lands exactly on scale_min / scale_max at t = 0 / t = 1
    (1.0 - t) * s.scale_min + t * s.scale_max
}

/// Scale a raw reading and coerce it to the node's data type
pub fn engineering_value(scaling: Option<&Scaling>, data_type: DataType, raw: f64) -> (f64, NodeValue) {
    let value = apply_scaling(scaling, raw);
    (value, data_type.coerce(value))
}
