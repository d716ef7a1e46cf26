//! Software signal generators
//!
//! Generators are deterministic given a seed and the number of cycles they
//! have produced, so a seeded simulation replays the same series in tests.

use super::{opt_f64, opt_u64, require_str};
use crate::error::{EngineError, Result};
use crate::types::SourceConfig;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::f64::consts::TAU;
use std::time::Duration;

/// Waveform produced by a simulation source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimKind {
    /// Uniform in `[min, max]`
    Random,
    /// Oscillates around the midpoint of `[min, max]`
    Sine,
    /// Adds `step` each cycle, wrapping past either bound to the other
    Incremental,
}

impl std::str::FromStr for SimKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "random" => Ok(SimKind::Random),
            "sine" => Ok(SimKind::Sine),
            "incremental" => Ok(SimKind::Incremental),
            other => Err(EngineError::Config(format!(
                "sim_type must be one of random, sine, incremental; got '{}'",
                other
            ))),
        }
    }
}

/// Parsed simulation parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationSpec {
    pub kind: SimKind,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    /// Sine period in seconds
    pub period_s: f64,
    pub seed: Option<u64>,
}

impl SimulationSpec {
    pub fn parse(config: &SourceConfig) -> Result<Self> {
        let kind = require_str(config, "sim_type")?.parse()?;
        let min = opt_f64(config, "min")?.unwrap_or(0.0);
        let max = opt_f64(config, "max")?.unwrap_or(100.0);
        let step = opt_f64(config, "step")?.unwrap_or(1.0);
        let period_s = opt_f64(config, "period_s")?.unwrap_or(TAU);
        let seed = opt_u64(config, "seed")?;

        if !(min.is_finite() && max.is_finite() && step.is_finite()) {
            return Err(EngineError::Config(
                "min, max and step must be finite".to_string(),
            ));
        }
        if min > max {
            return Err(EngineError::Config(format!(
                "min ({}) must not exceed max ({})",
                min, max
            )));
        }
        if !(max - min).is_finite() {
            return Err(EngineError::Config(format!(
                "range {}..{} is too wide to sample",
                min, max
            )));
        }
        if !(period_s.is_finite() && period_s > 0.0) {
            return Err(EngineError::Config(format!(
                "period_s must be positive, got {}",
                period_s
            )));
        }

        Ok(Self {
            kind,
            min,
            max,
            step,
            period_s,
            seed,
        })
    }
}

/// Stateful generator for one simulation node
pub struct SimulationDriver {
    spec: SimulationSpec,
    rng: ChaCha8Rng,
    /// Cycles produced so far
    cycles: u64,
    /// Simulated time of the next sample (seconds)
    elapsed_s: f64,
    /// Last incremental output
    current: f64,
}

impl SimulationDriver {
    pub fn new(spec: SimulationSpec, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        let current = spec.min;
        Self {
            spec,
            rng,
            cycles: 0,
            elapsed_s: 0.0,
            current,
        }
    }

    /// Cycles produced so far
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Produce the next sample
    ///
    /// The first sample is taken at elapsed time zero; each later sample
    /// advances simulated time by `interval`.
    pub fn next(&mut self, interval: Duration) -> f64 {
        if self.cycles > 0 {
            self.elapsed_s += interval.as_secs_f64();
        }
        self.cycles += 1;

        let SimulationSpec { min, max, .. } = self.spec;
        match self.spec.kind {
            SimKind::Random => self.rng.gen_range(min..=max),
            SimKind::Sine => {
                let amplitude = (max - min) / 2.0;
                let center = min + amplitude;
                center + amplitude * (TAU * self.elapsed_s / self.spec.period_s).sin()
            }
            SimKind::Incremental => {
                self.current += self.spec.step;
                if self.current > max {
                    self.current = min;
                } else if self.current < min {
                    self.current = max;
                }
                self.current
            }
        }
    }
}
