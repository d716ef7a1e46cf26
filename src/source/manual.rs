//! Manually set values

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Value cell written by `set_manual_value` and read by the node's driver
#[derive(Debug)]
pub struct ManualValue {
    bits: AtomicU64,
}

impl ManualValue {
    pub fn new(value: f64) -> Self {
        Self {
            bits: AtomicU64::new(value.to_bits()),
        }
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }

    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Release);
    }
}

/// Driver returning the last explicitly set value; never fails
pub struct ManualDriver {
    value: Arc<ManualValue>,
}

impl ManualDriver {
    pub fn new(value: Arc<ManualValue>) -> Self {
        Self { value }
    }

    pub fn read(&self) -> f64 {
        self.value.get()
    }
}
