//! Engine construction helpers around the simulated bench

use nodeacq_rs::config::AcquisitionConfig;
use nodeacq_rs::engine::{Engine, EngineEvents, LiveValue};
use nodeacq_rs::hardware::MockHardware;
use nodeacq_rs::store::MemoryNodeStore;
use nodeacq_rs::types::DeviceKey;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Key of the ADS1115 the builders target
pub const ADS_KEY: DeviceKey = DeviceKey::I2c {
    bus: 1,
    address: 0x48,
};

/// Bench with an ADS1115 at 0x48 and every channel at `volts`
pub fn bench_with_ads1115(volts: f64) -> MockHardware {
    let bench = MockHardware::new();
    bench.attach_ads1115(1, 0x48);
    for channel in 0..4 {
        bench.set_channel_voltage(ADS_KEY, channel, volts);
    }
    bench
}

/// Fast settings used by most tests
pub fn test_settings() -> AcquisitionConfig {
    AcquisitionConfig {
        min_interval_ms: 10,
        shutdown_grace_ms: 500,
        simulation_seed: Some(42),
        ..AcquisitionConfig::default()
    }
}

/// Engine over `bench` with an in-memory store and fast settings
pub fn create_test_engine(bench: Arc<MockHardware>) -> (Engine, EngineEvents) {
    create_engine_with(bench, test_settings())
}

pub fn create_engine_with(
    bench: Arc<MockHardware>,
    settings: AcquisitionConfig,
) -> (Engine, EngineEvents) {
    Engine::new(&settings, bench, Arc::new(MemoryNodeStore::new()))
}

/// Poll until `pred` holds
pub async fn eventually(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Poll the live value of `id` until `pred` holds
pub async fn wait_for_value(
    engine: &Engine,
    id: u32,
    timeout: Duration,
    pred: impl Fn(&LiveValue) -> bool,
) -> Option<LiveValue> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(value) = engine.get_live_value(id) {
            if pred(&value) {
                return Some(value);
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}

/// Successful reads recorded so far for `id`
pub fn reads(engine: &Engine, id: u32) -> u64 {
    engine
        .get_live_value(id)
        .map(|v| v.stats.successful_reads)
        .unwrap_or(0)
}
