//! Integration tests for shared-bus acquisition
//!
//! Several nodes on one ADS1115 must never interleave their transactions,
//! and a failing device must not disturb anything else.

mod common;

use common::builders::{ads1115, manual, tank_level};
use common::mock_helpers::{
    bench_with_ads1115, create_engine_with, create_test_engine, eventually, reads, test_settings,
    wait_for_value, ADS_KEY,
};
use common::{assert_float_eq, test_timeout};
use nodeacq_rs::config::AcquisitionConfig;
use nodeacq_rs::hardware::MockHardware;
use nodeacq_rs::types::DeviceKey;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_channels_on_one_device_never_overlap() {
    let bench = Arc::new(MockHardware::new().with_latency(Duration::from_millis(2)));
    bench.attach_ads1115(1, 0x48);
    let volts = [0.5, 1.0, 1.5, 2.0];
    for (channel, v) in volts.iter().enumerate() {
        bench.set_channel_voltage(ADS_KEY, channel, *v);
    }

    let (engine, _events) = create_test_engine(bench.clone());
    let specs = (0..4u8)
        .map(|ch| ads1115(&format!("AIN{}", ch), ch).with_interval(20))
        .collect();
    engine.apply_config(specs).await.unwrap();
    assert_eq!(engine.stats().device_keys, 1);

    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(bench.max_concurrent(ADS_KEY), 1, "transactions overlapped");
    assert!(bench.transaction_count(ADS_KEY) > 20);

    // Each node sees its own channel
    for (node, v) in engine.list_nodes().iter().zip(volts) {
        let value = engine.get_live_value(node.id).unwrap();
        assert!(value.error.is_none(), "{}: {:?}", node.display_name, value.error);
        assert_float_eq(value.raw_value.unwrap(), v, 1e-3);
    }

    engine.shutdown().await;
    assert_eq!(engine.stats().device_keys, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_two_channels_same_address_slow_cadence() {
    let bench = Arc::new(bench_with_ads1115(0.0));
    bench.set_channel_voltage(ADS_KEY, 0, 0.8);
    bench.set_channel_voltage(ADS_KEY, 1, 2.4);

    let (engine, _events) = create_test_engine(bench.clone());
    engine
        .apply_config(vec![
            ads1115("Pressure", 0).with_interval(500),
            ads1115("Flow", 1).with_interval(500),
        ])
        .await
        .unwrap();
    let ids: Vec<u32> = engine.list_nodes().iter().map(|n| n.id).collect();

    for (id, expected) in ids.iter().zip([0.8, 2.4]) {
        let value = wait_for_value(&engine, *id, test_timeout(), |v| v.raw_value.is_some())
            .await
            .unwrap();
        assert_float_eq(value.raw_value.unwrap(), expected, 1e-3);
    }
    assert_eq!(bench.max_concurrent(ADS_KEY), 1);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_scaled_channel_reads_half_scale() {
    let bench = Arc::new(bench_with_ads1115(1.65));
    let (engine, _events) = create_test_engine(bench);
    engine
        .apply_config(vec![tank_level("Tank_Level", 0).with_interval(500)])
        .await
        .unwrap();
    let id = engine.list_nodes()[0].id;

    let value = wait_for_value(&engine, id, test_timeout(), |v| v.value.is_some())
        .await
        .unwrap();
    assert_float_eq(value.raw_value.unwrap(), 1.65, 1e-3);
    assert_float_eq(value.value.unwrap(), 50.0, 0.1);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_failing_device_is_isolated() {
    let bench = Arc::new(bench_with_ads1115(1.65));
    let (engine, _events) = create_test_engine(bench.clone());
    engine
        .apply_config(vec![tank_level("Tank_Level", 0), manual("Setpoint", 3.0)])
        .await
        .unwrap();
    let tank = engine.list_nodes()[0].id;
    let setpoint = engine.list_nodes()[1].id;

    wait_for_value(&engine, tank, test_timeout(), |v| v.value.is_some())
        .await
        .unwrap();

    bench.fail_device(ADS_KEY, true);
    let failed = wait_for_value(&engine, tank, test_timeout(), |v| v.error.is_some())
        .await
        .expect("failure never reported");
    assert!(failed.value.is_none());
    // Last good raw reading survives the failure
    assert_float_eq(failed.raw_value.unwrap(), 1.65, 1e-3);
    assert!(failed.stats.consecutive_failures >= 1);

    let before = reads(&engine, setpoint);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(reads(&engine, setpoint) > before, "healthy node stalled");
    assert_eq!(engine.get_live_value(setpoint).unwrap().value, Some(3.0));

    bench.fail_device(ADS_KEY, false);
    let recovered = wait_for_value(&engine, tank, test_timeout(), |v| v.error.is_none()).await;
    assert!(recovered.is_some(), "node did not recover");
    assert!(engine.stats().counters.failed_cycles >= 1);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_missing_device_reports_error() {
    // No converter attached at 0x49
    let bench = Arc::new(bench_with_ads1115(1.0));
    let (engine, _events) = create_test_engine(bench.clone());
    engine
        .apply_config(vec![ads1115("Ghost", 0).with_config("i2c_address", 0x49)])
        .await
        .unwrap();
    let id = engine.list_nodes()[0].id;

    let value = wait_for_value(&engine, id, test_timeout(), |v| v.error.is_some())
        .await
        .unwrap();
    assert!(value.raw_value.is_none());
    assert_eq!(
        bench.transaction_count(DeviceKey::I2c {
            bus: 1,
            address: 0x48
        }),
        0
    );

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_bus_timeout_lands_in_node_error() {
    // One conversion holds the bus for three 200 ms transactions
    let bench = Arc::new(bench_with_ads1115(1.0).with_latency(Duration::from_millis(200)));
    let settings = AcquisitionConfig {
        bus_timeout_ms: 50,
        ..test_settings()
    };
    let (engine, _events) = create_engine_with(bench, settings);
    engine
        .apply_config(vec![
            ads1115("AIN0", 0).with_interval(2000),
            ads1115("AIN1", 1).with_interval(2000),
        ])
        .await
        .unwrap();

    let timed_out = eventually(test_timeout(), || {
        engine.get_live_values().iter().any(|v| {
            v.error
                .as_deref()
                .map_or(false, |e| e.contains("Bus timeout") && e.contains("i2c-1@0x48"))
        })
    })
    .await;
    assert!(timed_out, "no node reported the bus timeout");

    // The node holding the bus still completes its conversion
    assert!(
        eventually(test_timeout(), || {
            engine
                .get_live_values()
                .iter()
                .any(|v| v.raw_value.is_some() && v.error.is_none())
        })
        .await
    );
    assert!(engine.stats().counters.failed_cycles >= 1);

    engine.shutdown().await;
}
